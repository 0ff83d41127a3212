//! Session behavior against an in-process stub coordinator.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quartz_atlas::protocol;
use quartz_atlas::types::{event_mask, open_flags};
use quartz_atlas::{
    Attribute, AtlasError, HandleCallback, LockMode, NodeEvent, Session, SessionCallback,
    SessionConfig, SessionState,
};
use quartz_codec::Decoder;
use quartz_comm::{
    Comm, CommAddress, CommBuf, CommConfig, CommHeader, ConnectionHandlerFactory,
    DispatchHandler, Event, EventKind,
};

fn test_comm() -> Comm {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Comm::new(CommConfig { reactor_count: 2 }).expect("comm construction")
}

#[derive(Default)]
struct Node {
    is_dir: bool,
    attrs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct StubState {
    next_session: u64,
    next_handle: u64,
    next_event_id: u64,
    lock_generation: u64,
    nodes: HashMap<String, Node>,
    handles: HashMap<u64, String>,
    sessions: HashMap<SocketAddr, u64>,
    pending_events: Vec<(u64, u64, NodeEvent)>,
    respond_keepalives: bool,
}

/// A minimal coordinator: enough of the protocol to drive a session
/// through handshake, keep-alives, node operations and notifications.
struct StubCoordinator {
    comm: Comm,
    addr: SocketAddr,
    state: Arc<Mutex<StubState>>,
}

impl StubCoordinator {
    fn start(respond_keepalives: bool) -> Self {
        let comm = test_comm();
        let mut addr: SocketAddr = "127.0.0.1:38800".parse().unwrap();
        Comm::find_available_tcp_port(&mut addr);

        let state = Arc::new(Mutex::new(StubState {
            next_session: 1,
            next_handle: 1,
            next_event_id: 1,
            respond_keepalives,
            ..StubState::default()
        }));

        // TCP side: request handlers per accepted connection.
        let tcp_state = state.clone();
        let tcp_comm = comm.clone();
        let factory: Arc<dyn ConnectionHandlerFactory> = Arc::new(move || {
            let state = tcp_state.clone();
            let comm = tcp_comm.clone();
            let handler: Arc<dyn DispatchHandler> = Arc::new(move |event: Arc<Event>| {
                if event.kind == EventKind::Message && event.header.is_request() {
                    let response = handle_request(&state, &event);
                    comm.send_response(&CommAddress::Inet(event.addr.unwrap()), response)
                        .ok();
                }
            });
            handler
        });
        comm.listen(&CommAddress::Inet(addr), factory, None)
            .expect("stub listen");

        // UDP side: keep-alive replies carrying queued notifications.
        let udp_state = state.clone();
        let udp_comm = comm.clone();
        let mut udp_addr = addr;
        let udp_handler: Arc<dyn DispatchHandler> = Arc::new(move |event: Arc<Event>| {
            if event.kind != EventKind::Message
                || event.header.command != protocol::COMMAND_KEEPALIVE
            {
                return;
            }
            let Some(reply) = handle_keepalive(&udp_state, &event) else {
                return;
            };
            udp_comm
                .send_datagram(&CommAddress::Inet(event.addr.unwrap()), &event.local_addr.unwrap(), reply)
                .ok();
        });
        comm.create_datagram_receive_socket(&mut udp_addr, udp_handler)
            .expect("stub datagram socket");
        assert_eq!(udp_addr.port(), addr.port());

        Self { comm, addr, state }
    }

    /// Queue a node event for delivery on the next keep-alive.
    fn queue_event(&self, handle: u64, event: NodeEvent) {
        let mut state = self.state.lock().unwrap();
        let id = state.next_event_id;
        state.next_event_id += 1;
        state.pending_events.push((handle, id, event));
    }
}

fn ok_response(request: &CommHeader, capacity: usize) -> CommBuf {
    let mut cbuf = CommBuf::new(CommHeader::initialize_from_request(request), 4 + capacity);
    cbuf.append_i32(quartz_atlas::error::code::OK);
    cbuf
}

fn error_response(request: &CommHeader, code: i32) -> CommBuf {
    let mut cbuf = CommBuf::new(CommHeader::initialize_from_request(request), 4);
    cbuf.append_i32(code);
    cbuf
}

fn handle_request(state: &Arc<Mutex<StubState>>, event: &Event) -> CommBuf {
    use quartz_atlas::error::code;

    let mut state = state.lock().unwrap();
    let mut dec = Decoder::new(&event.payload);
    let header = &event.header;

    match header.command {
        protocol::COMMAND_HANDSHAKE => ok_response(header, 0),
        protocol::COMMAND_OPEN => {
            let _version = dec.read_u32().unwrap();
            let flags = dec.read_u32().unwrap();
            let _mask = dec.read_u32().unwrap();
            let name = dec.read_vstr().unwrap();

            let created = !state.nodes.contains_key(&name);
            if created && flags & open_flags::CREATE == 0 {
                return error_response(header, code::NO_SUCH_NODE);
            }
            state.nodes.entry(name.clone()).or_default();

            let handle = state.next_handle;
            state.next_handle += 1;
            state.handles.insert(handle, name);

            let mut cbuf = ok_response(header, 17);
            cbuf.append_u64(handle);
            cbuf.append_bool(created);
            cbuf.append_u64(0);
            cbuf
        }
        protocol::COMMAND_MKDIR => {
            let name = dec.read_vstr().unwrap();
            if state.nodes.contains_key(&name) {
                return error_response(header, code::NODE_EXISTS);
            }
            state.nodes.insert(
                name,
                Node {
                    is_dir: true,
                    attrs: HashMap::new(),
                },
            );
            ok_response(header, 0)
        }
        protocol::COMMAND_EXISTS => {
            let name = dec.read_vstr().unwrap();
            let mut cbuf = ok_response(header, 1);
            cbuf.append_bool(state.nodes.contains_key(&name));
            cbuf
        }
        protocol::COMMAND_DELETE => {
            let name = dec.read_vstr().unwrap();
            match state.nodes.remove(&name) {
                Some(_) => ok_response(header, 0),
                None => error_response(header, code::NO_SUCH_NODE),
            }
        }
        protocol::COMMAND_CLOSE => {
            let handle = dec.read_u64().unwrap();
            state.handles.remove(&handle);
            ok_response(header, 0)
        }
        protocol::COMMAND_ATTRSET => {
            let handle = dec.read_u64().unwrap();
            let Some(path) = state.handles.get(&handle).cloned() else {
                return error_response(header, code::NO_SUCH_NODE);
            };
            let count = dec.read_u32().unwrap();
            for _ in 0..count {
                let name = dec.read_vstr().unwrap();
                let value = dec.read_vbytes().unwrap().to_vec();
                state.nodes.get_mut(&path).unwrap().attrs.insert(name, value);
            }
            ok_response(header, 0)
        }
        protocol::COMMAND_ATTRGET => {
            let handle = dec.read_u64().unwrap();
            let name = dec.read_vstr().unwrap();
            let value = state
                .handles
                .get(&handle)
                .and_then(|path| state.nodes.get(path))
                .and_then(|node| node.attrs.get(&name));
            match value {
                Some(value) => {
                    let value = value.clone();
                    let mut cbuf = ok_response(header, value.len() + 5);
                    cbuf.append_vbytes(&value);
                    cbuf
                }
                None => error_response(header, code::ATTR_NOT_FOUND),
            }
        }
        protocol::COMMAND_ATTREXISTS => {
            let handle = dec.read_u64().unwrap();
            let name = dec.read_vstr().unwrap();
            let exists = state
                .handles
                .get(&handle)
                .and_then(|path| state.nodes.get(path))
                .map(|node| node.attrs.contains_key(&name))
                .unwrap_or(false);
            let mut cbuf = ok_response(header, 1);
            cbuf.append_bool(exists);
            cbuf
        }
        protocol::COMMAND_ATTRLIST => {
            let handle = dec.read_u64().unwrap();
            let names: Vec<String> = state
                .handles
                .get(&handle)
                .and_then(|path| state.nodes.get(path))
                .map(|node| node.attrs.keys().cloned().collect())
                .unwrap_or_default();
            let mut cbuf = ok_response(header, 64);
            cbuf.append_u32(names.len() as u32);
            for name in names {
                cbuf.append_vstr(&name);
            }
            cbuf
        }
        protocol::COMMAND_ATTRINCR => {
            let handle = dec.read_u64().unwrap();
            let name = dec.read_vstr().unwrap();
            let Some(path) = state.handles.get(&handle).cloned() else {
                return error_response(header, code::NO_SUCH_NODE);
            };
            let node = state.nodes.get_mut(&path).unwrap();
            let current = node
                .attrs
                .get(&name)
                .and_then(|v| v.as_slice().try_into().ok())
                .map(u64::from_le_bytes)
                .unwrap_or(0);
            let next = current + 1;
            node.attrs.insert(name, next.to_le_bytes().to_vec());

            let mut cbuf = ok_response(header, 8);
            cbuf.append_u64(next);
            cbuf
        }
        protocol::COMMAND_ATTRDEL => {
            let handle = dec.read_u64().unwrap();
            let name = dec.read_vstr().unwrap();
            let removed = state
                .handles
                .get(&handle)
                .cloned()
                .and_then(|path| state.nodes.get_mut(&path))
                .and_then(|node| node.attrs.remove(&name));
            match removed {
                Some(_) => ok_response(header, 0),
                None => error_response(header, code::ATTR_NOT_FOUND),
            }
        }
        protocol::COMMAND_READDIR => {
            let handle = dec.read_u64().unwrap();
            let Some(base) = state.handles.get(&handle).cloned() else {
                return error_response(header, code::NO_SUCH_NODE);
            };
            let prefix = if base.ends_with('/') {
                base.clone()
            } else {
                format!("{base}/")
            };
            let children: Vec<(String, bool)> = state
                .nodes
                .iter()
                .filter(|(path, _)| {
                    path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
                })
                .map(|(path, node)| (path[prefix.len()..].to_owned(), node.is_dir))
                .collect();

            let mut cbuf = ok_response(header, 64);
            cbuf.append_u32(children.len() as u32);
            for (name, is_dir) in children {
                cbuf.append_vstr(&name);
                cbuf.append_bool(is_dir);
            }
            cbuf
        }
        protocol::COMMAND_LOCK => {
            let _handle = dec.read_u64().unwrap();
            let _mode = dec.read_u32().unwrap();
            let _try_lock = dec.read_bool().unwrap();
            state.lock_generation += 1;

            let mut cbuf = ok_response(header, 12);
            cbuf.append_u32(1); // granted
            cbuf.append_u64(state.lock_generation);
            cbuf
        }
        protocol::COMMAND_RELEASE => ok_response(header, 0),
        protocol::COMMAND_CHECKSEQUENCER => {
            let _name = dec.read_vstr().unwrap();
            let _mode = dec.read_u32().unwrap();
            let generation = dec.read_u64().unwrap();
            if generation == state.lock_generation {
                ok_response(header, 0)
            } else {
                error_response(header, code::BAD_SEQUENCER)
            }
        }
        protocol::COMMAND_STATUS => {
            let mut cbuf = ok_response(header, 16);
            cbuf.append_i32(0);
            cbuf.append_vstr("coordinator ok");
            cbuf
        }
        _ => error_response(header, code::PROTOCOL_ERROR),
    }
}

fn handle_keepalive(state: &Arc<Mutex<StubState>>, event: &Event) -> Option<CommBuf> {
    let mut state = state.lock().unwrap();
    if !state.respond_keepalives {
        return None;
    }

    let mut dec = Decoder::new(&event.payload);
    let _session_id = dec.read_u64().ok()?;
    let last_delivered = dec.read_u64().ok()?;
    let destroy = dec.read_bool().ok()?;
    if destroy {
        return None;
    }

    let source = event.addr.unwrap();
    let session_id = match state.sessions.get(&source) {
        Some(id) => *id,
        None => {
            let id = state.next_session;
            state.next_session += 1;
            state.sessions.insert(source, id);
            id
        }
    };

    // Acknowledged events are garbage-collected; the rest are re-sent.
    state.pending_events.retain(|(_, id, _)| *id > last_delivered);

    let mut payload = Vec::new();
    for (handle, id, node_event) in &state.pending_events {
        quartz_codec::encode_u64(&mut payload, *handle);
        quartz_codec::encode_u64(&mut payload, *id);
        node_event.encode(&mut payload);
    }

    // Coordinator reply: {session, error, count, records}.
    let mut header = CommHeader::new(protocol::COMMAND_KEEPALIVE);
    header.flags |= quartz_comm::header::FLAGS_BIT_URGENT;
    let mut cbuf = CommBuf::new(header, 16 + payload.len());
    cbuf.append_u64(session_id);
    cbuf.append_i32(quartz_atlas::error::code::OK);
    cbuf.append_i32(state.pending_events.len() as i32);
    cbuf.append_bytes(&payload);
    Some(cbuf)
}

/// Records session callback invocations in order.
struct Recorder {
    events: flume::Sender<&'static str>,
}

impl SessionCallback for Recorder {
    fn safe(&self) {
        self.events.send("safe").ok();
    }
    fn jeopardy(&self) {
        self.events.send("jeopardy").ok();
    }
    fn expired(&self) {
        self.events.send("expired").ok();
    }
    fn disconnected(&self) {
        self.events.send("disconnected").ok();
    }
}

fn fast_config(addr: SocketAddr) -> SessionConfig {
    let mut config = SessionConfig::new(addr);
    config.exe_name = "session-test".into();
    config.timer_interval_ms = 100;
    config.grace_period_ms = 2_000;
    config.lease_ms = 10_000;
    config.reconnect_interval_ms = 200;
    config.request_timeout_ms = 3_000;
    config
}

#[test]
fn handshake_reaches_safe_and_session_id_is_assigned() {
    let stub = StubCoordinator::start(true);
    let client = test_comm();

    let (tx, rx) = flume::unbounded();
    let session = Session::new(client, fast_config(stub.addr), Arc::new(Recorder { events: tx }))
        .expect("session");

    assert!(session.wait_for_connection(Duration::from_secs(3)));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)),
        Ok("safe"),
        "safe transition not observed"
    );
    assert_eq!(session.state(), SessionState::Safe);

    // The server assigns the id on first keep-alive contact.
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.session_id() == 0 {
        assert!(Instant::now() < deadline, "session id never assigned");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn node_operations_round_trip() {
    let stub = StubCoordinator::start(true);
    let client = test_comm();

    let (tx, rx) = flume::unbounded();
    let session = Session::new(client, fast_config(stub.addr), Arc::new(Recorder { events: tx }))
        .expect("session");
    assert!(session.wait_for_connection(Duration::from_secs(3)));
    let _ = rx.recv_timeout(Duration::from_secs(2));

    session.mkdirs("/tables", &[]).expect("mkdir");
    assert!(session.exists("/tables").expect("exists"));
    assert!(!session.exists("/nothing").expect("exists"));

    let handle = session
        .open(
            "/tables/users",
            open_flags::READ | open_flags::WRITE | open_flags::CREATE | open_flags::LOCK,
            None,
            &[Attribute::new("schema", b"v1".to_vec())],
        )
        .expect("open");

    session
        .attr_set(handle, &[Attribute::new("schema", b"v2".to_vec())])
        .expect("attr_set");
    assert_eq!(session.attr_get(handle, "schema").expect("attr_get"), b"v2");
    assert!(session.attr_exists(handle, "schema").expect("attr_exists"));
    assert_eq!(session.attr_list(handle).expect("attr_list"), vec!["schema"]);

    assert_eq!(session.attr_incr(handle, "generation").expect("incr"), 1);
    assert_eq!(session.attr_incr(handle, "generation").expect("incr"), 2);

    assert!(matches!(
        session.attr_get(handle, "missing"),
        Err(AtlasError::AttrNotFound)
    ));

    let sequencer = session.lock(handle, LockMode::Exclusive).expect("lock");
    assert!(sequencer.generation > 0);
    assert_eq!(sequencer.name, "/tables/users");
    session.check_sequencer(&sequencer).expect("sequencer valid");
    session.release(handle).expect("release");

    let root = session
        .open("/tables", open_flags::READ | open_flags::CREATE, None, &[])
        .expect("open dir");
    let entries = session.readdir(root).expect("readdir");
    assert!(entries.iter().any(|e| e.name == "users"));

    // The root handle was opened without the LOCK flag.
    assert!(matches!(
        session.try_lock(root, LockMode::Shared),
        Err(AtlasError::ModeRestriction)
    ));

    let (status, text) = session.status().expect("status");
    assert_eq!(status, 0);
    assert_eq!(text, "coordinator ok");

    session.close(handle).expect("close");
    session.close(root).expect("close");
}

#[test]
fn lease_expiry_walks_through_jeopardy_to_expired() {
    // Handshake succeeds but keep-alives go unanswered.
    let stub = StubCoordinator::start(false);
    let client = test_comm();

    let mut config = fast_config(stub.addr);
    config.grace_period_ms = 500;
    config.lease_ms = 1_200;

    let (tx, rx) = flume::unbounded();
    let session = Session::new(client, config, Arc::new(Recorder { events: tx }))
        .expect("session");
    assert!(session.wait_for_connection(Duration::from_secs(3)));

    let mut transitions = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while transitions.last() != Some(&"expired") {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(event) if event != "disconnected" => transitions.push(event),
            Ok(_) => {}
            Err(_) => panic!("expiry never observed; saw {transitions:?}"),
        }
    }
    assert_eq!(transitions, vec!["safe", "jeopardy", "expired"]);
    assert_eq!(session.state(), SessionState::Expired);

    // Expired sessions fail fast, with no network attempt.
    let started = Instant::now();
    assert!(matches!(
        session.open("/x", open_flags::READ, None, &[]),
        Err(AtlasError::SessionExpired)
    ));
    assert!(started.elapsed() < Duration::from_millis(100));

    drop(stub);
}

#[test]
fn node_events_are_delivered_once() {
    struct AttrWatcher {
        events: flume::Sender<String>,
    }

    impl HandleCallback for AttrWatcher {
        fn event_mask(&self) -> u32 {
            event_mask::ATTR_SET
        }
        fn attr_set(&self, name: &str) {
            self.events.send(name.to_owned()).ok();
        }
    }

    let stub = StubCoordinator::start(true);
    let client = test_comm();

    let (tx, rx) = flume::unbounded();
    let session = Session::new(client, fast_config(stub.addr), Arc::new(Recorder { events: tx }))
        .expect("session");
    assert!(session.wait_for_connection(Duration::from_secs(3)));

    let (event_tx, event_rx) = flume::unbounded();
    let handle = session
        .open(
            "/watched",
            open_flags::READ | open_flags::CREATE,
            Some(Arc::new(AttrWatcher { events: event_tx })),
            &[],
        )
        .expect("open");

    stub.queue_event(handle, NodeEvent::AttrSet { name: "schema".into() });

    assert_eq!(
        event_rx.recv_timeout(Duration::from_secs(2)),
        Ok("schema".to_owned())
    );

    // The stub re-sends until acknowledged; the client suppresses the
    // duplicates by event id.
    std::thread::sleep(Duration::from_millis(400));
    assert!(event_rx.try_recv().is_err(), "duplicate event delivered");
    let _ = rx;
}
