//! Request/response round-trip scenarios over loopback TCP and UDP.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quartz_codec::Decoder;
use quartz_comm::{
    Comm, CommAddress, CommBuf, CommConfig, CommError, CommHeader, ConnectionHandlerFactory,
    DispatchHandler, DispatchHandlerSynchronizer, Event, EventKind,
};

fn test_comm() -> Comm {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Comm::new(CommConfig { reactor_count: 2 }).expect("comm construction")
}

fn pick_port(base: u16) -> SocketAddr {
    let mut addr: SocketAddr = format!("127.0.0.1:{base}").parse().unwrap();
    Comm::find_available_tcp_port(&mut addr);
    addr
}

/// A factory whose handlers echo each request's payload back with the same
/// request id.
fn echo_factory(comm: Comm) -> Arc<dyn ConnectionHandlerFactory> {
    Arc::new(move || {
        let comm = comm.clone();
        let handler: Arc<dyn DispatchHandler> = Arc::new(move |event: Arc<Event>| {
            if event.kind == EventKind::Message && event.header.is_request() {
                let header = CommHeader::initialize_from_request(&event.header);
                let mut response = CommBuf::new(header, event.payload.len());
                response.append_bytes(&event.payload);
                comm.send_response(&CommAddress::Inet(event.addr.unwrap()), response)
                    .expect("send echo response");
            }
        });
        handler
    })
}

/// A factory whose handlers accept requests and never respond.
fn black_hole_factory() -> Arc<dyn ConnectionHandlerFactory> {
    Arc::new(|| {
        let handler: Arc<dyn DispatchHandler> = Arc::new(|_event: Arc<Event>| {});
        handler
    })
}

fn connect(comm: &Comm, addr: SocketAddr) -> Arc<DispatchHandlerSynchronizer> {
    let events = DispatchHandlerSynchronizer::new();
    comm.connect(&CommAddress::Inet(addr), events.clone())
        .expect("connect");
    let established = events
        .wait_for_event(Duration::from_secs(2))
        .expect("connection established event");
    assert_eq!(established.kind, EventKind::ConnectionEstablished);
    events
}

#[test]
fn echo_round_trip() {
    let comm = test_comm();
    let addr = pick_port(38600);

    comm.listen(&CommAddress::Inet(addr), echo_factory(comm.clone()), None)
        .expect("listen");
    connect(&comm, addr);

    let mut request = CommBuf::new(CommHeader::new(1), 8);
    request.append_vstr("hello");

    let reply = DispatchHandlerSynchronizer::new();
    comm.send_request(&CommAddress::Inet(addr), 5_000, request, reply.clone())
        .expect("send request");

    let event = reply.wait_for_reply(Duration::from_secs(2)).expect("echo reply");
    assert_eq!(event.kind, EventKind::Message);
    assert!(event.error.is_none());
    assert_ne!(event.header.id, 0);

    let mut dec = Decoder::new(&event.payload);
    assert_eq!(dec.read_vstr().unwrap(), "hello");
}

#[test]
fn request_timeout_and_late_response_dropped() {
    let comm = test_comm();
    let addr = pick_port(38620);

    // The server delays its response until well past the request timeout.
    let server = comm.clone();
    let factory: Arc<dyn ConnectionHandlerFactory> = Arc::new(move || {
        let comm = server.clone();
        let handler: Arc<dyn DispatchHandler> = Arc::new(move |event: Arc<Event>| {
            if event.kind == EventKind::Message && event.header.is_request() {
                let comm = comm.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(700));
                    let header = CommHeader::initialize_from_request(&event.header);
                    let mut response = CommBuf::new(header, 4);
                    response.append_i32(0);
                    comm.send_response(&CommAddress::Inet(event.addr.unwrap()), response)
                        .ok();
                });
            }
        });
        handler
    });
    comm.listen(&CommAddress::Inet(addr), factory, None)
        .expect("listen");
    connect(&comm, addr);

    let mut request = CommBuf::new(CommHeader::new(1), 4);
    request.append_i32(7);

    let reply = DispatchHandlerSynchronizer::new();
    let started = Instant::now();
    comm.send_request(&CommAddress::Inet(addr), 500, request, reply.clone())
        .expect("send request");

    let result = reply.wait_for_reply(Duration::from_secs(2));
    let elapsed = started.elapsed();
    assert!(matches!(result, Err(CommError::RequestTimeout)));
    assert!(elapsed >= Duration::from_millis(450), "timed out early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_500), "timed out late: {elapsed:?}");

    // The late response with the same id must be dropped silently.
    assert!(reply.wait_for_event(Duration::from_millis(500)).is_none());
}

#[test]
fn close_socket_purges_outstanding_requests() {
    let comm = test_comm();
    let addr = pick_port(38640);

    comm.listen(&CommAddress::Inet(addr), black_hole_factory(), None)
        .expect("listen");
    let conn_events = connect(&comm, addr);

    let reply = DispatchHandlerSynchronizer::new();
    for _ in 0..3 {
        let mut request = CommBuf::new(CommHeader::new(2), 4);
        request.append_i32(1);
        comm.send_request(&CommAddress::Inet(addr), 10_000, request, reply.clone())
            .expect("send request");
    }

    comm.close_socket(&CommAddress::Inet(addr)).expect("close");

    for _ in 0..3 {
        let event = reply
            .wait_for_event(Duration::from_millis(500))
            .expect("purged request event");
        assert_eq!(event.kind, EventKind::Message);
        assert!(matches!(event.error, Some(CommError::BrokenConnection)));
    }

    let disconnect = conn_events
        .wait_for_event(Duration::from_millis(500))
        .expect("disconnect event");
    assert_eq!(disconnect.kind, EventKind::Disconnect);

    // Exactly once: nothing further arrives on this connection.
    assert!(conn_events.wait_for_event(Duration::from_millis(200)).is_none());
    assert!(reply.wait_for_event(Duration::from_millis(200)).is_none());
}

#[test]
fn send_request_without_connection_fails() {
    let comm = test_comm();
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let mut request = CommBuf::new(CommHeader::new(1), 0);
    request.append_i32(0);
    let reply = DispatchHandlerSynchronizer::new();
    assert!(matches!(
        comm.send_request(&CommAddress::Inet(addr), 100, request, reply),
        Err(CommError::NotConnected)
    ));
}

#[test]
fn duplicate_connect_is_rejected() {
    let comm = test_comm();
    let addr = pick_port(38660);

    comm.listen(&CommAddress::Inet(addr), black_hole_factory(), None)
        .expect("listen");
    connect(&comm, addr);

    let events = DispatchHandlerSynchronizer::new();
    assert!(matches!(
        comm.connect(&CommAddress::Inet(addr), events),
        Err(CommError::AlreadyConnected)
    ));
}

#[test]
fn alias_reaches_the_same_connection() {
    let comm = test_comm();
    let addr = pick_port(38680);

    comm.listen(&CommAddress::Inet(addr), echo_factory(comm.clone()), None)
        .expect("listen");
    connect(&comm, addr);

    let alias: SocketAddr = "10.255.0.1:15865".parse().unwrap();
    comm.set_alias(&addr, &alias).expect("set alias");

    let mut request = CommBuf::new(CommHeader::new(1), 8);
    request.append_vstr("via-alias");

    let reply = DispatchHandlerSynchronizer::new();
    comm.send_request(&CommAddress::Inet(alias), 5_000, request, reply.clone())
        .expect("send request through alias");

    let event = reply.wait_for_reply(Duration::from_secs(2)).expect("echo reply");
    let mut dec = Decoder::new(&event.payload);
    assert_eq!(dec.read_vstr().unwrap(), "via-alias");
}

#[test]
fn datagram_round_trip() {
    let comm = test_comm();

    let receiver = DispatchHandlerSynchronizer::new();
    let mut recv_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    comm.create_datagram_receive_socket(&mut recv_addr, receiver.clone())
        .expect("datagram receive socket");

    let sender = DispatchHandlerSynchronizer::new();
    let mut send_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    comm.create_datagram_receive_socket(&mut send_addr, sender)
        .expect("datagram send socket");

    let mut header = CommHeader::new(9);
    header.gid = 3;
    let mut cbuf = CommBuf::new(header, 8);
    cbuf.append_u64(0xabcd_1234);

    comm.send_datagram(&CommAddress::Inet(recv_addr), &send_addr, cbuf)
        .expect("send datagram");

    let event = receiver
        .wait_for_event(Duration::from_secs(2))
        .expect("datagram event");
    assert_eq!(event.kind, EventKind::Message);
    assert_eq!(event.header.command, 9);
    assert_eq!(event.header.gid, 3);

    let mut dec = Decoder::new(&event.payload);
    assert_eq!(dec.read_u64().unwrap(), 0xabcd_1234);
}

#[test]
fn timer_delivers_timer_event() {
    let comm = test_comm();

    let events = DispatchHandlerSynchronizer::new();
    let started = Instant::now();
    comm.set_timer(50, events.clone());

    let event = events
        .wait_for_event(Duration::from_secs(2))
        .expect("timer event");
    assert_eq!(event.kind, EventKind::Timer);
    assert!(started.elapsed() >= Duration::from_millis(45));
}
