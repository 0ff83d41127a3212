//! Coordination service session.
//!
//! One TCP connection (via the connection manager, with a handshake
//! initializer) plus one UDP socket for lease keep-alives. The session
//! exposes an observed state of SAFE, JEOPARDY or EXPIRED to its callback:
//! losing contact for the grace period means jeopardy, losing it for the
//! lease interval expires the session permanently.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use quartz_codec::{CodecError, Decoder};
use quartz_comm::header::FLAGS_BIT_IGNORE_RESPONSE;
use quartz_comm::{
    Comm, CommAddress, CommBuf, CommError, ConnectionInitializer, ConnectionManager,
    DispatchHandler, DispatchHandlerSynchronizer, Event, EventKind, LocalTime,
};

use crate::error::{code, AtlasError};
use crate::protocol;
use crate::types::{
    open_flags, Attribute, DirEntry, DirEntryAttr, HandleCallback, LockMode, LockSequencer,
    LockStatus, NodeEvent, PathEntryAttr,
};

/// Keep-alive send interval.
pub const TIMER_INTERVAL_MS: u32 = 1_000;
/// Default time without coordinator contact before the session observes
/// jeopardy.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 10_000;
/// Default lease interval; expiry is terminal.
pub const DEFAULT_LEASE_MS: u64 = 30_000;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Coordination service endpoint (TCP and UDP).
    pub addr: SocketAddr,
    /// Executable name reported in the handshake.
    pub exe_name: String,
    pub timer_interval_ms: u32,
    pub grace_period_ms: u64,
    pub lease_ms: u64,
    /// Re-dial pacing handed to the connection manager.
    pub reconnect_interval_ms: u32,
    /// Per-attempt timeout for requests.
    pub request_timeout_ms: u32,
}

impl SessionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            exe_name: std::env::args()
                .next()
                .unwrap_or_else(|| "quartz".to_owned()),
            timer_interval_ms: TIMER_INTERVAL_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            lease_ms: DEFAULT_LEASE_MS,
            reconnect_interval_ms: 3_000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Observed session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Safe,
    Jeopardy,
    Expired,
}

/// Callbacks observing session state transitions.
///
/// Invoked from reactor and timer threads; implementations must not block.
pub trait SessionCallback: Send + Sync {
    fn safe(&self) {}
    fn jeopardy(&self) {}
    fn expired(&self) {}
    fn disconnected(&self) {}
}

struct HandleState {
    path: String,
    open_flags: u32,
    callback: Option<Arc<dyn HandleCallback>>,
}

struct SessionData {
    session_id: u64,
    state: SessionState,
    last_contact: LocalTime,
    last_delivered_event: u64,
    handles: HashMap<u64, HandleState>,
    /// Set by `close_session`: the next keep-alive asks the server to
    /// destroy the session, and the timer stops.
    closing: bool,
}

struct SessionInner {
    comm: Comm,
    config: SessionConfig,
    target: CommAddress,
    callback: Arc<dyn SessionCallback>,
    data: Mutex<SessionData>,
    udp_local: OnceCell<SocketAddr>,
    keepalive_handler: OnceCell<Arc<dyn DispatchHandler>>,
    conn_manager: OnceCell<ConnectionManager>,
}

/// A client session with the coordination service.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session: bind the keep-alive socket, hand the TCP connection
    /// to the connection manager with the handshake initializer, and start
    /// the keep-alive timer.
    pub fn new(
        comm: Comm,
        config: SessionConfig,
        callback: Arc<dyn SessionCallback>,
    ) -> Result<Self, AtlasError> {
        let inner = Arc::new(SessionInner {
            comm: comm.clone(),
            target: CommAddress::Inet(config.addr),
            config,
            callback,
            data: Mutex::new(SessionData {
                session_id: 0,
                state: SessionState::Jeopardy,
                last_contact: LocalTime::now(),
                last_delivered_event: 0,
                handles: HashMap::new(),
                closing: false,
            }),
            udp_local: OnceCell::new(),
            keepalive_handler: OnceCell::new(),
            conn_manager: OnceCell::new(),
        });

        let mut udp_addr: SocketAddr = SocketAddr::new(
            "0.0.0.0".parse().expect("wildcard address"),
            0,
        );
        comm.create_datagram_receive_socket(
            &mut udp_addr,
            Arc::new(UdpDispatch {
                inner: Arc::downgrade(&inner),
            }),
        )
        .map_err(AtlasError::Comm)?;
        inner.udp_local.set(udp_addr).ok();

        let keepalive: Arc<dyn DispatchHandler> = Arc::new(KeepaliveTimer {
            inner: Arc::downgrade(&inner),
        });
        inner.keepalive_handler.set(keepalive.clone()).ok();

        let manager = ConnectionManager::new(comm.clone());
        manager.set_quiet_mode(true);
        manager.add_with_handler(
            &inner.target,
            inner.config.reconnect_interval_ms,
            "atlas",
            Some(Arc::new(SessionDispatch {
                inner: Arc::downgrade(&inner),
            })),
            Some(Arc::new(HandshakeInitializer {
                inner: Arc::downgrade(&inner),
            })),
        );
        inner.conn_manager.set(manager).ok();

        comm.set_timer(inner.config.timer_interval_ms, keepalive);

        Ok(Self { inner })
    }

    /// Block until the TCP connection is established and the handshake has
    /// completed, or the timeout expires.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.inner
            .conn_manager
            .get()
            .expect("connection manager installed")
            .wait_for_connection(&self.inner.target, timeout)
    }

    pub fn state(&self) -> SessionState {
        self.inner.data.lock().expect("session lock").state
    }

    pub fn session_id(&self) -> u64 {
        self.inner.data.lock().expect("session lock").session_id
    }

    /// Open a node handle. Events matching the callback's mask are
    /// delivered to it until the handle is closed.
    pub fn open(
        &self,
        name: &str,
        flags: u32,
        callback: Option<Arc<dyn HandleCallback>>,
        init_attrs: &[Attribute],
    ) -> Result<u64, AtlasError> {
        let mask = callback.as_ref().map(|c| c.event_mask()).unwrap_or(0);
        let event =
            self.rpc(|| protocol::create_open_request(name, flags, mask, init_attrs), None)?;

        let mut dec = response_body(&event)?;
        let handle = dec.read_u64()?;
        let _created = dec.read_bool()?;
        let _lock_generation = dec.read_u64()?;

        let mut data = self.inner.data.lock().expect("session lock");
        data.handles.insert(
            handle,
            HandleState {
                path: name.to_owned(),
                open_flags: flags,
                callback,
            },
        );
        debug!(target: "atlas", "opened {} as handle {}", name, handle);
        Ok(handle)
    }

    /// Close a node handle.
    pub fn close(&self, handle: u64) -> Result<(), AtlasError> {
        let event = self.rpc(|| protocol::create_close_request(handle), None)?;
        response_body(&event)?;
        self.inner
            .data
            .lock()
            .expect("session lock")
            .handles
            .remove(&handle);
        Ok(())
    }

    pub fn mkdir(&self, name: &str, init_attrs: &[Attribute]) -> Result<(), AtlasError> {
        let event =
            self.rpc(|| protocol::create_mkdir_request(name, false, init_attrs), None)?;
        response_body(&event).map(|_| ())
    }

    /// Create a directory node, creating missing intermediate nodes.
    pub fn mkdirs(&self, name: &str, init_attrs: &[Attribute]) -> Result<(), AtlasError> {
        let event = self.rpc(|| protocol::create_mkdir_request(name, true, init_attrs), None)?;
        response_body(&event).map(|_| ())
    }

    pub fn delete(&self, name: &str) -> Result<(), AtlasError> {
        let event = self.rpc(|| protocol::create_delete_request(name), None)?;
        response_body(&event).map(|_| ())
    }

    pub fn exists(&self, name: &str) -> Result<bool, AtlasError> {
        let event = self.rpc(|| protocol::create_exists_request(name), None)?;
        let mut dec = response_body(&event)?;
        Ok(dec.read_bool()?)
    }

    pub fn readdir(&self, handle: u64) -> Result<Vec<DirEntry>, AtlasError> {
        let event = self.rpc(|| protocol::create_readdir_request(handle), None)?;
        let mut dec = response_body(&event)?;

        let count = dec.read_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(DirEntry {
                name: dec.read_vstr()?,
                is_dir: dec.read_bool()?,
            });
        }
        Ok(entries)
    }

    pub fn readdir_attr(
        &self,
        handle: u64,
        attr: &str,
        include_sub_entries: bool,
    ) -> Result<Vec<DirEntryAttr>, AtlasError> {
        let event = self.rpc(
            || protocol::create_readdir_attr_request(handle, attr, include_sub_entries),
            None,
        )?;
        let mut dec = response_body(&event)?;

        let count = dec.read_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(DirEntryAttr {
                name: dec.read_vstr()?,
                is_dir: dec.read_bool()?,
                has_attr: dec.read_bool()?,
                attr: dec.read_vbytes()?.to_vec(),
            });
        }
        Ok(entries)
    }

    pub fn readpath_attr(&self, handle: u64, attr: &str) -> Result<Vec<PathEntryAttr>, AtlasError> {
        let event =
            self.rpc(|| protocol::create_readpath_attr_request(handle, attr), None)?;
        let mut dec = response_body(&event)?;

        let count = dec.read_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(PathEntryAttr {
                name: dec.read_vstr()?,
                attr: dec.read_vbytes()?.to_vec(),
            });
        }
        Ok(entries)
    }

    pub fn attr_set(&self, handle: u64, attrs: &[Attribute]) -> Result<(), AtlasError> {
        let event = self.rpc(|| protocol::create_attr_set_request(handle, attrs), None)?;
        response_body(&event).map(|_| ())
    }

    pub fn attr_get(&self, handle: u64, name: &str) -> Result<Vec<u8>, AtlasError> {
        let event = self.rpc(|| protocol::create_attr_get_request(handle, name), None)?;
        let mut dec = response_body(&event)?;
        Ok(dec.read_vbytes()?.to_vec())
    }

    /// Atomically increment a numeric attribute, returning the new value.
    pub fn attr_incr(&self, handle: u64, name: &str) -> Result<u64, AtlasError> {
        let event = self.rpc(|| protocol::create_attr_incr_request(handle, name), None)?;
        let mut dec = response_body(&event)?;
        Ok(dec.read_u64()?)
    }

    pub fn attr_del(&self, handle: u64, name: &str) -> Result<(), AtlasError> {
        let event = self.rpc(|| protocol::create_attr_del_request(handle, name), None)?;
        response_body(&event).map(|_| ())
    }

    pub fn attr_exists(&self, handle: u64, name: &str) -> Result<bool, AtlasError> {
        let event = self.rpc(|| protocol::create_attr_exists_request(handle, name), None)?;
        let mut dec = response_body(&event)?;
        Ok(dec.read_bool()?)
    }

    pub fn attr_list(&self, handle: u64) -> Result<Vec<String>, AtlasError> {
        let event = self.rpc(|| protocol::create_attr_list_request(handle), None)?;
        let mut dec = response_body(&event)?;

        let count = dec.read_u32()?;
        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            names.push(dec.read_vstr()?);
        }
        Ok(names)
    }

    /// Acquire a lock, blocking on the server until granted. The returned
    /// sequencer fences writes performed under the lock.
    ///
    /// The handle must have been opened with the LOCK flag.
    pub fn lock(&self, handle: u64, mode: LockMode) -> Result<LockSequencer, AtlasError> {
        self.check_lockable(handle)?;
        // Blocking acquisition: the request stays pending until response or
        // disconnect, so no request timeout is armed.
        let event = self.rpc(
            || protocol::create_lock_request(handle, mode, false),
            Some(0),
        )?;
        let mut dec = response_body(&event)?;

        let status = LockStatus::from_u32(dec.read_u32()?).ok_or(AtlasError::Protocol)?;
        if status != LockStatus::Granted {
            return Err(AtlasError::LockConflict);
        }
        let generation = dec.read_u64()?;
        Ok(LockSequencer {
            name: self.handle_path(handle),
            mode,
            generation,
        })
    }

    /// Attempt a lock without blocking.
    pub fn try_lock(
        &self,
        handle: u64,
        mode: LockMode,
    ) -> Result<(LockStatus, Option<LockSequencer>), AtlasError> {
        self.check_lockable(handle)?;
        let event = self.rpc(|| protocol::create_lock_request(handle, mode, true), None)?;
        let mut dec = response_body(&event)?;

        let status = LockStatus::from_u32(dec.read_u32()?).ok_or(AtlasError::Protocol)?;
        let sequencer = if status == LockStatus::Granted {
            Some(LockSequencer {
                name: self.handle_path(handle),
                mode,
                generation: dec.read_u64()?,
            })
        } else {
            None
        };
        Ok((status, sequencer))
    }

    pub fn release(&self, handle: u64) -> Result<(), AtlasError> {
        let event = self.rpc(|| protocol::create_release_request(handle), None)?;
        response_body(&event).map(|_| ())
    }

    /// Validate a sequencer against the current lock state. Used by third
    /// parties to fence operations.
    pub fn check_sequencer(&self, sequencer: &LockSequencer) -> Result<(), AtlasError> {
        let event =
            self.rpc(|| protocol::create_check_sequencer_request(sequencer), None)?;
        response_body(&event).map(|_| ())
    }

    /// Query coordinator status: a numeric code and descriptive text.
    pub fn status(&self) -> Result<(i32, String), AtlasError> {
        let event = self.rpc(protocol::create_status_request, None)?;
        let mut dec = response_body(&event)?;
        Ok((dec.read_i32()?, dec.read_vstr()?))
    }

    /// Ask the coordinator process to shut down. Fire-and-forget.
    pub fn server_shutdown(&self) -> Result<(), AtlasError> {
        self.inner.check_not_expired()?;
        let mut cbuf = protocol::create_shutdown_request();
        cbuf.header.flags |= FLAGS_BIT_IGNORE_RESPONSE;
        self.inner
            .comm
            .send_request(
                &self.inner.target,
                0,
                cbuf,
                DispatchHandlerSynchronizer::new(),
            )
            .map_err(AtlasError::Comm)
    }

    /// Submit a request asynchronously; the handler observes the raw
    /// response event.
    pub fn submit(
        &self,
        cbuf: CommBuf,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), AtlasError> {
        self.inner.check_not_expired()?;
        self.inner
            .comm
            .send_request(
                &self.inner.target,
                self.inner.config.request_timeout_ms,
                cbuf,
                handler,
            )
            .map_err(AtlasError::Comm)
    }

    /// End the session: ask the server to destroy it and stop
    /// reconnecting. The session callback is not invoked.
    pub fn close_session(&self) {
        let session_id = {
            let mut data = self.inner.data.lock().expect("session lock");
            if data.closing {
                return;
            }
            data.closing = true;
            data.state = SessionState::Expired;
            data.handles.clear();
            data.session_id
        };

        if let Some(udp_local) = self.inner.udp_local.get() {
            let cbuf = protocol::create_keepalive_request(session_id, 0, true);
            self.inner
                .comm
                .send_datagram(&self.inner.target, udp_local, cbuf)
                .ok();
        }
        if let Some(manager) = self.inner.conn_manager.get() {
            manager.remove(&self.inner.target);
        }
    }

    fn handle_path(&self, handle: u64) -> String {
        let data = self.inner.data.lock().expect("session lock");
        data.handles
            .get(&handle)
            .map(|h| h.path.clone())
            .unwrap_or_default()
    }

    /// A handle registered in this session must carry the LOCK open flag
    /// before lock requests are issued for it.
    fn check_lockable(&self, handle: u64) -> Result<(), AtlasError> {
        let data = self.inner.data.lock().expect("session lock");
        match data.handles.get(&handle) {
            Some(state) if state.open_flags & open_flags::LOCK == 0 => {
                Err(AtlasError::ModeRestriction)
            }
            _ => Ok(()),
        }
    }

    /// Issue a request with the synchronous wrapper, replaying it after a
    /// reconnect if the response was never seen. `timeout_override` of zero
    /// disables the per-request timeout (blocking server-side operations).
    fn rpc(
        &self,
        build: impl Fn() -> CommBuf,
        timeout_override: Option<u32>,
    ) -> Result<Arc<Event>, AtlasError> {
        let per_try_ms = timeout_override.unwrap_or(self.inner.config.request_timeout_ms);
        let overall = if per_try_ms == 0 {
            // Blocking operations wait as long as the session lives.
            Duration::from_secs(86_400 * 365)
        } else {
            Duration::from_millis(self.inner.config.request_timeout_ms as u64)
        };
        let deadline = Instant::now() + overall;

        loop {
            self.inner.check_not_expired()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AtlasError::Comm(CommError::RequestTimeout));
            }

            if !self.wait_for_connection(remaining) {
                self.inner.check_not_expired()?;
                return Err(AtlasError::Comm(CommError::NotConnected));
            }

            let sync = DispatchHandlerSynchronizer::new();
            match self.inner.comm.send_request(
                &self.inner.target,
                per_try_ms,
                build(),
                sync.clone(),
            ) {
                Ok(()) => {}
                Err(CommError::NotConnected) | Err(CommError::BrokenConnection) => continue,
                Err(err) => return Err(AtlasError::Comm(err)),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match sync.wait_for_reply(remaining) {
                Ok(event) => return Ok(event),
                // The connection dropped with the response unseen: replay
                // once the manager re-establishes it. The server tolerates
                // duplicates.
                Err(CommError::BrokenConnection) | Err(CommError::NotConnected) => {
                    debug!(target: "atlas", "request interrupted by disconnect, replaying");
                    continue;
                }
                Err(err) => {
                    self.inner.check_not_expired()?;
                    return Err(AtlasError::Comm(err));
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_session();
    }
}

/// Read past the service error code, failing on nonzero codes.
fn response_body(event: &Event) -> Result<Decoder<'_>, AtlasError> {
    let mut dec = Decoder::new(&event.payload);
    let code = dec.read_i32()?;
    if code != code::OK {
        return Err(AtlasError::from_code(code));
    }
    Ok(dec)
}

impl From<CodecError> for AtlasError {
    fn from(_: CodecError) -> Self {
        AtlasError::Protocol
    }
}

impl SessionInner {
    fn check_not_expired(&self) -> Result<(), AtlasError> {
        let data = self.data.lock().expect("session lock");
        if data.state == SessionState::Expired {
            return Err(AtlasError::SessionExpired);
        }
        Ok(())
    }

    /// Transition the observed state, invoking the matching callback once
    /// per edge. Expired is terminal.
    fn state_transition(&self, to: SessionState) {
        let edge = {
            let mut data = self.data.lock().expect("session lock");
            match (data.state, to) {
                (SessionState::Expired, _) => None,
                (from, to) if from == to => None,
                (_, to) => {
                    data.state = to;
                    Some(to)
                }
            }
        };

        match edge {
            Some(SessionState::Safe) => {
                info!(target: "atlas", "session state: SAFE");
                self.callback.safe();
            }
            Some(SessionState::Jeopardy) => {
                warn!(target: "atlas", "session state: JEOPARDY");
                self.callback.jeopardy();
            }
            Some(SessionState::Expired) => {
                warn!(target: "atlas", "session expired");
                if let Some(manager) = self.conn_manager.get() {
                    manager.remove(&self.target);
                }
                self.comm.close_socket(&self.target).ok();
                self.callback.expired();
            }
            None => {}
        }
    }

    fn on_handshake_ok(&self) {
        {
            let mut data = self.data.lock().expect("session lock");
            data.last_contact = LocalTime::now();
        }
        self.state_transition(SessionState::Safe);
    }

    fn on_disconnect(&self) {
        let was_safe = {
            let data = self.data.lock().expect("session lock");
            data.state == SessionState::Safe
        };
        self.state_transition(SessionState::Jeopardy);
        // Dial failures during reconnect arrive here too; only the loss of
        // an established connection is reported.
        if was_safe {
            self.callback.disconnected();
        }
    }

    /// Timer tick: check the lease, send a keep-alive, re-arm.
    fn on_timer(&self) {
        let action = {
            let data = self.data.lock().expect("session lock");
            if data.closing || data.state == SessionState::Expired {
                return; // timer stops
            }
            let elapsed = LocalTime::now() - data.last_contact;
            if elapsed >= Duration::from_millis(self.config.lease_ms) {
                TimerAction::Expire
            } else if elapsed >= Duration::from_millis(self.config.grace_period_ms) {
                TimerAction::Jeopardy(data.session_id, data.last_delivered_event)
            } else {
                TimerAction::Keepalive(data.session_id, data.last_delivered_event)
            }
        };

        match action {
            TimerAction::Expire => {
                self.state_transition(SessionState::Expired);
                return;
            }
            TimerAction::Jeopardy(session_id, last_delivered) => {
                self.state_transition(SessionState::Jeopardy);
                self.send_keepalive(session_id, last_delivered);
            }
            TimerAction::Keepalive(session_id, last_delivered) => {
                self.send_keepalive(session_id, last_delivered);
            }
        }

        if let Some(handler) = self.keepalive_handler.get() {
            self.comm.set_timer(self.config.timer_interval_ms, handler.clone());
        }
    }

    fn send_keepalive(&self, session_id: u64, last_delivered: u64) {
        let Some(udp_local) = self.udp_local.get() else { return };
        let cbuf = protocol::create_keepalive_request(session_id, last_delivered, false);
        if let Err(err) = self.comm.send_datagram(&self.target, udp_local, cbuf) {
            debug!(target: "atlas", "keepalive send failed: {}", err);
        }
    }

    /// Keep-alive reply: refresh the lease, adopt the assigned session id,
    /// deliver new node events in id order.
    fn on_keepalive_reply(&self, event: &Event) {
        let parsed = match parse_keepalive_reply(&event.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(target: "atlas", "malformed keepalive reply: {}", err);
                return;
            }
        };

        if parsed.error == code::SESSION_EXPIRED {
            self.state_transition(SessionState::Expired);
            return;
        }

        let (deliveries, went_safe) = {
            let mut data = self.data.lock().expect("session lock");
            if data.state == SessionState::Expired || data.closing {
                return;
            }
            if data.session_id == 0 {
                data.session_id = parsed.session_id;
                info!(target: "atlas", "session {} established", parsed.session_id);
            } else if data.session_id != parsed.session_id {
                debug!(target: "atlas", "ignoring keepalive for session {}", parsed.session_id);
                return;
            }

            data.last_contact = LocalTime::now();
            let went_safe = data.state == SessionState::Jeopardy;

            let mut deliveries = Vec::new();
            for notification in parsed.notifications {
                if notification.event_id <= data.last_delivered_event {
                    continue; // duplicate delivery
                }
                data.last_delivered_event = notification.event_id;
                if let Some(handle) = data.handles.get(&notification.handle) {
                    if let Some(callback) = &handle.callback {
                        if callback.event_mask() & notification.event.mask_bit() != 0 {
                            deliveries.push((callback.clone(), notification.event));
                        }
                    }
                }
            }
            (deliveries, went_safe)
        };

        if went_safe {
            self.state_transition(SessionState::Safe);
        }
        for (callback, node_event) in deliveries {
            callback.deliver(&node_event);
        }
    }

    /// Server-initiated TCP message, e.g. a REDIRECT when the peer lost
    /// mastership.
    fn on_server_message(&self, event: &Event) {
        if event.header.command == protocol::COMMAND_REDIRECT {
            let host = Decoder::new(&event.payload).read_vstr().unwrap_or_default();
            warn!(target: "atlas", "redirected by coordinator toward {:?}, reconnecting", host);
            self.comm.close_socket(&self.target).ok();
        } else {
            debug!(
                target: "atlas",
                "unexpected server message: {}",
                protocol::command_text(event.header.command)
            );
        }
    }
}

enum TimerAction {
    Expire,
    Jeopardy(u64, u64),
    Keepalive(u64, u64),
}

struct ParsedNotification {
    handle: u64,
    event_id: u64,
    event: NodeEvent,
}

struct ParsedKeepalive {
    session_id: u64,
    error: i32,
    notifications: Vec<ParsedNotification>,
}

/// Coordinator keep-alive reply: {u64 session_id, i32 error,
/// i32 notification_count, count * {u64 handle, u64 event_id, event}}.
fn parse_keepalive_reply(payload: &[u8]) -> Result<ParsedKeepalive, CodecError> {
    let mut dec = Decoder::new(payload);
    let session_id = dec.read_u64()?;
    let error = dec.read_i32()?;
    let count = dec.read_i32()?;

    let mut notifications = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        notifications.push(ParsedNotification {
            handle: dec.read_u64()?,
            event_id: dec.read_u64()?,
            event: NodeEvent::decode(&mut dec)?,
        });
    }
    Ok(ParsedKeepalive {
        session_id,
        error,
        notifications,
    })
}

/// Handshake driver handed to the connection manager.
struct HandshakeInitializer {
    inner: Weak<SessionInner>,
}

impl ConnectionInitializer for HandshakeInitializer {
    fn create_initialization_request(&self) -> CommBuf {
        let (session_id, exe_name) = match self.inner.upgrade() {
            Some(inner) => {
                let data = inner.data.lock().expect("session lock");
                (data.session_id, inner.config.exe_name.clone())
            }
            None => (0, String::new()),
        };
        protocol::create_handshake_request(session_id, &exe_name)
    }

    fn process_initialization_response(&self, event: &Event) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        match event.response_code() {
            Ok(code::OK) => {
                inner.on_handshake_ok();
                true
            }
            other => {
                warn!(target: "atlas", "handshake rejected: {:?}", other);
                false
            }
        }
    }
}

/// Events on the managed TCP connection, post-handshake.
struct SessionDispatch {
    inner: Weak<SessionInner>,
}

impl DispatchHandler for SessionDispatch {
    fn handle(&self, event: Arc<Event>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match event.kind {
            EventKind::Disconnect => inner.on_disconnect(),
            EventKind::Message if event.error.is_none() => inner.on_server_message(&event),
            _ => {}
        }
    }
}

/// Keep-alive datagrams from the coordinator.
struct UdpDispatch {
    inner: Weak<SessionInner>,
}

impl DispatchHandler for UdpDispatch {
    fn handle(&self, event: Arc<Event>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if event.kind == EventKind::Message
            && event.header.command == protocol::COMMAND_KEEPALIVE
        {
            inner.on_keepalive_reply(&event);
        }
    }
}

/// Re-arms itself through the timer reactor each interval.
struct KeepaliveTimer {
    inner: Weak<SessionInner>,
}

impl DispatchHandler for KeepaliveTimer {
    fn handle(&self, _event: Arc<Event>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_timer();
        }
    }
}
