//! Per-descriptor I/O handlers: TCP data, TCP listener, UDP datagram.
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace};

use crate::checksum::fletcher32;
use crate::dispatch::{ConnectionHandlerFactory, DispatchHandler};
use crate::error::CommError;
use crate::event::Event;
use crate::header::{CommHeader, FLAGS_BIT_PAYLOAD_CHECKSUM, HEADER_LENGTH};
use crate::reactor::Registrar;

/// Socket read buffer size.
pub(crate) const READ_BUFFER_SIZE: usize = 1024 * 192;
/// Largest datagram the substrate will parse.
const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// A dispatch callback paired with the event to deliver.
///
/// Handlers assemble these under their lock; the reactor runs them after
/// every lock has been released.
pub(crate) type PendingDispatch = (Arc<dyn DispatchHandler>, Arc<Event>);

/// Result of feeding a readable TCP socket.
pub(crate) struct ReadOutcome {
    pub dispatches: Vec<PendingDispatch>,
    /// Payload of an inbound `PROXY_MAP_UPDATE` frame, consumed out-of-band.
    pub proxy_update: Option<Vec<u8>>,
    /// Set when the connection must be torn down.
    pub closed: Option<CommError>,
}

impl ReadOutcome {
    fn empty() -> Self {
        Self {
            dispatches: Vec::new(),
            proxy_update: None,
            closed: None,
        }
    }
}

/// Result of flushing a writable TCP socket.
pub(crate) enum WriteOutcome {
    Ok {
        /// Connection-established delivery, on the first writable event of
        /// an outbound connect.
        established: Option<PendingDispatch>,
        /// The send queue drained completely; write interest can be unset.
        queue_empty: bool,
    },
    Closed(CommError),
}

struct OutFrame {
    bytes: Vec<u8>,
    pos: usize,
}

struct TcpState {
    stream: TcpStream,
    local_addr: SocketAddr,
    connected: bool,
    shutdown: bool,
    default_dispatch: Option<Arc<dyn DispatchHandler>>,
    recv: Vec<u8>,
    sendq: VecDeque<OutFrame>,
    requests: HashMap<u32, Arc<dyn DispatchHandler>>,
}

/// Per-connection state machine.
///
/// Owns the descriptor, the receive assembly buffer, the send queue and the
/// table of outstanding requests. The owning reactor thread performs reads;
/// any thread may send, taking the direct-write fast path when the queue is
/// empty.
pub(crate) struct TcpHandler {
    remote: SocketAddr,
    reactor: usize,
    registrar: Arc<Registrar>,
    state: Mutex<TcpState>,
}

impl TcpHandler {
    pub fn new(
        stream: TcpStream,
        remote: SocketAddr,
        connected: bool,
        reactor: usize,
        registrar: Arc<Registrar>,
        default_dispatch: Option<Arc<dyn DispatchHandler>>,
    ) -> Self {
        let local_addr = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

        Self {
            remote,
            reactor,
            registrar,
            state: Mutex::new(TcpState {
                stream,
                local_addr,
                connected,
                shutdown: false,
                default_dispatch,
                recv: Vec::new(),
                sendq: VecDeque::new(),
                requests: HashMap::new(),
            }),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn reactor(&self) -> usize {
        self.reactor
    }

    pub fn raw_fd(&self) -> RawFd {
        self.state.lock().expect("tcp handler lock").stream.as_raw_fd()
    }

    /// Register an outstanding request. Fails once the connection is down.
    pub fn add_request(
        &self,
        id: u32,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), CommError> {
        let mut state = self.state.lock().expect("tcp handler lock");
        if state.shutdown {
            return Err(CommError::BrokenConnection);
        }
        state.requests.insert(id, handler);
        Ok(())
    }

    /// Remove and return the response handler for `id`, if still pending.
    pub fn remove_request(&self, id: u32) -> Option<Arc<dyn DispatchHandler>> {
        let mut state = self.state.lock().expect("tcp handler lock");
        state.requests.remove(&id)
    }

    /// Queue a frame for delivery, writing directly from the calling thread
    /// when the socket is idle. Residual bytes stay at the head of the send
    /// queue and write interest is armed on the multiplexer.
    pub fn send_frame(&self, bytes: Vec<u8>) -> Result<(), CommError> {
        let mut state = self.state.lock().expect("tcp handler lock");
        if state.shutdown {
            return Err(CommError::BrokenConnection);
        }

        let mut frame = OutFrame { bytes, pos: 0 };
        if state.connected && state.sendq.is_empty() {
            match write_frame(&state.stream, &mut frame) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => return Err(CommError::send(err)),
            }
        }

        state.sendq.push_back(frame);
        if state.connected {
            self.registrar.set_write(self.reactor, self.remote, true);
        }
        Ok(())
    }

    /// Drive the socket on a writable readiness event.
    pub fn handle_write(&self) -> WriteOutcome {
        let mut guard = self.state.lock().expect("tcp handler lock");
        let state = &mut *guard;
        if state.shutdown {
            return WriteOutcome::Ok {
                established: None,
                queue_empty: true,
            };
        }

        let mut established = None;
        if !state.connected {
            // A non-blocking connect is complete once the socket reports
            // writable.
            state.connected = true;
            if let Ok(local) = state.stream.local_addr() {
                state.local_addr = local;
            }
            trace!(target: "comm", "{}: connection established", self.remote);
            if let Some(handler) = &state.default_dispatch {
                established = Some((
                    handler.clone(),
                    Arc::new(Event::connection_established(self.remote, state.local_addr)),
                ));
            }
        }

        while let Some(frame) = state.sendq.front_mut() {
            match write_frame(&state.stream, frame) {
                Ok(true) => {
                    state.sendq.pop_front();
                }
                Ok(false) => {
                    return WriteOutcome::Ok {
                        established,
                        queue_empty: false,
                    };
                }
                Err(err) => {
                    error!(target: "comm", "{}: write error: {}", self.remote, err);
                    return WriteOutcome::Closed(CommError::send(err));
                }
            }
        }

        WriteOutcome::Ok {
            established,
            queue_empty: true,
        }
    }

    /// Drive the socket on a readable readiness event.
    ///
    /// The multiplexer is level-triggered, so a single read per wake-up is
    /// sufficient; remaining bytes trigger another readiness event.
    pub fn handle_read(&self) -> ReadOutcome {
        let mut outcome = ReadOutcome::empty();
        let mut state = self.state.lock().expect("tcp handler lock");
        if state.shutdown {
            return outcome;
        }

        let mut buffer = [0; READ_BUFFER_SIZE];
        match (&state.stream).read(&mut buffer) {
            Ok(0) => {
                // Orderly shutdown by the peer.
                outcome.closed = Some(CommError::BrokenConnection);
            }
            Ok(count) => {
                state.recv.extend_from_slice(&buffer[..count]);
                self.drain_frames(&mut state, &mut outcome);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                trace!(target: "comm", "{}: read error: {}", self.remote, err);
                outcome.closed = Some(CommError::send(err));
            }
        }
        outcome
    }

    /// Extract complete frames from the receive buffer.
    fn drain_frames(&self, state: &mut TcpState, outcome: &mut ReadOutcome) {
        while state.recv.len() >= HEADER_LENGTH {
            let header = match CommHeader::decode(&state.recv) {
                Ok(header) => header,
                Err(err) => {
                    error!(target: "comm", "{}: bad frame header: {}", self.remote, err);
                    outcome.closed = Some(err);
                    return;
                }
            };

            let total = header.total_len as usize;
            if state.recv.len() < total {
                return;
            }

            let payload = state.recv[HEADER_LENGTH..total].to_vec();
            state.recv.drain(..total);

            if header.flags & FLAGS_BIT_PAYLOAD_CHECKSUM != 0
                && fletcher32(&payload) != header.payload_checksum
            {
                error!(target: "comm", "{}: payload checksum mismatch", self.remote);
                outcome.closed = Some(CommError::Protocol("payload checksum mismatch".into()));
                return;
            }

            if header.is_proxy_map_update() {
                outcome.proxy_update = Some(payload);
                continue;
            }

            if header.is_request() {
                match &state.default_dispatch {
                    Some(handler) => outcome.dispatches.push((
                        handler.clone(),
                        Arc::new(Event::message(
                            self.remote,
                            state.local_addr,
                            header,
                            payload,
                        )),
                    )),
                    None => {
                        debug!(target: "comm", "{}: dropping request, no dispatch handler", self.remote)
                    }
                }
            } else {
                match state.requests.remove(&header.id) {
                    Some(handler) => outcome.dispatches.push((
                        handler,
                        Arc::new(Event::message(
                            self.remote,
                            state.local_addr,
                            header,
                            payload,
                        )),
                    )),
                    // The requester timed out or is no longer interested.
                    None => trace!(target: "comm", "{}: dropping response id={}", self.remote, header.id),
                }
            }
        }
    }

    /// Tear down the connection, yielding the events to deliver: one
    /// broken-connection failure per outstanding request, then exactly one
    /// disconnect to the default handler. Idempotent.
    pub fn take_disconnect(&self, error: Option<CommError>) -> Vec<PendingDispatch> {
        let mut state = self.state.lock().expect("tcp handler lock");
        if state.shutdown {
            return Vec::new();
        }
        state.shutdown = true;
        state.stream.shutdown(std::net::Shutdown::Both).ok();
        state.sendq.clear();

        let mut dispatches: Vec<PendingDispatch> = state
            .requests
            .drain()
            .map(|(id, handler)| {
                (
                    handler,
                    Arc::new(Event::request_failure(
                        self.remote,
                        id,
                        CommError::BrokenConnection,
                    )),
                )
            })
            .collect();

        if let Some(handler) = state.default_dispatch.take() {
            dispatches.push((
                handler,
                Arc::new(Event::disconnect(self.remote, error)),
            ));
        }
        dispatches
    }
}

/// Write an outbound frame until done or the socket would block.
/// Returns `Ok(true)` when the frame completed.
fn write_frame(mut stream: &TcpStream, frame: &mut OutFrame) -> io::Result<bool> {
    while frame.pos < frame.bytes.len() {
        match stream.write(&frame.bytes[frame.pos..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => frame.pos += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

/// Listening socket handler. Accepts connections and hands them dispatch
/// handlers built by the factory registered at listen time.
pub(crate) struct ListenerHandler {
    local: SocketAddr,
    reactor: usize,
    listener: TcpListener,
    factory: Arc<dyn ConnectionHandlerFactory>,
    default_dispatch: Option<Arc<dyn DispatchHandler>>,
}

impl ListenerHandler {
    pub fn new(
        listener: TcpListener,
        local: SocketAddr,
        reactor: usize,
        factory: Arc<dyn ConnectionHandlerFactory>,
        default_dispatch: Option<Arc<dyn DispatchHandler>>,
    ) -> Self {
        Self {
            local,
            reactor,
            listener,
            factory,
            default_dispatch,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn reactor(&self) -> usize {
        self.reactor
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept until the socket would block.
    pub fn accept_ready(&self) -> Vec<(TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((conn, peer)) => {
                    if let Err(err) = conn.set_nonblocking(true) {
                        error!(target: "comm", "{}: accept setup error: {}", peer, err);
                        continue;
                    }
                    trace!(target: "comm", "{}: accepted connection on {}", peer, self.local);
                    accepted.push((conn, peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(target: "comm", "accept error on {}: {}", self.local, err);
                    break;
                }
            }
        }
        accepted
    }

    pub fn make_conn_dispatch(&self) -> Arc<dyn DispatchHandler> {
        self.factory.make_handler()
    }

    pub fn default_dispatch(&self) -> Option<Arc<dyn DispatchHandler>> {
        self.default_dispatch.clone()
    }
}

/// Datagram socket handler. Each datagram carries exactly one frame.
pub(crate) struct UdpHandler {
    local: SocketAddr,
    reactor: usize,
    socket: UdpSocket,
    dispatch: Arc<dyn DispatchHandler>,
}

impl UdpHandler {
    pub fn new(
        socket: UdpSocket,
        local: SocketAddr,
        reactor: usize,
        dispatch: Arc<dyn DispatchHandler>,
    ) -> Self {
        Self {
            local,
            reactor,
            socket,
            dispatch,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn reactor(&self) -> usize {
        self.reactor
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Drain every pending datagram, decoding each as one complete frame.
    pub fn handle_read(&self) -> Vec<PendingDispatch> {
        let mut dispatches = Vec::new();
        let mut buffer = [0; DATAGRAM_BUFFER_SIZE];

        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((count, peer)) => {
                    let datagram = &buffer[..count];
                    let header = match CommHeader::decode(datagram) {
                        Ok(header) => header,
                        Err(err) => {
                            debug!(target: "comm", "{}: dropping datagram: {}", peer, err);
                            continue;
                        }
                    };
                    let total = header.total_len as usize;
                    if total > count {
                        debug!(target: "comm", "{}: dropping short datagram", peer);
                        continue;
                    }
                    let payload = datagram[HEADER_LENGTH..total].to_vec();
                    dispatches.push((
                        self.dispatch.clone(),
                        Arc::new(Event::message(peer, self.local, header, payload)),
                    ));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(target: "comm", "datagram read error on {}: {}", self.local, err);
                    break;
                }
            }
        }
        dispatches
    }

    /// Send exactly one datagram.
    pub fn send_datagram(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), CommError> {
        self.socket
            .send_to(bytes, addr)
            .map_err(CommError::send)?;
        Ok(())
    }
}
