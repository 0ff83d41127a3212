//! Poll-based reactor pool.
//!
//! Each reactor is a thread running a `poll` loop over the descriptors
//! assigned to it. Descriptors are bound to one reactor for their entire
//! lifetime, chosen round-robin at registration. Registration and interest
//! changes from other threads travel over a control channel and wake the
//! loop through a [`popol::Waker`].
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use tracing::{error, trace};

use crate::addr::CommAddress;
use crate::error::CommError;
use crate::handler::{PendingDispatch, WriteOutcome};
use crate::handler_map::{HandlerEntry, HandlerMap};
use crate::proxy::ProxyMap;

/// Maximum amount of time to wait for i/o before re-checking control state.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Key identifying a registered descriptor within one reactor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Source {
    /// A TCP connection, keyed by remote address.
    Conn(SocketAddr),
    /// A listening socket, keyed by local address.
    Listener(SocketAddr),
    /// A datagram socket, keyed by local address.
    Datagram(SocketAddr),
    Waker,
}

/// Control-plane messages accepted by a reactor.
pub(crate) enum Control {
    Register {
        source: Source,
        entry: HandlerEntry,
    },
    /// Remove a source. For connections this runs the full disconnect flow:
    /// purge outstanding requests, deliver DISCONNECT exactly once.
    Unregister {
        source: Source,
        error: Option<CommError>,
    },
    SetWrite {
        source: Source,
        enable: bool,
    },
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);
        Ok(Self(waker))
    }

    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

struct ReactorHandle {
    tx: chan::Sender<Control>,
    waker: Waker,
}

/// Shared handle used to reach every reactor in the pool from any thread.
pub(crate) struct Registrar {
    handles: Vec<ReactorHandle>,
    next: AtomicUsize,
}

impl Registrar {
    /// Pick a reactor for a new descriptor, round-robin.
    pub fn assign(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len()
    }

    fn send(&self, reactor: usize, control: Control) -> Result<(), CommError> {
        let handle = &self.handles[reactor];
        handle.tx.send(control).map_err(|_| CommError::Shutdown)?;
        handle.waker.wake().ok();
        Ok(())
    }

    pub fn register(
        &self,
        reactor: usize,
        source: Source,
        entry: HandlerEntry,
    ) -> Result<(), CommError> {
        self.send(reactor, Control::Register { source, entry })
    }

    pub fn unregister(
        &self,
        reactor: usize,
        source: Source,
        error: Option<CommError>,
    ) -> Result<(), CommError> {
        self.send(reactor, Control::Unregister { source, error })
    }

    pub fn set_write(&self, reactor: usize, remote: SocketAddr, enable: bool) {
        self.send(
            reactor,
            Control::SetWrite {
                source: Source::Conn(remote),
                enable,
            },
        )
        .ok();
    }

    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.tx.send(Control::Shutdown).ok();
            handle.waker.wake().ok();
        }
    }
}

/// Create the reactor pool and return a registrar plus the thread handles.
pub(crate) fn spawn_pool(
    count: usize,
    handler_map: Arc<HandlerMap>,
    proxy_map: Arc<ProxyMap>,
) -> io::Result<(Arc<Registrar>, Vec<thread::JoinHandle<()>>)> {
    assert!(count > 0, "reactor pool needs at least one reactor");

    let mut handles = Vec::with_capacity(count);
    let mut pending = Vec::with_capacity(count);

    for id in 0..count {
        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let (tx, rx) = chan::unbounded();

        handles.push(ReactorHandle {
            tx,
            waker: waker.clone(),
        });
        pending.push((id, sources, rx));
    }

    let registrar = Arc::new(Registrar {
        handles,
        next: AtomicUsize::new(0),
    });

    let mut threads = Vec::with_capacity(count);
    for (id, sources, rx) in pending {
        let reactor = Reactor {
            id,
            sources,
            entries: HashMap::new(),
            control: rx,
            handler_map: handler_map.clone(),
            proxy_map: proxy_map.clone(),
            registrar: registrar.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("comm-reactor-{id}"))
            .spawn(move || reactor.run())?;
        threads.push(handle);
    }

    Ok((registrar, threads))
}

/// Wrapper handing a borrowed descriptor to the poll registration.
struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Reactor {
    id: usize,
    sources: popol::Sources<Source>,
    entries: HashMap<Source, HandlerEntry>,
    control: chan::Receiver<Control>,
    handler_map: Arc<HandlerMap>,
    proxy_map: Arc<ProxyMap>,
    registrar: Arc<Registrar>,
}

impl Reactor {
    fn run(mut self) {
        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = Vec::with_capacity(32);
        // Dispatch callbacks assembled while handler locks are held, and run
        // after every lock has been released.
        let mut pending: Vec<PendingDispatch> = Vec::new();

        loop {
            let result = self.sources.wait_timeout(&mut events, WAIT_TIMEOUT);

            match result {
                Ok(n) => {
                    trace!(target: "comm", "reactor {}: {} source(s) ready", self.id, n);
                    for event in events.drain(..) {
                        let key = event.key.clone();
                        match key {
                            Source::Conn(addr) => self.conn_event(addr, &event, &mut pending),
                            Source::Listener(addr) => self.listener_event(addr, &mut pending),
                            Source::Datagram(addr) => self.datagram_event(addr, &mut pending),
                            Source::Waker => {
                                popol::Waker::reset(event.source).ok();
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    // A failing multiplexer is not recoverable from here.
                    panic!("reactor {}: poll failed: {err}", self.id);
                }
            }

            if self.drain_control(&mut pending) {
                break;
            }

            for (handler, event) in pending.drain(..) {
                handler.handle(event);
            }
        }

        // Deliver disconnects for anything still registered, then exit.
        let addrs: Vec<SocketAddr> = self
            .entries
            .keys()
            .filter_map(|source| match source {
                Source::Conn(addr) => Some(*addr),
                _ => None,
            })
            .collect();
        for addr in addrs {
            self.teardown_conn(addr, Some(CommError::Shutdown), &mut pending);
        }
        for (handler, event) in pending.drain(..) {
            handler.handle(event);
        }
        trace!(target: "comm", "reactor {} exiting", self.id);
    }

    /// Apply queued control messages. Returns true on shutdown.
    fn drain_control(&mut self, pending: &mut Vec<PendingDispatch>) -> bool {
        while let Ok(control) = self.control.try_recv() {
            match control {
                Control::Register { source, entry } => self.register(source, entry),
                Control::Unregister { source, error } => match source {
                    Source::Conn(addr) => self.teardown_conn(addr, error, pending),
                    source => {
                        self.entries.remove(&source);
                        self.sources.unregister(&source);
                    }
                },
                Control::SetWrite { source, enable } => {
                    if let Some(src) = self.sources.get_mut(&source) {
                        if enable {
                            src.set(popol::interest::WRITE);
                        } else {
                            src.unset(popol::interest::WRITE);
                        }
                    }
                }
                Control::Shutdown => return true,
            }
        }
        false
    }

    fn register(&mut self, source: Source, entry: HandlerEntry) {
        let (fd, interest) = match &entry {
            HandlerEntry::Data(handler) => (handler.raw_fd(), popol::interest::ALL),
            HandlerEntry::Listener(handler) => (handler.raw_fd(), popol::interest::READ),
            HandlerEntry::Datagram(handler) => (handler.raw_fd(), popol::interest::READ),
        };
        if self.entries.contains_key(&source) {
            self.sources.unregister(&source);
        }
        self.sources.register(source.clone(), &Fd(fd), interest);
        self.entries.insert(source, entry);
    }

    fn conn_event(
        &mut self,
        addr: SocketAddr,
        event: &popol::Event<Source>,
        pending: &mut Vec<PendingDispatch>,
    ) {
        let handler = match self.entries.get(&Source::Conn(addr)) {
            Some(HandlerEntry::Data(handler)) => handler.clone(),
            _ => return,
        };

        if event.is_invalid() {
            // The descriptor was closed out from under the multiplexer.
            error!(target: "comm", "{}: socket is invalid, removing", addr);
            self.teardown_conn(addr, Some(CommError::BrokenConnection), pending);
            return;
        }
        if event.is_error() || event.is_hangup() {
            // Covers refused connects and hard resets.
            trace!(target: "comm", "{}: socket error/hangup: {:?}", addr, event);
            self.teardown_conn(addr, Some(CommError::BrokenConnection), pending);
            return;
        }

        if event.is_writable() {
            match handler.handle_write() {
                WriteOutcome::Ok {
                    established,
                    queue_empty,
                } => {
                    pending.extend(established);
                    if queue_empty {
                        if let Some(src) = self.sources.get_mut(&Source::Conn(addr)) {
                            src.unset(popol::interest::WRITE);
                        }
                    }
                }
                WriteOutcome::Closed(err) => {
                    self.teardown_conn(addr, Some(err), pending);
                    return;
                }
            }
        }

        if event.is_readable() {
            let outcome = handler.handle_read();
            pending.extend(outcome.dispatches);
            if let Some(payload) = outcome.proxy_update {
                if let Err(err) = self.proxy_map.apply_update(&payload) {
                    error!(target: "comm", "{}: bad proxy map update: {}", addr, err);
                }
            }
            if let Some(err) = outcome.closed {
                self.teardown_conn(addr, Some(err), pending);
            }
        }
    }

    fn listener_event(&mut self, addr: SocketAddr, pending: &mut Vec<PendingDispatch>) {
        let listener = match self.entries.get(&Source::Listener(addr)) {
            Some(HandlerEntry::Listener(listener)) => listener.clone(),
            _ => return,
        };

        for (conn, peer) in listener.accept_ready() {
            let reactor = self.registrar.assign();
            let dispatch = listener.make_conn_dispatch();
            let handler = Arc::new(crate::handler::TcpHandler::new(
                conn,
                peer,
                true,
                reactor,
                self.registrar.clone(),
                Some(dispatch),
            ));
            let entry = HandlerEntry::Data(handler.clone());

            if let Err(err) = self
                .handler_map
                .insert(CommAddress::Inet(peer), entry.clone())
            {
                error!(target: "comm", "{}: dropping accepted connection: {}", peer, err);
                continue;
            }
            if self
                .registrar
                .register(reactor, Source::Conn(peer), entry)
                .is_err()
            {
                self.handler_map.remove(&CommAddress::Inet(peer));
                continue;
            }

            if let Some(default) = listener.default_dispatch() {
                pending.push((
                    default,
                    Arc::new(crate::event::Event::connection_established(
                        peer,
                        listener.local_addr(),
                    )),
                ));
            }
        }
    }

    fn datagram_event(&mut self, addr: SocketAddr, pending: &mut Vec<PendingDispatch>) {
        let handler = match self.entries.get(&Source::Datagram(addr)) {
            Some(HandlerEntry::Datagram(handler)) => handler.clone(),
            _ => return,
        };
        pending.extend(handler.handle_read());
    }

    fn teardown_conn(
        &mut self,
        addr: SocketAddr,
        error: Option<CommError>,
        pending: &mut Vec<PendingDispatch>,
    ) {
        let source = Source::Conn(addr);
        if let Some(HandlerEntry::Data(handler)) = self.entries.remove(&source) {
            self.sources.unregister(&source);
            self.handler_map.remove(&CommAddress::Inet(addr));
            pending.extend(handler.take_disconnect(error));
        }
    }
}

/// Connect to a remote address, optionally binding the local side first.
///
/// The connect is non-blocking; completion is observed as the first
/// writable readiness event on the socket.
pub(crate) fn dial(
    addr: &SocketAddr,
    local: Option<&SocketAddr>,
) -> Result<TcpStream, CommError> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None).map_err(CommError::socket)?;

    sock.set_nonblocking(true).map_err(CommError::socket)?;
    if let Some(local) = local {
        sock.set_reuse_address(true).map_err(CommError::socket)?;
        sock.bind(&(*local).into()).map_err(CommError::bind)?;
    }

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(CommError::AlreadyConnected)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(CommError::connect(e)),
    }
    Ok(sock.into())
}

/// Bind a non-blocking listening socket with address reuse.
pub(crate) fn listen(addr: &SocketAddr) -> Result<TcpListener, CommError> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None).map_err(CommError::socket)?;

    sock.set_reuse_address(true).map_err(CommError::socket)?;
    sock.bind(&(*addr).into()).map_err(CommError::bind)?;
    sock.listen(128).map_err(CommError::bind)?;
    sock.set_nonblocking(true).map_err(CommError::socket)?;

    Ok(sock.into())
}
