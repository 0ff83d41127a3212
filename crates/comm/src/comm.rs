//! Primary entry point for the messaging substrate.
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::addr::CommAddress;
use crate::buf::CommBuf;
use crate::dispatch::{ConnectionHandlerFactory, DispatchHandler};
use crate::error::CommError;
use crate::handler::{ListenerHandler, TcpHandler, UdpHandler};
use crate::handler_map::{HandlerEntry, HandlerMap};
use crate::header::{CommHeader, FLAGS_BIT_IGNORE_RESPONSE, FLAGS_BIT_PROXY_MAP_UPDATE, FLAGS_BIT_REQUEST};
use crate::proxy::{ProxyEntry, ProxyMap};
use crate::reactor::{self, Registrar, Source};
use crate::time::LocalTime;
use crate::timer::{TimerReactor, TimerTask};

/// How many consecutive ports the port finders probe.
const PORT_SEARCH_WINDOW: u16 = 15;

/// Process-wide request id counter. Ids never repeat within an active
/// connection; zero is reserved.
static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

fn next_request_id() -> u32 {
    loop {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

static GLOBAL: OnceCell<Comm> = OnceCell::new();

/// Messaging substrate configuration.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Number of reactor threads driving I/O.
    pub reactor_count: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self { reactor_count: 2 }
    }
}

/// The messaging substrate façade.
///
/// Owns the reactor pool, the handler map, the proxy map and the dedicated
/// timer reactor. Cloning is cheap and shares the same runtime. Dropping
/// the last clone (or calling [`Comm::shutdown`]) stops every thread and
/// closes every descriptor.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<CommInner>,
}

struct CommInner {
    handler_map: Arc<HandlerMap>,
    proxy_map: Arc<ProxyMap>,
    registrar: Arc<Registrar>,
    timer: TimerReactor,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Comm {
    /// Construct the substrate, spawning the reactor pool and timer thread.
    pub fn new(config: CommConfig) -> Result<Self, CommError> {
        let handler_map = Arc::new(HandlerMap::new());
        let proxy_map = Arc::new(ProxyMap::new());

        let (registrar, threads) =
            reactor::spawn_pool(config.reactor_count, handler_map.clone(), proxy_map.clone())
                .map_err(CommError::socket)?;
        let timer = TimerReactor::start(handler_map.clone()).map_err(CommError::socket)?;

        info!(target: "comm", "substrate up with {} reactor(s)", config.reactor_count);

        Ok(Self {
            inner: Arc::new(CommInner {
                handler_map,
                proxy_map,
                registrar,
                timer,
                threads: Mutex::new(threads),
            }),
        })
    }

    /// Install `comm` as the process-wide instance. Fails if one is already
    /// installed.
    pub fn set_global(comm: Comm) -> Result<(), Comm> {
        GLOBAL.set(comm)
    }

    /// The process-wide instance installed with [`Comm::set_global`].
    ///
    /// # Panics
    ///
    /// Panics if no instance was installed; global construction is explicit,
    /// never lazy.
    pub fn global() -> Comm {
        GLOBAL.get().cloned().expect("Comm::set_global not called")
    }

    fn resolve(&self, addr: &CommAddress) -> Result<SocketAddr, CommError> {
        match addr {
            CommAddress::Inet(inet) => Ok(*inet),
            CommAddress::Proxy(name) => self
                .inner
                .proxy_map
                .resolve(name)
                .ok_or_else(|| CommError::InvalidProxy(name.clone())),
        }
    }

    /// Establish a TCP connection and attach a default event handler.
    ///
    /// On `Ok`, the handler is installed and will eventually observe either
    /// `CONNECTION_ESTABLISHED` or `DISCONNECT`. On error the call had no
    /// effect and the handler was not installed.
    pub fn connect(
        &self,
        addr: &CommAddress,
        default_handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), CommError> {
        self.connect_inner(addr, None, default_handler)
    }

    /// Like [`Comm::connect`], binding the local side of the connection
    /// first.
    pub fn connect_with_local(
        &self,
        addr: &CommAddress,
        local_addr: &SocketAddr,
        default_handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), CommError> {
        self.connect_inner(addr, Some(local_addr), default_handler)
    }

    fn connect_inner(
        &self,
        addr: &CommAddress,
        local_addr: Option<&SocketAddr>,
        default_handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), CommError> {
        let inet = self.resolve(addr)?;
        if self.inner.handler_map.contains(&CommAddress::Inet(inet))
            || self.inner.handler_map.contains(addr)
        {
            return Err(CommError::AlreadyConnected);
        }

        let stream = reactor::dial(&inet, local_addr)?;
        let reactor = self.inner.registrar.assign();
        let handler = Arc::new(TcpHandler::new(
            stream,
            inet,
            false,
            reactor,
            self.inner.registrar.clone(),
            Some(default_handler),
        ));
        let entry = HandlerEntry::Data(handler);

        self.inner
            .handler_map
            .insert(CommAddress::Inet(inet), entry.clone())?;
        if addr.is_proxy() {
            self.inner
                .handler_map
                .insert(addr.clone(), entry.clone())
                .ok();
        }
        if let Err(err) = self
            .inner
            .registrar
            .register(reactor, Source::Conn(inet), entry)
        {
            self.inner.handler_map.remove(&CommAddress::Inet(inet));
            return Err(err);
        }

        debug!(target: "comm", "connecting to {}", addr);
        Ok(())
    }

    /// Listen for connection requests on `addr`. Accepted connections are
    /// assigned dispatch handlers by `factory`; `default_handler`, when
    /// present, observes a `CONNECTION_ESTABLISHED` event per accept.
    pub fn listen(
        &self,
        addr: &CommAddress,
        factory: Arc<dyn ConnectionHandlerFactory>,
        default_handler: Option<Arc<dyn DispatchHandler>>,
    ) -> Result<(), CommError> {
        let inet = addr.inet().ok_or_else(|| {
            CommError::InvalidProxy("cannot listen on a proxy address".into())
        })?;

        let listener = reactor::listen(&inet)?;
        let local = listener.local_addr().map_err(CommError::socket)?;
        let reactor = self.inner.registrar.assign();
        let handler = Arc::new(ListenerHandler::new(
            listener,
            local,
            reactor,
            factory,
            default_handler,
        ));
        let entry = HandlerEntry::Listener(handler);

        self.inner
            .handler_map
            .insert(CommAddress::Inet(local), entry.clone())?;
        if let Err(err) = self
            .inner
            .registrar
            .register(reactor, Source::Listener(local), entry)
        {
            self.inner.handler_map.remove(&CommAddress::Inet(local));
            return Err(err);
        }

        info!(target: "comm", "listening on {}", local);
        Ok(())
    }

    /// Send a request over the connection to `addr`, expecting a response.
    ///
    /// The response handler observes exactly one of: the matched response, a
    /// synthesized `MESSAGE` with `RequestTimeout`, or a synthesized
    /// `MESSAGE` with `BrokenConnection`. `timeout_ms == 0` means no
    /// timeout.
    pub fn send_request(
        &self,
        addr: &CommAddress,
        timeout_ms: u32,
        mut cbuf: CommBuf,
        response_handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), CommError> {
        let inet = self.resolve(addr)?;
        let handler = self
            .inner
            .handler_map
            .get_data(&CommAddress::Inet(inet))
            .ok_or(CommError::NotConnected)?;

        let id = next_request_id();
        cbuf.header.id = id;
        cbuf.header.timeout_ms = timeout_ms;
        cbuf.header.flags |= FLAGS_BIT_REQUEST;

        let expects_response = cbuf.header.flags & FLAGS_BIT_IGNORE_RESPONSE == 0;
        if expects_response {
            handler.add_request(id, response_handler)?;
            if timeout_ms > 0 {
                self.inner.timer.register(
                    TimerTask::RequestTimeout {
                        addr: handler.remote_addr(),
                        id,
                    },
                    LocalTime::now() + Duration::from_millis(timeout_ms as u64),
                );
            }
        }

        if let Err(err) = handler.send_frame(cbuf.encode()) {
            if expects_response {
                handler.remove_request(id);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Send a response frame; the header id must already match the
    /// originating request.
    pub fn send_response(&self, addr: &CommAddress, mut cbuf: CommBuf) -> Result<(), CommError> {
        let inet = self.resolve(addr)?;
        let handler = self
            .inner
            .handler_map
            .get_data(&CommAddress::Inet(inet))
            .ok_or(CommError::NotConnected)?;

        cbuf.header.flags &= !FLAGS_BIT_REQUEST;
        handler.send_frame(cbuf.encode())
    }

    /// Create a local datagram socket and attach a dispatch handler for
    /// inbound datagrams. `addr` is updated with the bound address.
    pub fn create_datagram_receive_socket(
        &self,
        addr: &mut SocketAddr,
        dispatch: Arc<dyn DispatchHandler>,
    ) -> Result<(), CommError> {
        let socket = UdpSocket::bind(*addr).map_err(CommError::bind)?;
        socket.set_nonblocking(true).map_err(CommError::socket)?;
        let local = socket.local_addr().map_err(CommError::socket)?;
        *addr = local;

        let reactor = self.inner.registrar.assign();
        let handler = Arc::new(UdpHandler::new(socket, local, reactor, dispatch));
        let entry = HandlerEntry::Datagram(handler);

        self.inner
            .handler_map
            .insert(CommAddress::Inet(local), entry.clone())?;
        if let Err(err) = self
            .inner
            .registrar
            .register(reactor, Source::Datagram(local), entry)
        {
            self.inner.handler_map.remove(&CommAddress::Inet(local));
            return Err(err);
        }
        Ok(())
    }

    /// Send one datagram to `addr` from the local socket bound at
    /// `send_addr`.
    pub fn send_datagram(
        &self,
        addr: &CommAddress,
        send_addr: &SocketAddr,
        mut cbuf: CommBuf,
    ) -> Result<(), CommError> {
        let inet = self.resolve(addr)?;
        let handler = self
            .inner
            .handler_map
            .get_datagram(&CommAddress::Inet(*send_addr))
            .ok_or(CommError::NotConnected)?;
        handler.send_datagram(inet, &cbuf.encode())
    }

    /// Deliver a `TIMER` event to `handler` after `duration_ms`
    /// milliseconds. A zero duration fires on the next timer-reactor
    /// iteration.
    pub fn set_timer(&self, duration_ms: u32, handler: Arc<dyn DispatchHandler>) {
        self.inner.timer.register(
            TimerTask::Dispatch(handler),
            LocalTime::now() + Duration::from_millis(duration_ms as u64),
        );
    }

    /// Deliver a `TIMER` event to `handler` at the absolute time
    /// `deadline`.
    pub fn set_timer_absolute(&self, deadline: LocalTime, handler: Arc<dyn DispatchHandler>) {
        self.inner.timer.register(TimerTask::Dispatch(handler), deadline);
    }

    /// Cancel all timers registered against `handler`. Timers already in
    /// flight run to completion.
    pub fn cancel_timer(&self, handler: &Arc<dyn DispatchHandler>) {
        self.inner.timer.cancel_dispatch(handler);
    }

    /// Close the socket at `addr`: evict the handler, purge all outstanding
    /// requests with `BrokenConnection`, and deliver `DISCONNECT` to the
    /// default handler exactly once.
    pub fn close_socket(&self, addr: &CommAddress) -> Result<(), CommError> {
        let entry = self
            .inner
            .handler_map
            .remove(addr)
            .ok_or(CommError::NotConnected)?;

        match entry {
            HandlerEntry::Data(handler) => {
                self.inner.registrar.unregister(
                    handler.reactor(),
                    Source::Conn(handler.remote_addr()),
                    None,
                )?;
            }
            HandlerEntry::Listener(handler) => {
                // Listener sockets tear down silently.
                self.inner
                    .registrar
                    .unregister(handler.reactor(), Source::Listener(handler.local_addr()), None)
                    .ok();
            }
            HandlerEntry::Datagram(handler) => {
                self.inner
                    .registrar
                    .unregister(handler.reactor(), Source::Datagram(handler.local_addr()), None)
                    .ok();
            }
        }
        Ok(())
    }

    /// Install `alias` as a second endpoint key for the connection at
    /// `addr`.
    pub fn set_alias(&self, addr: &SocketAddr, alias: &SocketAddr) -> Result<(), CommError> {
        self.inner
            .handler_map
            .insert_alias(&CommAddress::Inet(*addr), CommAddress::Inet(*alias))
    }

    /// Add a proxy binding and broadcast the updated mapping to every
    /// connection.
    pub fn add_proxy(
        &self,
        proxy: &str,
        hostname: &str,
        addr: &SocketAddr,
    ) -> Result<(), CommError> {
        self.inner.proxy_map.insert(proxy, hostname, *addr);
        self.broadcast_proxy_map()
    }

    fn broadcast_proxy_map(&self) -> Result<(), CommError> {
        let payload = self.inner.proxy_map.encode_mappings()?;
        let mut header = CommHeader::new(0);
        header.flags |= FLAGS_BIT_PROXY_MAP_UPDATE;

        let mut cbuf = CommBuf::new(header, payload.len());
        cbuf.append_bytes(&payload);
        let bytes = cbuf.encode();

        for handler in self.inner.handler_map.data_handlers() {
            handler.send_frame(bytes.clone()).ok();
        }
        Ok(())
    }

    /// Snapshot of the proxy map.
    pub fn get_proxy_map(&self) -> std::collections::HashMap<String, ProxyEntry> {
        self.inner.proxy_map.snapshot()
    }

    /// Block until a `PROXY_MAP_UPDATE` has been received at least once or
    /// the timeout expires. Returns `false` on expiry.
    pub fn wait_for_proxy_load(&self, timeout: Duration) -> bool {
        self.inner.proxy_map.wait_for_load(timeout)
    }

    /// Find an unused TCP port, probing 15 consecutive ports starting at
    /// `addr.port()`. Updates `addr` on success.
    ///
    /// # Panics
    ///
    /// Panics when every port in the window is taken; running out of ports
    /// is a deployment error with no recovery here.
    pub fn find_available_tcp_port(addr: &mut SocketAddr) {
        let base = addr.port();
        for offset in 0..PORT_SEARCH_WINDOW {
            let port = base.wrapping_add(offset);
            let mut probe = *addr;
            probe.set_port(port);
            if TcpListener::bind(probe).is_ok() {
                addr.set_port(port);
                return;
            }
        }
        panic!(
            "no available TCP port in [{base}, {})",
            base.wrapping_add(PORT_SEARCH_WINDOW)
        );
    }

    /// Find an unused UDP port, probing 15 consecutive ports starting at
    /// `addr.port()`. Updates `addr` on success.
    ///
    /// # Panics
    ///
    /// Panics when every port in the window is taken.
    pub fn find_available_udp_port(addr: &mut SocketAddr) {
        let base = addr.port();
        for offset in 0..PORT_SEARCH_WINDOW {
            let port = base.wrapping_add(offset);
            let mut probe = *addr;
            probe.set_port(port);
            if UdpSocket::bind(probe).is_ok() {
                addr.set_port(port);
                return;
            }
        }
        panic!(
            "no available UDP port in [{base}, {})",
            base.wrapping_add(PORT_SEARCH_WINDOW)
        );
    }

    /// Stop every reactor, the timer thread, and drop all handlers.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl CommInner {
    fn shutdown(&self) {
        self.registrar.shutdown();
        self.timer.shutdown();

        let mut threads = self.threads.lock().expect("comm lock");
        for handle in threads.drain(..) {
            handle.join().ok();
        }
        self.handler_map.clear();
    }
}

impl Drop for CommInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
