//! Establishes and maintains a declared set of outbound connections.
//!
//! Broken connections are re-dialed by a dedicated manager thread pacing
//! attempts through a retry min-heap. Connections may carry an initializer
//! that drives an application-level handshake before the connection is
//! reported ready.
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::addr::CommAddress;
use crate::buf::CommBuf;
use crate::comm::Comm;
use crate::dispatch::DispatchHandler;
use crate::event::{Event, EventKind};
use crate::time::{DeadlineHeap, LocalTime};

/// Drives an initialization handshake on a managed connection.
///
/// After `CONNECTION_ESTABLISHED`, the manager sends the initializer's
/// request and feeds the response back; only on acceptance is the
/// connection flagged initialized and events begin flowing to the user
/// handler.
pub trait ConnectionInitializer: Send + Sync {
    /// Build the handshake request frame.
    fn create_initialization_request(&self) -> CommBuf;
    /// Inspect the handshake response; `true` completes initialization.
    fn process_initialization_response(&self, event: &Event) -> bool;
}

struct ConnInner {
    connected: bool,
    initialized: bool,
    decommissioned: bool,
    handler: Option<Arc<dyn DispatchHandler>>,
    initializer: Option<Arc<dyn ConnectionInitializer>>,
}

/// Per-connection record shared by the manager thread and dispatch
/// callbacks.
struct ConnectionState {
    addr: CommAddress,
    retry_interval: Duration,
    service_name: String,
    inner: Mutex<ConnInner>,
    cond: Condvar,
}

struct MgrState {
    conns: HashMap<CommAddress, Arc<ConnectionState>>,
    retry: DeadlineHeap<CommAddress>,
    quiet_mode: bool,
    shutdown: bool,
}

struct MgrShared {
    comm: Comm,
    state: Mutex<MgrState>,
    retry_cond: Condvar,
}

/// Maintains a set of persistent outbound connections.
pub struct ConnectionManager {
    shared: Arc<MgrShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(comm: Comm) -> Self {
        let shared = Arc::new(MgrShared {
            comm,
            state: Mutex::new(MgrState {
                conns: HashMap::new(),
                retry: DeadlineHeap::new(),
                quiet_mode: false,
                shutdown: false,
            }),
            retry_cond: Condvar::new(),
        });

        let runner = shared.clone();
        let thread = thread::Builder::new()
            .name("conn-manager".into())
            .spawn(move || runner.run())
            .expect("spawn connection manager thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Suppress connect-failure log messages.
    pub fn set_quiet_mode(&self, quiet: bool) {
        self.shared.state.lock().expect("conn manager lock").quiet_mode = quiet;
    }

    /// Add a connection to maintain. Idempotent: adding an address that is
    /// already managed is a no-op.
    pub fn add(&self, addr: &CommAddress, retry_interval_ms: u32, service_name: &str) {
        self.add_with_handler(addr, retry_interval_ms, service_name, None, None)
    }

    /// Add a connection with a dispatch handler receiving all events on the
    /// connection (except the initialization handshake exchange).
    pub fn add_with_handler(
        &self,
        addr: &CommAddress,
        retry_interval_ms: u32,
        service_name: &str,
        handler: Option<Arc<dyn DispatchHandler>>,
        initializer: Option<Arc<dyn ConnectionInitializer>>,
    ) {
        let record = {
            let mut state = self.shared.state.lock().expect("conn manager lock");
            if state.conns.contains_key(addr) {
                return;
            }

            let has_initializer = initializer.is_some();
            let record = Arc::new(ConnectionState {
                addr: addr.clone(),
                retry_interval: Duration::from_millis(retry_interval_ms as u64),
                service_name: service_name.to_owned(),
                inner: Mutex::new(ConnInner {
                    connected: false,
                    initialized: !has_initializer,
                    decommissioned: false,
                    handler,
                    initializer,
                }),
                cond: Condvar::new(),
            });
            state.conns.insert(addr.clone(), record.clone());
            record
        };

        self.shared.issue_connect(&record);
    }

    /// Stop maintaining `addr` and close its socket.
    pub fn remove(&self, addr: &CommAddress) {
        let record = {
            let mut state = self.shared.state.lock().expect("conn manager lock");
            let Some(record) = state.conns.remove(addr) else {
                return;
            };
            state.retry.retain(|a| a != addr);
            record
        };

        {
            let mut inner = record.inner.lock().expect("connection state lock");
            inner.decommissioned = true;
            inner.connected = false;
            record.cond.notify_all();
        }
        self.shared.comm.close_socket(addr).ok();
    }

    /// Block until the connection is established and initialized, or until
    /// `timeout` expires. Returns whether the connection is ready.
    pub fn wait_for_connection(&self, addr: &CommAddress, timeout: Duration) -> bool {
        let record = {
            let state = self.shared.state.lock().expect("conn manager lock");
            match state.conns.get(addr) {
                Some(record) => record.clone(),
                None => return false,
            }
        };

        let deadline = Instant::now() + timeout;
        let mut inner = record.inner.lock().expect("connection state lock");
        while !(inner.connected && inner.initialized) {
            if inner.decommissioned {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = record
                .cond
                .wait_timeout(inner, remaining)
                .expect("connection state lock");
            inner = guard;
        }
        true
    }

    /// Stop the manager thread. Managed sockets stay open.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("conn manager lock");
            state.shutdown = true;
            self.shared.retry_cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().expect("conn manager lock").take() {
            handle.join().ok();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MgrShared {
    /// Issue a connect attempt for the record, scheduling a retry on
    /// synchronous failure. At most one attempt per record is outstanding;
    /// retries are serialized through the retry heap.
    fn issue_connect(self: &Arc<Self>, record: &Arc<ConnectionState>) {
        {
            let inner = record.inner.lock().expect("connection state lock");
            if inner.decommissioned || inner.connected {
                return;
            }
        }

        let handler = Arc::new(ManagerDispatch {
            shared: self.clone(),
            record: record.clone(),
        });

        match self.comm.connect(&record.addr, handler) {
            Ok(()) => {}
            Err(err) => {
                let quiet = self.state.lock().expect("conn manager lock").quiet_mode;
                if !quiet {
                    warn!(
                        target: "comm",
                        "connect to {} ({}) failed: {}; will retry in {:?}",
                        record.addr, record.service_name, err, record.retry_interval
                    );
                }
                self.schedule_retry(record);
            }
        }
    }

    fn schedule_retry(&self, record: &Arc<ConnectionState>) {
        let mut state = self.state.lock().expect("conn manager lock");
        if state.shutdown || !state.conns.contains_key(&record.addr) {
            return;
        }
        let next_retry = LocalTime::now() + record.retry_interval;
        state.retry.register(record.addr.clone(), next_retry);
        self.retry_cond.notify_one();
    }

    fn run(self: Arc<Self>) {
        let mut due: Vec<CommAddress> = Vec::new();

        loop {
            {
                let mut state = self.state.lock().expect("conn manager lock");
                loop {
                    if state.shutdown {
                        return;
                    }
                    let now = LocalTime::now();
                    if state.retry.pop_due(now, &mut due) > 0 {
                        break;
                    }
                    state = match state.retry.next_deadline() {
                        Some(deadline) => {
                            let wait = now.until(deadline).max(Duration::from_millis(1));
                            self.retry_cond
                                .wait_timeout(state, wait)
                                .expect("conn manager lock")
                                .0
                        }
                        None => self.retry_cond.wait(state).expect("conn manager lock"),
                    };
                }
            }

            for addr in due.drain(..) {
                let record = {
                    let state = self.state.lock().expect("conn manager lock");
                    state.conns.get(&addr).cloned()
                };
                if let Some(record) = record {
                    debug!(target: "comm", "retrying {} ({})", record.addr, record.service_name);
                    self.issue_connect(&record);
                }
            }
        }
    }

    fn handle_event(self: &Arc<Self>, record: &Arc<ConnectionState>, event: Arc<Event>) {
        match event.kind {
            EventKind::ConnectionEstablished => self.on_established(record, &event),
            EventKind::Disconnect => self.on_disconnect(record, event),
            EventKind::Message => self.on_message(record, event),
            EventKind::Timer | EventKind::Error => self.forward(record, event),
        }
    }

    fn on_established(self: &Arc<Self>, record: &Arc<ConnectionState>, event: &Arc<Event>) {
        let initializer = {
            let mut inner = record.inner.lock().expect("connection state lock");
            inner.connected = true;
            let cloned = inner.initializer.clone();
            match cloned {
                Some(initializer) => {
                    inner.initialized = false;
                    Some(initializer)
                }
                None => {
                    record.cond.notify_all();
                    None
                }
            }
        };

        match initializer {
            Some(initializer) => {
                debug!(target: "comm", "{}: starting initialization handshake", record.addr);
                let request = initializer.create_initialization_request();
                let handler = Arc::new(ManagerDispatch {
                    shared: self.clone(),
                    record: record.clone(),
                });
                let timeout = (record.retry_interval.as_millis() as u32).max(1);
                if let Err(err) = self.comm.send_request(&record.addr, timeout, request, handler)
                {
                    error!(target: "comm", "{}: handshake send failed: {}", record.addr, err);
                }
            }
            None => self.forward(record, event.clone()),
        }
    }

    fn on_disconnect(self: &Arc<Self>, record: &Arc<ConnectionState>, event: Arc<Event>) {
        let decommissioned = {
            let mut inner = record.inner.lock().expect("connection state lock");
            inner.connected = false;
            if inner.initializer.is_some() {
                inner.initialized = false;
            }
            record.cond.notify_all();
            inner.decommissioned
        };

        if !decommissioned {
            self.schedule_retry(record);
        }
        self.forward(record, event);
    }

    fn on_message(self: &Arc<Self>, record: &Arc<ConnectionState>, event: Arc<Event>) {
        let initializer = {
            let inner = record.inner.lock().expect("connection state lock");
            if inner.initialized {
                None
            } else {
                inner.initializer.clone()
            }
        };

        // The handshake exchange is consumed here, never forwarded.
        if let Some(initializer) = initializer {
            if event.error.is_none() && initializer.process_initialization_response(&event) {
                let mut inner = record.inner.lock().expect("connection state lock");
                inner.initialized = true;
                record.cond.notify_all();
                debug!(target: "comm", "{}: initialization complete", record.addr);
            } else {
                warn!(target: "comm", "{}: initialization failed, reconnecting", record.addr);
                self.comm.close_socket(&record.addr).ok();
            }
            return;
        }

        self.forward(record, event);
    }

    fn forward(&self, record: &Arc<ConnectionState>, event: Arc<Event>) {
        let handler = {
            let inner = record.inner.lock().expect("connection state lock");
            inner.handler.clone()
        };
        if let Some(handler) = handler {
            handler.handle(event);
        }
    }
}

/// The dispatch handler the manager installs on each managed connection.
/// Carries the record it serves, so events never need an address lookup.
struct ManagerDispatch {
    shared: Arc<MgrShared>,
    record: Arc<ConnectionState>,
}

impl DispatchHandler for ManagerDispatch {
    fn handle(&self, event: Arc<Event>) {
        self.shared.handle_event(&self.record, event);
    }
}
