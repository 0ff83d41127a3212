//! Dedicated timer reactor.
//!
//! One thread hosts every timer in the process: user timers registered
//! through the façade and per-request timeouts for requests whose
//! connections live on other reactors.
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::addr::CommAddress;
use crate::dispatch::DispatchHandler;
use crate::error::CommError;
use crate::event::Event;
use crate::handler_map::HandlerMap;
use crate::time::{DeadlineHeap, LocalTime};

pub(crate) enum TimerTask {
    /// Deliver a TIMER event to the handler.
    Dispatch(Arc<dyn DispatchHandler>),
    /// Expire an outstanding request if it is still pending.
    RequestTimeout { addr: SocketAddr, id: u32 },
}

struct TimerState {
    heap: DeadlineHeap<TimerTask>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
    handler_map: Arc<HandlerMap>,
}

/// Handle to the timer thread.
pub(crate) struct TimerReactor {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerReactor {
    pub fn start(handler_map: Arc<HandlerMap>) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: DeadlineHeap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            handler_map,
        });

        let runner = shared.clone();
        let thread = thread::Builder::new()
            .name("comm-timer".into())
            .spawn(move || runner.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn register(&self, task: TimerTask, deadline: LocalTime) {
        let mut state = self.shared.state.lock().expect("timer lock");
        state.heap.register(task, deadline);
        self.shared.cond.notify_one();
    }

    /// Remove all timers registered against `handler`. Timers already in
    /// flight run to completion.
    pub fn cancel_dispatch(&self, handler: &Arc<dyn DispatchHandler>) {
        let mut state = self.shared.state.lock().expect("timer lock");
        state.heap.retain(|task| match task {
            TimerTask::Dispatch(h) => !Arc::ptr_eq(h, handler),
            TimerTask::RequestTimeout { .. } => true,
        });
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("timer lock");
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().expect("timer lock").take() {
            handle.join().ok();
        }
    }
}

impl TimerShared {
    fn run(&self) {
        let mut due: Vec<TimerTask> = Vec::new();

        loop {
            {
                let mut state = self.state.lock().expect("timer lock");
                loop {
                    if state.shutdown {
                        return;
                    }
                    let now = LocalTime::now();
                    if state.heap.pop_due(now, &mut due) > 0 {
                        break;
                    }
                    state = match state.heap.next_deadline() {
                        Some(deadline) => {
                            let wait = now.until(deadline).max(Duration::from_millis(1));
                            self.cond
                                .wait_timeout(state, wait)
                                .expect("timer lock")
                                .0
                        }
                        None => self.cond.wait(state).expect("timer lock"),
                    };
                }
            }

            for task in due.drain(..) {
                self.fire(task);
            }
        }
    }

    fn fire(&self, task: TimerTask) {
        match task {
            TimerTask::Dispatch(handler) => {
                trace!(target: "comm", "timer fired");
                handler.handle(Arc::new(Event::timer()));
            }
            TimerTask::RequestTimeout { addr, id } => {
                let Some(conn) = self.handler_map.get_data(&CommAddress::Inet(addr)) else {
                    return;
                };
                if let Some(handler) = conn.remove_request(id) {
                    trace!(target: "comm", "{}: request {} timed out", addr, id);
                    handler.handle(Arc::new(Event::request_failure(
                        addr,
                        id,
                        CommError::RequestTimeout,
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::event::EventKind;

    struct Counter(AtomicUsize);

    impl DispatchHandler for Counter {
        fn handle(&self, event: Arc<Event>) {
            assert_eq!(event.kind, EventKind::Timer);
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn zero_duration_timer_fires_promptly() {
        let timer = TimerReactor::start(Arc::new(HandlerMap::new())).unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        timer.register(TimerTask::Dispatch(counter.clone()), LocalTime::now());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.0.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(5));
        }
        timer.shutdown();
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let timer = TimerReactor::start(Arc::new(HandlerMap::new())).unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let handler: Arc<dyn DispatchHandler> = counter.clone();

        timer.register(
            TimerTask::Dispatch(counter.clone()),
            LocalTime::now() + Duration::from_millis(50),
        );
        timer.cancel_dispatch(&handler);

        thread::sleep(Duration::from_millis(120));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }
}
