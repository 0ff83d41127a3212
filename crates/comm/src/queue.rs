//! Application queue: a worker pool with per-group FIFO dispatch.
use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::error;

use crate::error::CommError;

/// A unit of work carrying the group id of its originating message.
///
/// Items with the same nonzero group id run in enqueue order, never
/// concurrently. Group id zero means unordered. Urgent items bypass normal
/// queuing but still observe group serialization.
pub trait ApplicationHandler: Send {
    fn run(self: Box<Self>);

    fn group_id(&self) -> u32 {
        0
    }

    fn is_urgent(&self) -> bool {
        false
    }
}

struct QueueState {
    urgent: VecDeque<Box<dyn ApplicationHandler>>,
    normal: VecDeque<Box<dyn ApplicationHandler>>,
    /// Groups with an item currently running on a worker.
    busy: HashSet<u32>,
    accepting: bool,
    shutdown: bool,
    active: usize,
}

impl QueueState {
    /// Take the first runnable item, preferring the urgent lane. An item is
    /// runnable when its group is not already in flight.
    fn take_runnable(&mut self) -> Option<Box<dyn ApplicationHandler>> {
        for lane in [&mut self.urgent, &mut self.normal] {
            let runnable = lane
                .iter()
                .position(|item| item.group_id() == 0 || !self.busy.contains(&item.group_id()));
            if let Some(index) = runnable {
                return lane.remove(index);
            }
        }
        None
    }

    fn is_drained(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty() && self.active == 0
    }
}

struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Bounded-concurrency worker pool dispatching decoded requests.
pub struct ApplicationQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ApplicationQueue {
    /// Spawn `worker_count` worker threads.
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "application queue needs at least one worker");

        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                busy: HashSet::new(),
                accepting: true,
                shutdown: false,
                active: 0,
            }),
            cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("app-queue-{id}"))
                .spawn(move || worker_loop(shared))
                .expect("spawn application queue worker");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a work item.
    pub fn add(&self, item: Box<dyn ApplicationHandler>) -> Result<(), CommError> {
        let mut state = self.shared.state.lock().expect("app queue lock");
        if !state.accepting {
            return Err(CommError::Shutdown);
        }
        if item.is_urgent() {
            state.urgent.push_back(item);
        } else {
            state.normal.push_back(item);
        }
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Graceful shutdown: stop accepting new items, drain everything in
    /// flight, then stop the workers and join them.
    pub fn join(&self) {
        {
            let mut state = self.shared.state.lock().expect("app queue lock");
            state.accepting = false;
            while !state.is_drained() {
                state = self.shared.cond.wait(state).expect("app queue lock");
            }
            state.shutdown = true;
            self.shared.cond.notify_all();
        }

        let mut workers = self.workers.lock().expect("app queue lock");
        for handle in workers.drain(..) {
            handle.join().ok();
        }
    }
}

fn worker_loop(shared: Arc<QueueShared>) {
    loop {
        let item = {
            let mut state = shared.state.lock().expect("app queue lock");
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(item) = state.take_runnable() {
                    let gid = item.group_id();
                    if gid != 0 {
                        state.busy.insert(gid);
                    }
                    state.active += 1;
                    break item;
                }
                state = shared.cond.wait(state).expect("app queue lock");
            }
        };

        let gid = item.group_id();
        // Worker panics are contained; the worker returns to the pool.
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| item.run())) {
            error!(target: "comm", "application handler panicked: {:?}", panic);
        }

        let mut state = shared.state.lock().expect("app queue lock");
        if gid != 0 {
            state.busy.remove(&gid);
        }
        state.active -= 1;
        shared.cond.notify_all();
    }
}
