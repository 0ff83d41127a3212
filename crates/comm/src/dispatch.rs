//! Dispatch handler trait and the blocking synchronizer adapter.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::CommError;
use crate::event::{Event, EventKind};

/// A callback invoked with events by reactor threads.
///
/// Handlers must not block; long-running work belongs on the application
/// queue. The calling reactor holds no locks during the callback, so
/// handlers may re-enter the `Comm` façade.
pub trait DispatchHandler: Send + Sync {
    fn handle(&self, event: Arc<Event>);
}

impl<F> DispatchHandler for F
where
    F: Fn(Arc<Event>) + Send + Sync,
{
    fn handle(&self, event: Arc<Event>) {
        self(event)
    }
}

/// Builds dispatch handlers for connections accepted by a listener.
pub trait ConnectionHandlerFactory: Send + Sync {
    fn make_handler(&self) -> Arc<dyn DispatchHandler>;
}

impl<F> ConnectionHandlerFactory for F
where
    F: Fn() -> Arc<dyn DispatchHandler> + Send + Sync,
{
    fn make_handler(&self) -> Arc<dyn DispatchHandler> {
        self()
    }
}

/// The standard blocking primitive for synchronous callers.
///
/// Events are pushed into an internal queue by the reactor and popped by the
/// waiting caller.
#[derive(Default)]
pub struct DispatchHandlerSynchronizer {
    queue: Mutex<VecDeque<Arc<Event>>>,
    cond: Condvar,
}

impl DispatchHandlerSynchronizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until any event arrives, or until `timeout` expires.
    pub fn wait_for_event(&self, timeout: Duration) -> Option<Arc<Event>> {
        let mut queue = self.queue.lock().expect("synchronizer lock");
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(queue, remaining)
                .expect("synchronizer lock");
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    /// Block until a reply arrives and translate failures into errors.
    ///
    /// `Message` events with a nonzero error yield that error; `Disconnect`
    /// yields `BrokenConnection`. Other event kinds are skipped.
    pub fn wait_for_reply(&self, timeout: Duration) -> Result<Arc<Event>, CommError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let event = self
                .wait_for_event(remaining)
                .ok_or(CommError::RequestTimeout)?;

            match event.kind {
                EventKind::Message => {
                    return match &event.error {
                        Some(err) => Err(err.clone()),
                        None => Ok(event),
                    };
                }
                EventKind::Disconnect | EventKind::Error => {
                    return Err(event
                        .error
                        .clone()
                        .unwrap_or(CommError::BrokenConnection));
                }
                EventKind::ConnectionEstablished | EventKind::Timer => continue,
            }
        }
    }
}

impl DispatchHandler for DispatchHandlerSynchronizer {
    fn handle(&self, event: Arc<Event>) {
        let mut queue = self.queue.lock().expect("synchronizer lock");
        queue.push_back(event);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_resolves_to_message() {
        let sync = DispatchHandlerSynchronizer::new();
        sync.handle(Arc::new(Event::new(EventKind::ConnectionEstablished)));
        sync.handle(Arc::new(Event::new(EventKind::Message)));

        let event = sync.wait_for_reply(Duration::from_millis(100)).unwrap();
        assert_eq!(event.kind, EventKind::Message);
    }

    #[test]
    fn disconnect_becomes_broken_connection() {
        let sync = DispatchHandlerSynchronizer::new();
        sync.handle(Arc::new(Event::disconnect(
            "127.0.0.1:1".parse().unwrap(),
            None,
        )));

        assert!(matches!(
            sync.wait_for_reply(Duration::from_millis(100)),
            Err(CommError::BrokenConnection)
        ));
    }

    #[test]
    fn empty_queue_times_out() {
        let sync = DispatchHandlerSynchronizer::new();
        assert!(sync.wait_for_event(Duration::from_millis(20)).is_none());
    }
}
