//! Worker-pool delivery of events to registered handlers.
//!
//! A [`Dispatcher`] owns a bounded event queue and a resizable pool of
//! worker threads. Each worker pulls one event at a time, runs the optional
//! pre-hook (which may replace the payload), invokes every registered
//! handler in registration order, then runs the optional post-hook. The
//! pool shrinks by retiring its newest workers and grows only while the
//! dispatcher is still accepting work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::debug;

use crate::error::{NodeError, Result};

/// Handler invoked by dispatch workers for every delivered event.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Hook run before the handler stack; may replace the payload.
pub type PreHook<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Hook run after the handler stack has seen the payload.
pub type PostHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// How often an idle worker rechecks whether it should retire.
    pub idle_tick: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            worker_count: 1,
            queue_capacity: 64,
            idle_tick: Duration::from_millis(100),
        }
    }
}

enum DispatchEvent<T> {
    Deliver(T),
    Shutdown,
}

struct Shared<T> {
    handlers: Mutex<Vec<Handler<T>>>,
    pre: Option<PreHook<T>>,
    post: Option<PostHook<T>>,
    /// Workers whose id is at or above this retire at their next idle tick.
    target_workers: AtomicUsize,
    accepting: AtomicBool,
}

pub struct Dispatcher<T: Send + 'static> {
    tx: Sender<DispatchEvent<T>>,
    rx: Receiver<DispatchEvent<T>>,
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    idle_tick: Duration,
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new(config: DispatcherConfig) -> Self {
        Dispatcher::with_hooks(config, None, None)
    }

    /// Build a dispatcher with optional pre/post hooks fixed for its
    /// lifetime, and spawn the initial worker pool.
    pub fn with_hooks(
        config: DispatcherConfig,
        pre: Option<PreHook<T>>,
        post: Option<PostHook<T>>,
    ) -> Self {
        let (tx, rx) = bounded(config.queue_capacity);
        let shared = Arc::new(Shared {
            handlers: Mutex::new(Vec::new()),
            pre,
            post,
            target_workers: AtomicUsize::new(config.worker_count),
            accepting: AtomicBool::new(true),
        });

        let dispatcher = Dispatcher {
            tx,
            rx,
            shared,
            workers: Mutex::new(Vec::new()),
            idle_tick: config.idle_tick,
        };
        {
            let mut workers = dispatcher.lock_workers();
            for id in 0..config.worker_count {
                workers.push(dispatcher.spawn_worker(id));
            }
        }
        dispatcher
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self, id: usize) -> JoinHandle<()> {
        let rx = self.rx.clone();
        let shared = Arc::clone(&self.shared);
        let idle_tick = self.idle_tick;
        std::thread::spawn(move || worker_loop(id, rx, shared, idle_tick))
    }

    /// Queue one event for delivery, waiting up to `timeout` for space.
    pub fn submit(&self, payload: T, timeout: Duration) -> Result<()> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(NodeError::DispatchClosed);
        }
        match self.tx.send_timeout(DispatchEvent::Deliver(payload), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(NodeError::QueueRefused {
                pending: self.tx.len(),
            }),
            Err(SendTimeoutError::Disconnected(_)) => Err(NodeError::DispatchClosed),
        }
    }

    /// Add `handler` to the stack unless the same closure is already
    /// registered. Returns whether it was added.
    pub fn add_handler(&self, handler: Handler<T>) -> bool {
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.iter().any(|known| Arc::ptr_eq(known, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Remove a previously added handler, matched by closure identity.
    pub fn remove_handler(&self, handler: &Handler<T>) -> bool {
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|known| !Arc::ptr_eq(known, handler));
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn worker_count(&self) -> usize {
        self.lock_workers().len()
    }

    /// Grow or shrink the pool. Growing is refused once shutdown has begun;
    /// shrinking retires and joins the newest workers.
    pub fn set_worker_count(&self, count: usize) {
        let mut workers = self.lock_workers();
        let current = workers.len();
        if count > current {
            if !self.shared.accepting.load(Ordering::Acquire) {
                debug!(count, "ignoring pool grow after shutdown");
                return;
            }
            self.shared.target_workers.store(count, Ordering::Release);
            for id in current..count {
                workers.push(self.spawn_worker(id));
            }
        } else if count < current {
            self.shared.target_workers.store(count, Ordering::Release);
            while workers.len() > count {
                if let Some(handle) = workers.pop() {
                    let _ = handle.join();
                }
            }
        }
    }

    /// Stop accepting events, let the workers drain the backlog, and join
    /// them. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut workers = self.lock_workers();
        if self.shared.accepting.swap(false, Ordering::AcqRel) {
            // One sentinel per worker; they queue behind any backlog, so
            // every already-accepted event is still delivered.
            for _ in 0..workers.len() {
                let _ = self.tx.send(DispatchEvent::Shutdown);
            }
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl<T: Send + 'static> Drop for Dispatcher<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T: Send + 'static>(
    id: usize,
    rx: Receiver<DispatchEvent<T>>,
    shared: Arc<Shared<T>>,
    idle_tick: Duration,
) {
    loop {
        if id >= shared.target_workers.load(Ordering::Acquire) {
            debug!(worker = id, "dispatch worker retiring");
            return;
        }
        match rx.recv_timeout(idle_tick) {
            Ok(DispatchEvent::Deliver(payload)) => {
                let payload = match &shared.pre {
                    Some(pre) => pre(payload),
                    None => payload,
                };
                let handlers = shared
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for handler in &handlers {
                    handler(&payload);
                }
                if let Some(post) = &shared.post {
                    post(&payload);
                }
            }
            Ok(DispatchEvent::Shutdown) => return,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            idle_tick: Duration::from_millis(10),
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = Dispatcher::<u32>::new(quick_config());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            dispatcher.add_handler(Arc::new(move |value: &u32| {
                seen.lock().unwrap().push((tag, *value));
            }));
        }

        dispatcher
            .submit(7, Duration::from_millis(100))
            .expect("submit");
        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().len() == 2
        }));
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn pre_hook_replaces_payload_before_handlers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::<u32>::with_hooks(
            quick_config(),
            Some(Arc::new(|value| value * 2)),
            None,
        );
        {
            let seen = Arc::clone(&seen);
            dispatcher.add_handler(Arc::new(move |value: &u32| {
                seen.store(*value as usize, Ordering::SeqCst);
            }));
        }

        dispatcher
            .submit(21, Duration::from_millis(100))
            .expect("submit");
        assert!(wait_until(Duration::from_secs(2), || {
            seen.load(Ordering::SeqCst) == 42
        }));
    }

    #[test]
    fn post_hook_runs_after_handler_stack() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let post_seen = Arc::clone(&seen);
        let dispatcher = Dispatcher::<u32>::with_hooks(
            quick_config(),
            None,
            Some(Arc::new(move |_: &u32| {
                post_seen.lock().unwrap().push("post");
            })),
        );
        {
            let seen = Arc::clone(&seen);
            dispatcher.add_handler(Arc::new(move |_: &u32| {
                seen.lock().unwrap().push("handler");
            }));
        }

        dispatcher
            .submit(1, Duration::from_millis(100))
            .expect("submit");
        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().len() == 2
        }));
        assert_eq!(*seen.lock().unwrap(), vec!["handler", "post"]);
    }

    #[test]
    fn duplicate_handler_registers_once() {
        let dispatcher = Dispatcher::<u32>::new(quick_config());
        let handler: Handler<u32> = Arc::new(|_| {});

        assert!(dispatcher.add_handler(Arc::clone(&handler)));
        assert!(!dispatcher.add_handler(Arc::clone(&handler)));
        assert_eq!(dispatcher.handler_count(), 1);

        assert!(dispatcher.remove_handler(&handler));
        assert!(!dispatcher.remove_handler(&handler));
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let dispatcher = Dispatcher::<u32>::new(quick_config());
        dispatcher.shutdown();
        assert!(matches!(
            dispatcher.submit(1, Duration::from_millis(10)),
            Err(NodeError::DispatchClosed)
        ));
    }

    #[test]
    fn full_queue_refuses_with_pending_count() {
        // No workers, so submissions pile up in the queue.
        let dispatcher = Dispatcher::<u32>::new(DispatcherConfig {
            worker_count: 0,
            queue_capacity: 1,
            ..quick_config()
        });
        dispatcher.submit(1, Duration::from_millis(10)).expect("fits");
        match dispatcher.submit(2, Duration::from_millis(10)) {
            Err(NodeError::QueueRefused { pending }) => assert_eq!(pending, 1),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_drains_queued_events_first() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::<u32>::new(quick_config());
        {
            let counter = Arc::clone(&counter);
            dispatcher.add_handler(Arc::new(move |_: &u32| {
                std::thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for value in 0..5 {
            dispatcher
                .submit(value, Duration::from_millis(100))
                .expect("submit");
        }
        dispatcher.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn pool_shrinks_and_grows() {
        let dispatcher = Dispatcher::<u32>::new(DispatcherConfig {
            worker_count: 3,
            ..quick_config()
        });
        assert_eq!(dispatcher.worker_count(), 3);

        dispatcher.set_worker_count(1);
        assert_eq!(dispatcher.worker_count(), 1);

        // The surviving worker still delivers.
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            dispatcher.add_handler(Arc::new(move |_: &u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        dispatcher.submit(1, Duration::from_millis(100)).expect("submit");
        assert!(wait_until(Duration::from_secs(2), || {
            counter.load(Ordering::SeqCst) == 1
        }));

        dispatcher.set_worker_count(2);
        assert_eq!(dispatcher.worker_count(), 2);
    }

    #[test]
    fn pool_does_not_grow_after_shutdown() {
        let dispatcher = Dispatcher::<u32>::new(quick_config());
        dispatcher.shutdown();
        dispatcher.set_worker_count(4);
        assert_eq!(dispatcher.worker_count(), 0);
    }
}
