use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A resettable binary signal.
///
/// `notify` sets the signal; `wait` blocks until it is set, consumes it,
/// and returns whether it was set within the timeout. One waiter consumes
/// each notification.
pub struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = true;
        self.cond.notify_all();
    }

    /// Block until notified or `timeout` elapses. Consumes the notification.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _timed_out) = self
            .cond
            .wait_timeout_while(state, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        if *state {
            *state = false;
            true
        } else {
            false
        }
    }

    /// Clear the signal without waiting.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed pool of reusable signals.
///
/// Response contexts borrow one signal for the lifetime of an exchange and
/// return it on drop, so steady-state correlation traffic creates no new
/// synchronization primitives. Under pressure the pool hands out extra
/// signals; returns beyond the configured capacity are dropped.
pub struct SignalPool {
    free: Mutex<Vec<Arc<Signal>>>,
    capacity: usize,
}

impl SignalPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let free = (0..capacity).map(|_| Arc::new(Signal::new())).collect();
        Arc::new(Self {
            free: Mutex::new(free),
            capacity,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledSignal {
        let signal = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Arc::new(Signal::new()));
        PooledSignal {
            signal,
            pool: Arc::clone(self),
        }
    }

    /// Signals currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A signal on loan from a [`SignalPool`]; returned (reset) on drop.
pub struct PooledSignal {
    signal: Arc<Signal>,
    pool: Arc<SignalPool>,
}

impl Deref for PooledSignal {
    type Target = Signal;

    fn deref(&self) -> &Signal {
        &self.signal
    }
}

impl Drop for PooledSignal {
    fn drop(&mut self) {
        self.signal.reset();
        let mut free = self.pool.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.pool.capacity {
            free.push(Arc::clone(&self.signal));
        }
    }
}
