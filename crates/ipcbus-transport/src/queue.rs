use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::debug;

use crate::conduit::Conduit;
use crate::error::{Result, TransportError};

/// Interval between emptiness polls in [`QueueConduit::ready`].
const READY_POLL: Duration = Duration::from_millis(1);

/// A registry of named in-process message queues.
///
/// The portable stand-in for OS message queues: each queue preserves message
/// boundaries and blocks senders when full. A hub is an explicitly
/// constructed object shared by the endpoints that communicate over it —
/// typically a router and the nodes attached to it within one process.
#[derive(Default)]
pub struct QueueHub {
    queues: Mutex<HashMap<String, Channel>>,
}

#[derive(Clone)]
struct Channel {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl QueueHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a named queue holding at most `capacity` pending messages.
    pub fn create(&self, name: &str, capacity: usize) -> Result<()> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if queues.contains_key(name) {
            return Err(TransportError::QueueExists {
                name: name.to_string(),
            });
        }
        let (tx, rx) = bounded(capacity);
        queues.insert(name.to_string(), Channel { tx, rx });
        debug!(queue = name, capacity, "created queue");
        Ok(())
    }

    /// Open a conduit onto an existing queue.
    ///
    /// Any number of conduits may be open on one queue; each message is
    /// delivered to exactly one receiver.
    pub fn open(&self, name: &str) -> Result<QueueConduit> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = queues.get(name).ok_or_else(|| TransportError::UnknownQueue {
            name: name.to_string(),
        })?;
        Ok(QueueConduit {
            name: name.to_string(),
            tx: channel.tx.clone(),
            rx: channel.rx.clone(),
        })
    }

    /// Drop a queue from the registry. Conduits already open keep working
    /// until released.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            debug!(queue = name, "removed queue");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

/// One endpoint's handle onto a hub queue. Clones share the same queue.
#[derive(Clone, Debug)]
pub struct QueueConduit {
    name: String,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl QueueConduit {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages waiting in the queue.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}

impl Conduit for QueueConduit {
    fn send(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        match self.tx.send_timeout(buf.to_vec(), timeout) {
            Ok(()) => Ok(buf.len()),
            Err(SendTimeoutError::Timeout(_)) => Err(TransportError::Timeout),
            Err(SendTimeoutError::Disconnected(_)) => Err(TransportError::Closed),
        }
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => {
                let n = msg.len().min(buf.len());
                buf[..n].copy_from_slice(&msg[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn ready(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.rx.is_empty() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            std::thread::sleep(READY_POLL.min(remaining));
        }
    }

    fn cancel(&self) {
        // A 4-byte throwaway message; receivers discard it as foreign.
        let _ = self.tx.try_send(b"wake".to_vec());
    }

    fn kind(&self) -> &'static str {
        "queue"
    }
}
