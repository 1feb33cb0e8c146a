use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Smallest socket timeout handed to the kernel.
/// `set_read_timeout`/`set_write_timeout` reject a zero duration.
pub(crate) const MIN_IO_TICK: Duration = Duration::from_millis(1);

/// A blocking byte-transport device.
///
/// Conduits are the narrow seam between the segment protocol and whatever
/// actually moves bytes: in-process queues, Unix stream sockets, UDP
/// datagrams. Every operation takes an explicit timeout; a timeout surfaces
/// as [`TransportError::Timeout`](crate::TransportError::Timeout) so callers
/// can use short waits as housekeeping ticks.
///
/// Implementations must be safe to call from multiple threads; a transport
/// typically drives the send side from one thread and the receive side from
/// another.
pub trait Conduit: Send + Sync {
    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn send(&self, buf: &[u8], timeout: Duration) -> Result<usize>;

    /// Read into `buf`, returning how many bytes arrived.
    ///
    /// Datagram-style conduits deliver at most one message per call.
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Whether a `recv` would complete without blocking past `timeout`.
    fn ready(&self, timeout: Duration) -> Result<bool>;

    /// Flush buffered writes. Datagram conduits have nothing to flush.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Unblock a concurrent `recv`, typically during shutdown.
    ///
    /// Implementations wake the reader with a short throwaway message or by
    /// closing the device; the upper layer discards anything smaller than a
    /// segment header as foreign traffic.
    fn cancel(&self);

    /// Device kind for diagnostics.
    fn kind(&self) -> &'static str;
}

/// Per-destination overrides for a transport's outbound device.
///
/// Most traffic leaves through the transport's default device toward a
/// router; a direct route short-circuits that hop for one destination.
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: Mutex<HashMap<u32, Arc<dyn Conduit>>>,
}

impl RouteTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, addr: u32, dev: Arc<dyn Conduit>) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, dev);
        debug!(addr, "direct route installed");
    }

    pub(crate) fn clear(&self, addr: u32) -> bool {
        let removed = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr)
            .is_some();
        if removed {
            debug!(addr, "direct route removed");
        }
        removed
    }

    /// The device for `dst`: its direct route if one is set, else `default`.
    pub(crate) fn get_or(&self, dst: u32, default: &Arc<dyn Conduit>) -> Arc<dyn Conduit> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dst)
            .cloned()
            .unwrap_or_else(|| Arc::clone(default))
    }
}

/// Map socket errors onto transport errors: kernel-level timeouts surface
/// as [`TransportError::Timeout`](crate::TransportError::Timeout).
pub(crate) fn map_io(err: std::io::Error) -> crate::TransportError {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            crate::TransportError::Timeout
        }
        _ => crate::TransportError::Io(err),
    }
}

/// Write all of `buf`, looping on partial sends until `timeout` elapses.
pub(crate) fn send_full(dev: &dyn Conduit, buf: &[u8], timeout: Duration) -> Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    let mut offset = 0usize;
    while offset < buf.len() {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(crate::TransportError::Timeout);
        }
        offset += dev.send(&buf[offset..], remaining)?;
    }
    Ok(())
}
