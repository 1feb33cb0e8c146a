use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use ipcbus_wire::{Segment, HEADER_SIZE, MAX_SEGMENT_SIZE};

use crate::conduit::{send_full, Conduit, RouteTable};
use crate::error::{Result, TransportError};
use crate::traits::Transport;

/// A segment transport over datagram-style conduits.
///
/// One datagram is one segment: each `send` emits a single encoded segment
/// on the outbound device, each `recv` decodes a single datagram from the
/// inbound device. Works over [`QueueConduit`](crate::QueueConduit) and
/// [`UdpConduit`](crate::UdpConduit).
///
/// Destinations with a direct route registered bypass the default outbound
/// device; everything else goes out the default device, typically toward a
/// router.
pub struct DirectTransport {
    send_dev: Arc<dyn Conduit>,
    recv_dev: Arc<dyn Conduit>,
    routes: RouteTable,
}

impl DirectTransport {
    pub fn new(send_dev: Arc<dyn Conduit>, recv_dev: Arc<dyn Conduit>) -> Self {
        Self {
            send_dev,
            recv_dev,
            routes: RouteTable::new(),
        }
    }

    /// Build from a single bidirectional device, e.g. one UDP socket.
    pub fn over(dev: Arc<dyn Conduit>) -> Self {
        Self::new(Arc::clone(&dev), dev)
    }

    /// Route segments addressed to `addr` over `dev` instead of the default
    /// outbound device.
    pub fn set_direct_route(&self, addr: u32, dev: Arc<dyn Conduit>) {
        self.routes.set(addr, dev);
    }

    /// Remove the direct route for `addr`, returning whether one existed.
    pub fn clear_direct_route(&self, addr: u32) -> bool {
        self.routes.clear(addr)
    }
}

impl Transport for DirectTransport {
    fn send(&self, segment: Segment, timeout: Duration) -> Result<()> {
        let dev = self.routes.get_or(segment.dst(), &self.send_dev);
        let wire = segment.to_bytes();
        send_full(&*dev, &wire, timeout)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Segment>> {
        let mut buf = [0u8; MAX_SEGMENT_SIZE];
        let n = match self.recv_dev.recv(&mut buf, timeout) {
            Ok(n) => n,
            Err(TransportError::Timeout) => return Ok(None),
            Err(e) => return Err(e),
        };
        if n < HEADER_SIZE {
            debug!(len = n, "discarding undersized datagram");
            return Ok(None);
        }
        match Segment::decode(&buf[..n]) {
            Ok(seg) => Ok(Some(seg)),
            Err(e) => {
                debug!(len = n, error = %e, "discarding undecodable datagram");
                Ok(None)
            }
        }
    }

    fn cancel(&self) {
        self.recv_dev.cancel();
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}
