use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use ipcbus_wire::control::CTL_NOP;
use ipcbus_wire::Segment;

use crate::error::{Result, TransportError};

/// Moves whole segments between endpoints.
///
/// A transport owns its byte devices and hides their shape: datagram devices
/// map one datagram to one segment, stream devices add framing. The node
/// layer drives `recv` from a single thread with short tick timeouts and
/// `send` from another.
pub trait Transport: Send + Sync {
    /// Encode and send one segment toward its destination address.
    fn send(&self, segment: Segment, timeout: Duration) -> Result<()>;

    /// Receive the next segment.
    ///
    /// Returns `Ok(None)` when the call produced no usable segment: nothing
    /// arrived within the window, or what arrived was discarded as foreign
    /// or malformed. Errors are reserved for real device failures. Callers
    /// treat `None` as a tick and call again.
    fn recv(&self, timeout: Duration) -> Result<Option<Segment>>;

    /// Unblock a concurrent `recv`, typically during shutdown.
    fn cancel(&self);

    /// Transport kind for diagnostics.
    fn kind(&self) -> &'static str;

    /// Prove this transport can reach `self_addr` — that is, itself —
    /// through whatever is routing segments.
    ///
    /// Sends a NOP control probe carrying a unique marker and waits for it
    /// to come back. Anything else received in the window is discarded;
    /// callers run this before attaching consumers to the transport.
    fn validate(&self, self_addr: u32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let marker = probe_marker();

        let mut probe = Segment::control(self_addr, CTL_NOP);
        probe.set_src(self_addr);
        probe.set_payload(Bytes::from(marker.clone().into_bytes()));
        self.send(probe, timeout)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::ValidationFailed {
                    detail: format!(
                        "loopback probe did not return within {}ms",
                        timeout.as_millis()
                    ),
                });
            }
            match self.recv(remaining)? {
                Some(seg) if seg.payload().as_ref() == marker.as_bytes() => {
                    debug!(addr = self_addr, transport = self.kind(), "transport validated");
                    return Ok(());
                }
                Some(seg) => {
                    debug!(
                        src = seg.src(),
                        msg_id = seg.msg_id(),
                        "discarding segment received during validation"
                    );
                }
                None => {}
            }
        }
    }
}

fn probe_marker() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("probe:{}:{:x}", std::process::id(), nanos)
}
