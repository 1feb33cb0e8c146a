use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use ipcbus_wire::{Segment, HEADER_SIZE, MAX_SEGMENT_SIZE};

use crate::conduit::{send_full, Conduit, RouteTable};
use crate::error::{Result, TransportError};
use crate::traits::Transport;

/// Frame header: magic (2) + opcode (2) + length (4) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Frame magic: "IB" (0x49 0x42), big-endian.
pub const FRAME_MAGIC: u16 = 0x4942;

/// Opcode for a frame carrying one encoded segment.
pub const OPCODE_SEGMENT: u16 = 0x0001;

/// Bytes pulled from the device per read.
const READ_CHUNK: usize = 4096;

/// A segment transport over byte-stream conduits.
///
/// Streams have no message boundaries, so each segment rides inside a frame:
///
/// ```text
/// ┌────────────┬────────────┬────────────┬───────────────────────┐
/// │ magic (2B) │ opcode (2B)│ length (4B)│ segment (length bytes)│
/// │ 0x49 0x42  │ 0x0001     │ BE         │ header + payload       │
/// └────────────┴────────────┴────────────┴───────────────────────┘
/// ```
///
/// The receive side scans for the magic to recover from desynchronization:
/// garbage bytes are skipped one at a time, frames with a foreign opcode or
/// an undecodable body are read whole and discarded.
pub struct StreamTransport {
    send_dev: Arc<dyn Conduit>,
    recv_dev: Arc<dyn Conduit>,
    routes: RouteTable,
    rdbuf: Mutex<BytesMut>,
}

impl StreamTransport {
    pub fn new(send_dev: Arc<dyn Conduit>, recv_dev: Arc<dyn Conduit>) -> Self {
        Self {
            send_dev,
            recv_dev,
            routes: RouteTable::new(),
            rdbuf: Mutex::new(BytesMut::new()),
        }
    }

    /// Build from a single bidirectional device, e.g. one connected stream
    /// socket.
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

    /// Pull the next whole segment out of `buf`, consuming garbage and
    /// foreign frames along the way. `None` means more bytes are needed.
    fn scan_frame(buf: &mut BytesMut) -> Option<Segment> {
        loop {
            if buf.len() < FRAME_HEADER_SIZE {
                return None; // Need more data
            }
            let magic = u16::from_be_bytes([buf[0], buf[1]]);
            if magic != FRAME_MAGIC {
                // Desynchronized: walk forward one byte at a time.
                buf.advance(1);
                continue;
            }
            let opcode = u16::from_be_bytes([buf[2], buf[3]]);
            let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            if length < HEADER_SIZE || length > MAX_SEGMENT_SIZE {
                // Implausible length: the magic match was coincidence.
                debug!(length, "skipping frame header with implausible length");
                buf.advance(2);
                continue;
            }
            let total = FRAME_HEADER_SIZE + length;
            if buf.len() < total {
                return None; // Need more data
            }
            if opcode != OPCODE_SEGMENT {
                debug!(opcode, length, "discarding frame with foreign opcode");
                buf.advance(total);
                continue;
            }
            let frame = buf.split_to(total);
            match Segment::decode(&frame[FRAME_HEADER_SIZE..]) {
                Ok(seg) => return Some(seg),
                Err(e) => {
                    debug!(length, error = %e, "discarding undecodable segment frame");
                    continue;
                }
            }
        }
    }
}

impl Transport for StreamTransport {
    fn send(&self, segment: Segment, timeout: Duration) -> Result<()> {
        let dev = self.routes.get_or(segment.dst(), &self.send_dev);
        let mut wire = BytesMut::with_capacity(FRAME_HEADER_SIZE + segment.wire_size());
        wire.put_u16(FRAME_MAGIC);
        wire.put_u16(OPCODE_SEGMENT);
        wire.put_u32(segment.wire_size() as u32);
        segment.encode(&mut wire);
        send_full(&*dev, &wire, timeout)?;
        dev.flush()
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Segment>> {
        let deadline = Instant::now() + timeout;
        let mut rdbuf = self.rdbuf.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(seg) = Self::scan_frame(&mut rdbuf) {
                return Ok(Some(seg));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = match self.recv_dev.recv(&mut chunk, remaining) {
                Ok(n) => n,
                Err(TransportError::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            };
            rdbuf.extend_from_slice(&chunk[..n]);
        }
    }

    fn cancel(&self) {
        self.recv_dev.cancel();
    }

    fn kind(&self) -> &'static str {
        "stream"
    }
}
