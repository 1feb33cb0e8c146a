use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Segment header size: version (1) + options (1) + fragment number (2) +
/// source (4) + destination (4) + message id (4) + context (4) +
/// message type (1) + control code (1) + payload length (2) = 24 bytes.
pub const HEADER_SIZE: usize = 24;

/// Maximum total segment size on the wire, header included.
pub const MAX_SEGMENT_SIZE: usize = 1024;

/// Maximum payload bytes a single segment can carry.
pub const PAYLOAD_CAPACITY: usize = MAX_SEGMENT_SIZE - HEADER_SIZE;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// The invalid/unassigned node address.
pub const ADDR_NONE: u32 = 0;

/// The all-ones broadcast address.
pub const ADDR_BROADCAST: u32 = u32::MAX;

/// Options bit: segment is one fragment of a multipart message.
pub const OPT_MULTIPART: u8 = 0x20;

/// Options bit: segment is the initial fragment (highest fragment number,
/// transmitted last; its fragment number equals the total fragment count).
pub const OPT_INITIAL: u8 = 0x40;

/// Options bit: segment carries a protocol control message.
pub const OPT_CONTROL: u8 = 0x80;

const OPT_PRIORITY_MASK: u8 = 0x03;

/// Delivery priority, two bits of the options field. Numerically lower is
/// more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    #[default]
    Medium = 1,
    Low = 2,
    Background = 3,
}

impl Priority {
    /// Decode from the two priority bits of an options byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & OPT_PRIORITY_MASK {
            0 => Priority::High,
            1 => Priority::Medium,
            2 => Priority::Low,
            _ => Priority::Background,
        }
    }

    pub fn as_bits(self) -> u8 {
        self as u8
    }
}

/// Payload kind carried by a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MsgType {
    /// Uninterpreted bytes.
    #[default]
    Raw = 0,
    /// An encoded hierarchical value; opaque to this layer.
    Value = 1,
    /// A protocol control message (see [`crate::control`]).
    Control = 2,
}

impl TryFrom<u8> for MsgType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MsgType::Raw),
            1 => Ok(MsgType::Value),
            2 => Ok(MsgType::Control),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// The atomic wire unit of the messaging protocol.
///
/// Wire format (all multi-byte integers big-endian):
/// ```text
/// ┌─────────┬─────────┬─────────┬────────┬────────┬────────┬─────────┐
/// │ version │ options │ fragNum │ srcAddr│ dstAddr│ msgId  │ context │
/// │ (1B)    │ (1B)    │ (2B)    │ (4B)   │ (4B)   │ (4B)   │ (4B)    │
/// ├─────────┼─────────┼─────────┼────────┴────────┴────────┴─────────┤
/// │ msgType │ ctlCode │ dataLen │ payload (dataLen bytes)            │
/// │ (1B)    │ (1B)    │ (2B)    │                                    │
/// └─────────┴─────────┴─────────┴────────────────────────────────────┘
/// ```
///
/// Options byte: bits 0-1 priority, bit 5 multipart, bit 6 initial,
/// bit 7 control. Bits 2-4 are reserved and preserved on decode.
///
/// A logical message larger than [`PAYLOAD_CAPACITY`] travels as an ordered
/// sequence of segments (`Vec<Segment>`) sharing one message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    version: u8,
    options: u8,
    frag_no: u16,
    src: u32,
    dst: u32,
    msg_id: u32,
    context: u32,
    msg_type: MsgType,
    ctl_code: u8,
    payload: Bytes,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            options: Priority::Medium.as_bits(),
            frag_no: 0,
            src: ADDR_NONE,
            dst: ADDR_NONE,
            msg_id: 0,
            context: 0,
            msg_type: MsgType::Raw,
            ctl_code: 0,
            payload: Bytes::new(),
        }
    }
}

impl Segment {
    /// Create an empty segment with default header values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a control segment carrying `code`, addressed to `dst`.
    pub fn control(dst: u32, code: u8) -> Self {
        let mut seg = Self::new();
        seg.dst = dst;
        seg.msg_type = MsgType::Control;
        seg.ctl_code = code;
        seg.options |= OPT_CONTROL;
        seg.set_priority(Priority::High);
        seg
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn frag_no(&self) -> u16 {
        self.frag_no
    }

    pub fn set_frag_no(&mut self, frag_no: u16) {
        self.frag_no = frag_no;
    }

    pub fn src(&self) -> u32 {
        self.src
    }

    pub fn set_src(&mut self, src: u32) {
        self.src = src;
    }

    pub fn dst(&self) -> u32 {
        self.dst
    }

    pub fn set_dst(&mut self, dst: u32) {
        self.dst = dst;
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn set_msg_id(&mut self, msg_id: u32) {
        self.msg_id = msg_id;
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn set_context(&mut self, context: u32) {
        self.context = context;
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.msg_type = msg_type;
        if msg_type == MsgType::Control {
            self.options |= OPT_CONTROL;
        } else {
            self.options &= !OPT_CONTROL;
        }
    }

    pub fn ctl_code(&self) -> u8 {
        self.ctl_code
    }

    pub fn set_ctl_code(&mut self, code: u8) {
        self.ctl_code = code;
    }

    pub fn priority(&self) -> Priority {
        Priority::from_bits(self.options)
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.options = (self.options & !OPT_PRIORITY_MASK) | priority.as_bits();
    }

    pub fn is_multipart(&self) -> bool {
        self.options & OPT_MULTIPART != 0
    }

    pub fn set_multipart(&mut self, on: bool) {
        if on {
            self.options |= OPT_MULTIPART;
        } else {
            self.options &= !OPT_MULTIPART;
        }
    }

    pub fn is_initial(&self) -> bool {
        self.options & OPT_INITIAL != 0
    }

    pub fn set_initial(&mut self, on: bool) {
        if on {
            self.options |= OPT_INITIAL;
        } else {
            self.options &= !OPT_INITIAL;
        }
    }

    pub fn is_control(&self) -> bool {
        self.options & OPT_CONTROL != 0
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Replace the payload, silently truncating to [`PAYLOAD_CAPACITY`].
    ///
    /// Returns `true` if truncation occurred.
    pub fn set_payload(&mut self, data: impl Into<Bytes>) -> bool {
        let mut data: Bytes = data.into();
        let truncated = data.len() > PAYLOAD_CAPACITY;
        if truncated {
            data.truncate(PAYLOAD_CAPACITY);
        }
        self.payload = data;
        truncated
    }

    /// Reset every header field to its default value and drop the payload.
    pub fn clear(&mut self) {
        *self = Segment::default();
    }

    /// Reassembly key: one logical message's fragments share this value for
    /// the lifetime of the reassembly window.
    pub fn guid(&self) -> u64 {
        (self.src as u64) << 32 | self.msg_id as u64
    }

    /// Total wire size of this segment (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into the wire format, appending to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        dst.put_u8(self.version);
        dst.put_u8(self.options);
        dst.put_u16(self.frag_no);
        dst.put_u32(self.src);
        dst.put_u32(self.dst);
        dst.put_u32(self.msg_id);
        dst.put_u32(self.context);
        dst.put_u8(self.msg_type as u8);
        dst.put_u8(self.ctl_code);
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one segment from `src`, which must hold exactly one segment.
    pub fn decode(src: &[u8]) -> Result<Segment> {
        if src.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                len: src.len(),
                need: HEADER_SIZE,
            });
        }

        let mut buf = src;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }
        let options = buf.get_u8();
        let frag_no = buf.get_u16();
        let src_addr = buf.get_u32();
        let dst_addr = buf.get_u32();
        let msg_id = buf.get_u32();
        let context = buf.get_u32();
        let msg_type = MsgType::try_from(buf.get_u8())?;
        let ctl_code = buf.get_u8();
        let payload_len = buf.get_u16() as usize;

        if payload_len > PAYLOAD_CAPACITY {
            return Err(WireError::PayloadTooLarge {
                len: payload_len,
                max: PAYLOAD_CAPACITY,
            });
        }
        if buf.remaining() != payload_len {
            return Err(WireError::LengthMismatch {
                declared: payload_len,
                actual: buf.remaining(),
            });
        }

        Ok(Segment {
            version,
            options,
            frag_no,
            src: src_addr,
            dst: dst_addr,
            msg_id,
            context,
            msg_type,
            ctl_code,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Read only the destination address from an encoded segment.
    ///
    /// Used by relays that forward raw bytes without a full decode.
    pub fn peek_dst(src: &[u8]) -> Option<u32> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        Some(u32::from_be_bytes([src[8], src[9], src[10], src[11]]))
    }
}
