//! Splitting a logical message into a segment chain and joining it back.
//!
//! A payload that fits [`PAYLOAD_CAPACITY`] travels as one plain segment.
//! Anything larger becomes a chain of multipart fragments numbered from 1,
//! transmitted in ascending order. The highest-numbered fragment carries the
//! initial flag: its fragment number doubles as the total fragment count, so
//! a receiver learns how many fragments to expect only when the trailer
//! arrives.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::segment::{Segment, PAYLOAD_CAPACITY};

/// Largest logical message that can be fragmented (fragment numbers are
/// 16-bit and numbering starts at 1).
pub const MAX_MESSAGE_SIZE: usize = PAYLOAD_CAPACITY * u16::MAX as usize;

/// Split `payload` into a segment chain, copying addressing and type fields
/// from `template`.
///
/// The template's fragment fields (fragment number, multipart/initial flags)
/// are overwritten per fragment; the message id is left for the transmit
/// queue to assign.
pub fn fragment_payload(template: &Segment, payload: &[u8]) -> Result<Vec<Segment>> {
    if payload.len() <= PAYLOAD_CAPACITY {
        let mut seg = template.clone();
        seg.set_frag_no(0);
        seg.set_multipart(false);
        seg.set_initial(false);
        seg.set_payload(Bytes::copy_from_slice(payload));
        return Ok(vec![seg]);
    }

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let total = payload.len().div_ceil(PAYLOAD_CAPACITY);
    let mut chain = Vec::with_capacity(total);
    for (index, piece) in payload.chunks(PAYLOAD_CAPACITY).enumerate() {
        let mut seg = template.clone();
        seg.set_frag_no((index + 1) as u16);
        seg.set_multipart(true);
        seg.set_initial(index + 1 == total);
        seg.set_payload(Bytes::copy_from_slice(piece));
        chain.push(seg);
    }
    Ok(chain)
}

/// Concatenate the payloads of an ordered chain back into one buffer.
pub fn assemble_payload(chain: &[Segment]) -> Bytes {
    let total: usize = chain.iter().map(|seg| seg.payload().len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for seg in chain {
        buf.extend_from_slice(seg.payload());
    }
    buf.freeze()
}
