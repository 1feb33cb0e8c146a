//! Segment wire format for the ipcbus messaging protocol.
//!
//! Every message on an ipcbus link is one or more [`Segment`]s: a fixed
//! 24-byte big-endian header followed by up to 1000 payload bytes. Large
//! messages are split by [`chain::fragment_payload`] and rejoined by the
//! receiving node; the fragment numbering convention (the trailer carries
//! the total) lives here so every layer above agrees on it.
//!
//! This is the lowest layer of ipcbus. It knows nothing about transports,
//! queues, or threads.

pub mod chain;
pub mod control;
pub mod error;
pub mod segment;

pub use chain::{assemble_payload, fragment_payload, MAX_MESSAGE_SIZE};
pub use error::{Result, WireError};
pub use segment::{
    MsgType, Priority, Segment, ADDR_BROADCAST, ADDR_NONE, HEADER_SIZE, MAX_SEGMENT_SIZE,
    PAYLOAD_CAPACITY, PROTOCOL_VERSION,
};
