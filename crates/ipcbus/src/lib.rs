//! Segmented IPC message bus with priority delivery and request correlation.
//!
//! ipcbus moves arbitrarily sized messages between endpoints as chains of
//! fixed-size segments: fragmentation and reassembly, four delivery
//! priorities, request/response correlation, and a pluggable transport seam
//! covering in-process queues, Unix stream sockets, and UDP.
//!
//! # Crate Structure
//!
//! - [`wire`] — Segment header format, fragment chains, control codes
//! - [`transport`] — Byte conduits and segment transports (queue, UDS, UDP)
//! - [`node`] — Endpoints: reassembly, dispatch, transmit queue, router

/// Re-export wire types.
pub mod wire {
    pub use ipcbus_wire::*;
}

/// Re-export transport types.
pub mod transport {
    pub use ipcbus_transport::*;
}

/// Re-export node types.
pub mod node {
    pub use ipcbus_node::*;
}
