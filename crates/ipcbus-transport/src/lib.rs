// `StreamConduit::ready` peeks the socket; `UnixStream::peek` is not yet
// stable, so this crate requires a nightly toolchain.
#![cfg_attr(unix, feature(unix_socket_peek))]

//! Byte conduits and segment transports.
//!
//! Two layers live here. [`Conduit`] is the raw device seam — blocking
//! send/recv with explicit timeouts over in-process queues, Unix stream
//! sockets, or UDP. [`Transport`] moves whole [`Segment`](ipcbus_wire::Segment)s
//! over conduits: [`DirectTransport`] for devices that preserve message
//! boundaries, [`StreamTransport`] for plain byte streams, which adds a
//! length-prefixed frame and resynchronization.

pub mod conduit;
pub mod direct;
pub mod error;
pub mod framed;
pub mod queue;
pub mod traits;
pub mod udp;

#[cfg(unix)]
pub mod stream;

pub use conduit::Conduit;
pub use direct::DirectTransport;
pub use error::{Result, TransportError};
pub use framed::{StreamTransport, FRAME_HEADER_SIZE, FRAME_MAGIC, OPCODE_SEGMENT};
pub use queue::{QueueConduit, QueueHub};
pub use traits::Transport;
pub use udp::UdpConduit;

#[cfg(unix)]
pub use stream::{connect, StreamConduit, StreamListener};
