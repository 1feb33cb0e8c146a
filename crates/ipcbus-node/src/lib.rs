//! Message-level endpoints for the ipcbus protocol.
//!
//! Where `ipcbus-wire` defines segments and `ipcbus-transport` moves them,
//! this crate turns segment streams back into messages and gives them
//! somewhere to go. A [`Node`] owns the two protocol threads: the transmit
//! side drains a priority [`TransmitQueue`] into a transport, the receive
//! side feeds an [`AccumulatorMap`] that reassembles fragment chains,
//! correlates responses to waiting requesters, and hands complete messages
//! to per-context [`Dispatcher`] pools. A [`Router`] relays segments
//! between in-process nodes and doubles as their name service.

pub mod accumulator;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod node;
pub mod reassembly;
pub mod resolver;
pub mod response;
pub mod router;
pub mod signal;
pub mod transmit;

pub use accumulator::Accumulator;
pub use dispatch::{Dispatcher, DispatcherConfig, Handler, PostHook, PreHook};
pub use error::{NodeError, Result};
pub use message::{Delivery, DeliveryHandler};
pub use node::{Node, NodeConfig, NodeState, NodeStats, SendOptions, WatchdogFn};
pub use reassembly::{AccumulatorMap, MapConfig, ReassemblyObserver};
pub use resolver::{ResolveFn, Resolver};
pub use response::{PutOutcome, ResponseContext};
pub use router::{Router, RouterConfig};
pub use signal::{PooledSignal, Signal, SignalPool};
pub use transmit::{TransmitQueue, TxPull, DEFAULT_PENDING_LIMIT};
