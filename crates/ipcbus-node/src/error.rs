/// Errors that can occur in node, router, and delivery operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Destination did not resolve to a usable address.
    #[error("invalid destination {target:?}")]
    InvalidDestination { target: String },

    /// A message chain was unexpectedly empty.
    #[error("empty message chain")]
    EmptyMessage,

    /// Wire-level encode/decode error.
    #[error("wire error: {0}")]
    Wire(#[from] ipcbus_wire::WireError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] ipcbus_transport::TransportError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A bounded queue refused the submission; the message is dropped.
    #[error("queue refused submission ({pending} pending)")]
    QueueRefused { pending: usize },

    /// The dispatcher worker pool is no longer accepting events.
    #[error("dispatcher is shut down")]
    DispatchClosed,

    /// No response arrived for the given message in time.
    #[error("no response to message {msg_id} within {timeout:?}")]
    ResponseTimeout {
        msg_id: u32,
        timeout: std::time::Duration,
    },

    /// The operation is not legal in the node's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The router has no free addresses left.
    #[error("node address space exhausted")]
    AddressesExhausted,

    /// A node with this name is already registered.
    #[error("node name {name:?} already registered")]
    NameTaken { name: String },
}

pub type Result<T> = std::result::Result<T, NodeError>;
