use std::path::PathBuf;

/// Errors that can occur on conduits and segment transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a listening device.
    #[error("failed to bind to {target}: {source}")]
    Bind {
        target: String,
        source: std::io::Error,
    },

    /// Failed to connect to a remote device.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the device.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The operation did not complete within its timeout.
    #[error("operation timed out")]
    Timeout,

    /// The device was closed or its peer went away.
    #[error("device closed")]
    Closed,

    /// A queue with this name already exists on the hub.
    #[error("queue {name:?} already exists")]
    QueueExists { name: String },

    /// No queue with this name exists on the hub.
    #[error("unknown queue {name:?}")]
    UnknownQueue { name: String },

    /// The loopback self-test did not see its probe come back.
    #[error("transport validation failed: {detail}")]
    ValidationFailed { detail: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;
