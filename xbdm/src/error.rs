use crate::rdcp::Status;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A socket-level failure: refused connection, reset, unexpected close.
    #[error("network failure")]
    Network(#[from] std::io::Error),
    /// The peer sent bytes that do not form a valid protocol element.
    ///
    /// These are normally recovered locally (logged and discarded); the
    /// variant surfaces only when the violation is persistent.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// XBDM answered a request with an error status.
    #[error("target returned {status}: {message}")]
    Target {
        /// The 4xx status code.
        status: Status,
        /// The human-readable message from the status line.
        message: String,
    },
    /// An operation that requires an attached debugger was issued without one.
    #[error("debugger is not attached")]
    NotAttached,
    /// Bad caller input, rejected before anything reaches the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The transport owning an in-flight or queued request was closed.
    #[error("request abandoned because its transport closed")]
    Abandoned,
    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// Extension image parsing or relocation failed.
    #[error("extension load failed")]
    Loader(#[from] dxt_loader::LoaderError),
    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Builds a [`Error::Target`] from a completed request's status line.
    pub fn target(status: Status, message: impl Into<String>) -> Self {
        Error::Target {
            status,
            message: message.into(),
        }
    }
}
