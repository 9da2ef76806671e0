//! Error types for the PEI stack.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport failures, radio-reported
//! errors, timeouts, cancellation and usage errors are kept apart so that
//! callers can decide whether to retry, recover or give up.

/// The error type for all PEI operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port could not be opened, device vanished).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error: the radio answered with an error result code
    /// (`ERROR`, `+CME ERROR: <n>`) or sent data that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for the radio to finish a command exchange.
    #[error("timeout waiting for response")]
    Timeout,

    /// The caller cancelled the operation before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// An invalid parameter was passed (message reference out of range,
    /// unknown encoding name, malformed identity).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An indication handler is already registered for this prefix.
    #[error("indication already registered: {0:?}")]
    DuplicateIndication(String),

    /// No connection to the radio has been established, or it was closed.
    #[error("not connected")]
    NotConnected,

    /// The connection to the radio was lost while an operation was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the channel to the radio is gone.
    ///
    /// Fatal errors end the session; everything else leaves it usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::NotConnected | Error::ConnectionLost | Error::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
