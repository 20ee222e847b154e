use thiserror::Error;

/// Adapter error types covering tag definitions, write values, and link failures.
///
/// None of these ever escape to a tag endpoint as a panic or a propagated
/// error: the link layer folds every one of them into a delivered result
/// with error code `-1`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum S7Error {
    /// Unknown memory area or datatype, or an otherwise unusable tag.
    #[error("malformed tag: {0}")]
    MalformedTag(String),

    /// A write value was outside its datatype's domain and has been corrected.
    #[error("validation error: {0}")]
    Validation(String),

    /// A write value had the wrong primitive type for a bit, char, or string tag.
    #[error("fatal value type: {0}")]
    FatalValueType(String),

    /// The transport reported a failed connect, poll, or write.
    #[error("link error: {0}")]
    Link(String),

    /// A request arrived while the PLC link was not connected.
    #[error("no connection to {0}")]
    NoConnection(String),

    /// No poll has completed yet, or the address was never polled.
    #[error("stale buffer: no value for {0}")]
    StaleBuffer(String),

    /// An in-flight transport call did not complete within the watchdog period.
    #[error("operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// Configured watchdog period in milliseconds.
        timeout_ms: u64,
    },

    /// The connection manager has already been closed.
    #[error("connection manager closed")]
    Closed,

    /// Invalid connection state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl S7Error {
    /// Returns true if retrying the same request can never succeed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedTag(_) | Self::FatalValueType(_) | Self::Config(_)
        )
    }
}

/// Convenience type alias for adapter operations.
pub type S7Result<T> = Result<T, S7Error>;
