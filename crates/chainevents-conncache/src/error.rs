use thiserror::Error;

/// Errors returned by the caching connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The connector was closed; using it afterwards is a caller bug.
    #[error("connection cache is closed")]
    Closed,

    #[error("dial {target} failed: {reason}")]
    Dial { target: String, reason: String },

    #[error("dial {target} timed out after {ms}ms")]
    Timeout { target: String, ms: u64 },
}
