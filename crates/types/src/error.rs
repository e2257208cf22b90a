//! Error types shared across the relay.

use crate::result::RelayCode;

/// Errors surfaced by relay components.
///
/// Adapter-internal transport failures are retried inside the adapter and
/// never reach this type; anything emitted on an outward-facing stream is
/// terminal for its link.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("sequence gap: expected {expected}, got {got}")]
    Gap { expected: i64, got: i64 },
    #[error("config: {0}")]
    Config(String),
    #[error("rpc: {0}")]
    Rpc(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error("store: {0}")]
    Store(String),
    #[error("fatal relay result {code:?} for message {id}")]
    FatalResult { id: String, code: RelayCode },
}

impl RelayError {
    /// True for the sender-side back-pressure rejection the link engine
    /// absorbs by entering its pending state.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
