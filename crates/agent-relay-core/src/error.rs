//! Relay error taxonomy.

use agent_relay_proto::RejectReason;
use thiserror::Error;

/// Everything that can go wrong inside the relay.
///
/// Connection-local errors terminate only the offending connection, never
/// the process.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or role-invalid message; connection-scoped.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Target client is not connected.
    #[error("unknown client: {0}")]
    NotFound(String),
    /// Target is running a sequence and queueing is disabled.
    #[error("client busy")]
    Busy,
    /// Target's pending queue is at capacity.
    #[error("queue full")]
    QueueFull,
    /// The request id is already in flight.
    #[error("duplicate request id: {0}")]
    DuplicateRequest(String),
    /// Per-action, per-sequence or registration deadline elapsed.
    #[error("timed out")]
    Timeout,
    /// Peer went away or the session was invalidated.
    #[error("disconnected")]
    Disconnected,
    /// The sequence was cancelled or swept up in a cascading abort.
    #[error("aborted")]
    Aborted,
}

impl RelayError {
    /// Map to a wire-level rejection for an `EXECUTE_SEQUENCE` reply.
    #[must_use]
    pub const fn reject_reason(&self) -> RejectReason {
        match self {
            Self::Busy => RejectReason::Busy,
            Self::QueueFull => RejectReason::QueueFull,
            Self::DuplicateRequest(_) => RejectReason::DuplicateRequest,
            // A disconnected or unknown target looks the same to the caller.
            _ => RejectReason::NotFound,
        }
    }
}
