//! Error types for the relay layer.

use thiserror::Error;

/// Errors surfaced to relay callers.
///
/// Per-frame protocol violations (orphan content, malformed tags) are
/// recovered inside the relay task: the frame is logged and dropped
/// and the loop continues, so they never surface through this type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// `wait_for_message` exhausted its bounded wait. Distinct from the
    /// stream legitimately ending, which is signaled by data (`is_done`
    /// or the closed sentinel), never by an error.
    #[error("timed out waiting for a message")]
    Timeout,

    /// Relay operation on a connection or broker that is not running.
    #[error("relay is not running")]
    NotRunning,

    /// `start` on a connection or broker that is already running.
    #[error("relay is already running")]
    AlreadyRunning,

    #[error("invalid relay configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Wire(#[from] agent_wire::WireError),

    #[error(transparent)]
    Transport(#[from] std::io::Error),
}
