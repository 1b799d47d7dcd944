use thiserror::Error;

use courier_types::TargetError;

/// Failures surfaced by the sender to its callers.
#[derive(Debug, Error)]
pub enum SendError {
    /// No broker reachable and offline queueing is disabled.
    #[error("temporarily offline: {0}")]
    TemporarilyOffline(String),

    /// Publish failed for an unexpected reason.
    #[error("send failure: {0}")]
    SendFailure(String),

    #[error(transparent)]
    InvalidTarget(#[from] TargetError),

    /// Two-way sends require a response handler.
    #[error("response handler required for request")]
    MissingResponseHandler,
}
