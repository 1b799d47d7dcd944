use thiserror::Error;

/// Hard dispatch rejections raised to the surrounding transport layer, which
/// decides whether to acknowledge and drop. Handler failures are never raised;
/// they are converted into error results inside dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Unknown route prefix or method; a caller or configuration bug.
    #[error("cannot route to {0}")]
    InvalidRequestType(String),

    /// Re-delivery of an already-served non-idempotent call.
    #[error("duplicate request {0}")]
    DuplicateRequest(String),
}
