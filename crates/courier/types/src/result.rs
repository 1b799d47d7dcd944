use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Token;

/// Reason a call could not be delivered or answered, carried as data so the
/// caller can distinguish "gave up after retrying" from "never reachable"
/// from "routing failed upstream".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonDeliveryReason {
    RetryTimeout,
    TtlExpiration,
    TargetNotConnected,
    NoRouteToTarget,
    RetryFailed,
}

impl fmt::Display for NonDeliveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::RetryTimeout => "retry timeout",
            Self::TtlExpiration => "TTL expiration",
            Self::TargetNotConnected => "target not connected",
            Self::NoRouteToTarget => "no route to target",
            Self::RetryFailed => "retry failed",
        };
        f.write_str(reason)
    }
}

/// Outcome of one dispatched call. Exactly one variant is active.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OperationResult {
    /// The handler ran and returned this content.
    Success(Value),
    /// The handler or routing failed; the message describes why.
    Error(String),
    /// The call never reached a handler.
    NonDelivery(NonDeliveryReason),
    /// Delivery should be reattempted by the caller.
    Retry(String),
}

impl OperationResult {
    pub fn success(content: Value) -> Self {
        Self::Success(content)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn non_delivery(reason: NonDeliveryReason) -> Self {
        Self::NonDelivery(reason)
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_non_delivery(&self) -> bool {
        matches!(self, Self::NonDelivery(_))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Reply envelope correlated back to its call by token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub token: Token,
    pub from: String,
    pub to: String,
    pub result: OperationResult,
}

impl ResultEnvelope {
    pub fn new(
        token: Token,
        from: impl Into<String>,
        to: impl Into<String>,
        result: OperationResult,
    ) -> Self {
        Self {
            token,
            from: from.into(),
            to: to.into(),
            result,
        }
    }
}
