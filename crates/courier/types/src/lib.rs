//! Core data model for the courier delivery layer.
//!
//! Envelopes are already-structured values at this boundary; serialization to
//! the broker wire format is an external collaborator's responsibility.

#![deny(unsafe_code)]

pub mod clock;
pub mod envelope;
pub mod result;
pub mod target;

pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{CallEnvelope, Push, Request, Selector, TargetScope, Token};
pub use result::{NonDeliveryReason, OperationResult, ResultEnvelope};
pub use target::{validate_target, TargetError, TargetSpec};
