//! Inbound request routing for broker-connected agents.
//!
//! The [`Dispatcher`] resolves an inbound call envelope to a registered
//! [`Actor`], enforcing time-to-live and duplicate-suppression policy, and
//! normalizes the outcome into a result envelope for the caller to publish.

pub mod actor;
pub mod cache;
pub mod dispatcher;
pub mod error;

pub use actor::{Actor, ActorRegistry, ExceptionCallback};
pub use cache::{CacheStats, DispatchedCache};
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
