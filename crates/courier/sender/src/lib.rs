//! Outbound request delivery for broker-connected agents.
//!
//! The [`Sender`] is the outward-facing façade of the delivery layer: it
//! builds call envelopes, validates addressing, publishes through the broker,
//! tracks pending replies, drives timer-based retries, supervises broker
//! connectivity with ping probes, and buffers sends while offline.

pub mod broker;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod offline;
pub mod pending;
pub mod sender;
pub mod stats;

pub use broker::{
    Agent, BrokerAddress, BrokerClient, BrokerError, BrokerId, DeliveryOptions, PublishOptions,
};
pub use config::SenderConfig;
pub use connectivity::ConnectivityChecker;
pub use error::SendError;
pub use offline::{
    OfflineHandler, OfflineMode, OfflineState, QueuedKind, QueuedRequest, RestartVoteCallback,
};
pub use pending::{PendingRequest, PendingRequests, RequestKind, ResponseHandler};
pub use sender::{SendOutcome, Sender};
pub use stats::NonDeliveryStats;

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod testing;
