use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_types::CallEnvelope;

/// Identity of one broker connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerId(pub String);

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Host address parts backing a broker identity, used to re-derive the
/// connection during reconnect escalation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub shard: u32,
    pub variant: u32,
}

/// Exchange options for a publish.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishOptions {
    pub name: String,
}

impl PublishOptions {
    /// The shared request exchange.
    pub fn request() -> Self {
        Self {
            name: "request".into(),
        }
    }
}

/// Per-message delivery options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeliveryOptions {
    pub persistent: bool,
    pub mandatory: bool,
    /// Restrict the publish to specific broker connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brokers: Option<Vec<BrokerId>>,
}

/// Failures surfaced by the broker transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no connected brokers")]
    NoConnectedBrokers,

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Broker transport consumed by the sender. Connection management and the
/// wire protocol live behind this boundary.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish an envelope, returning the broker connections it went over.
    async fn publish(
        &self,
        options: &PublishOptions,
        envelope: &CallEnvelope,
        delivery: &DeliveryOptions,
    ) -> Result<Vec<BrokerId>, BrokerError>;

    fn connected(&self, broker_id: &BrokerId) -> bool;

    fn identity_parts(&self, broker_id: &BrokerId) -> Option<BrokerAddress>;

    /// All known broker connections.
    fn all(&self) -> Vec<BrokerId>;
}

/// Surrounding agent process, consulted for identity and reconnects.
#[async_trait]
pub trait Agent: Send + Sync {
    fn identity(&self) -> String;

    /// Re-establish one broker connection.
    async fn connect(&self, address: &BrokerAddress, force: bool) -> anyhow::Result<()>;
}
