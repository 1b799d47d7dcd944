//! In-memory collaborators for sender tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use courier_types::{CallEnvelope, ResultEnvelope};

use crate::broker::{
    Agent, BrokerAddress, BrokerClient, BrokerError, BrokerId, DeliveryOptions, PublishOptions,
};
use crate::lock;
use crate::pending::ResponseHandler;

type PublishScript =
    Box<dyn Fn(&CallEnvelope, usize) -> Result<Vec<BrokerId>, BrokerError> + Send + Sync>;

/// Broker that records every publish and answers from an optional script.
pub(crate) struct MockBroker {
    ids: Vec<BrokerId>,
    connected: AtomicBool,
    published: Mutex<Vec<CallEnvelope>>,
    deliveries: Mutex<Vec<DeliveryOptions>>,
    script: Mutex<Option<PublishScript>>,
}

impl MockBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            ids: vec![BrokerId::from("b1")],
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            deliveries: Mutex::new(Vec::new()),
            script: Mutex::new(None),
        })
    }

    /// Answer publishes with `script(envelope, prior_publish_count)` instead
    /// of the default success.
    pub(crate) fn script<F>(&self, script: F)
    where
        F: Fn(&CallEnvelope, usize) -> Result<Vec<BrokerId>, BrokerError> + Send + Sync + 'static,
    {
        *lock(&self.script) = Some(Box::new(script));
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn published(&self) -> Vec<CallEnvelope> {
        lock(&self.published).clone()
    }

    pub(crate) fn deliveries(&self) -> Vec<DeliveryOptions> {
        lock(&self.deliveries).clone()
    }

    pub(crate) fn publish_count(&self) -> usize {
        lock(&self.published).len()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn publish(
        &self,
        _options: &PublishOptions,
        envelope: &CallEnvelope,
        delivery: &DeliveryOptions,
    ) -> Result<Vec<BrokerId>, BrokerError> {
        let prior = {
            let mut published = lock(&self.published);
            lock(&self.deliveries).push(delivery.clone());
            published.push(envelope.clone());
            published.len() - 1
        };
        let script = lock(&self.script);
        match script.as_ref() {
            Some(script) => script(envelope, prior),
            None => Ok(self.ids.clone()),
        }
    }

    fn connected(&self, _broker_id: &BrokerId) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn identity_parts(&self, _broker_id: &BrokerId) -> Option<BrokerAddress> {
        Some(BrokerAddress {
            host: "localhost".into(),
            port: 5672,
            shard: 0,
            variant: 0,
        })
    }

    fn all(&self) -> Vec<BrokerId> {
        self.ids.clone()
    }
}

/// Agent that records reconnect attempts.
pub(crate) struct MockAgent {
    connects: Mutex<Vec<(BrokerAddress, bool)>>,
    fail_connects: AtomicBool,
}

impl MockAgent {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: Mutex::new(Vec::new()),
            fail_connects: AtomicBool::new(false),
        })
    }

    pub(crate) fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> Vec<(BrokerAddress, bool)> {
        lock(&self.connects).clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn identity(&self) -> String {
        "agent".into()
    }

    async fn connect(&self, address: &BrokerAddress, force: bool) -> anyhow::Result<()> {
        lock(&self.connects).push((address.clone(), force));
        if self.fail_connects.load(Ordering::SeqCst) {
            anyhow::bail!("connect refused");
        }
        Ok(())
    }
}

/// Response handler that appends every delivered result to a shared list.
pub(crate) fn recording_handler() -> (ResponseHandler, Arc<Mutex<Vec<ResultEnvelope>>>) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let seen = results.clone();
    let handler: ResponseHandler = Arc::new(move |result| {
        lock(&seen).push(result);
    });
    (handler, results)
}
