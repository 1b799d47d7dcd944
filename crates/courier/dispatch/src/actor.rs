use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use courier_types::CallEnvelope;

/// Exception callback registered by an actor, invoked with
/// `(method, envelope, error)` when one of its methods fails.
#[derive(Clone)]
pub enum ExceptionCallback {
    /// Dispatch back into the actor by callback name, so the callback runs
    /// with access to actor state.
    ByName(String),
    ByClosure(Arc<dyn Fn(&str, &CallEnvelope, &anyhow::Error) + Send + Sync>),
}

impl fmt::Debug for ExceptionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName(name) => f.debug_tuple("ByName").field(name).finish(),
            Self::ByClosure(_) => f.write_str("ByClosure(..)"),
        }
    }
}

/// A handler for inbound calls under one route prefix.
pub trait Actor: Send + Sync {
    /// Route prefix served when registered without an explicit prefix.
    fn prefix(&self) -> &str;

    /// Method dispatched when the route has no method segment.
    fn default_method(&self) -> &str {
        "index"
    }

    /// Methods reachable through dispatch.
    fn exposed_methods(&self) -> Vec<&str>;

    /// Whether `method` may safely run more than once for the same logical
    /// call. Idempotent methods are exempt from duplicate suppression.
    fn idempotent(&self, _method: &str) -> bool {
        false
    }

    fn exception_callback(&self) -> Option<ExceptionCallback> {
        None
    }

    /// Invoke `method` with the call payload. The full envelope is available
    /// for methods that need the call context.
    fn invoke(&self, method: &str, payload: &Value, envelope: &CallEnvelope)
        -> anyhow::Result<Value>;

    /// Target of [`ExceptionCallback::ByName`]; the default does nothing.
    fn invoke_callback(
        &self,
        _name: &str,
        _method: &str,
        _envelope: &CallEnvelope,
        _error: &anyhow::Error,
    ) {
    }
}

/// Registry mapping route prefixes to actors.
#[derive(Default)]
pub struct ActorRegistry {
    actors: DashMap<String, Arc<dyn Actor>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor, optionally under a prefix other than its own.
    pub fn register(&self, actor: Arc<dyn Actor>, prefix: Option<&str>) {
        let prefix = prefix.unwrap_or_else(|| actor.prefix()).to_string();
        debug!(prefix = %prefix, "Actor registered");
        self.actors.insert(prefix, actor);
    }

    pub fn resolve(&self, prefix: &str) -> Option<Arc<dyn Actor>> {
        self.actors.get(prefix).map(|actor| actor.clone())
    }

    /// Registered route prefixes.
    pub fn prefixes(&self) -> Vec<String> {
        self.actors.iter().map(|entry| entry.key().clone()).collect()
    }
}
