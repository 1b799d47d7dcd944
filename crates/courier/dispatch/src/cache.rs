use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_types::{Clock, Token};

/// Retention window for remembered tokens.
const MAX_AGE_SECS: u64 = 12 * 60 * 60;

/// Size and age summary of the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub oldest_age: Option<u64>,
    pub youngest_age: Option<u64>,
}

#[derive(Default)]
struct CacheInner {
    stored_at: HashMap<String, u64>,
    order: VecDeque<String>,
}

/// Recently dispatched request tokens for one receiving agent, used to detect
/// duplicate delivery of non-idempotent calls.
pub struct DispatchedCache {
    identity: String,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
}

impl DispatchedCache {
    pub fn new(identity: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity: identity.into(),
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Identity of the agent this cache serves.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Remember `token`, first sweeping entries past the retention window.
    pub fn store(&self, token: &Token) {
        let now = self.clock.now_secs();
        let mut inner = self.lock();
        loop {
            let expired = match inner.order.front() {
                Some(front) => inner
                    .stored_at
                    .get(front)
                    .map_or(true, |at| now.saturating_sub(*at) > MAX_AGE_SECS),
                None => break,
            };
            if !expired {
                break;
            }
            if let Some(front) = inner.order.pop_front() {
                inner.stored_at.remove(&front);
            }
        }
        if inner.stored_at.insert(token.0.clone(), now).is_none() {
            inner.order.push_back(token.0.clone());
        }
    }

    /// Whether `token` was dispatched within the retention window.
    pub fn contains(&self, token: &Token) -> bool {
        let now = self.clock.now_secs();
        self.lock()
            .stored_at
            .get(&token.0)
            .is_some_and(|at| now.saturating_sub(*at) <= MAX_AGE_SECS)
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_secs();
        let inner = self.lock();
        let ages = inner
            .stored_at
            .values()
            .map(|at| now.saturating_sub(*at));
        CacheStats {
            size: inner.stored_at.len(),
            oldest_age: ages.clone().max(),
            youngest_age: ages.min(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
