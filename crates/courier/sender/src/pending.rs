use std::fmt;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use courier_types::{Clock, ResultEnvelope, Token};

use crate::lock;

/// Callback invoked with the correlated result of a call.
pub type ResponseHandler = Arc<dyn Fn(ResultEnvelope) + Send + Sync>;

/// Classification of a pending entry for age statistics and reply policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    OneWay,
    TwoWay,
}

/// In-flight call metadata awaiting a correlated reply.
#[derive(Clone)]
pub struct PendingRequest {
    pub kind: RequestKind,
    /// Epoch seconds when the call was accepted for sending.
    pub receive_time: u64,
    pub response_handler: Option<ResponseHandler>,
    /// Token of the original attempt when this entry tracks a retry.
    pub retry_parent: Option<Token>,
}

impl PendingRequest {
    pub fn new(kind: RequestKind, receive_time: u64, response_handler: Option<ResponseHandler>) -> Self {
        Self {
            kind,
            receive_time,
            response_handler,
            retry_parent: None,
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("kind", &self.kind)
            .field("receive_time", &self.receive_time)
            .field("has_handler", &self.response_handler.is_some())
            .field("retry_parent", &self.retry_parent)
            .finish()
    }
}

/// One-way entries older than this are swept; replies to them are no longer
/// deliverable.
const MAX_PUSH_AGE_SECS: u64 = 2 * 60;
/// Minimum spacing between sweeps.
const MIN_CLEANUP_INTERVAL_SECS: u64 = 2 * 60;

/// Table of in-flight calls keyed by token.
///
/// Two-way entries are removed when their reply is delivered, together with
/// every entry whose `retry_parent` chains to the same original attempt.
/// One-way entries survive replies (acknowledgments may keep arriving) and
/// are bounded by an age-based sweep instead.
pub struct PendingRequests {
    clock: Arc<dyn Clock>,
    map: DashMap<Token, PendingRequest>,
    last_cleanup: Mutex<u64>,
}

impl PendingRequests {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let last_cleanup = Mutex::new(clock.now_secs());
        Self {
            clock,
            map: DashMap::new(),
            last_cleanup,
        }
    }

    /// Insert an entry, sweeping stale one-way entries first.
    pub fn insert(&self, token: Token, request: PendingRequest) {
        self.sweep_stale();
        self.map.insert(token, request);
    }

    fn sweep_stale(&self) {
        let now = self.clock.now_secs();
        {
            let mut last = lock(&self.last_cleanup);
            if now.saturating_sub(*last) < MIN_CLEANUP_INTERVAL_SECS {
                return;
            }
            *last = now;
        }
        self.map.retain(|_, request| {
            request.kind != RequestKind::OneWay
                || now.saturating_sub(request.receive_time) <= MAX_PUSH_AGE_SECS
        });
    }

    pub fn get(&self, token: &Token) -> Option<PendingRequest> {
        self.map.get(token).map(|entry| entry.clone())
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.map.contains_key(token)
    }

    pub fn remove(&self, token: &Token) -> Option<PendingRequest> {
        self.map.remove(token).map(|(_, request)| request)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Register a retry attempt sharing the original entry's handler.
    pub fn register_retry(&self, parent: &Token, token: Token) {
        if let Some(mut entry) = self.get(parent) {
            entry.retry_parent = Some(parent.clone());
            self.map.insert(token, entry);
        }
    }

    /// Remove the entry for `token` together with every entry in its retry
    /// family: the shared original attempt and all retries chained to it.
    pub fn remove_family(&self, token: &Token) {
        let root = match self.get(token) {
            Some(entry) => entry.retry_parent.unwrap_or_else(|| token.clone()),
            None => return,
        };
        self.map
            .retain(|key, entry| key != &root && entry.retry_parent.as_ref() != Some(&root));
    }

    /// Age of the oldest entry of `kind` (all kinds when `None`).
    pub fn oldest_age(&self, kind: Option<RequestKind>) -> Option<u64> {
        self.ages(kind).max()
    }

    /// Age of the youngest entry of `kind` (all kinds when `None`).
    pub fn youngest_age(&self, kind: Option<RequestKind>) -> Option<u64> {
        self.ages(kind).min()
    }

    fn ages(&self, kind: Option<RequestKind>) -> impl Iterator<Item = u64> + '_ {
        let now = self.clock.now_secs();
        self.map
            .iter()
            .filter(move |entry| kind.map_or(true, |kind| entry.kind == kind))
            .map(move |entry| now.saturating_sub(entry.receive_time))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Diagnostic dump of pending entries, oldest first.
    pub fn dump(&self) -> Vec<String> {
        let mut entries: Vec<(u64, Token)> = self
            .map
            .iter()
            .map(|entry| (entry.value().receive_time, entry.key().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));
        entries
            .into_iter()
            .map(|(received, token)| format!("{} <{}>", format_secs(received), token))
            .collect()
    }
}

fn format_secs(secs: u64) -> String {
    match chrono::DateTime::from_timestamp(secs as i64, 0) {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => secs.to_string(),
    }
}
