use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use courier_types::{
    CallEnvelope, Clock, NonDeliveryReason, OperationResult, Push, Request, ResultEnvelope,
    SystemClock, TargetSpec, Token,
};

use crate::broker::{
    Agent, BrokerClient, BrokerError, BrokerId, DeliveryOptions, PublishOptions,
};
use crate::config::SenderConfig;
use crate::connectivity::ConnectivityChecker;
use crate::error::SendError;
use crate::offline::{OfflineHandler, QueuedKind, QueuedRequest, RestartVoteCallback};
use crate::pending::{PendingRequest, PendingRequests, RequestKind, ResponseHandler};
use crate::stats::NonDeliveryStats;

/// Outcome of a send operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Published immediately under this token.
    Published(Token),
    /// Buffered by the offline handler for later replay.
    Queued,
}

impl SendOutcome {
    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::Published(token) => Some(token),
            Self::Queued => None,
        }
    }
}

/// Outward-facing delivery façade: builds call envelopes, validates
/// addressing, publishes through the broker, tracks pending replies, drives
/// timer-based retries, and demultiplexes responses back to their callers.
///
/// One long-lived instance per agent process, constructed once at startup and
/// passed by reference to every call site.
pub struct Sender {
    identity: String,
    config: SenderConfig,
    agent: Arc<dyn Agent>,
    broker: Arc<dyn BrokerClient>,
    clock: Arc<dyn Clock>,
    pending: PendingRequests,
    connectivity: ConnectivityChecker,
    offline: OfflineHandler,
    non_delivery: NonDeliveryStats,
    terminating: AtomicBool,
}

impl Sender {
    pub fn new(
        agent: Arc<dyn Agent>,
        broker: Arc<dyn BrokerClient>,
        config: SenderConfig,
    ) -> Arc<Self> {
        Self::with_clock(agent, broker, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        agent: Arc<dyn Agent>,
        broker: Arc<dyn BrokerClient>,
        config: SenderConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let ping_interval = config.ping_interval;
        let offline_queueing = config.offline_queueing;
        let sender = Arc::new_cyclic(|weak: &Weak<Sender>| Sender {
            identity: agent.identity(),
            pending: PendingRequests::new(clock.clone()),
            connectivity: ConnectivityChecker::new(weak.clone(), ping_interval),
            offline: OfflineHandler::new(weak.clone(), offline_queueing),
            non_delivery: NonDeliveryStats::default(),
            terminating: AtomicBool::new(false),
            agent,
            broker,
            config,
            clock,
        });
        sender.connectivity.start();
        sender
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn connectivity_checker(&self) -> &ConnectivityChecker {
        &self.connectivity
    }

    pub fn offline_handler(&self) -> &OfflineHandler {
        &self.offline
    }

    pub fn non_delivery_stats(&self) -> &NonDeliveryStats {
        &self.non_delivery
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub(crate) fn broker_client(&self) -> &dyn BrokerClient {
        self.broker.as_ref()
    }

    pub(crate) fn agent(&self) -> &dyn Agent {
        self.agent.as_ref()
    }

    pub(crate) fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Send a one-way call: fire-and-forget, `expires_at` disabled. With a
    /// response handler an eventual acknowledgment becomes deliverable, but
    /// no delivery is guaranteed and no failure is ever reported back.
    pub async fn send_push(
        self: &Arc<Self>,
        route: &str,
        payload: Value,
        target: Option<Value>,
        handler: Option<ResponseHandler>,
    ) -> Result<SendOutcome, SendError> {
        self.build_and_send(QueuedKind::Push { persistent: false }, route, payload, target, handler)
            .await
    }

    /// One-way call the broker retains across restarts.
    pub async fn send_persistent_push(
        self: &Arc<Self>,
        route: &str,
        payload: Value,
        target: Option<Value>,
        handler: Option<ResponseHandler>,
    ) -> Result<SendOutcome, SendError> {
        self.build_and_send(QueuedKind::Push { persistent: true }, route, payload, target, handler)
            .await
    }

    /// Two-way call retried until answered, timed out, or expired. Requires
    /// a response handler; fan-out selectors are rejected because exactly one
    /// respondent must answer.
    pub async fn send_retryable_request(
        self: &Arc<Self>,
        route: &str,
        payload: Value,
        target: Option<Value>,
        handler: Option<ResponseHandler>,
    ) -> Result<SendOutcome, SendError> {
        self.build_and_send(
            QueuedKind::Request { persistent: false },
            route,
            payload,
            target,
            handler,
        )
        .await
    }

    /// Two-way call whose delivery the broker guarantees across restarts.
    /// Persistence is the broker's job, so no retry loop is scheduled and no
    /// expiry is stamped.
    pub async fn send_persistent_request(
        self: &Arc<Self>,
        route: &str,
        payload: Value,
        target: Option<Value>,
        handler: Option<ResponseHandler>,
    ) -> Result<SendOutcome, SendError> {
        self.build_and_send(
            QueuedKind::Request { persistent: true },
            route,
            payload,
            target,
            handler,
        )
        .await
    }

    async fn build_and_send(
        self: &Arc<Self>,
        kind: QueuedKind,
        route: &str,
        payload: Value,
        target: Option<Value>,
        handler: Option<ResponseHandler>,
    ) -> Result<SendOutcome, SendError> {
        let one_way = kind.is_one_way();
        if !one_way && handler.is_none() {
            return Err(SendError::MissingResponseHandler);
        }
        let spec = TargetSpec::from_value(target.as_ref(), one_way)?;

        if self.offline.queueing() {
            self.offline.queue_request(QueuedRequest {
                kind,
                route: route.to_string(),
                payload,
                target,
                handler,
            });
            return Ok(SendOutcome::Queued);
        }

        let envelope = self.build_envelope(kind, route, payload, &spec, handler.is_some());
        let token = envelope.token().clone();
        if let Some(handler) = handler.clone() {
            let request_kind = if one_way {
                RequestKind::OneWay
            } else {
                RequestKind::TwoWay
            };
            self.pending.insert(
                token.clone(),
                PendingRequest::new(request_kind, self.clock.now_secs(), Some(handler)),
            );
        }

        match self.publish(&envelope, None).await {
            Ok(broker_ids) => {
                if let (QueuedKind::Request { persistent: false }, Some(timeout), Some(interval)) =
                    (kind, self.config.retry_timeout, self.config.retry_interval)
                {
                    if let CallEnvelope::Request(request) = envelope {
                        self.spawn_retry(request, token.clone(), timeout, interval, broker_ids);
                    }
                }
                Ok(SendOutcome::Published(token))
            }
            Err(SendError::TemporarilyOffline(_)) if self.config.offline_queueing => {
                // Hand the call to the offline handler instead of failing;
                // the pending entry is re-registered when it replays.
                self.pending.remove(&token);
                self.offline.enable_offline_mode();
                self.offline.queue_request(QueuedRequest {
                    kind,
                    route: route.to_string(),
                    payload: envelope.payload().clone(),
                    target,
                    handler,
                });
                Ok(SendOutcome::Queued)
            }
            Err(err) => {
                self.pending.remove(&token);
                Err(err)
            }
        }
    }

    fn build_envelope(
        &self,
        kind: QueuedKind,
        route: &str,
        payload: Value,
        spec: &TargetSpec,
        confirm: bool,
    ) -> CallEnvelope {
        let mut envelope = match kind {
            QueuedKind::Push { persistent } => {
                let mut push = Push::new(route, payload, self.identity.clone());
                push.persistent = persistent;
                push.confirm = confirm;
                CallEnvelope::Push(push)
            }
            QueuedKind::Request { persistent } => {
                let mut request = Request::new(route, payload, self.identity.clone());
                request.persistent = persistent;
                request.confirm = confirm;
                if !persistent && !self.config.time_to_live.is_zero() {
                    request.expires_at =
                        self.clock.now_secs() + self.config.time_to_live.as_secs();
                }
                CallEnvelope::Request(request)
            }
        };
        envelope.set_addressing(spec);
        envelope
    }

    /// Publish an envelope, returning the broker connections used.
    pub(crate) async fn publish(
        &self,
        envelope: &CallEnvelope,
        broker_ids: Option<Vec<BrokerId>>,
    ) -> Result<Vec<BrokerId>, SendError> {
        let options = PublishOptions::request();
        let delivery = DeliveryOptions {
            persistent: envelope.persistent(),
            mandatory: true,
            brokers: broker_ids,
        };
        match self.broker.publish(&options, envelope, &delivery).await {
            Ok(ids) => Ok(ids),
            Err(BrokerError::NoConnectedBrokers) => {
                error!(
                    token = %envelope.token(),
                    "Failed to publish request {}: no connected brokers",
                    envelope.route()
                );
                Err(SendError::TemporarilyOffline(format!(
                    "lost connectivity sending {}",
                    envelope.route()
                )))
            }
            Err(err) => {
                error!(
                    token = %envelope.token(),
                    error = %err,
                    "Failed to publish request {}",
                    envelope.route()
                );
                Err(SendError::SendFailure(err.to_string()))
            }
        }
    }

    /// Replay a queued request through the normal send path; the envelope is
    /// rebuilt with a fresh token.
    pub(crate) async fn resend(
        self: &Arc<Self>,
        request: QueuedRequest,
    ) -> Result<SendOutcome, SendError> {
        let QueuedRequest {
            kind,
            route,
            payload,
            target,
            handler,
        } = request;
        self.build_and_send(kind, &route, payload, target, handler).await
    }

    /// Drive the retry protocol for one retryable request: probe
    /// connectivity, re-publish under a fresh token with the original
    /// `expires_at`, back off by doubling, and resolve the caller with a
    /// non-delivery result when the time budget runs out.
    fn spawn_retry(
        self: &Arc<Self>,
        mut request: Request,
        parent: Token,
        retry_timeout: Duration,
        retry_interval: Duration,
        broker_ids: Vec<BrokerId>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = retry_interval;
            let mut elapsed = Duration::ZERO;
            let mut attempt = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                let Some(sender) = weak.upgrade() else {
                    return;
                };
                if sender.is_terminating() {
                    return;
                }
                // A delivered reply removes the whole retry family, which
                // implicitly cancels this loop.
                if !sender.pending.contains(&parent) {
                    return;
                }
                attempt += 1;
                elapsed += interval;
                let ttl_live = request.expires_at == 0
                    || sender.clock.now_secs() < request.expires_at;
                if elapsed >= retry_timeout || !ttl_live {
                    warn!(
                        token = %request.token,
                        "RE-SEND TIMEOUT after {:.1} seconds for {}",
                        elapsed.as_secs_f64(),
                        request.route
                    );
                    let result = ResultEnvelope::new(
                        request.token.clone(),
                        sender.identity.clone(),
                        request.from.clone(),
                        OperationResult::non_delivery(NonDeliveryReason::RetryTimeout),
                    );
                    sender.handle_response(result);
                    return;
                }

                let prior = std::mem::replace(&mut request.token, Token::generate());
                request.tries.push(prior);
                sender.pending.register_retry(&parent, request.token.clone());

                if attempt == 1 {
                    // Distinguish "broker reachable but peer silent" from
                    // "broker unreachable" before the first re-publish.
                    if let Err(err) = sender.connectivity.check(Some(broker_ids.clone())).await {
                        error!(
                            token = %request.token,
                            error = %err,
                            "Failed retry for {} without responding",
                            request.route
                        );
                        return;
                    }
                }

                match sender
                    .publish(&CallEnvelope::Request(request.clone()), Some(broker_ids.clone()))
                    .await
                {
                    Ok(_) => {}
                    Err(SendError::TemporarilyOffline(_)) => {
                        error!(
                            token = %request.token,
                            "Failed retry for {} because temporarily offline",
                            request.route
                        );
                        let result = ResultEnvelope::new(
                            request.token.clone(),
                            sender.identity.clone(),
                            request.from.clone(),
                            OperationResult::retry("lost connectivity"),
                        );
                        sender.handle_response(result);
                        return;
                    }
                    Err(err) => {
                        error!(
                            token = %request.token,
                            error = %err,
                            "Failed retry for {} because of send failure",
                            request.route
                        );
                        let result = ResultEnvelope::new(
                            request.token.clone(),
                            sender.identity.clone(),
                            request.from.clone(),
                            OperationResult::non_delivery(NonDeliveryReason::RetryFailed),
                        );
                        sender.handle_response(result);
                        return;
                    }
                }
                interval *= 2;
            }
        });
    }

    /// Correlate a reply to its pending call and deliver it.
    ///
    /// Two-way entries are removed together with their retry family; one-way
    /// entries survive so later acknowledgments to the same token remain
    /// deliverable. Non-delivery reasons consumed by the retry protocol are
    /// counted but not surfaced to the caller's handler.
    pub fn handle_response(&self, response: ResultEnvelope) {
        if let OperationResult::NonDelivery(reason) = &response.result {
            self.non_delivery.record(*reason);
        }
        let Some(entry) = self.pending.get(&response.token) else {
            match &response.result {
                OperationResult::NonDelivery(reason) => {
                    info!(token = %response.token, reason = %reason, "Non-delivery of request")
                }
                _ => debug!(token = %response.token, "No pending request for response"),
            }
            return;
        };

        if entry.kind == RequestKind::TwoWay {
            if let OperationResult::NonDelivery(reason) = &response.result {
                if matches!(
                    reason,
                    NonDeliveryReason::TargetNotConnected | NonDeliveryReason::TtlExpiration
                ) {
                    // Consumed by the retry protocol; the entry stays so a
                    // later attempt can still resolve the call.
                    debug!(token = %response.token, reason = %reason, "Non-delivery retained for retry");
                    return;
                }
            }
            self.pending.remove_family(&response.token);
        }

        match &entry.response_handler {
            Some(handler) => handler(response),
            None => {
                if let OperationResult::NonDelivery(reason) = &response.result {
                    info!(token = %response.token, reason = %reason, "Non-delivery of request");
                }
            }
        }
    }

    /// Note inbound broker traffic for the connectivity checker.
    pub fn message_received(&self) {
        self.connectivity.message_received();
    }

    pub fn initialize_offline_queue(&self) {
        if self.config.offline_queueing {
            self.offline.initialize();
        }
    }

    pub fn start_offline_queue(&self) {
        if self.config.offline_queueing {
            self.offline.start();
        }
    }

    pub fn enable_offline_mode(&self) {
        self.offline.enable_offline_mode();
    }

    pub fn disable_offline_mode(&self) {
        self.offline.disable_offline_mode();
    }

    /// Register the restart-vote signal raised by the offline handler.
    pub fn on_restart_vote(&self, callback: RestartVoteCallback) {
        self.offline.on_restart_vote(callback);
    }

    /// Diagnostic dump of pending requests, oldest first.
    pub fn dump_requests(&self) -> Vec<String> {
        self.pending.dump()
    }

    /// Stop connectivity checking and offline timers; any timer fire after
    /// this is a no-op. Returns the number of requests still pending and the
    /// age of the oldest one.
    pub fn terminate(&self) -> (usize, Option<u64>) {
        self.terminating.store(true, Ordering::SeqCst);
        self.connectivity.terminate();
        self.offline.terminate();
        (self.pending.len(), self.pending.oldest_age(None))
    }
}
