use std::sync::{Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use courier_types::{CallEnvelope, Push};

use crate::broker::BrokerId;
use crate::error::SendError;
use crate::lock;
use crate::pending::{PendingRequest, RequestKind, ResponseHandler};
use crate::sender::Sender;

/// Route of the health-check ping answered by the routing peer.
pub const PING_ROUTE: &str = "/mapper/ping";
/// Time allowed for a ping response before a timeout is counted.
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
/// Consecutive ping timeouts per broker before reconnect escalation.
pub const MAX_PING_TIMEOUTS: u32 = 3;
/// Minimum spacing between inactivity-timer restarts, so high message rates
/// do not thrash the timer.
const MIN_RESTART_INTERVAL: Duration = Duration::from_secs(60);

struct Probe {
    ids: Vec<BrokerId>,
    timer: JoinHandle<()>,
}

/// Periodic health prober that pings the routing peer across broker
/// connections and escalates to reconnection after repeated timeouts.
///
/// The probe rides the normal send path: a one-way ping registers a pending
/// entry whose response handler cancels the probe timer, so a reply arriving
/// through [`Sender::handle_response`] counts as connectivity.
pub struct ConnectivityChecker {
    sender: Weak<Sender>,
    ping_interval: Duration,
    probe: Mutex<Option<Probe>>,
    timeouts: DashMap<BrokerId, u32>,
    inactivity_timer: Mutex<Option<JoinHandle<()>>>,
    last_restart: Mutex<Option<Instant>>,
}

impl ConnectivityChecker {
    pub(crate) fn new(sender: Weak<Sender>, ping_interval: Duration) -> Self {
        Self {
            sender,
            ping_interval,
            probe: Mutex::new(None),
            timeouts: DashMap::new(),
            inactivity_timer: Mutex::new(None),
            last_restart: Mutex::new(None),
        }
    }

    /// Arm the inactivity timer; no-op when probing is disabled.
    pub(crate) fn start(&self) {
        if self.ping_interval.is_zero() {
            return;
        }
        *lock(&self.last_restart) = Some(Instant::now());
        self.restart_inactivity_timer();
    }

    /// Note inbound traffic. Restarts the inactivity timer when enough time
    /// has passed since the last restart; no-op if probing is disabled.
    pub fn message_received(&self) {
        if self.ping_interval.is_zero() {
            return;
        }
        {
            let mut last = lock(&self.last_restart);
            if let Some(at) = *last {
                if at.elapsed() < MIN_RESTART_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        self.restart_inactivity_timer();
    }

    fn restart_inactivity_timer(&self) {
        let weak = self.sender.clone();
        let interval = self.ping_interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(sender) = weak.upgrade() else {
                return;
            };
            if sender.is_terminating() {
                return;
            }
            if let Err(err) = sender.connectivity_checker().check(None).await {
                error!(error = %err, "Failed connectivity check");
            }
        });
        if let Some(old) = lock(&self.inactivity_timer).replace(handle) {
            old.abort();
        }
    }

    /// Probe connectivity across `broker_ids`, or all known connections when
    /// `None`. No-op while a probe is already in flight, while terminating,
    /// and for connections that report not connected.
    pub async fn check(&self, broker_ids: Option<Vec<BrokerId>>) -> Result<(), SendError> {
        let Some(sender) = self.sender.upgrade() else {
            return Ok(());
        };
        if sender.is_terminating() {
            return Ok(());
        }
        if lock(&self.probe).is_some() {
            return Ok(());
        }

        let candidates = broker_ids.unwrap_or_else(|| sender.broker_client().all());
        let ids: Vec<BrokerId> = candidates
            .into_iter()
            .filter(|id| sender.broker_client().connected(id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let mut ping = Push::new(PING_ROUTE, serde_json::Value::Null, sender.identity());
        ping.confirm = true;
        let token = ping.token.clone();
        let weak = self.sender.clone();
        let handler: ResponseHandler = std::sync::Arc::new(move |_result| {
            if let Some(sender) = weak.upgrade() {
                sender.connectivity_checker().ping_success();
            }
        });
        sender.pending_requests().insert(
            token.clone(),
            PendingRequest::new(RequestKind::OneWay, sender.now_secs(), Some(handler)),
        );
        debug!(token = %token, brokers = ids.len(), "Checking connectivity");

        let published = sender
            .publish(&CallEnvelope::Push(ping), Some(ids))
            .await?;

        let weak = self.sender.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(PING_TIMEOUT).await;
            let Some(sender) = weak.upgrade() else {
                return;
            };
            sender.connectivity_checker().handle_ping_timeout().await;
        });
        *lock(&self.probe) = Some(Probe {
            ids: published,
            timer,
        });
        Ok(())
    }

    /// Whether a probe is currently in flight.
    pub fn probing(&self) -> bool {
        lock(&self.probe).is_some()
    }

    fn ping_success(&self) {
        if let Some(probe) = lock(&self.probe).take() {
            probe.timer.abort();
            for id in &probe.ids {
                self.timeouts.remove(id);
            }
            debug!("Ping response received");
        }
    }

    async fn handle_ping_timeout(&self) {
        let Some(probe) = lock(&self.probe).take() else {
            return;
        };
        // A ping that never went out carries no connectivity signal.
        if probe.ids.is_empty() {
            return;
        }
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        for id in probe.ids {
            let count = {
                let mut count = self.timeouts.entry(id.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if count < MAX_PING_TIMEOUTS {
                warn!(
                    broker_id = %id,
                    "Ping via broker {} timed out after {} seconds",
                    id,
                    PING_TIMEOUT.as_secs()
                );
                continue;
            }
            error!(
                broker_id = %id,
                "Ping via broker {} reached maximum of {} timeouts, attempting to reconnect",
                id,
                MAX_PING_TIMEOUTS
            );
            self.timeouts.remove(&id);
            match sender.broker_client().identity_parts(&id) {
                Some(address) => {
                    if let Err(err) = sender.agent().connect(&address, true).await {
                        error!(broker_id = %id, error = %err, "Failed to reconnect");
                    }
                }
                None => error!(broker_id = %id, "Failed to reconnect: unknown broker identity"),
            }
        }
    }

    /// Stop all timers; later fires become no-ops.
    pub(crate) fn terminate(&self) {
        if let Some(handle) = lock(&self.inactivity_timer).take() {
            handle.abort();
        }
        if let Some(probe) = lock(&self.probe).take() {
            probe.timer.abort();
        }
    }
}
