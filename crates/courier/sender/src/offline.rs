use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lock;
use crate::pending::ResponseHandler;
use crate::sender::Sender;

/// Queue length at which a restart vote is cast (and again at every further
/// multiple).
pub const MAX_QUEUED_REQUESTS: usize = 100;
/// Pacing cap between re-sent queued requests during a flush, so draining
/// does not burst.
pub const MAX_QUEUE_FLUSH_DELAY: Duration = Duration::from_secs(2);
/// Time spent in offline or initializing mode before a restart vote is cast.
pub const RESTART_VOTE_DELAY: Duration = Duration::from_secs(15 * 60);

/// Lifecycle phase of the offline handler itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfflineState {
    Created,
    Initializing,
    Running,
    Flushing,
}

/// Broker reachability as seen by the handler. Tracked independently of the
/// lifecycle phase: mode follows connectivity, state follows startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfflineMode {
    Offline,
    Initializing,
    Online,
}

/// Which send operation a queued request replays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuedKind {
    Push { persistent: bool },
    Request { persistent: bool },
}

impl QueuedKind {
    pub fn is_one_way(&self) -> bool {
        matches!(self, Self::Push { .. })
    }

    pub fn persistent(&self) -> bool {
        match self {
            Self::Push { persistent } | Self::Request { persistent } => *persistent,
        }
    }
}

/// A send deferred while no broker was reachable. The envelope is rebuilt
/// with a fresh token when the request is finally replayed.
#[derive(Clone)]
pub struct QueuedRequest {
    pub kind: QueuedKind,
    pub route: String,
    pub payload: Value,
    pub target: Option<Value>,
    pub handler: Option<ResponseHandler>,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("kind", &self.kind)
            .field("route", &self.route)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

pub type RestartVoteCallback = Arc<dyn Fn() + Send + Sync>;

struct OfflineInner {
    state: OfflineState,
    mode: OfflineMode,
    /// Offline mode was requested explicitly, not inferred from startup.
    offline_requested: bool,
    queue: VecDeque<QueuedRequest>,
    vote_timer: Option<JoinHandle<()>>,
    flush_task: Option<JoinHandle<()>>,
}

/// Buffers outbound sends while no broker is reachable and replays them,
/// paced, once connectivity returns.
///
/// Votes to restart the surrounding process when the backlog or the offline
/// period grows past its bounds; the vote is a signal only, nothing is
/// restarted here.
pub struct OfflineHandler {
    sender: Weak<Sender>,
    enabled: bool,
    inner: Mutex<OfflineInner>,
    restart_votes: AtomicU32,
    vote_callback: Mutex<Option<RestartVoteCallback>>,
}

impl OfflineHandler {
    pub(crate) fn new(sender: Weak<Sender>, enabled: bool) -> Self {
        Self {
            sender,
            enabled,
            inner: Mutex::new(OfflineInner {
                state: OfflineState::Created,
                mode: if enabled {
                    OfflineMode::Offline
                } else {
                    OfflineMode::Online
                },
                offline_requested: false,
                queue: VecDeque::new(),
                vote_timer: None,
                flush_task: None,
            }),
            restart_votes: AtomicU32::new(0),
            vote_callback: Mutex::new(None),
        }
    }

    pub fn state(&self) -> OfflineState {
        lock(&self.inner).state
    }

    pub fn mode(&self) -> OfflineMode {
        lock(&self.inner).mode
    }

    pub fn offline(&self) -> bool {
        self.mode() == OfflineMode::Offline
    }

    /// Whether new sends should queue rather than publish. During a flush the
    /// send path publishes directly even though mode is still offline.
    pub fn queueing(&self) -> bool {
        let inner = lock(&self.inner);
        inner.mode == OfflineMode::Offline && inner.state != OfflineState::Flushing
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    pub fn restart_votes(&self) -> u32 {
        self.restart_votes.load(Ordering::SeqCst)
    }

    /// Register the restart-vote signal consumed by the surrounding process.
    pub fn on_restart_vote(&self, callback: RestartVoteCallback) {
        *lock(&self.vote_callback) = Some(callback);
    }

    /// Begin initialization. Sends queued from here until startup completes
    /// go to the queue front: they represent calls that must be retried first
    /// once online, ahead of backlog accumulated before restart.
    pub fn initialize(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != OfflineState::Created {
            return;
        }
        inner.state = OfflineState::Initializing;
        if !inner.offline_requested {
            inner.mode = OfflineMode::Initializing;
        }
    }

    /// Finish startup; drains any backlog unless offline mode is in force.
    pub fn start(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != OfflineState::Initializing {
            return;
        }
        if inner.mode == OfflineMode::Offline {
            inner.state = OfflineState::Running;
        } else {
            self.spawn_flush(&mut inner);
        }
    }

    pub fn enable_offline_mode(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = lock(&self.inner);
        inner.offline_requested = true;
        if inner.mode == OfflineMode::Offline {
            if inner.state == OfflineState::Flushing {
                info!("Aborting offline queue flush");
                if let Some(task) = inner.flush_task.take() {
                    task.abort();
                }
                inner.state = OfflineState::Running;
            }
        } else {
            info!("Disconnected from broker, entering offline mode");
            inner.mode = OfflineMode::Offline;
            self.arm_vote_timer(&mut inner);
        }
    }

    pub fn disable_offline_mode(&self) {
        let mut inner = lock(&self.inner);
        inner.offline_requested = false;
        if inner.mode != OfflineMode::Offline {
            return;
        }
        info!(queued = inner.queue.len(), "Connection to broker re-established");
        match inner.state {
            OfflineState::Running | OfflineState::Initializing => self.spawn_flush(&mut inner),
            OfflineState::Created => {
                inner.mode = OfflineMode::Online;
                if let Some(timer) = inner.vote_timer.take() {
                    timer.abort();
                }
            }
            OfflineState::Flushing => {}
        }
    }

    /// Queue one request, dropping the oldest entry once the queue is full.
    pub(crate) fn queue_request(&self, request: QueuedRequest) {
        let vote_due = {
            let mut inner = lock(&self.inner);
            if inner.state == OfflineState::Initializing {
                inner.queue.push_front(request);
            } else {
                inner.queue.push_back(request);
            }
            if inner.vote_timer.is_none() && inner.mode != OfflineMode::Online {
                self.arm_vote_timer(&mut inner);
            }
            let vote_due = inner.queue.len() == MAX_QUEUED_REQUESTS;
            if inner.queue.len() > MAX_QUEUED_REQUESTS {
                if let Some(dropped) = inner.queue.pop_front() {
                    warn!(route = %dropped.route, "Offline queue full, dropping oldest request");
                }
            }
            vote_due
        };
        if vote_due {
            self.vote_to_restart();
        }
    }

    fn vote_to_restart(&self) {
        let votes = self.restart_votes.fetch_add(1, Ordering::SeqCst) + 1;
        info!(votes, "Voting to restart agent");
        let callback = lock(&self.vote_callback).clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn arm_vote_timer(&self, inner: &mut OfflineInner) {
        let weak = self.sender.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RESTART_VOTE_DELAY).await;
                let Some(sender) = weak.upgrade() else {
                    return;
                };
                if sender.is_terminating() {
                    return;
                }
                let offline = sender.offline_handler();
                if offline.mode() == OfflineMode::Online {
                    return;
                }
                offline.vote_to_restart();
            }
        });
        if let Some(old) = inner.vote_timer.replace(handle) {
            old.abort();
        }
    }

    fn spawn_flush(&self, inner: &mut OfflineInner) {
        inner.state = OfflineState::Flushing;
        let weak = self.sender.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(sender) = weak.upgrade() else {
                    return;
                };
                if sender.is_terminating() {
                    return;
                }
                let offline = sender.offline_handler();
                let item = {
                    let mut inner = lock(&offline.inner);
                    if inner.state != OfflineState::Flushing {
                        return;
                    }
                    match inner.queue.pop_front() {
                        Some(item) => item,
                        None => {
                            inner.state = OfflineState::Running;
                            inner.mode = OfflineMode::Online;
                            if let Some(timer) = inner.vote_timer.take() {
                                timer.abort();
                            }
                            offline.restart_votes.store(0, Ordering::SeqCst);
                            info!("Offline queue flushed");
                            return;
                        }
                    }
                };
                if let Err(err) = sender.resend(item).await {
                    error!(error = %err, "Failed to flush queued request");
                }
                tokio::time::sleep(MAX_QUEUE_FLUSH_DELAY).await;
            }
        });
        if let Some(old) = inner.flush_task.replace(handle) {
            old.abort();
        }
    }

    /// Stop vote and flush timers; queued requests stay buffered.
    pub(crate) fn terminate(&self) {
        let mut inner = lock(&self.inner);
        if let Some(timer) = inner.vote_timer.take() {
            timer.abort();
        }
        if let Some(task) = inner.flush_task.take() {
            task.abort();
        }
    }
}
