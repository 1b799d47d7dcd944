use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delivery configuration, mirroring the agent's options map.
///
/// Zero durations disable the corresponding mechanism; retrying requires both
/// `retry_timeout` and `retry_interval`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Inactivity interval between connectivity probes; zero disables probing.
    pub ping_interval: Duration,

    /// Time-to-live applied to retryable requests; zero disables expiry.
    pub time_to_live: Duration,

    /// Total time budget for retrying one request.
    pub retry_timeout: Option<Duration>,

    /// Initial spacing between retries; doubles each cycle.
    pub retry_interval: Option<Duration>,

    /// Buffer outbound sends while no broker is reachable.
    pub offline_queueing: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::ZERO,
            time_to_live: Duration::ZERO,
            retry_timeout: None,
            retry_interval: None,
            offline_queueing: false,
        }
    }
}
