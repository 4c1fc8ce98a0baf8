//! Coordination worker and garbage collection tuning.

use std::time::Duration;

use serde::Deserialize;

/// Tuning for the barrier worker and the subscription multiplexer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often pending barriers poll their counters.
    pub barrier_poll_interval_ms: u64,
    /// How often the coordinator re-issues an unblock while interrupting.
    pub interrupt_retry_interval_ms: u64,
    /// Maximum entries read per topic in one blocking read.
    pub read_batch_size: usize,
    /// Capacity of each subscriber's delivery channel.
    pub subscription_buffer: usize,
    /// First delay before re-opening a failed reader connection.
    pub reconnect_min_delay_ms: u64,
    /// Cap on the delay between reader reconnection attempts.
    pub reconnect_max_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            barrier_poll_interval_ms: 1000,
            interrupt_retry_interval_ms: 500,
            read_batch_size: 10,
            subscription_buffer: 64,
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 3000,
        }
    }
}

impl SyncConfig {
    /// Short intervals so tests don't wait on production polling cadence.
    pub fn for_test() -> Self {
        Self {
            barrier_poll_interval_ms: 20,
            interrupt_retry_interval_ms: 10,
            reconnect_min_delay_ms: 5,
            reconnect_max_delay_ms: 50,
            ..Self::default()
        }
    }

    pub fn barrier_poll_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_poll_interval_ms.max(1))
    }

    pub fn interrupt_retry_interval(&self) -> Duration {
        Duration::from_millis(self.interrupt_retry_interval_ms.max(1))
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_min_delay_ms))
    }
}

/// Background collection of idle coordination keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Start the collector alongside the service.
    pub enabled: bool,
    /// How often a collection round runs.
    pub frequency_secs: u64,
    /// Keys idle for at least this long are deleted.
    pub last_access_threshold_secs: u64,
    /// Keys requested per SCAN page.
    pub scan_count: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency_secs: 1800,
            last_access_threshold_secs: 1800,
            scan_count: 50,
        }
    }
}

impl GcConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency_secs.max(1))
    }

    pub fn last_access_threshold(&self) -> Duration {
        Duration::from_secs(self.last_access_threshold_secs)
    }
}
