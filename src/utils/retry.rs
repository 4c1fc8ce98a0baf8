//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::config::SyncConfig;

/// Backoff for store connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Delays between attempts to re-open the subscription reader connection.
///
/// Bounded by the configured min and max; callers fall back to the max delay
/// once the iterator is exhausted.
pub fn reader_backoff(settings: &SyncConfig) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(settings.reconnect_min_delay())
        .with_max_delay(settings.reconnect_max_delay())
        .with_max_times(64)
        .build()
}
