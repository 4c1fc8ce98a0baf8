//! Garbage collection of idle topics and states.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Result, SyncError};
use crate::config::GcConfig;
use crate::store::LogStore;

/// Purges keys nobody has touched for longer than the configured threshold.
pub struct SyncGc {
    store: Arc<dyn LogStore>,
    threshold: Duration,
    frequency: Duration,
    scan_count: usize,
}

impl SyncGc {
    pub fn new(store: Arc<dyn LogStore>, config: &GcConfig) -> Self {
        Self {
            store,
            threshold: config.last_access_threshold(),
            frequency: config.frequency(),
            scan_count: config.scan_count,
        }
    }

    /// Run a single collection pass, returning the number of keys purged.
    pub async fn run_once(&self) -> Result<u64> {
        info!(threshold = ?self.threshold, "Running sync garbage collection");
        let started = Instant::now();

        let purged = self
            .store
            .collect_garbage(self.threshold, self.scan_count)
            .await?;

        info!(
            purged,
            took_ms = started.elapsed().as_millis() as u64,
            "Sync garbage collection finished"
        );
        Ok(purged)
    }

    /// Run collection every `frequency` until the returned handle is stopped.
    ///
    /// Each pass's outcome is offered to `notify` without blocking.
    pub fn spawn(self, notify: Option<mpsc::Sender<Result<u64>>>) -> GcHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.frequency;
            let mut ticker = tokio::time::interval_at(start, self.frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let outcome = self.run_once().await;
                if let Err(e) = &outcome {
                    warn!(error = %e, "Sync garbage collection failed");
                }
                if let Some(notify) = &notify {
                    if notify.try_send(outcome).is_err() {
                        debug!("Nobody listening for gc results; dropping");
                    }
                }
            }
            debug!("Sync garbage collector stopped");
        });

        GcHandle { cancel, task }
    }
}

/// Handle on a background collector.
pub struct GcHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl GcHandle {
    /// Stop the collector and wait for an in-flight pass to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await.map_err(|e| SyncError::Worker {
            name: "gc".to_string(),
            message: e.to_string(),
        })
    }
}
