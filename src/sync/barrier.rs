//! Barrier worker.
//!
//! Pending barriers are grouped by state key. Every poll reads all pending
//! keys with one MGET and releases the barriers whose target has been met.
//! The poll ticker only exists while something is waiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Result, SyncError};
use crate::store::LogStore;

/// Request handed to the worker by `barrier`.
pub(crate) struct BarrierCommand {
    pub(crate) state: String,
    pub(crate) target: i64,
    pub(crate) cx: CancellationToken,
    pub(crate) done: oneshot::Sender<Result<()>>,
}

struct PendingBarrier {
    target: i64,
    cx: CancellationToken,
    done: oneshot::Sender<Result<()>>,
}

impl PendingBarrier {
    fn resolve(self, result: Result<()>) {
        // The caller may have stopped waiting already.
        let _ = self.done.send(result);
    }

    fn abandoned(&self) -> bool {
        self.cx.is_cancelled() || self.done.is_closed()
    }
}

pub(crate) async fn run_barrier_worker(
    mut commands: mpsc::Receiver<BarrierCommand>,
    store: Arc<dyn LogStore>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<String, Vec<PendingBarrier>> = HashMap::new();
    let mut ticker: Option<Interval> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                debug!(state = %command.state, target = command.target, "Registering barrier");
                pending.entry(command.state).or_default().push(PendingBarrier {
                    target: command.target,
                    cx: command.cx,
                    done: command.done,
                });
                if ticker.is_none() {
                    ticker = Some(new_ticker(poll_interval));
                }
            }
            _ = tick(&mut ticker) => {}
        }

        prune_abandoned(&mut pending);
        if !pending.is_empty() {
            check(&mut pending, store.as_ref()).await;
        }
        if pending.is_empty() {
            ticker = None;
        }
    }

    let outstanding: usize = pending.values().map(Vec::len).sum();
    for barrier in pending.into_values().flatten() {
        barrier.resolve(Err(SyncError::Canceled));
    }
    info!(outstanding, "Barrier worker stopped");
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn prune_abandoned(pending: &mut HashMap<String, Vec<PendingBarrier>>) {
    pending.retain(|state, barriers| {
        let (abandoned, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(barriers).into_iter().partition(PendingBarrier::abandoned);
        if !abandoned.is_empty() {
            debug!(state = %state, count = abandoned.len(), "Dropping abandoned barriers");
        }
        for barrier in abandoned {
            barrier.resolve(Err(SyncError::Canceled));
        }
        *barriers = waiting;
        !barriers.is_empty()
    });
}

async fn check(pending: &mut HashMap<String, Vec<PendingBarrier>>, store: &dyn LogStore) {
    let keys: Vec<String> = pending.keys().cloned().collect();
    let values = match store.mget(&keys).await {
        Ok(values) => values,
        Err(e) => {
            warn!(error = %e, keys = keys.len(), "Failed to read barrier states; will retry");
            return;
        }
    };

    for (key, value) in keys.into_iter().zip(values) {
        // A state nobody has signalled yet reads as missing.
        let Some(current) = value else {
            continue;
        };
        let Some(barriers) = pending.get_mut(&key) else {
            continue;
        };

        let (met, waiting): (Vec<_>, Vec<_>) = std::mem::take(barriers)
            .into_iter()
            .partition(|barrier| current >= barrier.target);
        *barriers = waiting;

        if !met.is_empty() {
            debug!(state = %key, current, released = met.len(), "Barrier target reached");
        }
        for barrier in met {
            barrier.resolve(Ok(()));
        }
        if barriers.is_empty() {
            pending.remove(&key);
        }
    }
}
