//! Subscription coordinator.
//!
//! The only task allowed to change the active set. Each change interrupts the
//! consumer, edits the set it hands back, and resumes it once no further
//! changes are queued.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::consumer::{ActiveSet, Consumer};
use super::subscription::{ActiveSubscription, Removal, SubscribeCommand};
use super::SyncError;
use crate::config::SyncConfig;
use crate::store::LogStore;

pub(crate) async fn run_coordinator(
    mut commands: mpsc::Receiver<SubscribeCommand>,
    store: Arc<dyn LogStore>,
    settings: SyncConfig,
    shutdown: CancellationToken,
) {
    let (removals_tx, mut removals_rx) = mpsc::unbounded_channel();
    let mut consumer = Consumer::new(store, settings, shutdown.clone(), removals_tx.clone());
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                let parked = consumer.interrupt().await;

                next_id += 1;
                let (sub, ack) = ActiveSubscription::new(next_id, command);
                debug!(topic = %sub.topic, id = sub.id, cursor = %sub.cursor, "Adding subscription");
                sub.spawn_monitor(removals_tx.clone(), shutdown.clone());
                parked.active.entry(sub.topic.clone()).or_default().push(sub);
                let _ = ack.send(());
            }
            Some(removals) = removals_rx.recv() => {
                let parked = consumer.interrupt().await;
                remove(&mut parked.active, removals);
            }
        }

        // Apply queued changes before paying for another restart.
        if !commands.is_empty() || !removals_rx.is_empty() {
            continue;
        }
        consumer.resume();
    }

    let parked = consumer.interrupt().await;
    let fatal = parked.fatal.take();
    let mut closed = 0usize;
    for sub in std::mem::take(&mut parked.active).into_values().flatten() {
        let error = match &fatal {
            Some(message) => SyncError::Fatal(message.clone()),
            None => SyncError::Canceled,
        };
        sub.close(Err(error));
        closed += 1;
    }
    info!(closed, "Subscription coordinator stopped");
}

fn remove(active: &mut ActiveSet, removals: Vec<Removal>) {
    for removal in removals {
        let Some(subs) = active.get_mut(&removal.topic) else {
            continue;
        };
        let Some(index) = subs.iter().position(|sub| sub.id == removal.id) else {
            // Already removed through another path.
            continue;
        };

        let sub = subs.swap_remove(index);
        debug!(topic = %removal.topic, id = removal.id, "Removing subscription");
        if subs.is_empty() {
            active.remove(&removal.topic);
        }
        sub.close(removal.result);
    }
}
