//! Subscription consumer.
//!
//! A single long-running read loop serves every active subscription. The
//! coordinator stops it before touching the active set and restarts it
//! afterwards; the hand-off is a three-state machine driven by CAS:
//!
//! ```text
//! Stopped --resume--> Running --interrupt--> Interrupting --loop exits--> Stopped
//!                        \------------------ loop exits ----------------/
//! ```
//!
//! While running, the loop task owns the active set and the reader
//! connection. It hands both back through its join handle, so the set only
//! ever has one owner at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::Value;
use backon::ExponentialBackoff;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::subscription::{ActiveSubscription, Removal};
use super::SyncError;
use crate::config::SyncConfig;
use crate::store::{BlockingReader, Cursor, LogStore, StoreError, TopicBatch};
use crate::utils::retry::reader_backoff;

/// Active subscriptions keyed by topic.
pub(crate) type ActiveSet = HashMap<String, Vec<ActiveSubscription>>;

/// Consumer lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerState {
    Stopped = 0,
    Interrupting = 1,
    Running = 2,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Stopped,
            1 => ConsumerState::Interrupting,
            _ => ConsumerState::Running,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConsumerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConsumerState {
        ConsumerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, state: ConsumerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`, or report the state actually found.
    fn transition(&self, from: ConsumerState, to: ConsumerState) -> Result<(), ConsumerState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConsumerState::from_u8)
    }
}

/// Everything the read loop owns while running.
#[derive(Default)]
pub(crate) struct Parked {
    pub(crate) active: ActiveSet,
    reader: Option<Box<dyn BlockingReader>>,
    /// Set when the loop gave up reconnecting because the service shut down.
    pub(crate) fatal: Option<String>,
}

struct Shared {
    state: StateCell,
    /// Id of the connection currently used for blocking reads; 0 when none.
    reader_id: AtomicI64,
    interrupted: Notify,
}

/// Read-loop inputs that stay fixed for the consumer's lifetime.
#[derive(Clone)]
struct LoopContext {
    shared: Arc<Shared>,
    store: Arc<dyn LogStore>,
    settings: SyncConfig,
    shutdown: CancellationToken,
    removals: mpsc::UnboundedSender<Vec<Removal>>,
}

impl LoopContext {
    fn is_running(&self) -> bool {
        self.shared.state.load() == ConsumerState::Running && !self.shutdown.is_cancelled()
    }
}

/// Owner-side handle on the read loop. Only the coordinator holds one.
pub(crate) struct Consumer {
    cx: LoopContext,
    parked: Option<Parked>,
    task: Option<JoinHandle<Parked>>,
}

impl Consumer {
    pub(crate) fn new(
        store: Arc<dyn LogStore>,
        settings: SyncConfig,
        shutdown: CancellationToken,
        removals: mpsc::UnboundedSender<Vec<Removal>>,
    ) -> Self {
        Self {
            cx: LoopContext {
                shared: Arc::new(Shared {
                    state: StateCell::new(ConsumerState::Stopped),
                    reader_id: AtomicI64::new(0),
                    interrupted: Notify::new(),
                }),
                store,
                settings,
                shutdown,
                removals,
            },
            parked: Some(Parked::default()),
            task: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConsumerState {
        self.cx.shared.state.load()
    }

    /// Stop the read loop and take back the active set.
    ///
    /// # Panics
    /// If called while another interrupt is in flight.
    pub(crate) async fn interrupt(&mut self) -> &mut Parked {
        match self
            .cx
            .shared
            .state
            .transition(ConsumerState::Running, ConsumerState::Interrupting)
        {
            Ok(()) => {
                self.cx.shared.interrupted.notify_one();
                self.join(true).await;
            }
            Err(ConsumerState::Interrupting) => {
                panic!("duplicate call to consumer interrupt");
            }
            // The loop already stopped itself; reclaim what it handed back.
            Err(_) => self.join(false).await,
        }

        self.parked.get_or_insert_with(Parked::default)
    }

    /// Start the read loop over the current active set.
    ///
    /// Does nothing when there is nothing to read.
    ///
    /// # Panics
    /// If the loop is not stopped.
    pub(crate) fn resume(&mut self) {
        let state = self.cx.shared.state.load();
        if state != ConsumerState::Stopped {
            panic!("consumer resumed while {state:?}");
        }
        let Some(parked) = self.parked.take() else {
            return;
        };
        if parked.active.is_empty() {
            debug!("No active subscriptions; consumer stays stopped");
            self.parked = Some(parked);
            return;
        }

        if let Err(state) = self
            .cx
            .shared
            .state
            .transition(ConsumerState::Stopped, ConsumerState::Running)
        {
            panic!("consumer resumed while {state:?}");
        }

        debug!(topics = parked.active.len(), "Resuming consumer");
        self.task = Some(tokio::spawn(consume(parked, self.cx.clone())));
    }

    /// Wait for the loop task to hand back its state, unblocking its read
    /// until it does.
    async fn join(&mut self, unblock: bool) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        let retry = self.cx.settings.interrupt_retry_interval();

        let outcome = loop {
            if unblock {
                unblock_reader(Arc::clone(&self.cx.store), Arc::clone(&self.cx.shared)).await;
            }
            tokio::select! {
                outcome = &mut task => break outcome,
                _ = tokio::time::sleep(retry) => {
                    debug!("Consumer still running; retrying unblock");
                }
            }
        };

        match outcome {
            Ok(parked) => self.parked = Some(parked),
            Err(e) => {
                // The subscriptions went down with the task; their handles
                // observe a closed completion signal.
                error!(error = %e, "Consumer task failed");
                self.cx.shared.state.store(ConsumerState::Stopped);
                self.parked = Some(Parked {
                    fatal: Some(format!("consumer task failed: {e}")),
                    ..Parked::default()
                });
            }
        }
    }

}

async fn unblock_reader(store: Arc<dyn LogStore>, shared: Arc<Shared>) {
    let reader = shared.reader_id.load(Ordering::SeqCst);
    if reader == 0 {
        return;
    }
    match store.unblock(reader).await {
        Ok(true) => debug!(reader_id = reader, "Unblocked consumer read"),
        Ok(false) => debug!(reader_id = reader, "Consumer read was not blocked"),
        Err(e) => warn!(reader_id = reader, error = %e, "Failed to unblock consumer read"),
    }
}

async fn consume(mut parked: Parked, cx: LoopContext) -> Parked {
    run(&mut parked, &cx).await;
    cx.shared.state.store(ConsumerState::Stopped);
    parked
}

enum Yield {
    Stopped,
    ReadFailed(StoreError),
}

async fn run(parked: &mut Parked, cx: &LoopContext) {
    let Parked {
        active,
        reader,
        fatal,
    } = parked;
    let mut backoff: Option<ExponentialBackoff> = None;

    while cx.is_running() {
        if reader.is_none() {
            match cx.store.open_reader().await {
                Ok(opened) => {
                    cx.shared.reader_id.store(opened.id(), Ordering::SeqCst);
                    if backoff.take().is_some() {
                        info!(reader_id = opened.id(), "Subscription connection re-established");
                    }
                    *reader = Some(opened);
                }
                Err(e) => {
                    let delay = backoff
                        .get_or_insert_with(|| reader_backoff(&cx.settings))
                        .next()
                        .unwrap_or_else(|| cx.settings.reconnect_max_delay());
                    warn!(error = %e, retry_in = ?delay, "Failed to open subscription connection");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cx.shutdown.cancelled() => {
                            *fatal = Some(format!(
                                "failed to re-establish subscription connection: {e}"
                            ));
                            return;
                        }
                    }
                }
            }
        }
        let Some(current) = reader.as_mut() else {
            continue;
        };

        match read_loop(&mut **current, active, cx).await {
            Yield::Stopped => return,
            Yield::ReadFailed(e) => {
                warn!(error = %e, "Subscription read failed; reconnecting");
                cx.shared.reader_id.store(0, Ordering::SeqCst);
                *reader = None;
            }
        }
    }
}

async fn read_loop(
    reader: &mut dyn BlockingReader,
    active: &mut ActiveSet,
    cx: &LoopContext,
) -> Yield {
    while cx.is_running() {
        let cursors = read_cursors(active);
        if cursors.is_empty() {
            return Yield::Stopped;
        }

        let batches = match reader.read(&cursors, cx.settings.read_batch_size).await {
            Ok(batches) => batches,
            Err(e) => return Yield::ReadFailed(e),
        };

        let removals = dispatch(batches, active, cx).await;
        if !removals.is_empty() {
            debug!(count = removals.len(), "Queueing subscription removals");
            let _ = cx.removals.send(removals);
            return Yield::Stopped;
        }
    }
    Yield::Stopped
}

/// Each topic is read from the oldest cursor among its subscribers.
fn read_cursors(active: &ActiveSet) -> Vec<(String, Cursor)> {
    active
        .iter()
        .filter_map(|(topic, subs)| {
            subs.iter()
                .map(|sub| sub.cursor)
                .min()
                .map(|cursor| (topic.clone(), cursor))
        })
        .collect()
}

enum Delivery {
    Sent,
    Gone,
    Stopped,
}

/// Fan entries out to subscribers that have not seen them yet.
///
/// Returns early, without advancing cursors past undelivered entries, when
/// the loop is told to stop mid-send.
async fn dispatch(
    batches: Vec<TopicBatch>,
    active: &mut ActiveSet,
    cx: &LoopContext,
) -> Vec<Removal> {
    let mut removals = Vec::new();
    let mut removed = HashSet::new();

    for batch in batches {
        let Some(subs) = active.get_mut(&batch.topic) else {
            debug!(topic = %batch.topic, "Received entries for a topic with no subscribers");
            continue;
        };

        for entry in batch.entries {
            let payload: Option<Value> = match serde_json::from_slice(&entry.payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(topic = %batch.topic, cursor = %entry.cursor, error = %e, "Failed to decode entry");
                    None
                }
            };

            for sub in subs.iter_mut() {
                if removed.contains(&sub.id) || entry.cursor <= sub.cursor {
                    continue;
                }

                let Some(value) = &payload else {
                    removed.insert(sub.id);
                    removals.push(Removal::failed(
                        sub.id,
                        sub.topic.clone(),
                        SyncError::Decode {
                            topic: batch.topic.clone(),
                            message: format!("entry {} is not valid JSON", entry.cursor),
                        },
                    ));
                    continue;
                };

                match deliver(sub, value, cx).await {
                    Delivery::Sent => sub.cursor = entry.cursor,
                    Delivery::Gone => {
                        removed.insert(sub.id);
                        removals.push(Removal::graceful(sub.id, sub.topic.clone()));
                    }
                    Delivery::Stopped => return removals,
                }
            }
        }
    }

    removals
}

async fn deliver(sub: &ActiveSubscription, value: &Value, cx: &LoopContext) -> Delivery {
    loop {
        tokio::select! {
            biased;
            _ = sub.cx.cancelled() => return Delivery::Gone,
            _ = cx.shutdown.cancelled() => return Delivery::Stopped,
            _ = cx.shared.interrupted.notified() => {
                if !cx.is_running() {
                    return Delivery::Stopped;
                }
            }
            sent = sub.out.send(value.clone()) => {
                return match sent {
                    Ok(()) => Delivery::Sent,
                    Err(_) => Delivery::Gone,
                };
            }
        }
    }
}
