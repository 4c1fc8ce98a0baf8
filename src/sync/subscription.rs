//! Subscription handles and the coordinator's per-subscription bookkeeping.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Result, SyncError};
use crate::store::Cursor;

/// Where a new subscription starts reading its topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartFrom {
    /// Replay the whole topic, then follow new entries.
    #[default]
    Beginning,
    /// Skip everything already published; only entries appended later.
    Latest,
}

/// Receiving end of a subscription.
///
/// Items arrive in publish order. When the subscription ends the item stream
/// closes and [`Subscription::done`] reports why: `Ok(())` for a graceful end
/// (the subscribing context was cancelled), an error otherwise.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    items: mpsc::Receiver<Value>,
    done: oneshot::Receiver<Result<()>>,
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        items: mpsc::Receiver<Value>,
        done: oneshot::Receiver<Result<()>>,
    ) -> Self {
        Self { topic, items, done }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next delivered payload, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Value> {
        self.items.recv().await
    }

    /// Wait for the completion signal.
    ///
    /// Dropping the item stream here ends a still-running subscription, so
    /// call this after [`Subscription::next`] has returned `None`.
    pub async fn done(self) -> Result<()> {
        let Subscription { items, done, .. } = self;
        drop(items);
        done.await.unwrap_or(Err(SyncError::Closed))
    }
}

/// Request handed to the coordinator by `subscribe`.
pub(crate) struct SubscribeCommand {
    pub(crate) topic: String,
    pub(crate) cursor: Cursor,
    pub(crate) cx: CancellationToken,
    pub(crate) out: mpsc::Sender<Value>,
    pub(crate) done: oneshot::Sender<Result<()>>,
    pub(crate) ack: oneshot::Sender<()>,
}

/// A registered subscription as tracked by the coordinator and consumer.
pub(crate) struct ActiveSubscription {
    pub(crate) id: u64,
    pub(crate) topic: String,
    /// Last entry delivered to this subscriber.
    pub(crate) cursor: Cursor,
    pub(crate) cx: CancellationToken,
    pub(crate) out: mpsc::Sender<Value>,
    done: Option<oneshot::Sender<Result<()>>>,
    released: CancellationToken,
}

impl ActiveSubscription {
    pub(crate) fn new(id: u64, command: SubscribeCommand) -> (Self, oneshot::Sender<()>) {
        let SubscribeCommand {
            topic,
            cursor,
            cx,
            out,
            done,
            ack,
        } = command;

        let sub = Self {
            id,
            topic,
            cursor,
            cx,
            out,
            done: Some(done),
            released: CancellationToken::new(),
        };
        (sub, ack)
    }

    /// Deliver the completion signal, then close the item stream.
    pub(crate) fn close(mut self, result: Result<()>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    /// Watch for the subscriber going away and report it as a removal.
    ///
    /// The watcher exits once the subscription is closed or the service
    /// shuts down, so it never outlives the subscription.
    pub(crate) fn spawn_monitor(
        &self,
        removals: mpsc::UnboundedSender<Vec<Removal>>,
        shutdown: CancellationToken,
    ) {
        let id = self.id;
        let topic = self.topic.clone();
        let cx = self.cx.clone();
        let out = self.out.clone();
        let released = self.released.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cx.cancelled() => {
                    debug!(topic = %topic, id, "Subscription context closed; removing");
                    let _ = removals.send(vec![Removal::graceful(id, topic)]);
                }
                _ = out.closed() => {
                    debug!(topic = %topic, id, "Subscriber dropped its handle; removing");
                    let _ = removals.send(vec![Removal::graceful(id, topic)]);
                }
                _ = released.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.released.cancel();
    }
}

/// A subscription the coordinator must drop, with the result to report.
pub(crate) struct Removal {
    pub(crate) id: u64,
    pub(crate) topic: String,
    pub(crate) result: Result<()>,
}

impl Removal {
    pub(crate) fn graceful(id: u64, topic: String) -> Self {
        Self {
            id,
            topic,
            result: Ok(()),
        }
    }

    pub(crate) fn failed(id: u64, topic: String, error: SyncError) -> Self {
        Self {
            id,
            topic,
            result: Err(error),
        }
    }
}
