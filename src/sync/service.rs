//! Default coordination service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::barrier::{run_barrier_worker, BarrierCommand};
use super::coordinator::run_coordinator;
use super::gc::{GcHandle, SyncGc};
use super::subscription::{StartFrom, SubscribeCommand, Subscription};
use super::{Result, Service, SyncError, TeardownError};
use crate::config::{GcConfig, SyncConfig};
use crate::store::{Cursor, LogStore};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// [`Service`] over a [`LogStore`].
///
/// Owns two background tasks: the barrier worker and the subscription
/// coordinator. Both stop on [`DefaultService::close`] or when the service is
/// dropped.
pub struct DefaultService {
    store: Arc<dyn LogStore>,
    settings: SyncConfig,
    shutdown: CancellationToken,
    barriers: mpsc::Sender<BarrierCommand>,
    subscriptions: mpsc::Sender<SubscribeCommand>,
    workers: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    gc: Mutex<Option<GcHandle>>,
}

impl DefaultService {
    /// Start the service over `store`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn LogStore>, settings: SyncConfig) -> Self {
        let shutdown = CancellationToken::new();
        let (barriers, barrier_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (subscriptions, subscription_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let barrier_worker = tokio::spawn(run_barrier_worker(
            barrier_rx,
            Arc::clone(&store),
            settings.barrier_poll_interval(),
            shutdown.clone(),
        ));
        let coordinator = tokio::spawn(run_coordinator(
            subscription_rx,
            Arc::clone(&store),
            settings.clone(),
            shutdown.clone(),
        ));

        info!(
            poll_interval = ?settings.barrier_poll_interval(),
            read_batch_size = settings.read_batch_size,
            "Coordination service started"
        );

        Self {
            store,
            settings,
            shutdown,
            barriers,
            subscriptions,
            workers: Mutex::new(vec![
                ("barriers", barrier_worker),
                ("subscriptions", coordinator),
            ]),
            gc: Mutex::new(None),
        }
    }

    /// Connect to the Redis instance named in `config` and start the service.
    #[cfg(feature = "redis")]
    pub async fn connect(config: &crate::config::Config) -> Result<Self> {
        let store = crate::store::RedisLogStore::new(&config.redis.url()).await?;
        Ok(Self::new(Arc::new(store), config.sync.clone()))
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start background garbage collection; it stops with the service.
    ///
    /// Does nothing when collection is disabled or already running.
    pub async fn enable_background_gc(
        &self,
        config: &GcConfig,
        notify: Option<mpsc::Sender<Result<u64>>>,
    ) {
        if !config.enabled {
            debug!("Sync garbage collection disabled");
            return;
        }

        let mut gc = self.gc.lock().await;
        if gc.is_some() || self.is_closed() {
            return;
        }

        info!(
            frequency = ?config.frequency(),
            threshold = ?config.last_access_threshold(),
            "Starting background sync garbage collection"
        );
        *gc = Some(SyncGc::new(Arc::clone(&self.store), config).spawn(notify));
    }

    /// Stop all background work and release the store.
    ///
    /// Pending barriers fail and open subscriptions end with
    /// [`SyncError::Canceled`]. Every teardown failure is reported; one
    /// failing step does not skip the others.
    pub async fn close(&self) -> std::result::Result<(), TeardownError> {
        info!("Closing coordination service");
        self.shutdown.cancel();

        let mut errors = Vec::new();

        if let Some(gc) = self.gc.lock().await.take() {
            if let Err(e) = gc.stop().await {
                errors.push(e);
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for (name, worker) in workers {
            if let Err(e) = worker.await {
                warn!(worker = name, error = %e, "Worker task failed");
                errors.push(SyncError::Worker {
                    name: name.to_string(),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = self.store.close().await {
            errors.push(SyncError::Store(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { errors })
        }
    }

    fn check_open(&self, cx: &CancellationToken) -> Result<()> {
        if cx.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        Ok(())
    }
}

impl Drop for DefaultService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Service for DefaultService {
    #[tracing::instrument(name = "sync.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, cx: &CancellationToken, topic: &str, payload: &Value) -> Result<i64> {
        self.check_open(cx)?;
        let bytes = serde_json::to_vec(payload).map_err(SyncError::Serialization)?;

        let seq = tokio::select! {
            biased;
            _ = cx.cancelled() => return Err(SyncError::Canceled),
            appended = self.store.append(topic, &bytes) => appended?,
        };

        debug!(seq, bytes = bytes.len(), "Published");
        Ok(seq)
    }

    #[tracing::instrument(name = "sync.subscribe", skip_all, fields(topic = %topic, from = ?from))]
    async fn subscribe_from(
        &self,
        cx: &CancellationToken,
        topic: &str,
        from: StartFrom,
    ) -> Result<Subscription> {
        self.check_open(cx)?;

        let cursor = match from {
            StartFrom::Beginning => Cursor::BEGINNING,
            StartFrom::Latest => self.store.tail(topic).await?,
        };

        let (out_tx, out_rx) = mpsc::channel(self.settings.subscription_buffer.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();

        self.subscriptions
            .send(SubscribeCommand {
                topic: topic.to_string(),
                cursor,
                cx: cx.clone(),
                out: out_tx,
                done: done_tx,
                ack: ack_tx,
            })
            .await
            .map_err(|_| SyncError::Closed)?;
        ack_rx.await.map_err(|_| SyncError::Closed)?;

        debug!(cursor = %cursor, "Subscribed");
        Ok(Subscription::new(topic.to_string(), out_rx, done_rx))
    }

    #[tracing::instrument(name = "sync.barrier", skip_all, fields(state = %state, required = target))]
    async fn barrier(&self, cx: &CancellationToken, state: &str, target: i64) -> Result<()> {
        if target <= 0 {
            warn!("Barrier target is not positive; resolving immediately");
            return Ok(());
        }
        self.check_open(cx)?;

        let (done_tx, done_rx) = oneshot::channel();
        self.barriers
            .send(BarrierCommand {
                state: state.to_string(),
                target,
                cx: cx.clone(),
                done: done_tx,
            })
            .await
            .map_err(|_| SyncError::Closed)?;

        tokio::select! {
            biased;
            resolved = done_rx => resolved.unwrap_or(Err(SyncError::Closed)),
            _ = cx.cancelled() => Err(SyncError::Canceled),
        }
    }

    #[tracing::instrument(name = "sync.signal_entry", skip_all, fields(state = %state))]
    async fn signal_entry(&self, cx: &CancellationToken, state: &str) -> Result<i64> {
        self.check_open(cx)?;

        let seq = tokio::select! {
            biased;
            _ = cx.cancelled() => return Err(SyncError::Canceled),
            signalled = self.store.incr(state) => signalled?,
        };

        debug!(seq, "Signalled entry");
        Ok(seq)
    }

    #[tracing::instrument(name = "sync.signal_event", skip_all, fields(key = %key))]
    async fn signal_event(&self, cx: &CancellationToken, key: &str, event: &Value) -> Result<()> {
        self.check_open(cx)?;
        let bytes = serde_json::to_vec(event).map_err(SyncError::Serialization)?;

        tokio::select! {
            biased;
            _ = cx.cancelled() => return Err(SyncError::Canceled),
            appended = self.store.append(key, &bytes) => { appended?; }
        }

        debug!(bytes = bytes.len(), "Signalled event");
        Ok(())
    }
}
