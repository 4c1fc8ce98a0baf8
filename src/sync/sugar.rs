//! Compound operations built from the [`Service`] primitives.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{Result, Service, Subscription};

/// Common call sequences, available on every [`Service`].
#[async_trait]
pub trait ServiceExt: Service {
    /// Signal entry into `state`, then wait until `target` instances have.
    ///
    /// Returns this caller's sequence number within the state.
    async fn signal_and_wait(
        &self,
        cx: &CancellationToken,
        state: &str,
        target: i64,
    ) -> Result<i64> {
        let seq = self.signal_entry(cx, state).await?;
        self.barrier(cx, state, target).await?;
        Ok(seq)
    }

    /// Publish to `topic`, then wait for `state` to reach `target`.
    async fn publish_and_wait(
        &self,
        cx: &CancellationToken,
        topic: &str,
        payload: &Value,
        state: &str,
        target: i64,
    ) -> Result<i64> {
        let seq = self.publish(cx, topic, payload).await?;
        self.barrier(cx, state, target).await?;
        Ok(seq)
    }

    /// Publish to `topic` and subscribe to it, seeing the own entry too.
    async fn publish_subscribe(
        &self,
        cx: &CancellationToken,
        topic: &str,
        payload: &Value,
    ) -> Result<(i64, Subscription)> {
        let seq = self.publish(cx, topic, payload).await?;
        let sub = self.subscribe(cx, topic).await?;
        Ok((seq, sub))
    }
}

impl<T: Service + ?Sized> ServiceExt for T {}
