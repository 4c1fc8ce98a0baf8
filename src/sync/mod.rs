//! Coordination primitives for distributed test runs.
//!
//! Instances running a test plan coordinate through two primitives backed by
//! a shared log store:
//!
//! - **Topics**: append-only logs. `publish` appends a JSON payload and returns
//!   its 1-based sequence number; `subscribe` replays a topic from the start
//!   and then follows it.
//! - **States**: named counters. `signal_entry` increments one; `barrier`
//!   waits until one reaches a target.
//!
//! All subscriptions share one blocking read connection managed by a
//! coordinator task, and all barriers share one polling worker, so resource
//! use stays flat as the number of waiters grows.

mod barrier;
mod consumer;
mod coordinator;
mod error;
mod gc;
mod scope;
mod service;
mod subscription;
mod sugar;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use error::{Result, SyncError, TeardownError};
pub use gc::{GcHandle, SyncGc};
pub use scope::RunScope;
pub use service::DefaultService;
pub use subscription::{StartFrom, Subscription};
pub use sugar::ServiceExt;

/// The coordination service.
///
/// Every operation takes the caller's cancellation token. Cancelling it
/// aborts the operation with [`SyncError::Canceled`]; for subscriptions it
/// ends the stream gracefully.
#[async_trait]
pub trait Service: Send + Sync {
    /// Append `payload` to `topic`, returning its sequence number.
    async fn publish(&self, cx: &CancellationToken, topic: &str, payload: &Value) -> Result<i64>;

    /// Subscribe to `topic`, replaying it from the beginning.
    async fn subscribe(&self, cx: &CancellationToken, topic: &str) -> Result<Subscription> {
        self.subscribe_from(cx, topic, StartFrom::Beginning).await
    }

    /// Subscribe to `topic` starting at `from`.
    async fn subscribe_from(
        &self,
        cx: &CancellationToken,
        topic: &str,
        from: StartFrom,
    ) -> Result<Subscription>;

    /// Wait until `state` has been signalled at least `target` times.
    async fn barrier(&self, cx: &CancellationToken, state: &str, target: i64) -> Result<()>;

    /// Increment `state`, returning the new count.
    async fn signal_entry(&self, cx: &CancellationToken, state: &str) -> Result<i64>;

    /// Append `event` to the log at `key` without reporting its position.
    async fn signal_event(&self, cx: &CancellationToken, key: &str, event: &Value) -> Result<()>;
}
