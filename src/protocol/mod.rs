//! Wire messages exchanged with remote participants.
//!
//! Transport-agnostic: one JSON object per frame. Every request carries an
//! `id`; every response echoes it. A subscribe request yields one response per
//! delivered item, all tagged with the request's id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier: Option<BarrierRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_entry: Option<SignalEntryRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_event: Option<SignalEventRequest>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_cancel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierRequest {
    pub state: String,
    pub target: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntryRequest {
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEventRequest {
    pub key: String,
    #[serde(default)]
    pub event: Value,
}

/// The single action a request asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Cancel,
    Publish(PublishRequest),
    Subscribe(SubscribeRequest),
    Barrier(BarrierRequest),
    SignalEntry(SignalEntryRequest),
    SignalEvent(SignalEventRequest),
}

impl Request {
    /// Parse one frame.
    pub fn decode(frame: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(frame)
            .map_err(|e| SyncError::Protocol(format!("malformed request: {e}")))
    }

    /// Split into the request id and the operation it names.
    ///
    /// A request must name exactly one operation, or be a cancellation.
    pub fn into_operation(self) -> Result<(String, Operation), SyncError> {
        if self.id.is_empty() {
            return Err(SyncError::Protocol("request id is required".to_string()));
        }
        if self.is_cancel {
            return Ok((self.id, Operation::Cancel));
        }

        let Request {
            id,
            publish,
            subscribe,
            barrier,
            signal_entry,
            signal_event,
            ..
        } = self;

        let mut operations: Vec<Operation> = [
            publish.map(Operation::Publish),
            subscribe.map(Operation::Subscribe),
            barrier.map(Operation::Barrier),
            signal_entry.map(Operation::SignalEntry),
            signal_event.map(Operation::SignalEvent),
        ]
        .into_iter()
        .flatten()
        .collect();

        match operations.len() {
            1 => Ok((id, operations.remove(0))),
            0 => Err(SyncError::Protocol(format!(
                "request '{id}' has an unknown request type"
            ))),
            n => Err(SyncError::Protocol(format!(
                "request '{id}' names {n} operations; expected one"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResponse>,
    /// One delivered subscription item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_entry: Option<SignalEntryResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEntryResponse {
    pub seq: i64,
}

impl Response {
    /// Success with no result body.
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn error(id: impl Into<String>, error: &SyncError) -> Self {
        Self {
            id: id.into(),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn published(id: impl Into<String>, seq: i64) -> Self {
        Self {
            id: id.into(),
            publish: Some(PublishResponse { seq }),
            ..Self::default()
        }
    }

    pub fn signalled(id: impl Into<String>, seq: i64) -> Self {
        Self {
            id: id.into(),
            signal_entry: Some(SignalEntryResponse { seq }),
            ..Self::default()
        }
    }

    pub fn item(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            subscribe: Some(payload),
            ..Self::default()
        }
    }
}
