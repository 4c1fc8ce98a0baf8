//! Per-connection request handling.
//!
//! Independent of the transport: frames come in through [`Connection::handle_frame`],
//! responses go out through an mpsc channel the transport drains. Each request
//! runs in its own task under a cancellation token registered by request id,
//! so a later `is_cancel` frame can stop it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{Operation, Request, Response};
use crate::sync::{Service, SyncError};

type InFlight = HashMap<String, (u64, CancellationToken)>;

/// Handles the requests of one remote participant.
pub struct Connection {
    service: Arc<dyn Service>,
    publish_timeout: Duration,
    responses: mpsc::Sender<Response>,
    cx: CancellationToken,
    in_flight: Arc<Mutex<InFlight>>,
    next_generation: AtomicU64,
}

impl Connection {
    /// `cx` bounds every request on this connection.
    pub fn new(
        service: Arc<dyn Service>,
        publish_timeout: Duration,
        responses: mpsc::Sender<Response>,
        cx: CancellationToken,
    ) -> Self {
        Self {
            service,
            publish_timeout,
            responses,
            cx,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Number of requests still running.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Decode and dispatch one frame.
    ///
    /// A frame that does not parse is answered with an error under an empty id.
    /// Returns once any synchronous reply has been queued.
    pub async fn handle_frame(&self, frame: &[u8]) {
        match Request::decode(frame) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed frame");
                self.reply(Response::error("", &e)).await;
            }
        }
    }

    pub async fn handle(&self, request: Request) {
        let request_id = request.id.clone();
        let (id, operation) = match request.into_operation() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(id = %request_id, error = %e, "Rejecting request");
                self.reply(Response::error(request_id, &e)).await;
                return;
            }
        };

        if matches!(operation, Operation::Cancel) {
            self.cancel(&id);
            return;
        }

        let Some((generation, cx)) = self.register(&id) else {
            self.reply(Response::error(
                id.clone(),
                &SyncError::Protocol(format!("request id '{id}' is already in flight")),
            ))
            .await;
            return;
        };

        let service = Arc::clone(&self.service);
        let responses = self.responses.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let publish_timeout = self.publish_timeout;

        tokio::spawn(async move {
            run_operation(
                service.as_ref(),
                &id,
                operation,
                &cx,
                publish_timeout,
                &responses,
            )
            .await;

            let mut in_flight = lock(&in_flight);
            if matches!(in_flight.get(&id), Some((g, _)) if *g == generation) {
                in_flight.remove(&id);
            }
        });
    }

    /// Cancel every in-flight request.
    pub fn close(&self) {
        let drained: Vec<_> = lock(&self.in_flight).drain().collect();
        debug!(in_flight = drained.len(), "Closing connection");
        for (_, (_, cx)) in drained {
            cx.cancel();
        }
    }

    fn register(&self, id: &str) -> Option<(u64, CancellationToken)> {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.contains_key(id) {
            return None;
        }
        let generation = self
            .next_generation
            .fetch_add(1, Ordering::Relaxed);
        let cx = self.cx.child_token();
        in_flight.insert(id.to_string(), (generation, cx.clone()));
        Some((generation, cx))
    }

    fn cancel(&self, id: &str) {
        match lock(&self.in_flight).remove(id) {
            Some((_, cx)) => {
                debug!(id, "Cancelling request");
                cx.cancel();
            }
            None => debug!(id, "Cancel for unknown or finished request"),
        }
    }

    /// Queue a reply, waiting for room behind streamed items.
    async fn reply(&self, response: Response) {
        let id = response.id.clone();
        tokio::select! {
            sent = self.responses.send(response) => {
                if sent.is_err() {
                    debug!(id = %id, "Connection gone before reply was sent");
                }
            }
            _ = self.cx.cancelled() => debug!(id = %id, "Connection closing; reply dropped"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_operation(
    service: &dyn Service,
    id: &str,
    operation: Operation,
    cx: &CancellationToken,
    publish_timeout: Duration,
    responses: &mpsc::Sender<Response>,
) {
    let response = match operation {
        Operation::Publish(req) => {
            match tokio::time::timeout(
                publish_timeout,
                service.publish(cx, &req.topic, &req.payload),
            )
            .await
            {
                Ok(Ok(seq)) => Response::published(id, seq),
                Ok(Err(e)) => Response::error(id, &e),
                Err(_) => Response::error(id, &SyncError::DeadlineExceeded),
            }
        }
        Operation::SignalEntry(req) => {
            match tokio::time::timeout(publish_timeout, service.signal_entry(cx, &req.state)).await
            {
                Ok(Ok(seq)) => Response::signalled(id, seq),
                Ok(Err(e)) => Response::error(id, &e),
                Err(_) => Response::error(id, &SyncError::DeadlineExceeded),
            }
        }
        Operation::SignalEvent(req) => {
            match tokio::time::timeout(
                publish_timeout,
                service.signal_event(cx, &req.key, &req.event),
            )
            .await
            {
                Ok(Ok(())) => Response::ok(id),
                Ok(Err(e)) => Response::error(id, &e),
                Err(_) => Response::error(id, &SyncError::DeadlineExceeded),
            }
        }
        Operation::Barrier(req) => match service.barrier(cx, &req.state, req.target).await {
            Ok(()) => Response::ok(id),
            Err(e) => Response::error(id, &e),
        },
        Operation::Subscribe(req) => {
            match stream_subscription(service, id, &req.topic, cx, responses).await {
                Ok(()) => return,
                Err(e) => Response::error(id, &e),
            }
        }
        Operation::Cancel => return,
    };

    if responses.send(response).await.is_err() {
        debug!(id, "Connection gone before response was sent");
    }
}

/// Forward every item until the subscription ends.
///
/// Ending because the request was cancelled is not an error.
async fn stream_subscription(
    service: &dyn Service,
    id: &str,
    topic: &str,
    cx: &CancellationToken,
    responses: &mpsc::Sender<Response>,
) -> Result<(), SyncError> {
    let mut sub = match service.subscribe(cx, topic).await {
        Ok(sub) => sub,
        Err(e) if e.is_cancellation() => return Ok(()),
        Err(e) => return Err(e),
    };
    debug!(id, topic, "Streaming subscription");

    while let Some(item) = sub.next().await {
        if responses.send(Response::item(id, item)).await.is_err() {
            debug!(id, "Connection gone; ending subscription");
            cx.cancel();
            break;
        }
    }

    match sub.done().await {
        Err(e) if !e.is_cancellation() => Err(e),
        _ => Ok(()),
    }
}
