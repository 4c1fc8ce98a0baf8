//! Remote access to the coordination service.
//!
//! [`SyncServer`] accepts TCP connections and frames one JSON message per
//! line. Request handling itself lives in [`Connection`] and does not care
//! how frames are carried.

mod connection;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use connection::Connection;

use crate::config::ServerConfig;
use crate::protocol::Response;
use crate::sync::Service;

const RESPONSE_QUEUE_DEPTH: usize = 256;

/// Newline-delimited JSON listener in front of a [`Service`].
pub struct SyncServer {
    listener: TcpListener,
    service: Arc<dyn Service>,
    publish_timeout: Duration,
}

impl SyncServer {
    pub async fn bind(config: &ServerConfig, service: Arc<dyn Service>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        info!(address = %listener.local_addr()?, "Coordination server listening");

        Ok(Self {
            listener,
            service,
            publish_timeout: config.publish_timeout(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Open connections are cancelled along with it.
    pub async fn serve(self, shutdown: CancellationToken) -> io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer, "Accepted connection");
            tokio::spawn(serve_connection(
                stream,
                peer,
                Arc::clone(&self.service),
                self.publish_timeout,
                shutdown.child_token(),
            ));
        }

        info!("Coordination server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<dyn Service>,
    publish_timeout: Duration,
    cx: CancellationToken,
) {
    let (read, write) = stream.into_split();
    let (responses, outgoing) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
    let writer = tokio::spawn(write_responses(write, outgoing, cx.clone()));

    let connection = Connection::new(service, publish_timeout, responses, cx.clone());
    let mut frames = LinesStream::new(BufReader::new(read).lines());

    loop {
        let frame = tokio::select! {
            _ = cx.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(line)) if line.trim().is_empty() => {}
            Some(Ok(line)) => connection.handle_frame(line.as_bytes()).await,
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Failed to read frame");
                break;
            }
            None => break,
        }
    }

    // Ends in-flight requests; the writer drains once they drop their senders.
    cx.cancel();
    drop(connection);
    if let Err(e) = writer.await {
        warn!(peer = %peer, error = %e, "Response writer failed");
    }
    debug!(peer = %peer, "Connection closed");
}

async fn write_responses(
    mut write: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<Response>,
    cx: CancellationToken,
) {
    while let Some(response) = outgoing.recv().await {
        let mut line = match serde_json::to_vec(&response) {
            Ok(line) => line,
            Err(e) => {
                warn!(id = %response.id, error = %e, "Failed to encode response");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = write.write_all(&line).await {
            debug!(error = %e, "Peer stopped reading; closing connection");
            cx.cancel();
            break;
        }
    }
}
