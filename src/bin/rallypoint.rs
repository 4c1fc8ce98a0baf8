//! rallypoint: coordination daemon for distributed test runs.
//!
//! Serves publish/subscribe topics and barrier states to test instances over
//! newline-delimited JSON on TCP, backed by Redis.
//!
//! ## Architecture
//! ```text
//! [Test Instance] --NDJSON--> [rallypoint] --> [Redis]
//!       ...                        |
//! [Test Instance] --NDJSON--------/
//! ```
//!
//! ## Configuration
//! - `--config <path>` / RALLYPOINT_CONFIG: YAML config file
//! - RALLYPOINT_REDIS__HOST, RALLYPOINT_REDIS__PORT: Redis location
//! - RALLYPOINT_SERVER__PORT: listener port (default 5050)
//! - RALLYPOINT_LOG: tracing filter (default "info")

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rallypoint::config::Config;
use rallypoint::server::SyncServer;
use rallypoint::store::RedisLogStore;
use rallypoint::sync::DefaultService;
use rallypoint::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting rallypoint");

    let url = config.redis.url();
    let store = connect_with_retry("redis", &url, || RedisLogStore::new(&url)).await?;

    let service = Arc::new(DefaultService::new(Arc::new(store), config.sync.clone()));
    service.enable_background_gc(&config.gc, None).await;

    let server = SyncServer::bind(&config.server, service.clone()).await?;
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server stopped with error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    if let Err(e) = service.close().await {
        error!(error = %e, "Coordination service did not shut down cleanly");
        return Err(e.into());
    }

    info!("rallypoint stopped");
    Ok(())
}
