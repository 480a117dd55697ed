//! Mesh Reference - the rank authority
//!
//! Serves `rank`, `list` and `heartbeat` over the request/reply channel.

pub mod service;

pub use service::{ReferenceService, DEFAULT_CLEANUP_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};

use mesh_bus::RequestServer;
use std::{sync::Arc, time::Duration};

/// Serve the authority on `addr` and run its cleanup loop
pub async fn run(addr: &str, heartbeat_timeout: Duration, cleanup_interval: Duration) -> anyhow::Result<()> {
    let service = Arc::new(ReferenceService::with_timeout(heartbeat_timeout));

    let cleanup = tokio::spawn({
        let service = service.clone();
        async move { service.run_cleanup(cleanup_interval).await }
    });

    tracing::info!("Rank authority listening on {}", addr);
    let result = RequestServer::new(service).run(addr).await;
    cleanup.abort();
    result
}
