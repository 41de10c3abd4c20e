//! Read-only HTTP view of the registry.
//!
//! `GET /containers` returns every known container keyed by id, with its
//! name, image, addresses and fully-qualified aliases.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DnsError;
use crate::registry::{ContainerInfo, HostRegistry};

/// Routes of the inspection endpoint.
pub fn router(registry: HostRegistry) -> Router {
    Router::new()
        .route("/containers", get(list_containers))
        .with_state(registry)
}

async fn list_containers(State(registry): State<HostRegistry>) -> Json<BTreeMap<String, ContainerInfo>> {
    Json(registry.snapshot())
}

/// Serve the inspection endpoint on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    registry: HostRegistry,
    shutdown: CancellationToken,
) -> Result<(), DnsError> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?addr, "inspection endpoint listening");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
