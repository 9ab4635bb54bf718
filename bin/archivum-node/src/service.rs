//! HTTP surface of the node daemon

use archivum_common::NodeId;
use archivum_placement::{CapacityDirectory, DirectoryHealth, FallbackDirectory};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    pub directory: Arc<FallbackDirectory>,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while placement runs on cached or static data
    pub status: &'static str,
    pub directory: DirectoryHealth,
    pub nodes: Vec<NodeId>,
}

/// Routes served by the daemon.
///
/// The directory routes are only mounted when this process hosts the
/// directory; peers then heartbeat into it.
pub fn app(hosted: Option<Arc<dyn CapacityDirectory>>, health_state: HealthState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health))
        .with_state(health_state);
    match hosted {
        Some(directory) => health_routes.merge(archivum_placement::router(directory)),
        None => health_routes,
    }
}

/// GET /health
async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let directory = state.directory.health();
    Json(HealthResponse {
        status: if directory.is_degraded() { "degraded" } else { "ok" },
        directory,
        nodes: state.nodes,
    })
}
