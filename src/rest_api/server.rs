//! Axum HTTP server for health, metrics and status summaries

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::controller::{metrics, ControllerState};
use crate::crd::RedisSentinel;
use crate::error::{Error, Result};

/// Condensed view of one resource
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopologySummary {
    name: String,
    namespace: String,
    phase: String,
    master: Option<String>,
    quorum_agreement: bool,
    leader_ready_replicas: i32,
    sentinel_ready_replicas: i32,
    failover_count: i64,
    last_error_category: Option<String>,
}

impl From<&RedisSentinel> for TopologySummary {
    fn from(obj: &RedisSentinel) -> Self {
        let status = obj.status.clone().unwrap_or_default();
        Self {
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            phase: if status.phase.is_empty() {
                "Pending".to_string()
            } else {
                status.phase
            },
            master: status.master,
            quorum_agreement: status.quorum_agreement,
            leader_ready_replicas: status.leader_ready_replicas,
            sentinel_ready_replicas: status.sentinel_ready_replicas,
            failover_count: status.failover_count,
            last_error_category: status.last_error_category,
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    match encode(&mut buffer, &metrics::REGISTRY) {
        Ok(()) => buffer.into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_topologies(State(state): State<Arc<ControllerState>>) -> Response {
    let api: Api<RedisSentinel> = match &state.settings.namespace {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    };
    match api.list(&ListParams::default()).await {
        Ok(list) => {
            let items: Vec<TopologySummary> = list.items.iter().map(TopologySummary::from).collect();
            Json(items).into_response()
        }
        Err(e) => {
            warn!("Failed to list RedisSentinels: {}", e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn get_topology(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let api: Api<RedisSentinel> = Api::namespaced(state.client.clone(), &namespace);
    match api.get_opt(&name).await {
        Ok(Some(obj)) => Json(TopologySummary::from(&obj)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("Failed to get RedisSentinel {}/{}: {}", namespace, name, e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Run the HTTP server until the listener fails
pub async fn run_server(addr: SocketAddr, state: Arc<ControllerState>) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/redissentinels", get(list_topologies))
        .route("/api/v1/redissentinels/:namespace/:name", get(get_topology))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("HTTP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigurationError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::RetryableError(format!("Server error: {}", e)))?;

    Ok(())
}
