use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::protocol::{ACTION_PATH, OPERATIONS, SERVER_VERSION, SSE_RETRY_MS};
use shared::types::{CacheStatusInfo, OperationRecord};
use tokio::sync::mpsc;
use crate::dispatch::{Dispatcher, OperationEvent, OperationRequest};
use crate::location::{cache::normalize_name, LocationCache};
use crate::oplog::OpLogHandle;
use crate::provider::VmOperation;
use super::error::ApiError;

const DEFAULT_OPERATIONS_LIMIT: usize = 50;
const MAX_OPERATIONS_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub cache: LocationCache,
    pub oplog: OpLogHandle,
}

#[derive(Deserialize)]
pub struct ActionQuery {
    pub vmname: Option<String>,
    pub operation: Option<String>,
    pub zone: Option<String>,
    pub format: Option<String>,
}

#[derive(Deserialize)]
pub struct OperationsQuery {
    pub limit: Option<usize>,
    pub vm: Option<String>,
}

#[derive(Deserialize)]
pub struct ZonesQuery {
    pub pattern: Option<String>,
}

#[derive(Serialize)]
pub struct VmLocation {
    pub name: String,
    pub zone: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(ACTION_PATH, get(gcp_action))
        .route("/health", get(health))
        .route("/api-docs", get(api_docs))
        .route("/v1/cache/status", get(cache_status))
        .route("/v1/cache/hash", get(cache_hash))
        .route("/v1/cache/refresh", post(cache_refresh))
        .route("/v1/cache/vms/:name", get(cache_lookup))
        .route("/v1/zones", get(zones))
        .route("/v1/operations", get(operations))
        .with_state(state)
}

async fn gcp_action(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<ActionQuery>,
) -> Result<Response, ApiError> {
    let vm_name = params
        .vmname
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("vmname is required".to_string()))?;

    let requested = params.operation.as_deref().unwrap_or("status");
    let operation: VmOperation = requested.parse().map_err(|e| {
        tracing::warn!("Invalid operation requested: {}", requested);
        ApiError::BadRequest(format!("{}. Valid operations are: {}", e, OPERATIONS.join(", ")))
    })?;

    let client_ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let wants_json = params
        .format
        .as_deref()
        .is_some_and(|f| f.eq_ignore_ascii_case("json"));

    let request = OperationRequest {
        vm_name,
        operation,
        zone: params.zone,
        client_ip,
    };

    if wants_json {
        let outcome = state.dispatcher.dispatch(request, None).await?;
        let body = match outcome.details {
            Some(details) => json!({
                "status": "success",
                "data": details,
                "vanity_name": outcome.vanity_name,
            }),
            None => json!({ "status": "success", "message": outcome.message }),
        };
        return Ok(Json(body).into_response());
    }

    let (tx, rx) = mpsc::channel(64);
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        // Failures were already sent as error events.
        let _ = dispatcher.dispatch(request, Some(tx)).await;
    });

    Ok(Sse::new(event_stream(rx))
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn event_stream(rx: mpsc::Receiver<OperationEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let frame = Event::default()
            .event(event.kind.as_str())
            .data(event.data)
            .retry(Duration::from_millis(SSE_RETRY_MS));
        Some((Ok(frame), rx))
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let operations: BTreeMap<&str, &str> = OPERATIONS
        .iter()
        .map(|op| (*op, "Available for all VMs"))
        .collect();

    Json(json!({
        "status": "healthy",
        "server_version": SERVER_VERSION,
        "cache_status": state.cache.status(),
        "supported_operations": operations,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn api_docs() -> Json<Value> {
    Json(json!({
        "api_version": SERVER_VERSION,
        "endpoints": {
            ACTION_PATH: {
                "description": "Perform operations on cloud VMs",
                "methods": ["GET"],
                "parameters": {
                    "vmname": {
                        "description": "Name of the VM (required)",
                        "example": "guedfocanoop01"
                    },
                    "operation": {
                        "description": "Operation to perform",
                        "default": "status",
                        "options": OPERATIONS,
                    },
                    "zone": {
                        "description": "Zone (optional, detected from the location cache if not provided)",
                        "example": "us-east4-a"
                    },
                    "format": {
                        "description": "Response format",
                        "default": "sse",
                        "options": ["sse", "json"]
                    }
                },
                "examples": [
                    "/gcp-action/?vmname=guedfocanoop01&operation=status",
                    "/gcp-action/?vmname=guedfocanoop01&operation=start&format=json",
                    "/gcp-action/?vmname=guedfocanoop01&operation=suspend&zone=us-east4-a"
                ]
            },
            "/health": { "description": "Health check endpoint", "methods": ["GET"] },
            "/api-docs": { "description": "This documentation", "methods": ["GET"] },
            "/v1/cache/status": { "description": "Location cache status", "methods": ["GET"] },
            "/v1/cache/hash": { "description": "Fingerprint of the current snapshot", "methods": ["GET"] },
            "/v1/cache/refresh": { "description": "Run a full refresh now", "methods": ["POST"] },
            "/v1/cache/vms/{name}": { "description": "Zone of a VM", "methods": ["GET"] },
            "/v1/zones": {
                "description": "Known zones",
                "methods": ["GET"],
                "parameters": { "pattern": "'|'-separated alternatives, '^' anchors a prefix" }
            },
            "/v1/operations": {
                "description": "Recent operations, newest first",
                "methods": ["GET"],
                "parameters": { "limit": DEFAULT_OPERATIONS_LIMIT, "vm": "filter by VM name" }
            }
        }
    }))
}

async fn cache_status(State(state): State<AppState>) -> Json<CacheStatusInfo> {
    Json(state.cache.status())
}

async fn cache_hash(State(state): State<AppState>) -> String {
    state.cache.snapshot().fingerprint().to_string()
}

async fn cache_refresh(State(state): State<AppState>) -> Result<Json<CacheStatusInfo>, ApiError> {
    state.cache.refresh().await?;
    Ok(Json(state.cache.status()))
}

async fn cache_lookup(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VmLocation>, ApiError> {
    let zone = state.cache.lookup(&name).await?;
    Ok(Json(VmLocation {
        name: normalize_name(&name).to_string(),
        zone,
    }))
}

async fn zones(State(state): State<AppState>, Query(params): Query<ZonesQuery>) -> Json<Vec<String>> {
    let pattern = params.pattern.unwrap_or_default();
    Json(state.cache.zone_directory().filter_zones(&pattern).await)
}

async fn operations(
    State(state): State<AppState>,
    Query(params): Query<OperationsQuery>,
) -> Result<Json<Vec<OperationRecord>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_OPERATIONS_LIMIT)
        .clamp(1, MAX_OPERATIONS_LIMIT);

    let records = match params.vm.filter(|vm| !vm.is_empty()) {
        Some(vm) => state.oplog.for_vm(vm, limit).await,
        None => state.oplog.recent(limit).await,
    };

    records.map(Json).map_err(|e| {
        tracing::error!("Failed to query operations: {}", e);
        ApiError::Internal("Failed to query operations".to_string())
    })
}
