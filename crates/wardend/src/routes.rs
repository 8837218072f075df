//! API routes for wardend
//!
//! Agent-facing: rule sync, registration, heartbeat, drift push.

use crate::pipeline::Disposition;
use crate::server::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use warden_common::fleet::{DriftEvent, HeartbeatRequest, RegisterRequest, RegisterResponse};
use warden_common::learning::RuleSyncResponse;
use warden_common::WardenError;

type AppStateArc = Arc<AppState>;
type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn api_error(e: WardenError) -> (StatusCode, String) {
    let status = match &e {
        WardenError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        WardenError::Registry(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub agents: usize,
    pub catalog_version: u64,
}

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        agents: state.fleet.len(),
        catalog_version: state.catalog.version(),
    })
}

// ============================================================================
// Rule sync
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub site_id: String,
}

pub fn rule_routes() -> Router<AppStateArc> {
    Router::new().route("/api/rules/sync", get(sync_rules))
}

async fn sync_rules(State(state): State<AppStateArc>, Query(query): Query<SyncQuery>) -> ApiResult<RuleSyncResponse> {
    if query.site_id != state.site_id {
        return Err((StatusCode::NOT_FOUND, format!("unknown site {}", query.site_id)));
    }
    RuleSyncResponse::build(&state.catalog, &state.site_id, state.agent_config.clone())
        .map(Json)
        .map_err(api_error)
}

// ============================================================================
// Agents
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub acknowledged: bool,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriftAck {
    pub accepted: bool,
    pub check_name: String,
    pub status: String,
}

pub fn agent_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/agents/register", post(register))
        .route("/api/agents/heartbeat", post(heartbeat))
        .route("/api/agents/drift", post(drift))
}

async fn register(State(state): State<AppStateArc>, Json(req): Json<RegisterRequest>) -> ApiResult<RegisterResponse> {
    info!("Registration from {}", req.hostname);
    // Certificate issuance touches disk
    let fleet = state.fleet.clone();
    tokio::task::spawn_blocking(move || fleet.register(req))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .map_err(api_error)
}

async fn heartbeat(State(state): State<AppStateArc>, Json(req): Json<HeartbeatRequest>) -> ApiResult<HeartbeatAck> {
    state.fleet.heartbeat(&req.agent_id, req.timestamp).map_err(api_error)?;
    Ok(Json(HeartbeatAck {
        acknowledged: true,
        server_time: Utc::now(),
    }))
}

/// Accept the event and run it through the pipeline in the background
async fn drift(
    State(state): State<AppStateArc>,
    Json(event): Json<DriftEvent>,
) -> Result<(StatusCode, Json<DriftAck>), (StatusCode, String)> {
    let result = state.fleet.ingest_drift(event).map_err(api_error)?;
    let ack = DriftAck {
        accepted: true,
        check_name: result.check_name.clone(),
        status: result.status.to_string(),
    };

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let host = result.host_id.clone();
        let check = result.check_name.clone();
        if let Disposition::Remediated(outcome) = pipeline.process(result).await {
            if !outcome.success {
                warn!("Remote {} on {} not healed: {:?}", check, host, outcome.terminal_state);
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(ack)))
}
