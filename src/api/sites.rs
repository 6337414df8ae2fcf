use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error_response;
use crate::{
    db::{models::Site, queries},
    ingest::RawObservation,
    pending::PendingProbe,
    ws::WsEvent,
    AppState,
};

#[derive(Deserialize)]
pub struct RegisterSiteRequest {
    pub name: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_minutes: i64,
}

fn default_scan_interval() -> i64 {
    15
}

#[derive(Deserialize, Default)]
pub struct HeartbeatRequest {
    pub agent_version: Option<String>,
    pub probe_token: Option<String>,
}

#[derive(Deserialize)]
pub struct ScanRequest {
    #[serde(alias = "devices")]
    pub observations: Vec<RawObservation>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

async fn require_site(state: &AppState, id: &str) -> Result<Site, axum::response::Response> {
    match queries::get_site(&state.pool, id).await {
        Ok(Some(site)) => Ok(site),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Site not found")),
        Err(e) => Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

/// POST /api/sites
pub async fn register_site(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterSiteRequest>,
) -> impl IntoResponse {
    let name = req.name.trim();
    if name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Site name is required");
    }
    let site = Site::new(name.to_string(), req.scan_interval_minutes.max(1));
    match queries::insert_site(&state.pool, &site).await {
        Ok(()) => {
            tracing::info!("Registered site {} ({})", site.name, site.id);
            (StatusCode::CREATED, Json(site)).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// GET /api/sites/:id/status
pub async fn site_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let site = match require_site(&state, &id).await {
        Ok(site) => site,
        Err(resp) => return resp,
    };
    match queries::count_site_devices(&state.pool, &id).await {
        Ok((online, offline)) => Json(serde_json::json!({
            "site": site,
            "devices": {
                "online": online,
                "offline": offline,
                "total": online + offline,
            },
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// POST /api/sites/:id/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    match state.scans.record_heartbeat(&id, req.agent_version.as_deref()).await {
        Ok(true) => {}
        Ok(false) => return error_response(StatusCode::NOT_FOUND, "Site not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }

    let probe = req.probe_token.map(|token| match state.probes.take(&token) {
        Some((pending, age)) if pending.site_id == id => {
            let round_trip_ms = age.as_millis() as u64;
            tracing::info!("Probe {} answered by site {} after {} ms", token, id, round_trip_ms);
            let _ = state.event_tx.send(WsEvent::ProbeAcknowledged {
                site_id: id.clone(),
                token,
                round_trip_ms,
            });
            "acknowledged"
        }
        _ => {
            tracing::warn!("Site {} echoed an unknown or expired probe token", id);
            "rejected"
        }
    });

    Json(serde_json::json!({ "ok": true, "probe": probe })).into_response()
}

/// POST /api/sites/:id/scan
pub async fn submit_scan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    if let Err(resp) = require_site(&state, &id).await {
        return resp;
    }
    match state.scans.ingest_scan(&id, &req.observations).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!("Scan for site {} failed: {:#}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// GET /api/sites/:id/devices
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(resp) = require_site(&state, &id).await {
        return resp;
    }
    match queries::list_site_devices(&state.pool, &id).await {
        Ok(devices) => Json(serde_json::json!({ "devices": devices })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// GET /api/sites/:id/events?limit=N
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    if let Err(resp) = require_site(&state, &id).await {
        return resp;
    }
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match queries::list_site_events(&state.pool, &id, limit).await {
        Ok(events) => Json(serde_json::json!({ "events": events })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// GET /api/sites/:id/topology
pub async fn topology(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(resp) = require_site(&state, &id).await {
        return resp;
    }
    match state.topology.site_topology(&id).await {
        Ok(nodes) => Json(serde_json::json!({ "nodes": nodes })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// POST /api/sites/:id/probe
pub async fn request_probe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(resp) = require_site(&state, &id).await {
        return resp;
    }
    let token = Uuid::new_v4().to_string();
    state
        .probes
        .insert(token.clone(), PendingProbe { site_id: id.clone() });
    tracing::debug!("Issued probe {} for site {}", token, id);

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "token": token,
            "expires_in_secs": state.config.probe_ttl.as_secs(),
        })),
    )
        .into_response()
}
