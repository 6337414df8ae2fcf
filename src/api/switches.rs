use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use super::error_response;
use crate::{db::queries, AppState};

#[derive(Deserialize)]
pub struct RegisterSwitchRequest {
    pub name: String,
    pub ip: String,
}

/// MAC → port, as read from the switch.
#[derive(Deserialize)]
pub struct ForwardingTableRequest {
    pub entries: HashMap<String, String>,
}

/// POST /api/sites/:id/switches
pub async fn register_switch(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    Json(req): Json<RegisterSwitchRequest>,
) -> impl IntoResponse {
    let ip = req.ip.trim();
    if ip.parse::<IpAddr>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, format!("Invalid IP address: {}", req.ip));
    }
    match queries::get_site(&state.pool, &site_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Site not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }

    match state
        .topology
        .register_switch(&site_id, req.name.trim().to_string(), ip.to_string())
        .await
    {
        Ok(switch) => (StatusCode::CREATED, Json(switch)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// PUT /api/switches/:id/forwarding
pub async fn submit_forwarding_table(
    State(state): State<Arc<AppState>>,
    Path(switch_id): Path<String>,
    Json(req): Json<ForwardingTableRequest>,
) -> impl IntoResponse {
    match state.topology.ingest_forwarding_table(&switch_id, &req.entries).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Switch not found"),
        Err(e) => {
            tracing::warn!("Forwarding table for {} not processed: {:#}", switch_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
