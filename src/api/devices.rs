use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::error_response;
use crate::{db::queries, overrides::PolicyRequest, AppState};

#[derive(Deserialize)]
pub struct GatewayRequest {
    #[serde(default = "default_true")]
    pub is_gateway: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ParentRequest {
    /// `null` hands the device back to automatic inference.
    pub parent_ip: Option<String>,
}

/// GET /api/devices/:id
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let device = match queries::get_device(&state.pool, &id).await {
        Ok(Some(device)) => device,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Device not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let policy = queries::get_notification_policy(&state.pool, &id)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Notification policy for {} unreadable: {}", id, e);
            None
        });

    let ip_history = device.ip_history();
    Json(serde_json::json!({
        "device": device,
        "ip_history": ip_history,
        "notification_policy": policy,
    }))
    .into_response()
}

/// DELETE /api/devices/:id  (virtual switches only)
pub async fn delete_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.overrides.delete_virtual_switch(&id).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/devices/:id/gateway
pub async fn set_gateway(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<GatewayRequest>,
) -> impl IntoResponse {
    match state.overrides.set_gateway(&id, req.is_gateway).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PUT /api/devices/:id/parent
pub async fn set_parent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ParentRequest>,
) -> impl IntoResponse {
    match state.overrides.set_parent(&id, req.parent_ip.as_deref()).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/devices/:id/accept-address
pub async fn accept_address(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.overrides.accept_current_address(&id).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PUT /api/devices/:id/notifications
pub async fn set_notifications(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PolicyRequest>,
) -> impl IntoResponse {
    match state.overrides.set_notification_policy(&id, req).await {
        Ok(policy) => Json(policy).into_response(),
        Err(e) => e.into_response(),
    }
}
