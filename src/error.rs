use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Failures of interactive override calls. These are the only paths that
/// report a definite outcome back to the operator.
#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("no device with address {ip} at this site")]
    ParentNotFound { ip: String },
    #[error("device {0} is not a virtual switch")]
    NotVirtual(String),
    #[error("a device cannot be its own parent")]
    SelfParent,
    #[error("parenting {device} under {parent} would create a cycle")]
    Cycle { device: String, parent: String },
    #[error("invalid notification policy: {0}")]
    InvalidPolicy(String),
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl OverrideError {
    pub fn status(&self) -> StatusCode {
        match self {
            OverrideError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            OverrideError::ParentNotFound { .. }
            | OverrideError::SelfParent
            | OverrideError::InvalidPolicy(_) => StatusCode::BAD_REQUEST,
            OverrideError::NotVirtual(_) | OverrideError::Cycle { .. } => StatusCode::CONFLICT,
            OverrideError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OverrideError {
    fn into_response(self) -> Response {
        if let OverrideError::Database(e) = &self {
            tracing::error!("Override failed: {:#}", e);
        }
        (
            self.status(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
