pub mod devices;
pub mod sites;
pub mod switches;
pub mod ws_handler;

use axum::{http::StatusCode, response::IntoResponse, Json};

pub(crate) fn error_response(status: StatusCode, message: impl ToString) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}
