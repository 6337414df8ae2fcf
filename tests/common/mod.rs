#![allow(dead_code)]

use std::sync::Arc;

use netmap_backend::{
    build_state,
    config::Config,
    db::{self, models::Site, queries},
    ingest::RawObservation,
    labels::{LabelDirectory, NoLabels},
    notify::LogNotifier,
    AppState,
};

/// Fresh in-memory database with migrations applied. One connection, so
/// every query sees the same database.
pub async fn test_state() -> Arc<AppState> {
    test_state_with_labels(Arc::new(NoLabels)).await
}

pub async fn test_state_with_labels(labels: Arc<dyn LabelDirectory>) -> Arc<AppState> {
    let pool = db::init_pool("sqlite::memory:", 1).await.unwrap();
    build_state(Config::default(), pool, Arc::new(LogNotifier), labels)
}

pub async fn create_site(state: &AppState, name: &str) -> Site {
    let site = Site::new(name.to_string(), 15);
    queries::insert_site(&state.pool, &site).await.unwrap();
    site
}

pub fn raw(ip: &str, mac: &str) -> RawObservation {
    serde_json::from_value(serde_json::json!({ "ip": ip, "mac": mac, "reachable": true })).unwrap()
}

pub fn raw_json(value: serde_json::Value) -> RawObservation {
    serde_json::from_value(value).unwrap()
}
