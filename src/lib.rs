pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod labels;
pub mod lifecycle;
pub mod locks;
pub mod notify;
pub mod overrides;
pub mod pending;
pub mod reconcile;
pub mod sweep;
pub mod topology;
pub mod ws;

use axum::{
    routing::{get, post, put},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::labels::LabelDirectory;
use crate::notify::{EventDispatcher, Notifier};
use crate::overrides::OverrideService;
use crate::pending::ProbeStore;
use crate::reconcile::ScanService;
use crate::topology::TopologyService;
use crate::ws::WsEvent;

// ─── App State ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub event_tx: broadcast::Sender<WsEvent>,
    pub config: Config,
    pub dispatcher: EventDispatcher,
    pub scans: Arc<ScanService>,
    pub topology: Arc<TopologyService>,
    pub overrides: Arc<OverrideService>,
    pub probes: Arc<ProbeStore>,
}

/// Wires the services around one pool and one broadcast channel.
pub fn build_state(
    config: Config,
    pool: SqlitePool,
    notifier: Arc<dyn Notifier>,
    labels: Arc<dyn LabelDirectory>,
) -> Arc<AppState> {
    let (event_tx, _) = broadcast::channel::<WsEvent>(256);

    let dispatcher = EventDispatcher::new(
        pool.clone(),
        event_tx.clone(),
        notifier,
        config.schedule_offset,
        config.notify_unconfigured,
    );
    let scans = Arc::new(ScanService::new(
        pool.clone(),
        dispatcher.clone(),
        labels,
        config.label_timeout,
    ));
    let topology = Arc::new(TopologyService::new(pool.clone(), event_tx.clone()));
    let overrides = Arc::new(OverrideService::new(pool.clone(), event_tx.clone()));
    let probes = Arc::new(ProbeStore::new(config.probe_ttl));

    Arc::new(AppState {
        pool,
        event_tx,
        config,
        dispatcher,
        scans,
        topology,
        overrides,
        probes,
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // WebSocket
        .route("/ws", get(api::ws_handler::ws_handler))
        // Sites (agents)
        .route("/api/sites", post(api::sites::register_site))
        .route("/api/sites/:id/status", get(api::sites::site_status))
        .route("/api/sites/:id/heartbeat", post(api::sites::heartbeat))
        .route("/api/sites/:id/scan", post(api::sites::submit_scan))
        .route("/api/sites/:id/devices", get(api::sites::list_devices))
        .route("/api/sites/:id/events", get(api::sites::list_events))
        .route("/api/sites/:id/topology", get(api::sites::topology))
        .route("/api/sites/:id/probe", post(api::sites::request_probe))
        .route("/api/sites/:id/switches", post(api::switches::register_switch))
        // Managed switches
        .route("/api/switches/:id/forwarding", put(api::switches::submit_forwarding_table))
        // Devices and manual overrides
        .route(
            "/api/devices/:id",
            get(api::devices::get_device).delete(api::devices::delete_device),
        )
        .route("/api/devices/:id/gateway", post(api::devices::set_gateway))
        .route("/api/devices/:id/parent", put(api::devices::set_parent))
        .route("/api/devices/:id/accept-address", post(api::devices::accept_address))
        .route("/api/devices/:id/notifications", put(api::devices::set_notifications))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
