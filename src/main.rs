use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netmap_backend::{
    build_router, build_state,
    config::Config,
    db,
    labels::{FileLabelDirectory, HttpLabelDirectory, LabelDirectory, NoLabels},
    notify::{LogNotifier, Notifier, WebhookNotifier},
    sweep,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netmap_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("=== Network device catalog starting ===");

    let config = Config::from_env()?;

    // Database
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
    tracing::info!("Database ready");

    // Outbound collaborators
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            tracing::info!("Notifications go to webhook {}", url);
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => {
            tracing::info!("No NOTIFY_WEBHOOK_URL set, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };
    let labels: Arc<dyn LabelDirectory> = match (&config.label_service_url, &config.label_file) {
        (Some(url), _) => Arc::new(HttpLabelDirectory::new(url.clone(), config.label_timeout)?),
        (None, Some(path)) => Arc::new(FileLabelDirectory::load(path).await?),
        (None, None) => {
            tracing::info!("No label directory configured, devices stay unlabelled");
            Arc::new(NoLabels)
        }
    };

    // App state
    let state = build_state(config.clone(), pool.clone(), notifier, labels);

    // Periodic jobs: silent sites, IP conflicts, topology refresh
    sweep::spawn_background_jobs(
        &config,
        pool,
        state.dispatcher.clone(),
        state.topology.clone(),
        state.probes.clone(),
    );

    // Build router
    let app = build_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
