pub mod plan;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{models::ChangeEvent, queries, timestamp};
use crate::ingest::{normalize_batch, RawObservation};
use crate::labels::{fetch_labels, LabelDirectory};
use crate::locks::KeyedLocks;
use crate::notify::EventDispatcher;
use crate::ws::WsEvent;
use plan::{plan_batch, BatchPlan};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub accepted: usize,
    pub dropped: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub events: usize,
    pub failed_rows: usize,
}

/// Scan service: reconciles agent batches into the device catalog.
pub struct ScanService {
    pool: SqlitePool,
    dispatcher: EventDispatcher,
    labels: Arc<dyn LabelDirectory>,
    label_timeout: Duration,
    site_locks: KeyedLocks,
}

impl ScanService {
    pub fn new(
        pool: SqlitePool,
        dispatcher: EventDispatcher,
        labels: Arc<dyn LabelDirectory>,
        label_timeout: Duration,
    ) -> Self {
        ScanService {
            pool,
            dispatcher,
            labels,
            label_timeout,
            site_locks: KeyedLocks::new(),
        }
    }

    /// Normalizes, resolves and persists one batch. Passes for the same site
    /// are serialized; different sites run side by side.
    pub async fn ingest_scan(&self, site_id: &str, raw: &[RawObservation]) -> Result<BatchSummary> {
        let _guard = self.site_locks.lock(site_id).await;
        let now = Utc::now();

        let (observations, report) = normalize_batch(raw);
        let Some(previous) = queries::touch_site_report(&self.pool, site_id, &timestamp(now), None).await? else {
            bail!("site {site_id} not found");
        };
        if previous != "online" {
            self.announce_site_online(site_id).await;
        }

        let snapshot = queries::list_site_devices(&self.pool, site_id).await?;
        let mut macs: Vec<String> = observations.iter().filter_map(|o| o.mac.clone()).collect();
        macs.sort();
        macs.dedup();
        let labels = fetch_labels(&self.labels, &macs, self.label_timeout).await;

        let plan = plan_batch(site_id, &observations, snapshot, &labels, now);
        let mut summary = BatchSummary {
            accepted: report.accepted,
            dropped: report.dropped,
            ..Default::default()
        };
        let events = self.apply(plan, &mut summary).await;
        summary.events = self.dispatcher.dispatch(events, now).await;

        tracing::info!(
            "Site {}: {} observations ({} dropped), {} new, {} updated, {} removed, {} events",
            site_id,
            summary.accepted,
            summary.dropped,
            summary.created,
            summary.updated,
            summary.deleted,
            summary.events
        );

        self.dispatcher.broadcast(WsEvent::ScanProcessed {
            site_id: site_id.to_string(),
            accepted: summary.accepted,
            dropped: summary.dropped,
            created: summary.created,
            updated: summary.updated,
            deleted: summary.deleted,
            events: summary.events,
        });

        Ok(summary)
    }

    /// Agent heartbeat: keeps the site online between scans. Returns false
    /// for an unknown site.
    pub async fn record_heartbeat(&self, site_id: &str, agent_version: Option<&str>) -> Result<bool> {
        let now = timestamp(Utc::now());
        let previous = queries::touch_site_report(&self.pool, site_id, &now, agent_version).await?;
        match previous.as_deref() {
            None => Ok(false),
            Some("online") => Ok(true),
            Some(_) => {
                self.announce_site_online(site_id).await;
                Ok(true)
            }
        }
    }

    async fn announce_site_online(&self, site_id: &str) {
        match queries::get_site(&self.pool, site_id).await {
            Ok(Some(site)) => {
                tracing::info!("Site {} ({}) is reporting again", site.name, site.id);
                self.dispatcher.broadcast(WsEvent::SiteStatus {
                    site_id: site.id,
                    name: site.name,
                    status: "online".into(),
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to load site {}: {}", site_id, e),
        }
    }

    /// Applies the plan row by row. A failing row is logged and skipped, and
    /// events for rows that could not be written are dropped.
    async fn apply(&self, plan: BatchPlan, summary: &mut BatchSummary) -> Vec<ChangeEvent> {
        let mut failed: Vec<String> = Vec::new();

        for device in &plan.inserts {
            match queries::insert_device(&self.pool, device).await {
                Ok(()) => summary.created += 1,
                Err(e) => {
                    tracing::warn!("Failed to insert device {:?}/{:?}: {}", device.ip, device.mac, e);
                    failed.push(device.id.clone());
                }
            }
        }

        for device in &plan.updates {
            match queries::update_reconciled_device(&self.pool, device).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => {
                    tracing::debug!("Device {} has a fresher write, leaving it", device.id);
                    failed.push(device.id.clone());
                }
                Err(e) => {
                    tracing::warn!("Failed to update device {}: {}", device.id, e);
                    failed.push(device.id.clone());
                }
            }
        }

        for (removed, survivor) in &plan.reparented {
            if let Err(e) = queries::reparent_children(&self.pool, removed, survivor).await {
                tracing::warn!("Failed to move children of {} to {}: {}", removed, survivor, e);
            }
            if let Err(e) = queries::reassign_events(&self.pool, removed, survivor).await {
                tracing::warn!("Failed to move events of {} to {}: {}", removed, survivor, e);
            }
        }

        for id in &plan.deletions {
            match queries::delete_device(&self.pool, id).await {
                Ok(()) => summary.deleted += 1,
                Err(e) => tracing::warn!("Failed to delete duplicate device {}: {}", id, e),
            }
        }

        summary.failed_rows = failed.len();
        plan.events
            .into_iter()
            .filter(|e| !failed.contains(&e.device_id))
            .collect()
    }
}
