pub mod policy;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::Client;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::db::{models::ChangeEvent, queries};
use crate::ws::WsEvent;
use policy::NotificationPolicy;

/// What gets handed to the external dispatcher. Formatting is its business.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    DeviceChange { event: ChangeEvent },
    SiteSilent { site_id: String, name: String, last_report_at: Option<String> },
    IpConflict { site_id: String, ip: String, macs: Vec<String> },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        tracing::info!("Notification: {:?}", notification);
        Ok(())
    }
}

/// POSTs each notification as JSON.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(WebhookNotifier { url, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fire-and-forget: the notification is attempted once and a failure is only logged.
pub fn spawn_notify(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!("Notification dispatch failed: {}", e);
        }
    });
}

/// Stores change events, gates them through each device's policy, and fans
/// them out to live clients and the notifier.
#[derive(Clone)]
pub struct EventDispatcher {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    notifier: Arc<dyn Notifier>,
    schedule_offset: FixedOffset,
    notify_unconfigured: bool,
}

impl EventDispatcher {
    pub fn new(
        pool: SqlitePool,
        event_tx: broadcast::Sender<WsEvent>,
        notifier: Arc<dyn Notifier>,
        schedule_offset: FixedOffset,
        notify_unconfigured: bool,
    ) -> Self {
        EventDispatcher {
            pool,
            event_tx,
            notifier,
            schedule_offset,
            notify_unconfigured,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn broadcast(&self, event: WsEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Each event is handled on its own; one failing insert does not stop
    /// the rest. Returns how many were stored.
    pub async fn dispatch(&self, events: Vec<ChangeEvent>, now: DateTime<Utc>) -> usize {
        let local_now = now.with_timezone(&self.schedule_offset).naive_local();
        let mut stored = 0;

        for event in events {
            let notify = match self.policy_for(&event.device_id).await {
                Ok(Some(policy)) => policy.should_notify(event.kind, local_now),
                Ok(None) => self.notify_unconfigured,
                Err(e) => {
                    tracing::warn!("Notification policy for {} unreadable: {}", event.device_id, e);
                    false
                }
            };

            if let Err(e) = queries::insert_change_event(&self.pool, &event, notify).await {
                tracing::warn!(
                    "Failed to store {} event for {}: {}",
                    event.kind.as_str(),
                    event.device_id,
                    e
                );
                continue;
            }
            stored += 1;

            self.broadcast(WsEvent::DeviceChanged {
                site_id: event.site_id.clone(),
                device_id: event.device_id.clone(),
                kind: event.kind,
                old_value: event.old_value.clone(),
                new_value: event.new_value.clone(),
                detected_at: event.detected_at.clone(),
                notified: notify,
            });

            if notify {
                spawn_notify(&self.notifier, Notification::DeviceChange { event });
            }
        }

        stored
    }

    async fn policy_for(&self, device_id: &str) -> Result<Option<NotificationPolicy>> {
        queries::get_notification_policy(&self.pool, device_id)
            .await?
            .map(|row| NotificationPolicy::from_row(&row))
            .transpose()
    }
}
