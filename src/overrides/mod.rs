use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;

use crate::db::models::{Device, NotificationPolicyRow};
use crate::db::queries;
use crate::error::OverrideError;
use crate::notify::policy::{format_weekday, parse_time, parse_weekdays, MAX_GRACE_MINUTES};
use crate::ws::WsEvent;

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRequest {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Active weekdays; with `expected_time` this switches the device to scheduled mode.
    pub weekdays: Option<Vec<String>>,
    pub expected_time: Option<String>,
    pub grace_minutes: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

/// Override service: operator edits layered on top of automatic inference
pub struct OverrideService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
}

impl OverrideService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        OverrideService { pool, event_tx }
    }

    async fn load(&self, id: &str) -> Result<Device, OverrideError> {
        queries::get_device(&self.pool, id)
            .await?
            .ok_or_else(|| OverrideError::DeviceNotFound(id.to_string()))
    }

    /// Re-reads the device and tells live clients about the edit.
    async fn finish(&self, device: &Device, action: &str) -> Result<Device, OverrideError> {
        tracing::info!("Override on {}: {}", device.id, action);
        let _ = self.event_tx.send(WsEvent::DeviceOverridden {
            site_id: device.site_id.clone(),
            device_id: device.id.clone(),
            action: action.to_string(),
        });
        self.load(&device.id).await
    }

    pub async fn set_gateway(&self, id: &str, is_gateway: bool) -> Result<Device, OverrideError> {
        let device = self.load(id).await?;
        queries::set_gateway(&self.pool, id, is_gateway).await?;
        self.finish(&device, if is_gateway { "gateway_set" } else { "gateway_cleared" })
            .await
    }

    /// Pins the parent to the device at `parent_ip`, or hands the device back
    /// to automatic inference when `parent_ip` is `None`.
    pub async fn set_parent(&self, id: &str, parent_ip: Option<&str>) -> Result<Device, OverrideError> {
        let device = self.load(id).await?;

        let Some(ip) = parent_ip.map(str::trim).filter(|ip| !ip.is_empty()) else {
            queries::set_manual_parent(&self.pool, id, None).await?;
            return self.finish(&device, "parent_cleared").await;
        };

        let parent = queries::find_device_by_ip(&self.pool, &device.site_id, ip)
            .await?
            .ok_or_else(|| OverrideError::ParentNotFound { ip: ip.to_string() })?;
        if parent.id == device.id {
            return Err(OverrideError::SelfParent);
        }

        let devices = queries::list_site_devices(&self.pool, &device.site_id).await?;
        let parents: HashMap<&str, Option<&str>> = devices
            .iter()
            .map(|d| (d.id.as_str(), d.parent_id.as_deref()))
            .collect();
        if is_ancestor(&parents, &device.id, &parent.id) {
            return Err(OverrideError::Cycle {
                device: device.id.clone(),
                parent: parent.id.clone(),
            });
        }

        queries::set_manual_parent(&self.pool, id, Some(&parent.id)).await?;
        self.finish(&device, "parent_set").await
    }

    /// Marks the current IP/MAC as expected so later moves back to them stay quiet.
    pub async fn accept_current_address(&self, id: &str) -> Result<Device, OverrideError> {
        let device = self.load(id).await?;
        queries::accept_current_address(&self.pool, id).await?;
        self.finish(&device, "address_accepted").await
    }

    pub async fn set_notification_policy(
        &self,
        id: &str,
        req: PolicyRequest,
    ) -> Result<NotificationPolicyRow, OverrideError> {
        let device = self.load(id).await?;

        let weekdays = match &req.weekdays {
            Some(days) => {
                let parsed = parse_weekdays(&days.join(","))
                    .map_err(|e| OverrideError::InvalidPolicy(e.to_string()))?;
                Some(parsed.into_iter().map(format_weekday).collect::<Vec<_>>().join(","))
            }
            None => None,
        };
        let expected_time = match &req.expected_time {
            Some(time) => Some(
                parse_time(time)
                    .map_err(|e| OverrideError::InvalidPolicy(e.to_string()))?
                    .format("%H:%M")
                    .to_string(),
            ),
            None => None,
        };
        if weekdays.is_some() != expected_time.is_some() {
            return Err(OverrideError::InvalidPolicy(
                "weekdays and expected_time must be set together".into(),
            ));
        }
        if req.grace_minutes.is_some_and(|g| !(0..=MAX_GRACE_MINUTES).contains(&g)) {
            return Err(OverrideError::InvalidPolicy(format!(
                "grace_minutes must be between 0 and {MAX_GRACE_MINUTES}"
            )));
        }

        let row = NotificationPolicyRow {
            device_id: device.id.clone(),
            enabled: req.enabled,
            weekdays,
            expected_time,
            grace_minutes: req.grace_minutes,
        };
        queries::upsert_notification_policy(&self.pool, &row).await?;
        self.finish(&device, "notifications_updated").await?;
        Ok(row)
    }

    /// Only synthesized switches can be removed; their children are detached
    /// and picked up again by the next inference pass.
    pub async fn delete_virtual_switch(&self, id: &str) -> Result<(), OverrideError> {
        let device = self.load(id).await?;
        if !device.is_virtual {
            return Err(OverrideError::NotVirtual(id.to_string()));
        }
        queries::detach_children(&self.pool, id).await?;
        queries::delete_device(&self.pool, id).await?;

        tracing::info!("Deleted virtual switch {}", id);
        let _ = self.event_tx.send(WsEvent::DeviceOverridden {
            site_id: device.site_id,
            device_id: device.id,
            action: "deleted".into(),
        });
        Ok(())
    }
}

/// Whether `candidate` sits on the parent chain starting at `start`.
fn is_ancestor(parents: &HashMap<&str, Option<&str>>, candidate: &str, start: &str) -> bool {
    let mut seen = HashSet::new();
    let mut cursor = Some(start);
    while let Some(id) = cursor {
        if id == candidate {
            return true;
        }
        if !seen.insert(id) {
            return false;
        }
        cursor = parents.get(id).copied().flatten();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_walk_finds_loops_and_stops_on_corrupt_chains() {
        let parents: HashMap<&str, Option<&str>> = [
            ("a", None),
            ("b", Some("a")),
            ("c", Some("b")),
            ("x", Some("y")),
            ("y", Some("x")),
        ]
        .into_iter()
        .collect();

        assert!(is_ancestor(&parents, "a", "c"));
        assert!(is_ancestor(&parents, "c", "c"));
        assert!(!is_ancestor(&parents, "c", "a"));
        assert!(!is_ancestor(&parents, "a", "x"));
    }
}
