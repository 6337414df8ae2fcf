pub mod infer;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;

use crate::db::models::{Device, ForwardingEntry, ManagedSwitch};
use crate::db::{parse_timestamp, queries, timestamp};
use crate::ingest::normalize_mac;
use crate::locks::KeyedLocks;
use crate::ws::WsEvent;
use infer::{infer_switch, SiteTables};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologySummary {
    pub switch_id: String,
    pub entries: usize,
    pub rejected: usize,
    pub edges: usize,
    pub virtual_switches_created: usize,
}

/// A node of the site topology as served to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyNode {
    pub id: String,
    pub label: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub device_type: Option<String>,
    pub status: String,
    pub parent_id: Option<String>,
    pub port: Option<String>,
    pub is_gateway: bool,
    pub is_virtual: bool,
    pub managed_switch_id: Option<String>,
}

/// Topology service: caches switch forwarding tables and derives parent/port edges
pub struct TopologyService {
    pool: SqlitePool,
    event_tx: broadcast::Sender<WsEvent>,
    switch_locks: KeyedLocks,
}

impl TopologyService {
    pub fn new(pool: SqlitePool, event_tx: broadcast::Sender<WsEvent>) -> Self {
        TopologyService {
            pool,
            event_tx,
            switch_locks: KeyedLocks::new(),
        }
    }

    /// Registers a managed switch, anchoring it to the device at its address
    /// (a MAC-less placeholder when the address has not been scanned yet).
    /// Registering the same address twice returns the existing switch.
    pub async fn register_switch(&self, site_id: &str, name: String, ip: String) -> Result<ManagedSwitch> {
        let existing = queries::list_site_switches(&self.pool, site_id).await?;
        if let Some(switch) = existing.into_iter().find(|s| s.ip == ip) {
            return Ok(switch);
        }

        let device = self.anchor_device(site_id, &ip).await?;
        let mut switch = ManagedSwitch::new(site_id, name, ip);
        switch.device_id = Some(device.id);
        switch.seq = queries::insert_switch(&self.pool, &switch).await?;

        tracing::info!("Registered managed switch {} ({}) at site {}", switch.name, switch.ip, site_id);
        Ok(switch)
    }

    async fn anchor_device(&self, site_id: &str, ip: &str) -> Result<Device> {
        if let Some(device) = queries::find_device_by_ip(&self.pool, site_id, ip).await? {
            return Ok(device);
        }
        let mut device = Device::new(site_id, Some(ip.to_string()), None, Utc::now());
        device.device_type = Some("switch".into());
        queries::insert_device(&self.pool, &device).await?;
        tracing::debug!("Created placeholder device {} for switch at {}", device.id, ip);
        Ok(device)
    }

    /// Replaces the cached table of one switch and re-infers the site.
    /// Returns `None` for an unknown switch.
    pub async fn ingest_forwarding_table(
        &self,
        switch_id: &str,
        table: &HashMap<String, String>,
    ) -> Result<Option<TopologySummary>> {
        let guard = self.switch_locks.lock(switch_id).await;
        let Some(switch) = queries::get_switch(&self.pool, switch_id).await? else {
            return Ok(None);
        };

        let mut entries: BTreeMap<String, ForwardingEntry> = BTreeMap::new();
        let mut rejected = 0;
        for (raw_mac, port) in table {
            let port = port.trim();
            match normalize_mac(raw_mac) {
                Some(mac) if !port.is_empty() => {
                    entries.insert(
                        mac.clone(),
                        ForwardingEntry {
                            switch_id: switch.id.clone(),
                            mac,
                            port: port.to_string(),
                        },
                    );
                }
                _ => {
                    tracing::warn!("Dropping forwarding entry {:?} -> {:?} from {}", raw_mac, port, switch.name);
                    rejected += 1;
                }
            }
        }
        let entries: Vec<ForwardingEntry> = entries.into_values().collect();
        queries::replace_forwarding_table(&self.pool, &switch.id, &entries, &timestamp(Utc::now())).await?;
        drop(guard);

        let mut summary = self.infer_site(&switch).await?;
        summary.entries = entries.len();
        summary.rejected = rejected;
        Ok(Some(summary))
    }

    /// Re-infers every polled switch of `changed`'s site in registration
    /// order, so the outcome does not depend on which table arrived last.
    /// Only a failure for `changed` itself is returned.
    async fn infer_site(&self, changed: &ManagedSwitch) -> Result<TopologySummary> {
        let mut total = TopologySummary {
            switch_id: changed.id.clone(),
            ..Default::default()
        };
        for switch in queries::list_site_switches(&self.pool, &changed.site_id).await? {
            if switch.last_polled_at.is_none() {
                continue;
            }
            let _guard = self.switch_locks.lock(&switch.id).await;
            let (id, name) = (switch.id.clone(), switch.name.clone());
            match self.infer_and_apply(switch).await {
                Ok(summary) => {
                    total.edges += summary.edges;
                    total.virtual_switches_created += summary.virtual_switches_created;
                }
                Err(e) if id == changed.id => return Err(e),
                Err(e) => tracing::warn!("Topology pass for {} failed: {:#}", name, e),
            }
        }
        Ok(total)
    }

    /// Re-runs inference for every switch with a fresh enough cached table.
    /// One switch failing does not stop the others.
    pub async fn refresh_all(&self, stale_after: Duration) -> Result<usize> {
        let cutoff = Utc::now() - stale_after;
        let mut refreshed = 0;

        for switch in queries::list_switches(&self.pool).await? {
            let fresh = switch
                .last_polled_at
                .as_deref()
                .and_then(parse_timestamp)
                .is_some_and(|at| at >= cutoff);
            if !fresh {
                tracing::debug!("Skipping stale forwarding table of {}", switch.name);
                continue;
            }

            let _guard = self.switch_locks.lock(&switch.id).await;
            let name = switch.name.clone();
            match self.infer_and_apply(switch).await {
                Ok(_) => refreshed += 1,
                Err(e) => tracing::warn!("Topology refresh for {} failed: {:#}", name, e),
            }
        }
        Ok(refreshed)
    }

    async fn infer_and_apply(&self, mut switch: ManagedSwitch) -> Result<TopologySummary> {
        let mut devices = queries::list_site_devices(&self.pool, &switch.site_id).await?;

        // The anchor may have been merged away by a scan; re-find it by address.
        let anchored = switch
            .device_id
            .as_deref()
            .is_some_and(|id| devices.iter().any(|d| d.id == id));
        if !anchored {
            let device = self.anchor_device(&switch.site_id, &switch.ip).await?;
            queries::set_switch_device(&self.pool, &switch.id, &device.id).await?;
            switch.device_id = Some(device.id);
            devices = queries::list_site_devices(&self.pool, &switch.site_id).await?;
        }

        let switches = queries::list_site_switches(&self.pool, &switch.site_id).await?;
        let entries = queries::list_site_forwarding_entries(&self.pool, &switch.site_id).await?;
        let tables = SiteTables::from_entries(&entries);

        let plan = infer_switch(&switch, &switches, &tables, &devices, Utc::now())
            .with_context(|| format!("inferring topology for {}", switch.name))?;

        let mut summary = TopologySummary {
            switch_id: switch.id.clone(),
            ..Default::default()
        };
        for vs in &plan.virtual_switches {
            match queries::insert_device(&self.pool, vs).await {
                Ok(()) => {
                    summary.virtual_switches_created += 1;
                    tracing::info!(
                        "Created virtual switch behind {} port {}",
                        switch.name,
                        vs.virtual_port.as_deref().unwrap_or("?")
                    );
                }
                Err(e) => tracing::warn!("Failed to create virtual switch for {}: {}", switch.name, e),
            }
        }
        for edge in &plan.edges {
            match queries::set_inferred_parent(&self.pool, &edge.device_id, &edge.parent_id, edge.port.as_deref()).await {
                Ok(true) => summary.edges += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to set parent of {}: {}", edge.device_id, e),
            }
        }
        if let Some(anchor) = switch.device_id.as_deref() {
            for id in &plan.detached {
                match queries::clear_inferred_parent(&self.pool, id, anchor).await {
                    Ok(true) => {
                        summary.edges += 1;
                        tracing::debug!("Detached {} from {}", id, switch.name);
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Failed to detach {} from {}: {}", id, switch.name, e),
                }
            }
        }

        if summary.edges > 0 || summary.virtual_switches_created > 0 {
            tracing::info!(
                "Topology for {}: {} edges, {} virtual switches created",
                switch.name,
                summary.edges,
                summary.virtual_switches_created
            );
            let _ = self.event_tx.send(WsEvent::TopologyUpdated {
                site_id: switch.site_id.clone(),
                switch_id: switch.id.clone(),
                edges: summary.edges,
                virtual_switches_created: summary.virtual_switches_created,
            });
        }
        Ok(summary)
    }

    pub async fn site_topology(&self, site_id: &str) -> Result<Vec<TopologyNode>> {
        let devices = queries::list_site_devices(&self.pool, site_id).await?;
        let switches = queries::list_site_switches(&self.pool, site_id).await?;
        let managed: HashMap<&str, &str> = switches
            .iter()
            .filter_map(|s| s.device_id.as_deref().map(|d| (d, s.id.as_str())))
            .collect();

        Ok(devices
            .into_iter()
            .map(|d| TopologyNode {
                label: d
                    .label_title
                    .clone()
                    .or_else(|| d.hostname.clone())
                    .or_else(|| d.ip.clone())
                    .or_else(|| d.mac.clone())
                    .unwrap_or_else(|| d.id.clone()),
                managed_switch_id: managed.get(d.id.as_str()).map(|s| s.to_string()),
                id: d.id,
                ip: d.ip,
                mac: d.mac,
                device_type: d.device_type,
                status: d.status,
                parent_id: d.parent_id,
                port: d.port,
                is_gateway: d.is_gateway,
                is_virtual: d.is_virtual,
            })
            .collect())
    }
}
