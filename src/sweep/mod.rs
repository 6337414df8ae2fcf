use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::db::models::Device;
use crate::db::{parse_timestamp, queries, timestamp};
use crate::notify::{spawn_notify, EventDispatcher, Notification};
use crate::pending::ProbeStore;
use crate::topology::TopologyService;
use crate::ws::WsEvent;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IpConflict {
    pub site_id: String,
    pub ip: String,
    pub macs: Vec<String>,
}

/// Online devices sharing an address with different MACs, all seen within
/// `window`. A device sitting on its accepted address and MAC does not count.
pub fn find_ip_conflicts(devices: &[Device], now: DateTime<Utc>, window: Duration) -> Vec<IpConflict> {
    let cutoff = now - window;
    let mut by_ip: BTreeMap<(&str, &str), BTreeSet<&str>> = BTreeMap::new();

    for d in devices {
        let (Some(ip), Some(mac)) = (d.ip.as_deref(), d.mac.as_deref()) else {
            continue;
        };
        if d.is_virtual || !d.is_online() {
            continue;
        }
        if !parse_timestamp(&d.last_seen).is_some_and(|seen| seen >= cutoff) {
            continue;
        }
        if d.accepted_ip.as_deref() == Some(ip) && d.accepted_mac.as_deref() == Some(mac) {
            continue;
        }
        by_ip.entry((d.site_id.as_str(), ip)).or_default().insert(mac);
    }

    by_ip
        .into_iter()
        .filter(|(_, macs)| macs.len() > 1)
        .map(|((site_id, ip), macs)| IpConflict {
            site_id: site_id.to_string(),
            ip: ip.to_string(),
            macs: macs.into_iter().map(str::to_string).collect(),
        })
        .collect()
}

/// Conflicts already reported, per site, so a persisting conflict goes out
/// once. A conflict that clears and comes back is reported again.
#[derive(Default)]
pub struct ConflictTracker {
    reported: Mutex<HashMap<String, HashSet<IpConflict>>>,
}

impl ConflictTracker {
    /// Records the conflicts currently seen at `site_id` and returns the
    /// ones that were not seen on the previous sweep.
    pub fn update(&self, site_id: &str, current: Vec<IpConflict>) -> Vec<IpConflict> {
        let mut reported = self.reported.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = reported.remove(site_id).unwrap_or_default();
        let fresh = current
            .iter()
            .filter(|c| !previous.contains(*c))
            .cloned()
            .collect();
        if !current.is_empty() {
            reported.insert(site_id.to_string(), current.into_iter().collect());
        }
        fresh
    }
}

/// Flips sites that stopped reporting to offline and tells the notifier.
pub async fn sweep_silent_sites(
    pool: &SqlitePool,
    dispatcher: &EventDispatcher,
    offline_after: Duration,
) -> Result<usize> {
    let cutoff = timestamp(Utc::now() - offline_after);
    let mut flipped = 0;

    for site in queries::list_silent_sites(pool, &cutoff).await? {
        // A report may have landed since the list was read.
        match queries::mark_site_offline_if_silent(pool, &site.id, &cutoff).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!("Failed to mark site {} offline: {}", site.id, e);
                continue;
            }
        }
        flipped += 1;
        tracing::warn!(
            "Site {} ({}) stopped reporting, last report {:?}",
            site.name,
            site.id,
            site.last_report_at
        );
        dispatcher.broadcast(WsEvent::SiteStatus {
            site_id: site.id.clone(),
            name: site.name.clone(),
            status: "offline".into(),
        });
        spawn_notify(
            dispatcher.notifier(),
            Notification::SiteSilent {
                site_id: site.id,
                name: site.name,
                last_report_at: site.last_report_at,
            },
        );
    }
    Ok(flipped)
}

/// Reports conflicts that are new since the last sweep; returns how many.
pub async fn sweep_ip_conflicts(
    pool: &SqlitePool,
    dispatcher: &EventDispatcher,
    tracker: &ConflictTracker,
    window: Duration,
) -> Result<usize> {
    let now = Utc::now();
    let mut found = 0;

    for site in queries::list_sites(pool).await? {
        let devices = match queries::list_site_devices(pool, &site.id).await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Skipping conflict check for site {}: {}", site.id, e);
                continue;
            }
        };
        let conflicts = find_ip_conflicts(&devices, now, window);
        for conflict in tracker.update(&site.id, conflicts) {
            found += 1;
            tracing::warn!("IP conflict at site {}: {} used by {:?}", conflict.site_id, conflict.ip, conflict.macs);
            dispatcher.broadcast(WsEvent::IpConflict {
                site_id: conflict.site_id.clone(),
                ip: conflict.ip.clone(),
                macs: conflict.macs.clone(),
            });
            spawn_notify(
                dispatcher.notifier(),
                Notification::IpConflict {
                    site_id: conflict.site_id,
                    ip: conflict.ip,
                    macs: conflict.macs,
                },
            );
        }
    }
    Ok(found)
}

/// Starts the periodic background jobs. Each runs on its own timer.
pub fn spawn_background_jobs(
    config: &Config,
    pool: SqlitePool,
    dispatcher: EventDispatcher,
    topology: Arc<TopologyService>,
    probes: Arc<ProbeStore>,
) {
    {
        let pool = pool.clone();
        let dispatcher = dispatcher.clone();
        let interval = config.site_sweep_interval;
        let offline_after = config.site_offline_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep_silent_sites(&pool, &dispatcher, offline_after).await {
                    tracing::warn!("Site sweep failed: {:#}", e);
                }
                let purged = probes.purge_expired();
                if purged > 0 {
                    tracing::debug!("Dropped {} expired probe tokens", purged);
                }
            }
        });
    }

    {
        let interval = config.ip_conflict_sweep_interval;
        let window = config.ip_conflict_window;
        let tracker = ConflictTracker::default();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep_ip_conflicts(&pool, &dispatcher, &tracker, window).await {
                    tracing::warn!("IP conflict sweep failed: {:#}", e);
                }
            }
        });
    }

    {
        let interval = config.topology_refresh_interval;
        let stale_after = config.forwarding_stale_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match topology.refresh_all(stale_after).await {
                    Ok(n) => tracing::debug!("Topology refresh covered {} switches", n),
                    Err(e) => tracing::warn!("Topology refresh failed: {:#}", e),
                }
            }
        });
    }
}
