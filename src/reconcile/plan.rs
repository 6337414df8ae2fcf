use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::db::models::{ChangeEvent, Device};
use crate::identity::resolve_batch;
use crate::ingest::Observation;
use crate::labels::LabelLookups;
use crate::lifecycle::track_lifecycle;

/// Everything one batch changes, as a diff against the pre-batch snapshot.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub inserts: Vec<Device>,
    pub updates: Vec<Device>,
    pub deletions: Vec<String>,
    /// `(removed, survivor)`
    pub reparented: Vec<(String, String)>,
    pub events: Vec<ChangeEvent>,
}

/// Resolves identities, tracks lifecycle and diffs the result.
pub fn plan_batch(
    site_id: &str,
    observations: &[Observation],
    snapshot: Vec<Device>,
    labels: &LabelLookups,
    now: DateTime<Utc>,
) -> BatchPlan {
    let before: HashMap<String, Device> = snapshot
        .iter()
        .map(|d| (d.id.clone(), d.clone()))
        .collect();

    let mut res = resolve_batch(site_id, observations, snapshot, labels, now);
    track_lifecycle(&mut res, now);

    let mut plan = BatchPlan {
        deletions: res.deleted,
        reparented: res.reparented,
        events: res.events,
        ..Default::default()
    };
    for device in res.devices {
        if res.created.contains(&device.id) {
            plan.inserts.push(device);
        } else if before.get(&device.id) != Some(&device) {
            plan.updates.push(device);
        }
    }
    plan
}
