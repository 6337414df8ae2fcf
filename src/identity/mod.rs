//! MAC-first, IP-fallback identity resolution for one site's batch.
//!
//! Resolution runs against an in-memory copy of the site's catalog taken
//! before the batch, so every decision sees one consistent snapshot. Nothing
//! here touches storage; the caller diffs the result and persists it.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::db::models::{ChangeEvent, ChangeKind, Device};
use crate::db::timestamp;
use crate::ingest::Observation;
use crate::labels::{LabelLookup, LabelLookups};

/// Working state of a site catalog while a batch is resolved.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Every surviving device of the site, in catalog order.
    pub devices: Vec<Device>,
    /// Ids of devices created by this batch.
    pub created: HashSet<String>,
    /// Ids of devices matched or created by an observation.
    pub touched: HashSet<String>,
    pub deleted: Vec<String>,
    /// `(removed, survivor)`: children of `removed` move to `survivor`.
    pub reparented: Vec<(String, String)>,
    pub events: Vec<ChangeEvent>,
}

impl Resolution {
    pub fn new(snapshot: Vec<Device>) -> Self {
        Resolution {
            devices: snapshot,
            ..Default::default()
        }
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.id == id)
    }

    fn remove(&mut self, idx: usize, survivor_id: &str) {
        let removed = self.devices.remove(idx);
        for child in self.devices.iter_mut() {
            if child.parent_id.as_deref() == Some(removed.id.as_str()) {
                child.parent_id = Some(survivor_id.to_string());
            }
        }
        self.created.remove(&removed.id);
        self.touched.remove(&removed.id);
        self.reparented.push((removed.id.clone(), survivor_id.to_string()));
        self.deleted.push(removed.id);
    }

    fn push_event(
        &mut self,
        idx: usize,
        kind: ChangeKind,
        old: Option<String>,
        new: Option<String>,
        at: &str,
    ) {
        let event = ChangeEvent::new(&self.devices[idx], kind, old, new, at);
        self.events.push(event);
    }
}

/// Resolves every observation in order, then drops events that point at
/// rows a later observation collapsed away.
pub fn resolve_batch(
    site_id: &str,
    observations: &[Observation],
    snapshot: Vec<Device>,
    labels: &LabelLookups,
    now: DateTime<Utc>,
) -> Resolution {
    let mut res = Resolution::new(snapshot);
    for obs in observations {
        resolve_observation(&mut res, site_id, obs, labels, now);
    }
    let deleted: HashSet<&String> = res.deleted.iter().collect();
    res.events.retain(|e| !deleted.contains(&e.device_id));
    res
}

pub fn resolve_observation(
    res: &mut Resolution,
    site_id: &str,
    obs: &Observation,
    labels: &LabelLookups,
    now: DateTime<Utc>,
) {
    let at = timestamp(now);

    let idx = match &obs.mac {
        Some(mac) => match collapse_mac_holders(res, mac) {
            Some(idx) => apply_mac_match(res, idx, obs, &at),
            None => match find_by_ip(res, &obs.ip, true) {
                Some(idx) if res.devices[idx].mac.is_none() => {
                    tracing::debug!("Adopting MAC {} for placeholder at {}", mac, obs.ip);
                    res.devices[idx].mac = Some(mac.clone());
                    idx
                }
                Some(idx) => displace_ip_holder(res, site_id, idx, obs, now),
                None => create_device(res, site_id, obs, now),
            },
        },
        None => match find_by_ip(res, &obs.ip, false) {
            Some(idx) => idx,
            None => create_device(res, site_id, obs, now),
        },
    };

    refresh_observed(&mut res.devices[idx], obs, &at);
    if let Some(mac) = res.devices[idx].mac.clone() {
        enrich(&mut res.devices[idx], labels.get(&mac));
    }
    let id = res.devices[idx].id.clone();
    res.touched.insert(id);
}

/// Orders duplicate holders of one MAC: manual/static first, then most
/// recently seen, then newest row.
fn survivor_order(a: &Device, b: &Device) -> Ordering {
    let manual = |d: &Device| d.type_manual || d.accepted_ip.is_some();
    manual(b)
        .cmp(&manual(a))
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| b.seq.cmp(&a.seq))
}

/// Finds the device holding `mac`, collapsing historical duplicates into a
/// single survivor first. Returns the survivor's index.
fn collapse_mac_holders(res: &mut Resolution, mac: &str) -> Option<usize> {
    let mut holders: Vec<Device> = res
        .devices
        .iter()
        .filter(|d| !d.is_virtual && d.mac.as_deref() == Some(mac))
        .cloned()
        .collect();

    match holders.len() {
        0 => return None,
        1 => return res.index_of(&holders[0].id),
        _ => {}
    }

    holders.sort_by(survivor_order);
    let mut survivor = holders.remove(0);
    // Most recently seen first, so the first non-null value found wins.
    holders.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

    tracing::info!(
        "Collapsing {} duplicate rows for MAC {} into {}",
        holders.len(),
        mac,
        survivor.id
    );

    for dup in &holders {
        survivor.fill_descriptive_from(dup);
        if let Some(ip) = &dup.ip {
            if survivor.ip.as_ref() != Some(ip) && !survivor.ip_history().contains(ip) {
                survivor.push_ip_history(ip);
            }
        }
        if dup.last_seen > survivor.last_seen {
            survivor.last_seen = dup.last_seen.clone();
        }
        if dup.first_seen < survivor.first_seen {
            survivor.first_seen = dup.first_seen.clone();
        }
        if dup.is_online() {
            survivor.status = "online".into();
        }
    }

    let survivor_id = survivor.id.clone();
    let survivor_idx = res.index_of(&survivor_id)?;
    res.devices[survivor_idx] = survivor;
    for dup in holders {
        if let Some(idx) = res.index_of(&dup.id) {
            res.remove(idx, &survivor_id);
        }
    }
    res.index_of(&survivor_id)
}

/// Best holder of `ip`: MAC-less placeholders first when `prefer_placeholder`,
/// then online, then most recently seen, then newest row.
fn find_by_ip(res: &Resolution, ip: &str, prefer_placeholder: bool) -> Option<usize> {
    res.devices
        .iter()
        .enumerate()
        .filter(|(_, d)| !d.is_virtual && d.ip.as_deref() == Some(ip))
        .min_by(|(_, a), (_, b)| {
            let placeholder = |d: &Device| prefer_placeholder && d.mac.is_none();
            placeholder(b)
                .cmp(&placeholder(a))
                .then_with(|| b.is_online().cmp(&a.is_online()))
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| b.seq.cmp(&a.seq))
        })
        .map(|(idx, _)| idx)
}

/// Same MAC, possibly a new address. Returns the device's index, which
/// moves when placeholders ahead of it are purged.
fn apply_mac_match(res: &mut Resolution, idx: usize, obs: &Observation, at: &str) -> usize {
    let device = &res.devices[idx];
    if device.ip.as_deref() == Some(obs.ip.as_str()) {
        return idx;
    }
    let id = device.id.clone();

    let old_ip = device.ip.clone();
    let accepted = device.accepted_ip.as_deref() == Some(obs.ip.as_str());
    {
        let device = &mut res.devices[idx];
        if !accepted {
            if let Some(old) = &old_ip {
                device.push_ip_history(old);
                device.previous_ip = Some(old.clone());
            }
        }
        device.ip = Some(obs.ip.clone());
    }

    if accepted {
        tracing::debug!("{} moved to its accepted address {}", res.devices[idx].id, obs.ip);
    } else if old_ip.is_some() {
        tracing::info!(
            "Address change for {:?}: {:?} -> {}",
            res.devices[idx].mac,
            old_ip,
            obs.ip
        );
        res.push_event(idx, ChangeKind::AddressChanged, old_ip, Some(obs.ip.clone()), at);
    }

    purge_placeholders(res, &obs.ip, idx);
    res.index_of(&id).unwrap_or(idx)
}

/// Removes MAC-less rows squatting `ip` other than the device at `keep_idx`.
fn purge_placeholders(res: &mut Resolution, ip: &str, keep_idx: usize) {
    let keep_id = res.devices[keep_idx].id.clone();
    let stale: Vec<String> = res
        .devices
        .iter()
        .filter(|d| {
            d.id != keep_id && !d.is_virtual && d.mac.is_none() && d.ip.as_deref() == Some(ip)
        })
        .map(|d| d.id.clone())
        .collect();

    for id in stale {
        tracing::debug!("Purging stale placeholder {} at {}", id, ip);
        if let Some(idx) = res.index_of(&id) {
            res.remove(idx, &keep_id);
        }
    }
}

/// The IP is held by a device with a different MAC: a different machine.
/// The old row stays for the lifecycle pass to age out.
fn displace_ip_holder(
    res: &mut Resolution,
    site_id: &str,
    holder_idx: usize,
    obs: &Observation,
    now: DateTime<Utc>,
) -> usize {
    let displaced_mac = res.devices[holder_idx].mac.clone();
    let idx = create_device(res, site_id, obs, now);
    res.devices[idx].previous_mac = displaced_mac.clone();
    tracing::info!(
        "IP {} now answered by {:?} (was {:?})",
        obs.ip,
        obs.mac,
        displaced_mac
    );
    res.push_event(
        idx,
        ChangeKind::AddressChanged,
        displaced_mac,
        obs.mac.clone(),
        &timestamp(now),
    );
    idx
}

/// Creates a device for an unmatched observation. If some row still carries
/// the same MAC, its descriptive fields move to the new device and it gives
/// up the MAC.
fn create_device(res: &mut Resolution, site_id: &str, obs: &Observation, now: DateTime<Utc>) -> usize {
    let mut device = Device::new(site_id, Some(obs.ip.clone()), obs.mac.clone(), now);

    if let Some(mac) = &obs.mac {
        let stale = res
            .devices
            .iter_mut()
            .find(|d| !d.is_virtual && d.mac.as_deref() == Some(mac.as_str()));
        if let Some(stale) = stale {
            tracing::warn!("MAC {} still held by {}, transferring metadata", mac, stale.id);
            device.fill_descriptive_from(stale);
            stale.clear_descriptive();
            stale.previous_mac = stale.mac.take();
        }
    }

    tracing::info!("New device {} at {} ({:?})", device.id, obs.ip, obs.mac);
    res.created.insert(device.id.clone());
    res.devices.push(device);
    let idx = res.devices.len() - 1;
    res.push_event(idx, ChangeKind::NewDevice, None, Some(obs.ip.clone()), &timestamp(now));
    idx
}

fn refresh_observed(device: &mut Device, obs: &Observation, at: &str) {
    if obs.hostname.is_some() {
        device.hostname.clone_from(&obs.hostname);
    }
    if obs.vendor.is_some() {
        device.vendor.clone_from(&obs.vendor);
    }
    device.reachable = obs.reachable;
    device.firmware_upgrading = obs.firmware_upgrade;
    if device.last_seen.as_str() < at {
        device.last_seen = at.to_string();
    }
}

/// Applies a directory answer. Manually classified devices are left alone,
/// and a missing answer keeps the last known classification.
fn enrich(device: &mut Device, lookup: Option<&LabelLookup>) {
    if device.type_manual {
        return;
    }
    match lookup {
        Some(LabelLookup::Found(label)) => {
            device.device_type = Some(label.title.clone());
            device.label_title = Some(label.title.clone());
            device.label_path.clone_from(&label.path);
            device.label_account.clone_from(&label.account);
        }
        Some(LabelLookup::NotFound) => {
            device.device_type = None;
            device.label_title = None;
            device.label_path = None;
            device.label_account = None;
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Label;
    use chrono::{Duration, TimeZone};

    const SITE: &str = "site-1";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap()
    }

    fn obs(ip: &str, mac: Option<&str>) -> Observation {
        Observation {
            ip: ip.into(),
            mac: mac.map(Into::into),
            hostname: None,
            vendor: None,
            reachable: true,
            firmware_upgrade: false,
        }
    }

    fn stored(seq: i64, ip: &str, mac: Option<&str>, last_seen: DateTime<Utc>) -> Device {
        let mut d = Device::new(SITE, Some(ip.into()), mac.map(Into::into), last_seen);
        d.seq = seq;
        d
    }

    fn macs_unique(res: &Resolution) -> bool {
        let macs: Vec<_> = res.devices.iter().filter_map(|d| d.mac.clone()).collect();
        let unique: HashSet<_> = macs.iter().collect();
        macs.len() == unique.len()
    }

    #[test]
    fn address_change_records_history_and_one_event() {
        let first = resolve_batch(SITE, &[obs("10.0.0.5", Some("AA:BB:CC:DD:EE:01"))], vec![], &LabelLookups::new(), t0());
        let snapshot = first.devices.clone();

        let second = resolve_batch(
            SITE,
            &[obs("10.0.0.9", Some("AA:BB:CC:DD:EE:01"))],
            snapshot,
            &LabelLookups::new(),
            t0() + Duration::minutes(15),
        );

        assert_eq!(second.devices.len(), 1);
        let d = &second.devices[0];
        assert_eq!(d.ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(d.previous_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(d.ip_history(), vec!["10.0.0.5".to_string()]);
        let changes: Vec<_> = second
            .events
            .iter()
            .filter(|e| e.kind == ChangeKind::AddressChanged)
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_value.as_deref(), Some("10.0.0.5"));
        assert_eq!(changes[0].new_value.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn move_to_accepted_address_is_silent() {
        let mut d = stored(1, "10.0.0.5", Some("AA:BB:CC:DD:EE:01"), t0());
        d.accepted_ip = Some("10.0.0.9".into());

        let res = resolve_batch(
            SITE,
            &[obs("10.0.0.9", Some("AA:BB:CC:DD:EE:01"))],
            vec![d],
            &LabelLookups::new(),
            t0() + Duration::minutes(5),
        );

        let d = &res.devices[0];
        assert_eq!(d.ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(d.previous_ip, None);
        assert!(d.ip_history().is_empty());
        assert!(res.events.is_empty());
    }

    #[test]
    fn ip_history_is_capped() {
        let mut snapshot = vec![stored(1, "10.0.0.100", Some("AA:BB:CC:DD:EE:01"), t0())];
        for i in 0..12 {
            let res = resolve_batch(
                SITE,
                &[obs(&format!("10.0.0.{i}"), Some("AA:BB:CC:DD:EE:01"))],
                snapshot,
                &LabelLookups::new(),
                t0() + Duration::minutes(i + 1),
            );
            snapshot = res.devices;
        }
        let history = snapshot[0].ip_history();
        assert_eq!(history.len(), 10);
        assert_eq!(history.last().map(String::as_str), Some("10.0.0.10"));
    }

    #[test]
    fn duplicate_rows_collapse_into_best_survivor() {
        let mut older = stored(1, "10.0.0.20", Some("11:22:33:44:55:66"), t0());
        older.hostname = Some("nas".into());
        older.notes = Some("rack 2".into());
        let newer = stored(2, "10.0.0.21", Some("11:22:33:44:55:66"), t0() + Duration::minutes(10));
        let mut child = stored(3, "10.0.0.30", Some("AA:AA:AA:AA:AA:01"), t0());
        child.parent_id = Some(older.id.clone());
        let (older_id, newer_id) = (older.id.clone(), newer.id.clone());

        let res = resolve_batch(
            SITE,
            &[obs("10.0.0.21", Some("11:22:33:44:55:66"))],
            vec![older, newer, child],
            &LabelLookups::new(),
            t0() + Duration::minutes(20),
        );

        assert!(macs_unique(&res));
        assert_eq!(res.deleted, vec![older_id.clone()]);
        assert_eq!(res.reparented, vec![(older_id, newer_id.clone())]);
        let survivor = res.get(&newer_id).unwrap();
        assert_eq!(survivor.hostname.as_deref(), Some("nas"));
        assert_eq!(survivor.notes.as_deref(), Some("rack 2"));
        assert_eq!(survivor.ip_history(), vec!["10.0.0.20".to_string()]);
    }

    #[test]
    fn manual_row_wins_collapse_over_fresher_one() {
        let mut manual = stored(1, "10.0.0.20", Some("11:22:33:44:55:66"), t0());
        manual.type_manual = true;
        manual.device_type = Some("nas".into());
        let fresher = stored(2, "10.0.0.21", Some("11:22:33:44:55:66"), t0() + Duration::hours(1));
        let manual_id = manual.id.clone();

        let res = resolve_batch(
            SITE,
            &[obs("10.0.0.21", Some("11:22:33:44:55:66"))],
            vec![manual, fresher],
            &LabelLookups::new(),
            t0() + Duration::hours(2),
        );

        assert_eq!(res.devices.len(), 1);
        assert_eq!(res.devices[0].id, manual_id);
        assert_eq!(res.devices[0].ip.as_deref(), Some("10.0.0.21"));
    }

    #[test]
    fn different_mac_at_known_ip_is_a_new_device() {
        let old = stored(1, "10.0.0.7", Some("AA:BB:CC:DD:EE:01"), t0());
        let old_id = old.id.clone();

        let res = resolve_batch(
            SITE,
            &[obs("10.0.0.7", Some("AA:BB:CC:DD:EE:02"))],
            vec![old],
            &LabelLookups::new(),
            t0() + Duration::minutes(5),
        );

        assert_eq!(res.devices.len(), 2);
        assert!(!res.touched.contains(&old_id));
        let new = res.devices.iter().find(|d| d.id != old_id).unwrap();
        assert_eq!(new.previous_mac.as_deref(), Some("AA:BB:CC:DD:EE:01"));
        let kinds: Vec<_> = res.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::NewDevice, ChangeKind::AddressChanged]);
    }

    #[test]
    fn mac_less_placeholder_adopts_mac() {
        let placeholder = stored(1, "10.0.0.8", None, t0());
        let id = placeholder.id.clone();

        let res = resolve_batch(
            SITE,
            &[obs("10.0.0.8", Some("AA:BB:CC:DD:EE:08"))],
            vec![placeholder],
            &LabelLookups::new(),
            t0() + Duration::minutes(5),
        );

        assert_eq!(res.devices.len(), 1);
        assert_eq!(res.devices[0].id, id);
        assert_eq!(res.devices[0].mac.as_deref(), Some("AA:BB:CC:DD:EE:08"));
        assert!(res.events.is_empty());
    }

    #[test]
    fn placeholder_on_new_address_is_purged() {
        let moving = stored(1, "10.0.0.5", Some("AA:BB:CC:DD:EE:01"), t0());
        let squatter = stored(2, "10.0.0.9", None, t0());
        let (moving_id, squatter_id) = (moving.id.clone(), squatter.id.clone());

        let res = resolve_batch(
            SITE,
            &[obs("10.0.0.9", Some("AA:BB:CC:DD:EE:01"))],
            vec![moving, squatter],
            &LabelLookups::new(),
            t0() + Duration::minutes(5),
        );

        assert_eq!(res.deleted, vec![squatter_id]);
        assert_eq!(res.devices.len(), 1);
        assert_eq!(res.devices[0].id, moving_id);
    }

    #[test]
    fn observation_without_mac_falls_back_to_ip() {
        let known = stored(1, "10.0.0.3", Some("AA:BB:CC:DD:EE:03"), t0());
        let id = known.id.clone();

        let res = resolve_batch(SITE, &[obs("10.0.0.3", None)], vec![known], &LabelLookups::new(), t0());

        assert_eq!(res.devices.len(), 1);
        assert!(res.touched.contains(&id));
        assert!(res.created.is_empty());
    }

    #[test]
    fn stale_mac_holder_hands_over_metadata_on_create() {
        let mut stale = stored(1, "10.0.0.40", Some("AA:BB:CC:DD:EE:40"), t0());
        stale.hostname = Some("old-name".into());
        let stale_id = stale.id.clone();
        let mut res = Resolution::new(vec![stale]);

        let idx = create_device(&mut res, SITE, &obs("10.0.0.41", Some("AA:BB:CC:DD:EE:40")), t0());

        assert_eq!(res.devices[idx].hostname.as_deref(), Some("old-name"));
        let stale = res.get(&stale_id).unwrap();
        assert_eq!(stale.hostname, None);
        assert_eq!(stale.mac, None);
        assert!(macs_unique(&res));
    }

    #[test]
    fn enrichment_respects_manual_flag_and_unavailable_lookups() {
        let mut manual = stored(1, "10.0.0.1", Some("AA:BB:CC:DD:EE:01"), t0());
        manual.type_manual = true;
        manual.device_type = Some("firewall".into());
        let mut labelled = stored(2, "10.0.0.2", Some("AA:BB:CC:DD:EE:02"), t0());
        labelled.device_type = Some("old".into());
        let mut unknown = stored(3, "10.0.0.3", Some("AA:BB:CC:DD:EE:03"), t0());
        unknown.device_type = Some("printer".into());
        let mut unavailable = stored(4, "10.0.0.4", Some("AA:BB:CC:DD:EE:04"), t0());
        unavailable.device_type = Some("camera".into());

        let mut labels = LabelLookups::new();
        let label = Label { title: "Reception PC".into(), path: Some("Office".into()), account: None };
        labels.insert("AA:BB:CC:DD:EE:01".into(), LabelLookup::Found(label.clone()));
        labels.insert("AA:BB:CC:DD:EE:02".into(), LabelLookup::Found(label));
        labels.insert("AA:BB:CC:DD:EE:03".into(), LabelLookup::NotFound);

        let batch = [
            obs("10.0.0.1", Some("AA:BB:CC:DD:EE:01")),
            obs("10.0.0.2", Some("AA:BB:CC:DD:EE:02")),
            obs("10.0.0.3", Some("AA:BB:CC:DD:EE:03")),
            obs("10.0.0.4", Some("AA:BB:CC:DD:EE:04")),
        ];
        let res = resolve_batch(SITE, &batch, vec![manual, labelled, unknown, unavailable], &labels, t0());

        assert_eq!(res.devices[0].device_type.as_deref(), Some("firewall"));
        assert_eq!(res.devices[0].label_title, None);
        assert_eq!(res.devices[1].device_type.as_deref(), Some("Reception PC"));
        assert_eq!(res.devices[1].label_path.as_deref(), Some("Office"));
        assert_eq!(res.devices[2].device_type, None);
        assert_eq!(res.devices[3].device_type.as_deref(), Some("camera"));
    }

    #[test]
    fn same_mac_twice_in_one_batch_stays_one_device() {
        let batch = [
            obs("10.0.0.5", Some("AA:BB:CC:DD:EE:01")),
            obs("10.0.0.6", Some("AA:BB:CC:DD:EE:01")),
        ];
        let res = resolve_batch(SITE, &batch, vec![], &LabelLookups::new(), t0());

        assert_eq!(res.devices.len(), 1);
        assert!(macs_unique(&res));
        assert_eq!(res.devices[0].ip.as_deref(), Some("10.0.0.6"));
    }
}
