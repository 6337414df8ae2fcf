//! Online/offline transitions after a batch has been resolved.
//!
//! Device status is untouched by the resolver, so on entry every device still
//! carries the status it had before the batch.

use chrono::{DateTime, Utc};

use crate::db::models::{ChangeEvent, ChangeKind, Device};
use crate::db::timestamp;
use crate::identity::Resolution;

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

pub fn track_lifecycle(res: &mut Resolution, now: DateTime<Utc>) {
    let at = timestamp(now);

    // Devices observed this cycle come (back) online first, so the offline
    // pass below sees the complete set of current holders.
    for device in res.devices.iter_mut() {
        if device.is_virtual || !res.touched.contains(&device.id) {
            continue;
        }
        if res.created.contains(&device.id) {
            device.status = ONLINE.into();
            continue;
        }
        if !device.is_online() {
            tracing::info!("Device {} ({:?}) is back online", device.id, device.ip);
            device.status = ONLINE.into();
            res.events.push(ChangeEvent::new(
                device,
                ChangeKind::ReachabilityChanged,
                Some(OFFLINE.into()),
                Some(ONLINE.into()),
                &at,
            ));
        }
    }

    let candidates: Vec<usize> = res
        .devices
        .iter()
        .enumerate()
        .filter(|(_, d)| !d.is_virtual && d.is_online() && !res.touched.contains(&d.id))
        .map(|(idx, _)| idx)
        .collect();

    for idx in candidates {
        if let Some(counterpart) = migrated_counterpart(res, idx) {
            let candidate = res.devices[idx].clone();
            if candidate.has_descriptive() {
                tracing::info!(
                    "{} migrated from {:?} to {:?}, moving metadata to {}",
                    candidate.mac.as_deref().unwrap_or("?"),
                    candidate.ip,
                    res.devices[counterpart].ip,
                    res.devices[counterpart].id
                );
                res.devices[counterpart].fill_descriptive_from(&candidate);
                res.devices[idx].clear_descriptive();
            }
        }

        let device = &mut res.devices[idx];
        tracing::info!("Device {} ({:?}) went offline", device.id, device.ip);
        device.status = OFFLINE.into();
        res.events.push(ChangeEvent::new(
            device,
            ChangeKind::ReachabilityChanged,
            Some(ONLINE.into()),
            Some(OFFLINE.into()),
            &at,
        ));
    }
}

/// An online device observed this cycle holding the candidate's MAC at a
/// different address.
fn migrated_counterpart(res: &Resolution, idx: usize) -> Option<usize> {
    let candidate: &Device = &res.devices[idx];
    let mac = candidate.mac.as_deref()?;
    res.devices.iter().position(|d| {
        d.id != candidate.id
            && d.is_online()
            && res.touched.contains(&d.id)
            && d.mac.as_deref() == Some(mac)
            && d.ip != candidate.ip
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::resolve_batch;
    use crate::ingest::Observation;
    use crate::labels::LabelLookups;
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

    fn run(batch: &[Observation], snapshot: Vec<Device>, now: DateTime<Utc>) -> Resolution {
        let mut res = resolve_batch(SITE, batch, snapshot, &LabelLookups::new(), now);
        track_lifecycle(&mut res, now);
        res
    }

    #[test]
    fn absent_device_goes_offline_without_touching_last_seen() {
        let first = run(&[obs("10.0.0.1", Some("AA:BB:CC:DD:EE:01"))], vec![], t0());
        let seen_at = first.devices[0].last_seen.clone();

        let second = run(&[], first.devices, t0() + Duration::minutes(15));

        let d = &second.devices[0];
        assert_eq!(d.status, "offline");
        assert_eq!(d.last_seen, seen_at);
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].kind, ChangeKind::ReachabilityChanged);
        assert_eq!(second.events[0].new_value.as_deref(), Some("offline"));
    }

    #[test]
    fn returning_device_comes_back_online() {
        let mut d = Device::new(SITE, Some("10.0.0.1".into()), Some("AA:BB:CC:DD:EE:01".into()), t0());
        d.status = "offline".into();

        let later = t0() + Duration::hours(1);
        let res = run(&[obs("10.0.0.1", Some("AA:BB:CC:DD:EE:01"))], vec![d], later);

        assert_eq!(res.devices[0].status, "online");
        assert_eq!(res.devices[0].last_seen, timestamp(later));
        assert_eq!(res.events.len(), 1);
        assert_eq!(res.events[0].old_value.as_deref(), Some("offline"));
    }

    #[test]
    fn new_devices_only_emit_new_device() {
        let res = run(&[obs("10.0.0.1", Some("AA:BB:CC:DD:EE:01"))], vec![], t0());
        assert_eq!(res.events.len(), 1);
        assert_eq!(res.events[0].kind, ChangeKind::NewDevice);
        assert_eq!(res.devices[0].status, "online");
    }

    #[test]
    fn resubmitting_the_same_batch_is_quiet() {
        let batch = [
            obs("10.0.0.1", Some("AA:BB:CC:DD:EE:01")),
            obs("10.0.0.2", None),
        ];
        let first = run(&batch, vec![], t0());
        let second = run(&batch, first.devices.clone(), t0() + Duration::minutes(5));

        assert!(second.events.is_empty());
        assert_eq!(second.devices.len(), first.devices.len());
        assert!(second.created.is_empty());
    }

    #[test]
    fn migrated_mac_hands_metadata_to_online_counterpart() {
        // Historical duplicate: the same MAC on two rows. This cycle only the
        // new address answers, and without a MAC in the report.
        let mut old = Device::new(SITE, Some("10.0.0.5".into()), Some("AA:BB:CC:DD:EE:01".into()), t0());
        old.hostname = Some("laptop-7".into());
        old.notes = Some("finance".into());
        let new = Device::new(SITE, Some("10.0.0.9".into()), Some("AA:BB:CC:DD:EE:01".into()), t0());
        let (old_id, new_id) = (old.id.clone(), new.id.clone());

        let res = run(&[obs("10.0.0.9", None)], vec![old, new], t0() + Duration::minutes(5));

        let old = res.get(&old_id).unwrap();
        let new = res.get(&new_id).unwrap();
        assert_eq!(old.status, "offline");
        assert_eq!(old.hostname, None);
        assert_eq!(new.hostname.as_deref(), Some("laptop-7"));
        assert_eq!(new.notes.as_deref(), Some("finance"));
    }

    #[test]
    fn virtual_switches_never_go_offline() {
        let v = Device::new_virtual_switch(SITE, "sw-1", "core", "3", t0());
        let res = run(&[], vec![v], t0() + Duration::minutes(5));
        assert_eq!(res.devices[0].status, "online");
        assert!(res.events.is_empty());
    }
}
