mod common;

use chrono::Duration;
use std::collections::HashMap;

use common::{create_site, raw, test_state};
use netmap_backend::db::{models::Device, queries};
use sqlx::SqlitePool;

fn table(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(mac, port)| (mac.to_string(), port.to_string()))
        .collect()
}

async fn virtual_switch(pool: &SqlitePool, switch_id: &str, port: &str) -> Device {
    let switch = queries::get_switch(pool, switch_id).await.unwrap().unwrap();
    queries::list_site_devices(pool, &switch.site_id)
        .await
        .unwrap()
        .into_iter()
        .find(|d| {
            d.is_virtual
                && d.virtual_switch_id.as_deref() == Some(switch_id)
                && d.virtual_port.as_deref() == Some(port)
        })
        .unwrap()
}

#[tokio::test]
async fn crowded_port_gets_a_virtual_switch() {
    let state = test_state().await;
    let site = create_site(&state, "HQ").await;
    state
        .scans
        .ingest_scan(
            &site.id,
            &[
                raw("10.0.0.2", "AA:00:00:00:00:0A"),
                raw("10.0.0.11", "AA:00:00:00:00:01"),
                raw("10.0.0.12", "AA:00:00:00:00:02"),
            ],
        )
        .await
        .unwrap();
    let switch = state.topology.register_switch(&site.id, "A".into(), "10.0.0.2".into()).await.unwrap();

    let summary = state
        .topology
        .ingest_forwarding_table(&switch.id, &table(&[("aa:00:00:00:00:01", "3"), ("AA-00-00-00-00-02", "3")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.entries, 2);
    assert_eq!(summary.virtual_switches_created, 1);

    let vs = virtual_switch(&state.pool, &switch.id, "3").await;
    assert_eq!(vs.parent_id, switch.device_id);
    assert_eq!(vs.port.as_deref(), Some("3"));
    for ip in ["10.0.0.11", "10.0.0.12"] {
        let d = queries::find_device_by_ip(&state.pool, &site.id, ip).await.unwrap().unwrap();
        assert_eq!(d.parent_id.as_deref(), Some(vs.id.as_str()));
    }

    // Same table again: the virtual switch is reused, nothing moves.
    let again = state
        .topology
        .ingest_forwarding_table(&switch.id, &table(&[("AA:00:00:00:00:01", "3"), ("AA:00:00:00:00:02", "3")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.virtual_switches_created, 0);
    assert_eq!(again.edges, 0);
}

#[tokio::test]
async fn switch_seen_behind_a_port_becomes_its_child() {
    let state = test_state().await;
    let site = create_site(&state, "Plant").await;
    state
        .scans
        .ingest_scan(
            &site.id,
            &[
                raw("10.0.0.2", "AA:00:00:00:00:0A"),
                raw("10.0.0.3", "AA:00:00:00:00:0B"),
                raw("10.0.0.30", "AA:00:00:00:00:03"),
            ],
        )
        .await
        .unwrap();
    let a = state.topology.register_switch(&site.id, "A".into(), "10.0.0.2".into()).await.unwrap();
    let b = state.topology.register_switch(&site.id, "B".into(), "10.0.0.3".into()).await.unwrap();

    state
        .topology
        .ingest_forwarding_table(&b.id, &table(&[("AA:00:00:00:00:03", "1")]))
        .await
        .unwrap();
    state
        .topology
        .ingest_forwarding_table(&a.id, &table(&[("AA:00:00:00:00:03", "5")]))
        .await
        .unwrap();

    let b_device = queries::get_device(&state.pool, b.device_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(b_device.parent_id, a.device_id);
    assert_eq!(b_device.port.as_deref(), Some("5"));

    let m3 = queries::find_device_by_ip(&state.pool, &site.id, "10.0.0.30").await.unwrap().unwrap();
    assert_eq!(m3.parent_id, b.device_id);
    assert_eq!(m3.port.as_deref(), Some("1"));

    let devices = queries::list_site_devices(&state.pool, &site.id).await.unwrap();
    assert!(devices.iter().all(|d| !d.is_virtual));
}

#[tokio::test]
async fn switch_order_does_not_depend_on_table_arrival() {
    for a_first in [true, false] {
        let state = test_state().await;
        let site = create_site(&state, "Mill").await;
        state
            .scans
            .ingest_scan(
                &site.id,
                &[
                    raw("10.0.0.2", "AA:00:00:00:00:0A"),
                    raw("10.0.0.3", "AA:00:00:00:00:0B"),
                    raw("10.0.0.30", "AA:00:00:00:00:03"),
                ],
            )
            .await
            .unwrap();
        let a = state.topology.register_switch(&site.id, "A".into(), "10.0.0.2".into()).await.unwrap();
        let b = state.topology.register_switch(&site.id, "B".into(), "10.0.0.3".into()).await.unwrap();

        let a_table = table(&[("AA:00:00:00:00:03", "5")]);
        let b_table = table(&[("AA:00:00:00:00:03", "1")]);
        let order = if a_first {
            [(&a.id, &a_table), (&b.id, &b_table)]
        } else {
            [(&b.id, &b_table), (&a.id, &a_table)]
        };
        for (switch_id, entries) in order {
            state.topology.ingest_forwarding_table(switch_id, entries).await.unwrap();
        }
        state.topology.refresh_all(Duration::minutes(60)).await.unwrap();

        let a_device = queries::get_device(&state.pool, a.device_id.as_deref().unwrap()).await.unwrap().unwrap();
        let b_device = queries::get_device(&state.pool, b.device_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(a_device.parent_id, None, "a_first={a_first}");
        assert_eq!(b_device.parent_id, a.device_id, "a_first={a_first}");
        assert_eq!(b_device.port.as_deref(), Some("5"));
        let m3 = queries::find_device_by_ip(&state.pool, &site.id, "10.0.0.30").await.unwrap().unwrap();
        assert_eq!(m3.parent_id, b.device_id, "a_first={a_first}");
    }
}

#[tokio::test]
async fn manual_parent_survives_inference() {
    let state = test_state().await;
    let site = create_site(&state, "Depot").await;
    state
        .scans
        .ingest_scan(
            &site.id,
            &[
                raw("10.0.0.1", "AA:00:00:00:00:FF"),
                raw("10.0.0.2", "AA:00:00:00:00:0A"),
                raw("10.0.0.40", "AA:00:00:00:00:04"),
            ],
        )
        .await
        .unwrap();
    let switch = state.topology.register_switch(&site.id, "A".into(), "10.0.0.2".into()).await.unwrap();
    let printer = queries::find_device_by_ip(&state.pool, &site.id, "10.0.0.40").await.unwrap().unwrap();
    let router = queries::find_device_by_ip(&state.pool, &site.id, "10.0.0.1").await.unwrap().unwrap();

    state.overrides.set_parent(&printer.id, Some("10.0.0.1")).await.unwrap();
    state
        .topology
        .ingest_forwarding_table(&switch.id, &table(&[("AA:00:00:00:00:04", "7")]))
        .await
        .unwrap();

    let printer = queries::get_device(&state.pool, &printer.id).await.unwrap().unwrap();
    assert_eq!(printer.parent_id.as_deref(), Some(router.id.as_str()));
    assert!(printer.parent_manual);

    // Cleared: the next pass places it on the switch.
    state.overrides.set_parent(&printer.id, None).await.unwrap();
    state.topology.refresh_all(Duration::minutes(60)).await.unwrap();
    let printer = queries::get_device(&state.pool, &printer.id).await.unwrap().unwrap();
    assert_eq!(printer.parent_id, switch.device_id);
    assert_eq!(printer.port.as_deref(), Some("7"));
}

#[tokio::test]
async fn switch_registered_before_scan_adopts_its_mac() {
    let state = test_state().await;
    let site = create_site(&state, "New").await;

    let switch = state.topology.register_switch(&site.id, "Core".into(), "10.0.0.2".into()).await.unwrap();
    let again = state.topology.register_switch(&site.id, "Core".into(), "10.0.0.2".into()).await.unwrap();
    assert_eq!(switch.id, again.id);

    state.scans.ingest_scan(&site.id, &[raw("10.0.0.2", "AA:00:00:00:00:0A")]).await.unwrap();

    let devices = queries::list_site_devices(&state.pool, &site.id).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(Some(devices[0].id.clone()), switch.device_id);
    assert_eq!(devices[0].mac.as_deref(), Some("AA:00:00:00:00:0A"));
}

#[tokio::test]
async fn refresh_skips_stale_tables_and_unknown_switches_are_none() {
    let state = test_state().await;
    let site = create_site(&state, "Old").await;
    let switch = state.topology.register_switch(&site.id, "A".into(), "10.0.0.2".into()).await.unwrap();

    // Never polled: nothing to refresh.
    assert_eq!(state.topology.refresh_all(Duration::minutes(60)).await.unwrap(), 0);

    state
        .topology
        .ingest_forwarding_table(&switch.id, &table(&[("AA:00:00:00:00:01", "1")]))
        .await
        .unwrap();
    assert_eq!(state.topology.refresh_all(Duration::minutes(60)).await.unwrap(), 1);

    assert!(state
        .topology
        .ingest_forwarding_table("missing", &table(&[]))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn deleting_a_virtual_switch_detaches_its_children() {
    let state = test_state().await;
    let site = create_site(&state, "Hall").await;
    state
        .scans
        .ingest_scan(
            &site.id,
            &[
                raw("10.0.0.2", "AA:00:00:00:00:0A"),
                raw("10.0.0.11", "AA:00:00:00:00:01"),
                raw("10.0.0.12", "AA:00:00:00:00:02"),
            ],
        )
        .await
        .unwrap();
    let switch = state.topology.register_switch(&site.id, "A".into(), "10.0.0.2".into()).await.unwrap();
    state
        .topology
        .ingest_forwarding_table(&switch.id, &table(&[("AA:00:00:00:00:01", "3"), ("AA:00:00:00:00:02", "3")]))
        .await
        .unwrap();
    let vs = virtual_switch(&state.pool, &switch.id, "3").await;

    // Only virtual switches may be deleted.
    let anchor = switch.device_id.clone().unwrap();
    assert!(state.overrides.delete_virtual_switch(&anchor).await.is_err());

    state.overrides.delete_virtual_switch(&vs.id).await.unwrap();
    assert!(queries::get_device(&state.pool, &vs.id).await.unwrap().is_none());
    let child = queries::find_device_by_ip(&state.pool, &site.id, "10.0.0.11").await.unwrap().unwrap();
    assert!(child.parent_id.is_none());
}
