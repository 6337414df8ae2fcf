use anyhow::Result;
use sqlx::SqlitePool;

use super::models::{
    ChangeEvent, ChangeEventRow, Device, ForwardingEntry, ManagedSwitch, NotificationPolicyRow,
    Site,
};

// ─── Site queries ────────────────────────────────────────────────────────────

pub async fn insert_site(pool: &SqlitePool, s: &Site) -> Result<()> {
    sqlx::query(
        "INSERT INTO sites (id, name, status, last_report_at, agent_version, scan_interval_minutes, enabled, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&s.id)
    .bind(&s.name)
    .bind(&s.status)
    .bind(&s.last_report_at)
    .bind(&s.agent_version)
    .bind(s.scan_interval_minutes)
    .bind(s.enabled)
    .bind(&s.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_site(pool: &SqlitePool, id: &str) -> Result<Option<Site>> {
    let site = sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(site)
}

pub async fn list_sites(pool: &SqlitePool) -> Result<Vec<Site>> {
    let sites = sqlx::query_as::<_, Site>("SELECT * FROM sites ORDER BY created_at, id")
        .fetch_all(pool)
        .await?;
    Ok(sites)
}

/// Records a report from the site's agent. Returns the status the site had before.
pub async fn touch_site_report(
    pool: &SqlitePool,
    id: &str,
    at: &str,
    version: Option<&str>,
) -> Result<Option<String>> {
    let previous: Option<(String,)> = sqlx::query_as("SELECT status FROM sites WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    sqlx::query(
        "UPDATE sites
         SET status = 'online',
             last_report_at = CASE WHEN last_report_at IS NULL OR last_report_at < ?1 THEN ?1 ELSE last_report_at END,
             agent_version = COALESCE(?2, agent_version)
         WHERE id = ?3",
    )
    .bind(at)
    .bind(version)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(previous.map(|(status,)| status))
}

/// Online, enabled sites whose last report is older than `cutoff`.
pub async fn list_silent_sites(pool: &SqlitePool, cutoff: &str) -> Result<Vec<Site>> {
    let sites = sqlx::query_as::<_, Site>(
        "SELECT * FROM sites
         WHERE status = 'online' AND enabled = 1
           AND (last_report_at IS NULL OR last_report_at < ?)",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(sites)
}

/// Flips a site offline only if no fresher report arrived since `cutoff` was computed.
pub async fn mark_site_offline_if_silent(pool: &SqlitePool, id: &str, cutoff: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE sites SET status = 'offline'
         WHERE id = ? AND status = 'online' AND (last_report_at IS NULL OR last_report_at < ?)",
    )
    .bind(id)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

// ─── Device queries ──────────────────────────────────────────────────────────

pub async fn list_site_devices(pool: &SqlitePool, site_id: &str) -> Result<Vec<Device>> {
    let devices = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE site_id = ? ORDER BY seq")
        .bind(site_id)
        .fetch_all(pool)
        .await?;
    Ok(devices)
}

pub async fn get_device(pool: &SqlitePool, id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(device)
}

/// Prefers the online holder of `ip`, then the most recently seen one.
pub async fn find_device_by_ip(pool: &SqlitePool, site_id: &str, ip: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE site_id = ? AND ip = ?
         ORDER BY status = 'online' DESC, last_seen DESC, seq DESC
         LIMIT 1",
    )
    .bind(site_id)
    .bind(ip)
    .fetch_optional(pool)
    .await?;
    Ok(device)
}

pub async fn insert_device(pool: &SqlitePool, d: &Device) -> Result<()> {
    sqlx::query(
        "INSERT INTO devices (id, site_id, mac, ip, previous_ip, previous_mac, ip_history, accepted_ip, accepted_mac,
             hostname, vendor, device_type, type_manual, label_title, label_path, label_account, status, reachable,
             firmware_upgrading, first_seen, last_seen, parent_id, parent_manual, port, is_gateway, is_virtual,
             virtual_switch_id, virtual_port, notes)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&d.id)
    .bind(&d.site_id)
    .bind(&d.mac)
    .bind(&d.ip)
    .bind(&d.previous_ip)
    .bind(&d.previous_mac)
    .bind(&d.ip_history)
    .bind(&d.accepted_ip)
    .bind(&d.accepted_mac)
    .bind(&d.hostname)
    .bind(&d.vendor)
    .bind(&d.device_type)
    .bind(d.type_manual)
    .bind(&d.label_title)
    .bind(&d.label_path)
    .bind(&d.label_account)
    .bind(&d.status)
    .bind(d.reachable)
    .bind(d.firmware_upgrading)
    .bind(&d.first_seen)
    .bind(&d.last_seen)
    .bind(&d.parent_id)
    .bind(d.parent_manual)
    .bind(&d.port)
    .bind(d.is_gateway)
    .bind(d.is_virtual)
    .bind(&d.virtual_switch_id)
    .bind(&d.virtual_port)
    .bind(&d.notes)
    .execute(pool)
    .await?;
    Ok(())
}

/// Writes the columns owned by scan reconciliation. Topology and manual
/// override columns are left alone, and a row whose stored `last_seen` is
/// fresher than the one being written is not touched.
pub async fn update_reconciled_device(pool: &SqlitePool, d: &Device) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE devices SET
             mac = ?, ip = ?, previous_ip = ?, previous_mac = ?, ip_history = ?,
             hostname = ?, vendor = ?, device_type = ?, type_manual = ?,
             label_title = ?, label_path = ?, label_account = ?,
             status = ?, reachable = ?, firmware_upgrading = ?, last_seen = ?, notes = ?
         WHERE id = ? AND last_seen <= ?",
    )
    .bind(&d.mac)
    .bind(&d.ip)
    .bind(&d.previous_ip)
    .bind(&d.previous_mac)
    .bind(&d.ip_history)
    .bind(&d.hostname)
    .bind(&d.vendor)
    .bind(&d.device_type)
    .bind(d.type_manual)
    .bind(&d.label_title)
    .bind(&d.label_path)
    .bind(&d.label_account)
    .bind(&d.status)
    .bind(d.reachable)
    .bind(d.firmware_upgrading)
    .bind(&d.last_seen)
    .bind(&d.notes)
    .bind(&d.id)
    .bind(&d.last_seen)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn reparent_children(pool: &SqlitePool, from: &str, to: &str) -> Result<()> {
    sqlx::query("UPDATE devices SET parent_id = ? WHERE parent_id = ?")
        .bind(to)
        .bind(from)
        .execute(pool)
        .await?;
    Ok(())
}

/// Moves the event history of a collapsed duplicate onto its survivor.
pub async fn reassign_events(pool: &SqlitePool, from: &str, to: &str) -> Result<()> {
    sqlx::query("UPDATE change_events SET device_id = ? WHERE device_id = ?")
        .bind(to)
        .bind(from)
        .execute(pool)
        .await?;
    Ok(())
}

/// Detaches every child of `parent_id`, manual or inferred.
pub async fn detach_children(pool: &SqlitePool, parent_id: &str) -> Result<()> {
    sqlx::query("UPDATE devices SET parent_id = NULL, port = NULL, parent_manual = 0 WHERE parent_id = ?")
        .bind(parent_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_device(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM devices WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Inferred edge; manually parented devices keep their assignment.
pub async fn set_inferred_parent(
    pool: &SqlitePool,
    id: &str,
    parent_id: &str,
    port: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE devices SET parent_id = ?, port = ? WHERE id = ? AND parent_manual = 0",
    )
    .bind(parent_id)
    .bind(port)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Drops an inferred edge to `parent_id`; manual edges and moved devices stay.
pub async fn clear_inferred_parent(pool: &SqlitePool, id: &str, parent_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE devices SET parent_id = NULL, port = NULL WHERE id = ? AND parent_id = ? AND parent_manual = 0",
    )
    .bind(id)
    .bind(parent_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_manual_parent(pool: &SqlitePool, id: &str, parent_id: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE devices SET parent_id = ?, port = NULL, parent_manual = ? WHERE id = ?")
        .bind(parent_id)
        .bind(parent_id.is_some())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_gateway(pool: &SqlitePool, id: &str, is_gateway: bool) -> Result<()> {
    sqlx::query("UPDATE devices SET is_gateway = ? WHERE id = ?")
        .bind(is_gateway)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn accept_current_address(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE devices SET accepted_ip = ip, accepted_mac = mac WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_site_devices(pool: &SqlitePool, site_id: &str) -> Result<(i64, i64)> {
    let (online, offline): (i64, i64) = sqlx::query_as(
        "SELECT
             COALESCE(SUM(CASE WHEN status = 'online' THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN status = 'offline' THEN 1 ELSE 0 END), 0)
         FROM devices WHERE site_id = ? AND is_virtual = 0",
    )
    .bind(site_id)
    .fetch_one(pool)
    .await?;
    Ok((online, offline))
}

// ─── Change event queries ────────────────────────────────────────────────────

pub async fn insert_change_event(pool: &SqlitePool, e: &ChangeEvent, notified: bool) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO change_events (device_id, site_id, kind, old_value, new_value, detected_at, notified)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&e.device_id)
    .bind(&e.site_id)
    .bind(e.kind.as_str())
    .bind(&e.old_value)
    .bind(&e.new_value)
    .bind(&e.detected_at)
    .bind(notified)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_site_events(pool: &SqlitePool, site_id: &str, limit: i64) -> Result<Vec<ChangeEventRow>> {
    let events = sqlx::query_as::<_, ChangeEventRow>(
        "SELECT * FROM change_events WHERE site_id = ? ORDER BY detected_at DESC, id DESC LIMIT ?",
    )
    .bind(site_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(events)
}

// ─── Switch queries ──────────────────────────────────────────────────────────

/// Returns the registration sequence number of the new row.
pub async fn insert_switch(pool: &SqlitePool, s: &ManagedSwitch) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO managed_switches (id, site_id, name, ip, device_id, last_polled_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&s.id)
    .bind(&s.site_id)
    .bind(&s.name)
    .bind(&s.ip)
    .bind(&s.device_id)
    .bind(&s.last_polled_at)
    .bind(&s.created_at)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get_switch(pool: &SqlitePool, id: &str) -> Result<Option<ManagedSwitch>> {
    let switch = sqlx::query_as::<_, ManagedSwitch>("SELECT * FROM managed_switches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(switch)
}

pub async fn list_site_switches(pool: &SqlitePool, site_id: &str) -> Result<Vec<ManagedSwitch>> {
    let switches = sqlx::query_as::<_, ManagedSwitch>(
        "SELECT * FROM managed_switches WHERE site_id = ? ORDER BY seq",
    )
    .bind(site_id)
    .fetch_all(pool)
    .await?;
    Ok(switches)
}

pub async fn list_switches(pool: &SqlitePool) -> Result<Vec<ManagedSwitch>> {
    let switches = sqlx::query_as::<_, ManagedSwitch>("SELECT * FROM managed_switches ORDER BY site_id, seq")
        .fetch_all(pool)
        .await?;
    Ok(switches)
}

pub async fn set_switch_device(pool: &SqlitePool, switch_id: &str, device_id: &str) -> Result<()> {
    sqlx::query("UPDATE managed_switches SET device_id = ? WHERE id = ?")
        .bind(device_id)
        .bind(switch_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Swaps the cached table of one switch for `entries` in a single transaction.
pub async fn replace_forwarding_table(
    pool: &SqlitePool,
    switch_id: &str,
    entries: &[ForwardingEntry],
    polled_at: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM forwarding_entries WHERE switch_id = ?")
        .bind(switch_id)
        .execute(&mut *tx)
        .await?;
    for entry in entries {
        sqlx::query("INSERT OR REPLACE INTO forwarding_entries (switch_id, mac, port) VALUES (?, ?, ?)")
            .bind(switch_id)
            .bind(&entry.mac)
            .bind(&entry.port)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("UPDATE managed_switches SET last_polled_at = ? WHERE id = ?")
        .bind(polled_at)
        .bind(switch_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn list_site_forwarding_entries(pool: &SqlitePool, site_id: &str) -> Result<Vec<ForwardingEntry>> {
    let entries = sqlx::query_as::<_, ForwardingEntry>(
        "SELECT fe.switch_id, fe.mac, fe.port
         FROM forwarding_entries fe
         INNER JOIN managed_switches ms ON fe.switch_id = ms.id
         WHERE ms.site_id = ?
         ORDER BY fe.switch_id, fe.port, fe.mac",
    )
    .bind(site_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

// ─── Notification policy queries ─────────────────────────────────────────────

pub async fn get_notification_policy(
    pool: &SqlitePool,
    device_id: &str,
) -> Result<Option<NotificationPolicyRow>> {
    let row = sqlx::query_as::<_, NotificationPolicyRow>(
        "SELECT * FROM notification_policies WHERE device_id = ?",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn upsert_notification_policy(pool: &SqlitePool, p: &NotificationPolicyRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO notification_policies (device_id, enabled, weekdays, expected_time, grace_minutes)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(device_id) DO UPDATE SET
           enabled = excluded.enabled,
           weekdays = excluded.weekdays,
           expected_time = excluded.expected_time,
           grace_minutes = excluded.grace_minutes",
    )
    .bind(&p.device_id)
    .bind(p.enabled)
    .bind(&p.weekdays)
    .bind(&p.expected_time)
    .bind(p.grace_minutes)
    .execute(pool)
    .await?;
    Ok(())
}
