use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::timestamp;

/// Maximum number of prior addresses kept per device.
pub const IP_HISTORY_LIMIT: usize = 10;

// ─── Site ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub status: String, // online | offline
    pub last_report_at: Option<String>,
    pub agent_version: Option<String>,
    pub scan_interval_minutes: i64,
    pub enabled: bool,
    pub created_at: String,
}

impl Site {
    pub fn new(name: String, scan_interval_minutes: i64) -> Self {
        Site {
            id: Uuid::new_v4().to_string(),
            name,
            status: "offline".into(),
            last_report_at: None,
            agent_version: None,
            scan_interval_minutes,
            enabled: true,
            created_at: timestamp(Utc::now()),
        }
    }
}

// ─── Device ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    /// Insertion order; 0 until the row has been persisted.
    pub seq: i64,
    pub id: String,
    pub site_id: String,
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub previous_ip: Option<String>,
    pub previous_mac: Option<String>,
    /// JSON array of prior addresses, oldest first.
    pub ip_history: String,
    pub accepted_ip: Option<String>,
    pub accepted_mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub device_type: Option<String>,
    pub type_manual: bool,
    pub label_title: Option<String>,
    pub label_path: Option<String>,
    pub label_account: Option<String>,
    pub status: String, // online | offline
    pub reachable: bool,
    pub firmware_upgrading: bool,
    pub first_seen: String,
    pub last_seen: String,
    pub parent_id: Option<String>,
    pub parent_manual: bool,
    pub port: Option<String>,
    pub is_gateway: bool,
    pub is_virtual: bool,
    pub virtual_switch_id: Option<String>,
    pub virtual_port: Option<String>,
    pub notes: Option<String>,
}

impl Device {
    pub fn new(site_id: &str, ip: Option<String>, mac: Option<String>, now: DateTime<Utc>) -> Self {
        let now = timestamp(now);
        Device {
            seq: 0,
            id: Uuid::new_v4().to_string(),
            site_id: site_id.to_string(),
            mac,
            ip,
            previous_ip: None,
            previous_mac: None,
            ip_history: "[]".into(),
            accepted_ip: None,
            accepted_mac: None,
            hostname: None,
            vendor: None,
            device_type: None,
            type_manual: false,
            label_title: None,
            label_path: None,
            label_account: None,
            status: "online".into(),
            reachable: true,
            firmware_upgrading: false,
            first_seen: now.clone(),
            last_seen: now,
            parent_id: None,
            parent_manual: false,
            port: None,
            is_gateway: false,
            is_virtual: false,
            virtual_switch_id: None,
            virtual_port: None,
            notes: None,
        }
    }

    /// A synthesized node standing in for an unmanaged switch seen behind
    /// `port` of the managed switch `switch_id`.
    pub fn new_virtual_switch(
        site_id: &str,
        switch_id: &str,
        switch_name: &str,
        port: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut device = Device::new(site_id, None, None, now);
        device.is_virtual = true;
        device.virtual_switch_id = Some(switch_id.to_string());
        device.virtual_port = Some(port.to_string());
        device.hostname = Some(format!("Unmanaged switch ({switch_name} port {port})"));
        device.device_type = Some("virtual_switch".into());
        device
    }

    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    pub fn ip_history(&self) -> Vec<String> {
        serde_json::from_str(&self.ip_history).unwrap_or_default()
    }

    /// Appends `ip` to the history, dropping the oldest entries past the cap.
    pub fn push_ip_history(&mut self, ip: &str) {
        let mut history = self.ip_history();
        history.push(ip.to_string());
        if history.len() > IP_HISTORY_LIMIT {
            let overflow = history.len() - IP_HISTORY_LIMIT;
            history.drain(..overflow);
        }
        self.ip_history = serde_json::to_string(&history).unwrap_or_else(|_| "[]".into());
    }

    pub fn has_descriptive(&self) -> bool {
        self.hostname.is_some()
            || self.vendor.is_some()
            || self.device_type.is_some()
            || self.label_title.is_some()
            || self.label_path.is_some()
            || self.label_account.is_some()
            || self.notes.is_some()
    }

    /// Copies every descriptive field `other` has and `self` lacks.
    pub fn fill_descriptive_from(&mut self, other: &Device) {
        fn fill(dst: &mut Option<String>, src: &Option<String>) {
            if dst.is_none() && src.is_some() {
                dst.clone_from(src);
            }
        }
        fill(&mut self.hostname, &other.hostname);
        fill(&mut self.vendor, &other.vendor);
        fill(&mut self.label_title, &other.label_title);
        fill(&mut self.label_path, &other.label_path);
        fill(&mut self.label_account, &other.label_account);
        fill(&mut self.notes, &other.notes);
        if self.device_type.is_none() && other.device_type.is_some() {
            self.device_type.clone_from(&other.device_type);
            self.type_manual = other.type_manual;
        }
    }

    pub fn clear_descriptive(&mut self) {
        self.hostname = None;
        self.vendor = None;
        self.device_type = None;
        self.type_manual = false;
        self.label_title = None;
        self.label_path = None;
        self.label_account = None;
        self.notes = None;
    }
}

// ─── Change events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    NewDevice,
    AddressChanged,
    ReachabilityChanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::NewDevice => "new_device",
            ChangeKind::AddressChanged => "address_changed",
            ChangeKind::ReachabilityChanged => "reachability_changed",
        }
    }
}

/// A detected transition, before it has been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub device_id: String,
    pub site_id: String,
    pub kind: ChangeKind,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: String,
}

impl ChangeEvent {
    pub fn new(
        device: &Device,
        kind: ChangeKind,
        old_value: Option<String>,
        new_value: Option<String>,
        detected_at: &str,
    ) -> Self {
        ChangeEvent {
            device_id: device.id.clone(),
            site_id: device.site_id.clone(),
            kind,
            old_value,
            new_value,
            detected_at: detected_at.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChangeEventRow {
    pub id: i64,
    pub device_id: String,
    pub site_id: String,
    pub kind: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: String,
    pub notified: bool,
}

// ─── Switches ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ManagedSwitch {
    /// Registration order; 0 until the row has been persisted.
    pub seq: i64,
    pub id: String,
    pub site_id: String,
    pub name: String,
    pub ip: String,
    pub device_id: Option<String>,
    pub last_polled_at: Option<String>,
    pub created_at: String,
}

impl ManagedSwitch {
    pub fn new(site_id: &str, name: String, ip: String) -> Self {
        ManagedSwitch {
            seq: 0,
            id: Uuid::new_v4().to_string(),
            site_id: site_id.to_string(),
            name,
            ip,
            device_id: None,
            last_polled_at: None,
            created_at: timestamp(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ForwardingEntry {
    pub switch_id: String,
    pub mac: String,
    pub port: String,
}

// ─── Notification policy ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationPolicyRow {
    pub device_id: String,
    pub enabled: bool,
    pub weekdays: Option<String>, // comma separated, e.g. "mon,tue"
    pub expected_time: Option<String>, // HH:MM
    pub grace_minutes: Option<i64>,
}
