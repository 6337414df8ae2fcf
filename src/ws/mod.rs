use serde::{Deserialize, Serialize};

use crate::db::models::ChangeKind;

/// All WebSocket events sent to connected clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// A change event was recorded for a device
    DeviceChanged {
        site_id: String,
        device_id: String,
        kind: ChangeKind,
        old_value: Option<String>,
        new_value: Option<String>,
        detected_at: String,
        notified: bool,
    },
    /// A scan batch finished reconciling
    ScanProcessed {
        site_id: String,
        accepted: usize,
        dropped: usize,
        created: usize,
        updated: usize,
        deleted: usize,
        events: usize,
    },
    /// A site started or stopped reporting
    SiteStatus {
        site_id: String,
        name: String,
        status: String,
    },
    /// Two online devices answer on the same address
    IpConflict {
        site_id: String,
        ip: String,
        macs: Vec<String>,
    },
    /// Parent/port edges were recomputed from a switch's forwarding table
    TopologyUpdated {
        site_id: String,
        switch_id: String,
        edges: usize,
        virtual_switches_created: usize,
    },
    /// A manual override changed a device
    DeviceOverridden {
        site_id: String,
        device_id: String,
        action: String,
    },
    /// An agent answered a probe request
    ProbeAcknowledged {
        site_id: String,
        token: String,
        round_trip_ms: u64,
    },
}

impl WsEvent {
    pub fn site_id(&self) -> &str {
        match self {
            WsEvent::DeviceChanged { site_id, .. }
            | WsEvent::ScanProcessed { site_id, .. }
            | WsEvent::SiteStatus { site_id, .. }
            | WsEvent::IpConflict { site_id, .. }
            | WsEvent::TopologyUpdated { site_id, .. }
            | WsEvent::DeviceOverridden { site_id, .. }
            | WsEvent::ProbeAcknowledged { site_id, .. } => site_id,
        }
    }
}
