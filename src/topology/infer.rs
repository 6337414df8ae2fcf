use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::db::models::{Device, ForwardingEntry, ManagedSwitch};

type PortMap = BTreeMap<String, BTreeSet<String>>;

/// Cached forwarding tables of one site, grouped switch → port → MACs.
#[derive(Debug, Clone, Default)]
pub struct SiteTables {
    by_switch: HashMap<String, PortMap>,
}

impl SiteTables {
    pub fn from_entries(entries: &[ForwardingEntry]) -> Self {
        let mut by_switch: HashMap<String, PortMap> = HashMap::new();
        for entry in entries {
            by_switch
                .entry(entry.switch_id.clone())
                .or_default()
                .entry(entry.port.clone())
                .or_default()
                .insert(entry.mac.clone());
        }
        SiteTables { by_switch }
    }

    pub fn ports(&self, switch_id: &str) -> Option<&PortMap> {
        self.by_switch.get(switch_id)
    }

    /// Port of `mac` on `switch_id` and how many MACs share that port.
    fn locate(&self, switch_id: &str, mac: &str) -> Option<(&str, usize)> {
        self.by_switch.get(switch_id)?.iter().find_map(|(port, macs)| {
            macs.contains(mac).then_some((port.as_str(), macs.len()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub device_id: String,
    pub parent_id: String,
    pub port: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TopologyPlan {
    /// Virtual switches that do not exist yet; insert before applying edges.
    pub virtual_switches: Vec<Device>,
    /// Edges that differ from what is stored.
    pub edges: Vec<Edge>,
    /// Switches this table no longer places below the polled switch.
    pub detached: Vec<String>,
}

/// Working parent map: stored edges overlaid with the ones planned so far.
struct ParentMap {
    parents: HashMap<String, Option<String>>,
}

impl ParentMap {
    fn would_cycle(&self, child: &str, parent: &str) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = Some(parent.to_string());
        while let Some(id) = cursor {
            if id == child || !seen.insert(id.clone()) {
                return true;
            }
            cursor = self.parents.get(&id).cloned().flatten();
        }
        false
    }

    fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut cursor = self.parents.get(id).cloned().flatten();
        while let Some(parent) = cursor {
            if !found.insert(parent.clone()) {
                break;
            }
            cursor = self.parents.get(&parent).cloned().flatten();
        }
        found
    }

    fn set(&mut self, child: &str, parent: &str) {
        self.parents.insert(child.to_string(), Some(parent.to_string()));
    }

    fn clear(&mut self, child: &str) {
        self.parents.insert(child.to_string(), None);
    }
}

/// Orders two switches that see the same MACs on equally crowded ports.
struct TieBreak<'a> {
    tables: &'a SiteTables,
    anchor_macs: HashMap<&'a str, &'a str>,
    gateway_macs: HashSet<&'a str>,
}

impl TieBreak<'_> {
    fn sees_on(&self, switch_id: &str, port: &str, mac: Option<&str>) -> bool {
        let Some(mac) = mac else {
            return false;
        };
        self.tables
            .ports(switch_id)
            .and_then(|ports| ports.get(port))
            .is_some_and(|macs| macs.contains(mac))
    }

    fn sees_gateway(&self, switch_id: &str) -> bool {
        self.tables.ports(switch_id).is_some_and(|ports| {
            ports
                .values()
                .flatten()
                .any(|m| self.gateway_macs.contains(m.as_str()))
        })
    }

    /// Whether `upper` sits above `lower`: the one seeing the other's own MAC
    /// on the shared port wins, then the one seeing a gateway, then the one
    /// registered first.
    fn is_above(&self, upper: &ManagedSwitch, upper_port: &str, lower: &ManagedSwitch, lower_port: &str) -> bool {
        let upper_mac = self.anchor_macs.get(upper.id.as_str()).copied();
        let lower_mac = self.anchor_macs.get(lower.id.as_str()).copied();
        if self.sees_on(&upper.id, upper_port, lower_mac) {
            return true;
        }
        if self.sees_on(&lower.id, lower_port, upper_mac) {
            return false;
        }
        match (self.sees_gateway(&upper.id), self.sees_gateway(&lower.id)) {
            (true, false) => true,
            (false, true) => false,
            _ => (upper.seq, upper.id.as_str()) < (lower.seq, lower.id.as_str()),
        }
    }
}

struct Pass<'a> {
    devices: HashMap<&'a str, &'a Device>,
    by_mac: HashMap<&'a str, &'a Device>,
    parents: ParentMap,
    assigned: HashSet<String>,
    plan: TopologyPlan,
}

impl<'a> Pass<'a> {
    /// Plans `child → parent` unless it was already assigned in this pass,
    /// is manually parented, or would close a loop.
    fn assign(&mut self, child: &str, parent: &str, port: Option<&str>) -> bool {
        if self.assigned.contains(child) {
            return false;
        }
        if let Some(device) = self.devices.get(child) {
            if device.parent_manual {
                return false;
            }
        }
        if self.parents.would_cycle(child, parent) {
            tracing::debug!("Skipping edge {} -> {}: would form a cycle", child, parent);
            return false;
        }

        self.parents.set(child, parent);
        self.assigned.insert(child.to_string());

        let unchanged = self.devices.get(child).is_some_and(|d| {
            d.parent_id.as_deref() == Some(parent) && d.port.as_deref() == port
        });
        if !unchanged {
            self.plan.edges.push(Edge {
                device_id: child.to_string(),
                parent_id: parent.to_string(),
                port: port.map(str::to_string),
            });
        }
        true
    }

    fn detach(&mut self, child: &str) {
        self.parents.clear(child);
        self.assigned.insert(child.to_string());
        self.plan.detached.push(child.to_string());
    }
}

/// One read-then-write pass over `switch`'s cached table.
///
/// Direct attach: every MAC seen on a port is parented to the switch at that
/// port, unless another switch sees it on a port shared by fewer MACs.
/// Cascades: a port whose MACs also show up deeper in another managed
/// switch's table makes that switch a child at the port. A crowded port with
/// no such switch gets a virtual switch, reused by `(switch, port)`.
/// A port carrying the MAC of a gateway or of one of the switch's own
/// ancestors leads upstream and is left alone. Two switches seeing the same
/// MACs on equally crowded ports are ordered by [`TieBreak`], so the result
/// does not depend on which table arrived first. A switch previously inferred
/// below this one that the table no longer supports is detached.
pub fn infer_switch(
    switch: &ManagedSwitch,
    switches: &[ManagedSwitch],
    tables: &SiteTables,
    devices: &[Device],
    now: DateTime<Utc>,
) -> Result<TopologyPlan> {
    let Some(anchor) = switch.device_id.as_deref() else {
        bail!("switch {} has no device", switch.name);
    };
    let Some(ports) = tables.ports(&switch.id) else {
        return Ok(TopologyPlan::default());
    };

    let mut pass = Pass {
        devices: devices.iter().map(|d| (d.id.as_str(), d)).collect(),
        by_mac: devices
            .iter()
            .filter_map(|d| d.mac.as_deref().map(|m| (m, d)))
            .collect(),
        parents: ParentMap {
            parents: devices.iter().map(|d| (d.id.clone(), d.parent_id.clone())).collect(),
        },
        assigned: HashSet::new(),
        plan: TopologyPlan::default(),
    };

    // Gateways and this switch's own ancestors are reached through the uplink.
    let ancestors = pass.parents.ancestors(anchor);
    let upstream_macs: HashSet<&str> = devices
        .iter()
        .filter(|d| d.is_gateway || ancestors.contains(&d.id))
        .filter_map(|d| d.mac.as_deref())
        .collect();
    let tiebreak = TieBreak {
        tables,
        anchor_macs: switches
            .iter()
            .filter_map(|s| {
                let anchor = s.device_id.as_deref()?;
                let mac = devices.iter().find(|d| d.id == anchor)?.mac.as_deref()?;
                Some((s.id.as_str(), mac))
            })
            .collect(),
        gateway_macs: devices
            .iter()
            .filter(|d| d.is_gateway)
            .filter_map(|d| d.mac.as_deref())
            .collect(),
    };
    let others: Vec<(&ManagedSwitch, &str)> = switches
        .iter()
        .filter(|s| s.id != switch.id)
        .filter_map(|s| s.device_id.as_deref().map(|d| (s, d)))
        .collect();

    for (port, macs) in ports {
        if macs.iter().any(|m| upstream_macs.contains(m.as_str())) {
            tracing::debug!("{} port {} leads upstream, skipping", switch.name, port);
            continue;
        }

        // Switches hanging off this port. A MAC seen there on a port no more
        // crowded than ours means that switch sits further down this branch.
        let mut downstream: Vec<&ManagedSwitch> = Vec::new();
        for (other, other_anchor) in &others {
            let deeper = macs.iter().any(|m| match tables.locate(&other.id, m) {
                Some((_, count)) if count < macs.len() => true,
                Some((other_port, count)) if count == macs.len() => {
                    tiebreak.is_above(switch, port, other, other_port)
                }
                _ => false,
            });
            if !deeper {
                continue;
            }
            let already_child = pass
                .devices
                .get(other_anchor)
                .is_some_and(|d| d.parent_id.as_deref() == Some(anchor));
            if pass.assign(other_anchor, anchor, Some(port)) || already_child {
                downstream.push(*other);
            }
        }

        // MACs that belong here rather than to a downstream or more specific switch.
        let mut local: Vec<&Device> = Vec::new();
        for mac in macs {
            let Some(device) = pass.by_mac.get(mac.as_str()).copied() else {
                continue;
            };
            if device.id == anchor || device.is_virtual {
                continue;
            }
            if downstream.iter().any(|s| tables.locate(&s.id, mac).is_some()) {
                continue;
            }
            let elsewhere_narrower = others.iter().any(|(other, _)| {
                tables
                    .locate(&other.id, mac)
                    .is_some_and(|(_, count)| count < macs.len())
            });
            if elsewhere_narrower {
                continue;
            }
            local.push(device);
        }

        if macs.len() > 1 && downstream.is_empty() && !local.is_empty() {
            let vs_id = match devices.iter().find(|d| {
                d.is_virtual
                    && d.virtual_switch_id.as_deref() == Some(switch.id.as_str())
                    && d.virtual_port.as_deref() == Some(port.as_str())
            }) {
                Some(existing) => existing.id.clone(),
                None => {
                    let vs = Device::new_virtual_switch(&switch.site_id, &switch.id, &switch.name, port, now);
                    let id = vs.id.clone();
                    pass.plan.virtual_switches.push(vs);
                    id
                }
            };
            pass.assign(&vs_id, anchor, Some(port));
            for device in local {
                pass.assign(&device.id, &vs_id, None);
            }
        } else {
            for device in local {
                pass.assign(&device.id, anchor, Some(port));
            }
        }
    }

    for (_, other_anchor) in &others {
        if pass.assigned.contains(*other_anchor) {
            continue;
        }
        let stale = pass
            .devices
            .get(other_anchor)
            .is_some_and(|d| !d.parent_manual && d.parent_id.as_deref() == Some(anchor));
        if stale {
            pass.detach(other_anchor);
        }
    }

    Ok(pass.plan)
}
