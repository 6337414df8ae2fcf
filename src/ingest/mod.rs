//! Normalization of raw collector observations.
//!
//! Agents serialize fields inconsistently: the same value can arrive as a
//! scalar, as a one-element array, or as a string still carrying the
//! delimiters of the shell that produced it (`{192.168.1.10}`, `"aa-bb-..."`).
//! Everything here is pure and produces [`Observation`]s for the resolver.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

pub const HOSTNAME_MAX_CHARS: usize = 255;

const DELIMITER_NOISE: &[char] = &['{', '}', '"', '[', ']', '\''];

/// One record as posted by an agent. Every field is kept loosely typed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawObservation {
    #[serde(default, alias = "ip_address")]
    pub ip: Value,
    #[serde(default, alias = "mac_address")]
    pub mac: Value,
    #[serde(default)]
    pub hostname: Value,
    #[serde(default)]
    pub vendor: Value,
    #[serde(default, alias = "ping_responsive")]
    pub reachable: Value,
    #[serde(default, alias = "upgrading")]
    pub firmware_upgrade: Value,
}

/// A canonical observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub ip: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub reachable: bool,
    pub firmware_upgrade: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub dropped: usize,
}

pub fn normalize_batch(raw: &[RawObservation]) -> (Vec<Observation>, IngestReport) {
    let mut report = IngestReport::default();
    let mut observations = Vec::with_capacity(raw.len());

    for (index, record) in raw.iter().enumerate() {
        match normalize_observation(record) {
            Some(obs) => {
                report.accepted += 1;
                observations.push(obs);
            }
            None => {
                report.dropped += 1;
                tracing::warn!("Dropping observation #{} without a usable IP: {}", index, record.ip);
            }
        }
    }

    (observations, report)
}

pub fn normalize_observation(raw: &RawObservation) -> Option<Observation> {
    let ip = normalize_ip(&raw.ip)?;
    Some(Observation {
        ip,
        mac: scalar_text(&raw.mac).and_then(|m| normalize_mac(&m)),
        hostname: scalar_text(&raw.hostname).map(|h| cap_chars(&h, HOSTNAME_MAX_CHARS)),
        vendor: scalar_text(&raw.vendor),
        reachable: flag(&raw.reachable).unwrap_or(true),
        firmware_upgrade: flag(&raw.firmware_upgrade).unwrap_or(false),
    })
}

/// Unwraps one-element arrays and strips delimiter noise. Empty → `None`.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            if items.len() > 1 {
                tracing::debug!("Multi-valued field, keeping first of {}", items.len());
            }
            items.first().and_then(scalar_text)
        }
        Value::String(s) => clean_text(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(_) => None,
    }
}

fn clean_text(s: &str) -> Option<String> {
    let cleaned = s.trim().trim_matches(DELIMITER_NOISE).trim();
    let cleaned: String = cleaned.chars().filter(|c| !DELIMITER_NOISE.contains(c)).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn normalize_ip(value: &Value) -> Option<String> {
    let text = scalar_text(value)?;
    // Some collectors list several addresses in one string; the first one wins.
    let first = text.split([',', ';', ' ']).find(|part| !part.is_empty())?;
    first.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Canonical `AA:BB:CC:DD:EE:FF`, or `None` for anything that is not a
/// usable unicast hardware address.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let hex: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let hex = hex.to_ascii_uppercase();
    if hex == "000000000000" || hex == "FFFFFFFFFFFF" {
        return None;
    }

    let mut out = String::with_capacity(17);
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&String::from_utf8_lossy(chunk));
    }
    Some(out)
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::Array(items) if items.len() == 1 => flag(&items[0]),
        Value::String(_) => match scalar_text(value)?.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "online" => Some(true),
            "false" | "no" | "0" | "offline" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn cap_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
