use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub site_offline_after: chrono::Duration,
    pub site_sweep_interval: Duration,
    pub ip_conflict_sweep_interval: Duration,
    pub ip_conflict_window: chrono::Duration,
    pub topology_refresh_interval: Duration,
    pub forwarding_stale_after: chrono::Duration,
    pub schedule_offset: FixedOffset,
    pub notify_webhook_url: Option<String>,
    pub label_service_url: Option<String>,
    pub label_file: Option<String>,
    pub label_timeout: Duration,
    pub probe_ttl: Duration,
    pub notify_unconfigured: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite:./data/netmap.db".into(),
            port: 8080,
            db_max_connections: 10,
            site_offline_after: chrono::Duration::minutes(10),
            site_sweep_interval: Duration::from_secs(120),
            ip_conflict_sweep_interval: Duration::from_secs(300),
            ip_conflict_window: chrono::Duration::minutes(15),
            topology_refresh_interval: Duration::from_secs(300),
            forwarding_stale_after: chrono::Duration::minutes(60),
            schedule_offset: Utc.fix(),
            notify_webhook_url: None,
            label_service_url: None,
            label_file: None,
            label_timeout: Duration::from_secs(5),
            probe_ttl: Duration::from_secs(300),
            notify_unconfigured: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();
        let text = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: i64| -> Result<i64> {
            match text(key) {
                Some(v) => parse(key, &v),
                None => Ok(default),
            }
        };

        let offset_minutes = number("SCHEDULE_UTC_OFFSET_MINUTES", 0)?;
        let schedule_offset = offset_minutes
            .checked_mul(60)
            .and_then(|secs| i32::try_from(secs).ok())
            .and_then(FixedOffset::east_opt)
            .with_context(|| format!("SCHEDULE_UTC_OFFSET_MINUTES out of range: {offset_minutes}"))?;

        Ok(Config {
            database_url: text("DATABASE_URL").unwrap_or(defaults.database_url),
            port: match text("PORT") {
                Some(v) => parse("PORT", &v)?,
                None => defaults.port,
            },
            db_max_connections: match text("DB_MAX_CONNECTIONS") {
                Some(v) => parse("DB_MAX_CONNECTIONS", &v)?,
                None => defaults.db_max_connections,
            },
            site_offline_after: chrono::Duration::minutes(number("SITE_OFFLINE_AFTER_MINUTES", 10)?),
            site_sweep_interval: secs(number("SITE_SWEEP_INTERVAL_SECS", 120)?),
            ip_conflict_sweep_interval: secs(number("IP_CONFLICT_SWEEP_INTERVAL_SECS", 300)?),
            ip_conflict_window: chrono::Duration::minutes(number("IP_CONFLICT_WINDOW_MINUTES", 15)?),
            topology_refresh_interval: secs(number("TOPOLOGY_REFRESH_INTERVAL_SECS", 300)?),
            forwarding_stale_after: chrono::Duration::minutes(number("FORWARDING_STALE_AFTER_MINUTES", 60)?),
            schedule_offset,
            notify_webhook_url: text("NOTIFY_WEBHOOK_URL"),
            label_service_url: text("LABEL_SERVICE_URL"),
            label_file: text("LABEL_FILE"),
            label_timeout: secs(number("LABEL_TIMEOUT_SECS", 5)?),
            probe_ttl: secs(number("PROBE_TTL_SECS", 300)?),
            notify_unconfigured: match text("NOTIFY_UNCONFIGURED_DEVICES") {
                Some(v) => parse_bool("NOTIFY_UNCONFIGURED_DEVICES", &v)?,
                None => defaults.notify_unconfigured,
            },
        })
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value for {key}: {value:?}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("invalid value for {key}: {value:?}"),
    }
}

// Zero would make tokio::time::interval panic.
fn secs(value: i64) -> Duration {
    Duration::from_secs(value.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.site_offline_after, chrono::Duration::minutes(10));
        assert!(cfg.notify_webhook_url.is_none());
        assert!(!cfg.notify_unconfigured);
    }

    #[test]
    fn values_are_parsed() {
        let cfg = config(&[
            ("PORT", "9000"),
            ("SCHEDULE_UTC_OFFSET_MINUTES", "-300"),
            ("NOTIFY_UNCONFIGURED_DEVICES", "yes"),
            ("LABEL_SERVICE_URL", "http://labels.local"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.schedule_offset.local_minus_utc(), -300 * 60);
        assert!(cfg.notify_unconfigured);
        assert_eq!(cfg.label_service_url.as_deref(), Some("http://labels.local"));
    }

    #[test]
    fn bad_numbers_fail_with_the_variable_name() {
        let err = config(&[("SITE_OFFLINE_AFTER_MINUTES", "ten")]).unwrap_err();
        assert!(format!("{err:#}").contains("SITE_OFFLINE_AFTER_MINUTES"));
    }
}
