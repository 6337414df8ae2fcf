use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::ingest::normalize_mac;

/// Display decoration for a device, keyed by MAC in an external directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub title: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelLookup {
    Found(Label),
    NotFound,
}

/// Lookups collected for one batch. A MAC with no entry means the directory
/// could not answer, so the device keeps what it had.
pub type LabelLookups = HashMap<String, LabelLookup>;

#[async_trait]
pub trait LabelDirectory: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }
    async fn lookup(&self, mac: &str) -> Result<LabelLookup>;
}

/// Used when no directory is configured.
pub struct NoLabels;

#[async_trait]
impl LabelDirectory for NoLabels {
    fn enabled(&self) -> bool {
        false
    }

    async fn lookup(&self, _mac: &str) -> Result<LabelLookup> {
        anyhow::bail!("label directory not configured")
    }
}

/// Labels loaded once from a JSON object of `{ "<mac>": { "title": ... } }`.
pub struct FileLabelDirectory {
    labels: HashMap<String, Label>,
}

impl FileLabelDirectory {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: HashMap<String, Label> = serde_json::from_str(json)?;
        let labels = raw
            .into_iter()
            .filter_map(|(mac, label)| normalize_mac(&mac).map(|mac| (mac, label)))
            .collect();
        Ok(FileLabelDirectory { labels })
    }

    pub async fn load(path: &str) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading label file {path}"))?;
        let directory = Self::from_json(&json)?;
        tracing::info!("Loaded {} labels from {}", directory.labels.len(), path);
        Ok(directory)
    }
}

#[async_trait]
impl LabelDirectory for FileLabelDirectory {
    async fn lookup(&self, mac: &str) -> Result<LabelLookup> {
        Ok(match self.labels.get(mac) {
            Some(label) => LabelLookup::Found(label.clone()),
            None => LabelLookup::NotFound,
        })
    }
}

/// `GET {base}/labels/{mac}`: 200 with a [`Label`] body, 404 when unknown.
pub struct HttpLabelDirectory {
    base_url: String,
    client: Client,
}

impl HttpLabelDirectory {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpLabelDirectory {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl LabelDirectory for HttpLabelDirectory {
    async fn lookup(&self, mac: &str) -> Result<LabelLookup> {
        let resp = self
            .client
            .get(format!("{}/labels/{}", self.base_url, mac))
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(LabelLookup::NotFound),
            status if status.is_success() => Ok(LabelLookup::Found(resp.json::<Label>().await?)),
            status => anyhow::bail!("label service returned {}", status),
        }
    }
}

/// Looks up every MAC concurrently. Failures and timeouts are logged and
/// left out of the result.
pub async fn fetch_labels(
    directory: &Arc<dyn LabelDirectory>,
    macs: &[String],
    timeout: Duration,
) -> LabelLookups {
    if !directory.enabled() || macs.is_empty() {
        return LabelLookups::new();
    }

    let lookups = macs.iter().map(|mac| async move {
        match tokio::time::timeout(timeout, directory.lookup(mac)).await {
            Ok(Ok(lookup)) => Some((mac.clone(), lookup)),
            Ok(Err(e)) => {
                tracing::warn!("Label lookup for {} failed: {}", mac, e);
                None
            }
            Err(_) => {
                tracing::warn!("Label lookup for {} timed out", mac);
                None
            }
        }
    });

    futures::future::join_all(lookups)
        .await
        .into_iter()
        .flatten()
        .collect()
}
