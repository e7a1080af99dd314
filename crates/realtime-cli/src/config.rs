//! Tail configuration file

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use realtime_client::SubscriptionConfig;
use realtime_common::{EventFilter, RealtimeConfig};

/// Top-level file layout: a `[realtime]` table and any number of
/// `[[subscriptions]]` entries
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub realtime: RealtimeConfig,
    pub subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntry {
    pub id: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub event: EventFilter,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub auto_reconnect: Option<bool>,
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

impl SubscriptionEntry {
    /// Subscription options without hooks
    pub fn to_config(&self) -> SubscriptionConfig {
        let mut config = SubscriptionConfig::new(self.table.clone(), self.event);
        config.schema = self.schema.clone();
        config.filter = self.filter.clone();
        config.auto_reconnect = self.auto_reconnect;
        config.max_reconnect_attempts = self.max_reconnect_attempts;
        config
    }
}

impl TailConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let config: TailConfig = toml::from_str(content).context("invalid tail configuration")?;
        config.realtime.validate()?;

        let mut seen = std::collections::HashSet::new();
        for entry in &config.subscriptions {
            if !seen.insert(entry.id.as_str()) {
                bail!("duplicate subscription id '{}'", entry.id);
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content)
    }
}
