//! Configuration types for realtime subscriptions

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Manager-wide configuration; per-subscription options override these defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Prefix for generated channel names (default: "realtime")
    pub channel_prefix: String,
    /// Schema used when a subscription does not name one (default: "public")
    pub schema: String,
    /// Reconnection policy defaults
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "realtime".to_string(),
            schema: "public".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after errors and disconnects
    pub auto_reconnect: bool,
    /// Maximum consecutive reconnect attempts (default: 5)
    pub max_attempts: u32,
    /// Base delay in milliseconds (default: 3000)
    pub base_delay_ms: u64,
    /// Ceiling for the exponential delay in milliseconds (default: 30000)
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter as a fraction of the delay (default: 0.25)
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 5,
            base_delay_ms: 3000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.25,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl RealtimeConfig {
    /// Load configuration from a TOML or JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: RealtimeConfig = if path.as_ref().extension().map_or(false, |ext| ext == "toml")
        {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let reconnect = &self.reconnect;
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(Error::Config(format!(
                "reconnect.jitter_ratio must be within [0, 1], got {}",
                reconnect.jitter_ratio
            )));
        }
        if reconnect.base_delay_ms == 0 {
            return Err(Error::Config(
                "reconnect.base_delay_ms must be greater than zero".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(Error::Config(format!(
                "reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }
        if self.channel_prefix.is_empty() {
            return Err(Error::Config("channel_prefix must not be empty".to_string()));
        }
        Ok(())
    }
}
