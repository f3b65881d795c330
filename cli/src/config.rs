// Configuration management for the wps CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/webpubsub-cli/config.json
// - Linux: ~/.config/webpubsub-cli/config.json
// - Windows: %APPDATA%\webpubsub-cli\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use webpubsub_core::{Protocol, RetryPolicy, WebPubSubClientOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client access URL, including its access token
    pub url: Option<String>,

    /// `reliable` or `json`
    pub protocol: String,

    /// Seconds to wait for each ack
    pub ack_timeout: u64,

    /// Open a new session after an unrecoverable drop
    pub auto_reconnect: bool,

    /// Re-join groups on a new session
    pub auto_rejoin_groups: bool,

    /// Reconnect settings
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts before giving up
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    pub base_delay_ms: u64,

    /// Longest retry delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            protocol: "reliable".to_string(),
            ack_timeout: 30,
            auto_reconnect: true,
            auto_rejoin_groups: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("webpubsub-cli");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "url" => {
                self.url = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "protocol" => {
                Protocol::parse(value).context("Protocol must be `reliable` or `json`")?;
                self.protocol = value.to_string();
            }
            "ack_timeout" => {
                self.ack_timeout = value.parse().context("Invalid number")?;
            }
            "auto_reconnect" => {
                self.auto_reconnect = value.parse().context("Invalid boolean value")?;
            }
            "auto_rejoin_groups" => {
                self.auto_rejoin_groups = value.parse().context("Invalid boolean value")?;
            }
            "max_attempts" => {
                self.reconnect.max_attempts = value.parse().context("Invalid number")?;
            }
            "base_delay_ms" => {
                self.reconnect.base_delay_ms = value.parse().context("Invalid number")?;
            }
            "max_delay_ms" => {
                self.reconnect.max_delay_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.save()?;
        Ok(())
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "url".to_string(),
                self.url.clone().unwrap_or_else(|| "(not set)".to_string()),
            ),
            ("protocol".to_string(), self.protocol.clone()),
            ("ack_timeout".to_string(), format!("{}s", self.ack_timeout)),
            ("auto_reconnect".to_string(), self.auto_reconnect.to_string()),
            (
                "auto_rejoin_groups".to_string(),
                self.auto_rejoin_groups.to_string(),
            ),
            (
                "max_attempts".to_string(),
                self.reconnect.max_attempts.to_string(),
            ),
            (
                "base_delay_ms".to_string(),
                self.reconnect.base_delay_ms.to_string(),
            ),
            (
                "max_delay_ms".to_string(),
                self.reconnect.max_delay_ms.to_string(),
            ),
        ]
    }

    /// Engine options built from this config
    pub fn client_options(&self) -> Result<WebPubSubClientOptions> {
        let protocol = Protocol::parse(&self.protocol)
            .with_context(|| format!("Unknown protocol in config: {}", self.protocol))?;
        let reconnect = RetryPolicy::exponential(
            self.reconnect.max_attempts,
            Duration::from_millis(self.reconnect.base_delay_ms),
            Duration::from_millis(self.reconnect.max_delay_ms),
        )
        .with_jitter(true);

        Ok(WebPubSubClientOptions::default()
            .with_protocol(protocol)
            .with_ack_timeout(Duration::from_secs(self.ack_timeout))
            .with_auto_reconnect(self.auto_reconnect)
            .with_auto_rejoin_groups(self.auto_rejoin_groups)
            .with_reconnect_policy(reconnect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.url.is_none());
        assert_eq!(config.protocol, "reliable");
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.ack_timeout, deserialized.ack_timeout);
        assert_eq!(
            config.reconnect.max_attempts,
            deserialized.reconnect.max_attempts
        );
    }

    #[test]
    fn test_client_options() {
        let mut config = Config::default();
        config.protocol = "json".to_string();
        config.ack_timeout = 5;
        config.auto_rejoin_groups = false;

        let options = config.client_options().unwrap();
        assert_eq!(options.protocol, Protocol::Json);
        assert_eq!(options.ack_timeout, Duration::from_secs(5));
        assert!(!options.auto_rejoin_groups);
        assert_eq!(options.reconnect_policy.max_attempts, 10);
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let config = Config {
            protocol: "protobuf".to_string(),
            ..Config::default()
        };
        assert!(config.client_options().is_err());
    }
}
