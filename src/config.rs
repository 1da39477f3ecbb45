//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_RELAY_IDLE_TIMEOUT_SECS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub audio: AudioSettings,
}

/// Server bind settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: localhost only (development)
/// - `host = "0.0.0.0"`: accept connections from anywhere (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Relay behavior settings.
///
/// ## Fields:
/// - `max_session_participants`: capacity of a multiparty session
/// - `idle_timeout_secs`: stream sessions idle this long are closed
/// - `sweep_interval_secs`: how often the idle sweep runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_session_participants: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `sample_rate` / `channels` / `bit_depth`: expected PCM format
/// - `reorder_capacity`: max chunks held while waiting for a missing sequence
/// - `vad_threshold`: normalized mean-amplitude gate for voice activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub reorder_capacity: usize,
    pub vad_threshold: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            relay: RelayConfig {
                max_session_participants: crate::relay::multiparty::DEFAULT_MAX_PARTICIPANTS,
                idle_timeout_secs: 3600,
                sweep_interval_secs: 60,
            },
            audio: AudioSettings {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                reorder_capacity: 100,
                vad_threshold: 0.01,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, file, and environment, in priority
    /// order. `HOST`/`PORT` are honored separately for deployment platforms
    /// that don't follow the APP_ prefix convention.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catches configuration errors at startup rather than as runtime
    /// failures deep in the relay.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_session_participants == 0 {
            return Err(anyhow::anyhow!(
                "Max session participants must be greater than 0"
            ));
        }

        if self.relay.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Sweep interval must be greater than 0"));
        }

        if self.audio.reorder_capacity == 0 {
            return Err(anyhow::anyhow!("Reorder capacity must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.audio.vad_threshold) {
            return Err(anyhow::anyhow!("VAD threshold must be within [0, 1]"));
        }

        Ok(())
    }

    /// Partial runtime update from a JSON body, e.g.
    /// `{"relay": {"idle_timeout_secs": 600}}` changes only that field.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(relay) = partial_config.get("relay") {
            if let Some(cap) = relay
                .get("max_session_participants")
                .and_then(|v| v.as_u64())
            {
                self.relay.max_session_participants = cap as usize;
            }
            if let Some(timeout) = relay.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.relay.idle_timeout_secs = timeout;
            }
            if let Some(interval) = relay.get("sweep_interval_secs").and_then(|v| v.as_u64()) {
                self.relay.sweep_interval_secs = interval;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("sample_rate").and_then(|v| v.as_u64()) {
                self.audio.sample_rate = rate as u32;
            }
            if let Some(capacity) = audio.get("reorder_capacity").and_then(|v| v.as_u64()) {
                self.audio.reorder_capacity = capacity as usize;
            }
            if let Some(threshold) = audio.get("vad_threshold").and_then(|v| v.as_f64()) {
                self.audio.vad_threshold = threshold;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.relay.max_session_participants, 4);
        assert_eq!(config.audio.reorder_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.vad_threshold = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"relay": {"idle_timeout_secs": 600}, "server": {"port": 9090}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.relay.idle_timeout_secs, 600);
        assert_eq!(config.server.port, 9090);
        // untouched fields keep their values
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.relay.max_session_participants, 4);
    }

    #[test]
    fn test_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"vad_threshold": 5.0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
