//! Gateway configuration.
//!
//! TOML file with one section per concern; every knob has a default so a
//! partial file (or none at all) still yields a runnable gateway. Admission
//! tunables double as the runtime-mutable set exposed through
//! [`crate::gateway::AdmissionController::update`].
//!
//! ```toml
//! [gateway]
//! bind = "0.0.0.0:8833"
//! max_frame_bytes = 65536
//!
//! [commands]
//! max_inflight = 8
//! default_timeout_ms = 30000
//!
//! [admission]
//! rate_window_ms = 300000
//! max_attempts_per_window = 5
//! max_devices_per_source = 10
//! soft_ban_ms = 3600000
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub use crate::gateway::admission::AdmissionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Device-facing TCP listen address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upper bound on a single frame (preamble through CRC). Declared
    /// lengths above this are treated as protocol errors, not allocations.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_bind() -> String {
    "0.0.0.0:8833".to_string()
}

fn default_max_frame_bytes() -> usize {
    65_536
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Codec 12 responses pair FIFO with requests, so the in-flight window
    /// per session stays small.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Deadline applied when a caller does not pass its own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_max_inflight() -> usize {
    8
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    /// Separate file receiving records logged under the `security` target
    /// (admission denials, handshake rejections).
    #[serde(default)]
    pub security_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("failed to read config file {}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("failed to parse config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Write a fully-defaulted configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("failed to serialize default config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("failed to write config file {}: {}", path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = Config::default();
        assert_eq!(config.gateway.bind, "0.0.0.0:8833");
        assert_eq!(config.commands.max_inflight, 8);
        assert_eq!(config.commands.default_timeout_ms, 30_000);
        assert_eq!(config.admission.rate_window_ms, 300_000);
        assert_eq!(config.admission.max_attempts_per_window, 5);
        assert_eq!(config.admission.max_devices_per_source, 10);
        assert_eq!(config.admission.soft_ban_ms, 3_600_000);
        assert!(!config.admission.imei_allow_enabled);
        assert!(!config.admission.source_allow_enabled);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            bind = "127.0.0.1:9000"

            [admission]
            max_attempts_per_window = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1:9000");
        assert_eq!(config.gateway.max_frame_bytes, 65_536);
        assert_eq!(config.admission.max_attempts_per_window, 3);
        assert_eq!(config.admission.rate_window_ms, 300_000);
        assert_eq!(config.commands.max_inflight, 8);
    }

    #[test]
    fn empty_toml_is_a_runnable_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.gateway.bind, "0.0.0.0:8833");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.gateway.bind, config.gateway.bind);
        assert_eq!(parsed.admission.soft_ban_ms, config.admission.soft_ban_ms);
    }

    #[test]
    fn allow_lists_parse_from_toml_arrays() {
        let config: Config = toml::from_str(
            r#"
            [admission]
            imei_allow_enabled = true
            imei_allow_list = ["353691844288760", "356307042441013"]
            "#,
        )
        .unwrap();
        assert!(config.admission.imei_allow_enabled);
        assert!(config.admission.imei_allow_list.contains("353691844288760"));
        assert_eq!(config.admission.imei_allow_list.len(), 2);
    }
}
