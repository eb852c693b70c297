use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AdbSettings {
    pub command_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerSettings {
    pub reconnect_delay_ms: u64,
    pub name_retry_delay_ms: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3_000,
            name_retry_delay_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AyaSettings {
    pub payload_path: String,
    pub socket_name: String,
    pub remote_dir: String,
    pub server_class: String,
    pub ready_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    pub dial_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub close_wait_ms: u64,
    pub batch_size: usize,
}

impl Default for AyaSettings {
    fn default() -> Self {
        Self {
            payload_path: String::new(),
            socket_name: "aya".to_string(),
            remote_dir: "/data/local/tmp/aya".to_string(),
            server_class: "io.liriliri.aya.Server".to_string(),
            ready_timeout_ms: 10_000,
            ready_poll_interval_ms: 100,
            dial_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            close_wait_ms: 2_000,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub aya: AyaSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl TrackerSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn name_retry_delay(&self) -> Duration {
        Duration::from_millis(self.name_retry_delay_ms)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("AYA_BRIDGE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".aya_bridge_config.json")
}

pub fn load_config(trace_id: &str) -> Result<BridgeConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<BridgeConfig, AppError> {
    if !path.exists() {
        return Ok(BridgeConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: BridgeConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

fn validate_config(mut config: BridgeConfig) -> BridgeConfig {
    let tracker_defaults = TrackerSettings::default();
    let aya_defaults = AyaSettings::default();

    if config.tracker.reconnect_delay_ms < 100 {
        config.tracker.reconnect_delay_ms = tracker_defaults.reconnect_delay_ms;
    }
    if config.tracker.name_retry_delay_ms > 60_000 {
        config.tracker.name_retry_delay_ms = tracker_defaults.name_retry_delay_ms;
    }
    if config.aya.socket_name.trim().is_empty() {
        config.aya.socket_name = aya_defaults.socket_name;
    }
    if !config.aya.remote_dir.starts_with('/') {
        config.aya.remote_dir = aya_defaults.remote_dir;
    }
    if config.aya.server_class.trim().is_empty() {
        config.aya.server_class = aya_defaults.server_class;
    }
    if config.aya.ready_timeout_ms == 0 {
        config.aya.ready_timeout_ms = aya_defaults.ready_timeout_ms;
    }
    if config.aya.ready_poll_interval_ms < 10 {
        config.aya.ready_poll_interval_ms = aya_defaults.ready_poll_interval_ms;
    }
    if config.aya.dial_timeout_ms == 0 {
        config.aya.dial_timeout_ms = aya_defaults.dial_timeout_ms;
    }
    if config.aya.request_timeout_ms == 0 {
        config.aya.request_timeout_ms = aya_defaults.request_timeout_ms;
    }
    if config.aya.batch_size == 0 {
        config.aya.batch_size = aya_defaults.batch_size;
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = LoggingSettings::default().log_level;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from_path(&dir.path().join("absent.json"), "t")
            .expect("defaults");
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.aya.request_timeout_ms, 30_000);
        assert_eq!(config.tracker.reconnect_delay_ms, 3_000);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"adb": {{"command_path": "/opt/adb"}}, "aya": {{"batch_size": 20, "socket_name": "aya"}}}}"#
        )
        .expect("write");
        let config = load_config_from_path(file.path(), "t").expect("load");
        assert_eq!(config.adb.command_path, "/opt/adb");
        assert_eq!(config.aya.batch_size, 20);
        assert_eq!(config.aya.remote_dir, "/data/local/tmp/aya");
        assert_eq!(config.tracker, TrackerSettings::default());
    }

    #[test]
    fn malformed_file_is_validation_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{{not json").expect("write");
        let err = load_config_from_path(file.path(), "trace-9").expect_err("parse error");
        assert_eq!(err.code, crate::app::error::ErrorCode::Validation);
        assert_eq!(err.trace_id, "trace-9");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = BridgeConfig::default();
        config.tracker.reconnect_delay_ms = 0;
        config.aya.batch_size = 0;
        config.aya.remote_dir = "relative/dir".to_string();
        config.aya.ready_poll_interval_ms = 1;
        let validated = validate_config(config);
        assert_eq!(validated.tracker.reconnect_delay_ms, 3_000);
        assert_eq!(validated.aya.batch_size, 50);
        assert_eq!(validated.aya.remote_dir, "/data/local/tmp/aya");
        assert_eq!(validated.aya.ready_poll_interval_ms, 100);
    }
}
