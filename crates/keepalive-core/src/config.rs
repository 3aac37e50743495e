use std::path::Path;
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use keepalive_protocol::{Advisories, MAX_HEARTBEAT_INTERVAL, MIN_HEARTBEAT_INTERVAL};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: i64 = 30_000;
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
pub const MAX_RETRY_COUNT_LIMIT: u32 = 10;
pub const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_UPLINK_TIMEOUT_MS: u64 = 10_000;

const DEFAULT_NOTIFICATION_TITLE: &str = "Running in background";
const DEFAULT_NOTIFICATION_BODY: &str = "Keeping health reports up to date";
const DEFAULT_NOTIFICATION_ICON: &str = "ic_notification";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    #[serde(alias = "content")]
    pub body: String,
    pub icon: String,
    #[serde(alias = "showProgress")]
    pub show_progress: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: DEFAULT_NOTIFICATION_TITLE.to_string(),
            body: DEFAULT_NOTIFICATION_BODY.to_string(),
            icon: DEFAULT_NOTIFICATION_ICON.to_string(),
            show_progress: false,
        }
    }
}

/// Vendor adaptation toggles. Advisory only: surfaced to the host through
/// `Status.advisories`, never acted on by the core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct AdaptationConfig {
    #[serde(alias = "enableManufacturerOptimization")]
    pub enable_manufacturer_opt: bool,
    #[serde(alias = "enableBatteryWhitelist")]
    pub enable_battery_whitelist: bool,
    #[serde(alias = "enableAutoStart")]
    pub enable_autostart: bool,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            enable_manufacturer_opt: true,
            enable_battery_whitelist: true,
            enable_autostart: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    /// Base heartbeat interval; clamped to 15s..=300s on load, so zero or
    /// negative values mean the minimum.
    #[serde(alias = "heartbeatInterval")]
    pub heartbeat_interval_ms: i64,
    /// Transient uplink failures tolerated per cached record, at most 10.
    #[serde(alias = "maxRetryCount")]
    pub max_retry_count: u32,
    pub notification: NotificationConfig,
    pub adaptation: AdaptationConfig,
    /// Let observed heartbeat density nudge the interval within its level band.
    pub adaptive_tuning: bool,
    pub persist_debounce_ms: u64,
    pub uplink_timeout_ms: u64,
    pub app_version: Option<String>,
    pub os_version: Option<String>,
    /// Host fingerprint; a persisted or generated id is used when absent.
    pub device_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            notification: NotificationConfig::default(),
            adaptation: AdaptationConfig::default(),
            adaptive_tuning: false,
            persist_debounce_ms: DEFAULT_PERSIST_DEBOUNCE_MS,
            uplink_timeout_ms: DEFAULT_UPLINK_TIMEOUT_MS,
            app_version: None,
            os_version: None,
            device_id: None,
        }
    }
}

static CONFIG_SCHEMA: Lazy<Result<Validator, String>> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).map_err(|err| err.to_string())?;
    validator_for(&schema_value).map_err(|err| err.to_string())
});

/// Returns the JSON schema describing the configuration document.
pub fn config_schema_json() -> Result<Value, ConfigError> {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).map_err(|err| ConfigError::Schema(err.to_string()))
}

fn validate(document: &Value) -> Result<(), ConfigError> {
    let validator = CONFIG_SCHEMA
        .as_ref()
        .map_err(|err| ConfigError::Schema(err.clone()))?;
    let errors: Vec<_> = validator
        .iter_errors(document)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::Schema(errors.join(", ")));
    }
    Ok(())
}

impl Config {
    /// Validates and normalizes an already-parsed document.
    pub fn from_value(document: Value) -> Result<Self, ConfigError> {
        validate(&document)?;
        let cfg: Config =
            serde_json::from_value(document).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Ok(cfg.normalized())
    }

    /// Parses the JSON payload a host bridge hands to `init`.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let document: Value =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::from_value(document)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let table: toml::Value =
            toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let document =
            serde_json::to_value(&table).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::from_value(document)
    }

    /// Pulls numeric fields into range and defaults blank strings.
    pub fn normalized(mut self) -> Self {
        self.max_retry_count = self.max_retry_count.min(MAX_RETRY_COUNT_LIMIT);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.clamp(
            MIN_HEARTBEAT_INTERVAL.as_millis() as i64,
            MAX_HEARTBEAT_INTERVAL.as_millis() as i64,
        );
        let defaults = NotificationConfig::default();
        if self.notification.title.trim().is_empty() {
            self.notification.title = defaults.title;
        }
        if self.notification.body.trim().is_empty() {
            self.notification.body = defaults.body;
        }
        if self.notification.icon.trim().is_empty() {
            self.notification.icon = defaults.icon;
        }
        self.uplink_timeout_ms = self.uplink_timeout_ms.max(100);
        self.app_version = non_blank(self.app_version);
        self.os_version = non_blank(self.os_version);
        self.device_id = non_blank(self.device_id);
        self
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.heartbeat_interval_ms).unwrap_or(0))
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn uplink_timeout(&self) -> Duration {
        Duration::from_millis(self.uplink_timeout_ms)
    }

    pub fn advisories(&self) -> Advisories {
        Advisories {
            manufacturer_optimization: self.adaptation.enable_manufacturer_opt,
            battery_whitelist: self.adaptation.enable_battery_whitelist,
            autostart: self.adaptation.enable_autostart,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Loads a TOML config file, validating it against the generated schema.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::from_json_str("{}").expect("empty config");
        assert!(cfg.enabled);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.max_retry_count, 3);
        assert!(!cfg.adaptive_tuning);
        assert_eq!(cfg.persist_debounce(), Duration::from_millis(250));
        assert_eq!(cfg.notification.title, DEFAULT_NOTIFICATION_TITLE);
        assert!(cfg.advisories().autostart);
    }

    #[test]
    fn interval_is_clamped() {
        let low = Config::from_value(json!({"heartbeat_interval_ms": 1000})).expect("low");
        assert_eq!(low.heartbeat_interval_ms, 15_000);
        let high = Config::from_value(json!({"heartbeatInterval": 3_600_000})).expect("high");
        assert_eq!(high.heartbeat_interval_ms, 300_000);
    }

    #[test]
    fn negative_interval_and_retry_overflow_are_clamped() {
        let cfg = Config::from_value(json!({"heartbeatInterval": -5000, "maxRetryCount": 25}))
            .expect("clamped");
        assert_eq!(cfg.heartbeat_interval_ms, 15_000);
        assert_eq!(cfg.base_interval(), Duration::from_secs(15));
        assert_eq!(cfg.max_retry_count, MAX_RETRY_COUNT_LIMIT);

        let direct = Config {
            heartbeat_interval_ms: 0,
            max_retry_count: 11,
            ..Config::default()
        }
        .normalized();
        assert_eq!(direct.heartbeat_interval_ms, 15_000);
        assert_eq!(direct.max_retry_count, 10);
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let err = Config::from_value(json!({"enabled": "yes"})).expect_err("type error");
        assert!(matches!(err, ConfigError::Schema(_)));
        let err = Config::from_value(json!({"max_retry_count": -1})).expect_err("negative");
        assert!(matches!(err, ConfigError::Schema(_)));
        let err = Config::from_value(json!({"heartbeat_interval_ms": "fast"})).expect_err("string");
        assert!(matches!(err, ConfigError::Schema(_)));
    }

    #[test]
    fn blank_notification_strings_fall_back() {
        let cfg = Config::from_value(json!({
            "notification": {"title": "  ", "content": "Syncing", "showProgress": true}
        }))
        .expect("notification");
        assert_eq!(cfg.notification.title, DEFAULT_NOTIFICATION_TITLE);
        assert_eq!(cfg.notification.body, "Syncing");
        assert!(cfg.notification.show_progress);
    }

    #[test]
    fn toml_documents_load_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keepalive.toml");
        std::fs::write(
            &path,
            r#"
enabled = false
heartbeat_interval_ms = 60000
adaptive_tuning = true
device_id = "  device-7  "

[adaptation]
enable_autostart = false
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(!cfg.enabled);
        assert_eq!(cfg.base_interval(), Duration::from_secs(60));
        assert!(cfg.adaptive_tuning);
        assert_eq!(cfg.device_id.as_deref(), Some("device-7"));
        assert!(!cfg.advisories().autostart);
        assert!(cfg.advisories().battery_whitelist);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_config("/definitely/not/here.toml").expect_err("missing");
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn schema_is_exposed() {
        let schema = config_schema_json().expect("schema");
        assert!(schema["properties"]["heartbeat_interval_ms"].is_object());
    }
}
