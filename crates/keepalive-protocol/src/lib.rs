//! Data model shared by the keep-alive policy engine, supervisor and host
//! adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Maximum number of records kept in the heartbeat ring.
pub const RING_CAPACITY: usize = 100;
/// Maximum number of unsent heartbeats held while offline.
pub const CACHE_CAPACITY: usize = 50;
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyLevel {
    Minimal,
    Low,
    #[default]
    Normal,
    High,
}

impl StrategyLevel {
    pub fn nominal_interval(&self) -> Duration {
        match self {
            StrategyLevel::High => Duration::from_secs(30),
            StrategyLevel::Normal => Duration::from_secs(60),
            StrategyLevel::Low => Duration::from_secs(120),
            StrategyLevel::Minimal => Duration::from_secs(300),
        }
    }

    /// One level less aggressive; `Minimal` stays put.
    pub fn step_down(self) -> Self {
        match self {
            StrategyLevel::High => StrategyLevel::Normal,
            StrategyLevel::Normal => StrategyLevel::Low,
            StrategyLevel::Low | StrategyLevel::Minimal => StrategyLevel::Minimal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyLevel::High => "high",
            StrategyLevel::Normal => "normal",
            StrategyLevel::Low => "low",
            StrategyLevel::Minimal => "minimal",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            StrategyLevel::High => "High",
            StrategyLevel::Normal => "Normal",
            StrategyLevel::Low => "Low",
            StrategyLevel::Minimal => "Minimal",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(StrategyLevel::High),
            "normal" => Some(StrategyLevel::Normal),
            "low" => Some(StrategyLevel::Low),
            "minimal" | "min" => Some(StrategyLevel::Minimal),
            _ => None,
        }
    }
}

impl fmt::Display for StrategyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_label())
    }
}

/// Effective heartbeat cadence. `Paused` is a distinct sentinel, never an
/// oversized interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "mode", content = "interval_ms")]
pub enum HeartbeatInterval {
    Every(#[serde(with = "duration_ms")] #[schemars(with = "u64")] Duration),
    Paused,
}

impl HeartbeatInterval {
    pub fn is_paused(&self) -> bool {
        matches!(self, HeartbeatInterval::Paused)
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            HeartbeatInterval::Every(d) => Some(*d),
            HeartbeatInterval::Paused => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    #[default]
    Normal,
    Low,
    Moderate,
    Critical,
}

impl MemoryPressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPressure::Normal => "normal",
            MemoryPressure::Low => "low",
            MemoryPressure::Moderate => "moderate",
            MemoryPressure::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    None,
    Wifi,
    Cellular2g,
    Cellular3g,
    Cellular4g,
    Cellular5g,
    Ethernet,
    Other,
    #[default]
    #[serde(other)]
    Unknown,
}

impl NetworkClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkClass::None => "none",
            NetworkClass::Wifi => "wifi",
            NetworkClass::Cellular2g => "cellular2g",
            NetworkClass::Cellular3g => "cellular3g",
            NetworkClass::Cellular4g => "cellular4g",
            NetworkClass::Cellular5g => "cellular5g",
            NetworkClass::Ethernet => "ethernet",
            NetworkClass::Other => "other",
            NetworkClass::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Idle,
    Starting,
    Running,
    Degraded,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Degraded => "degraded",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Failed => "failed",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "Idle",
            SupervisorState::Starting => "Starting",
            SupervisorState::Running => "Running",
            SupervisorState::Degraded => "Degraded",
            SupervisorState::Restarting => "Restarting",
            SupervisorState::Stopping => "Stopping",
            SupervisorState::Stopped => "Stopped",
            SupervisorState::Failed => "Failed",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "starting" | "start" => SupervisorState::Starting,
            "running" | "ok" => SupervisorState::Running,
            "degraded" => SupervisorState::Degraded,
            "restarting" => SupervisorState::Restarting,
            "stopping" => SupervisorState::Stopping,
            "stopped" | "disabled" => SupervisorState::Stopped,
            "failed" | "error" => SupervisorState::Failed,
            _ => SupervisorState::Idle,
        }
    }

    /// Whether a live worker is expected in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SupervisorState::Starting | SupervisorState::Running | SupervisorState::Degraded
        )
    }

    /// Status tag written into heartbeat records taken in this state.
    pub fn record_status(&self) -> RecordStatus {
        match self {
            SupervisorState::Starting | SupervisorState::Running => RecordStatus::Running,
            SupervisorState::Degraded => RecordStatus::Degraded,
            _ => RecordStatus::Stopped,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChange,
    PolicyChange,
    LoopPaused,
    LoopResumed,
    RestartScheduled,
    RestartFailure,
    WorkerFailure,
    PermissionDenied,
    MemoryDegraded,
    MemoryRecovered,
    UplinkDropped,
    FlushRetryScheduled,
    NotificationUpdated,
    #[serde(other)]
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChange => "state_change",
            EventKind::PolicyChange => "policy_change",
            EventKind::LoopPaused => "loop_paused",
            EventKind::LoopResumed => "loop_resumed",
            EventKind::RestartScheduled => "restart_scheduled",
            EventKind::RestartFailure => "restart_failure",
            EventKind::WorkerFailure => "worker_failure",
            EventKind::PermissionDenied => "permission_denied",
            EventKind::MemoryDegraded => "memory_degraded",
            EventKind::MemoryRecovered => "memory_recovered",
            EventKind::UplinkDropped => "uplink_dropped",
            EventKind::FlushRetryScheduled => "flush_retry_scheduled",
            EventKind::NotificationUpdated => "notification_updated",
            EventKind::Other => "other",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        match value.trim() {
            "state_change" => EventKind::StateChange,
            "policy_change" => EventKind::PolicyChange,
            "loop_paused" => EventKind::LoopPaused,
            "loop_resumed" => EventKind::LoopResumed,
            "restart_scheduled" => EventKind::RestartScheduled,
            "restart_failure" => EventKind::RestartFailure,
            "worker_failure" => EventKind::WorkerFailure,
            "permission_denied" => EventKind::PermissionDenied,
            "memory_degraded" => EventKind::MemoryDegraded,
            "memory_recovered" => EventKind::MemoryRecovered,
            "uplink_dropped" => EventKind::UplinkDropped,
            "flush_retry_scheduled" => EventKind::FlushRetryScheduled,
            "notification_updated" => EventKind::NotificationUpdated,
            _ => EventKind::Other,
        }
    }

    /// Kinds that count as failures when scanning the log for anomalies.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::RestartFailure
                | EventKind::WorkerFailure
                | EventKind::PermissionDenied
                | EventKind::UplinkDropped
        )
    }
}

/// Status tag carried by every record: `running|stopped|degraded|event:<kind>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordStatus {
    Running,
    Stopped,
    Degraded,
    Event(EventKind),
}

impl RecordStatus {
    pub fn tag(&self) -> String {
        match self {
            RecordStatus::Running => "running".to_string(),
            RecordStatus::Stopped => "stopped".to_string(),
            RecordStatus::Degraded => "degraded".to_string(),
            RecordStatus::Event(kind) => format!("event:{}", kind.as_str()),
        }
    }

    pub fn from_tag(value: &str) -> Option<Self> {
        match value.trim() {
            "running" => Some(RecordStatus::Running),
            "stopped" => Some(RecordStatus::Stopped),
            "degraded" => Some(RecordStatus::Degraded),
            other => other
                .strip_prefix("event:")
                .map(|kind| RecordStatus::Event(EventKind::from_slug(kind))),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl Serialize for RecordStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tag())
    }
}

impl JsonSchema for RecordStatus {
    fn schema_name() -> String {
        "RecordStatus".to_string()
    }

    fn json_schema(generator: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = String::json_schema(generator).into_object();
        schema.string().pattern = Some("^(running|stopped|degraded|event:[a-z_]+)$".to_string());
        schema.into()
    }
}

impl<'de> Deserialize<'de> for RecordStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RecordStatus::from_tag(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown record status `{raw}`")))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Heartbeat,
    Event,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EventDetail {
    pub kind: EventKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

impl EventDetail {
    pub fn new(kind: EventKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

/// A heartbeat or event entry of the ring. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LogRecord {
    pub kind: RecordKind,
    /// Heartbeat sequence number; events repeat the latest heartbeat's value.
    pub seq: u64,
    /// Total order over every record produced by one supervisor instance.
    #[serde(default)]
    pub ordinal: u64,
    pub monotonic_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub app_version: String,
    pub os_version: String,
    pub status: RecordStatus,
    #[serde(default, with = "battery_sentinel")]
    #[schemars(with = "i16")]
    pub battery_percent: Option<u8>,
    #[serde(default)]
    pub charging: bool,
    #[serde(default)]
    pub screen_on: bool,
    #[serde(default)]
    pub network: NetworkClass,
    #[serde(default)]
    pub free_memory_bytes: u64,
    #[serde(default)]
    pub total_memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventDetail>,
}

impl LogRecord {
    pub fn is_heartbeat(&self) -> bool {
        self.kind == RecordKind::Heartbeat
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        self.event.as_ref().map(|e| e.kind)
    }
}

/// Debounced view of every environment input the policy reads.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EnvironmentSnapshot {
    /// `None` (wire sentinel `-1`) when the host cannot read the battery.
    #[serde(with = "battery_sentinel")]
    #[schemars(with = "i16")]
    pub battery_percent: Option<u8>,
    pub charging: bool,
    pub screen_on: bool,
    /// `None` when connectivity is unknown; treated as up.
    pub network_up: Option<bool>,
    pub network_class: NetworkClass,
    pub power_save: bool,
    pub memory_pressure: MemoryPressure,
    pub app_foreground: bool,
    pub time_since_app_active_ms: Option<u64>,
    pub free_memory_bytes: Option<u64>,
    pub total_memory_bytes: Option<u64>,
}

impl Default for EnvironmentSnapshot {
    fn default() -> Self {
        Self {
            battery_percent: None,
            charging: false,
            screen_on: true,
            network_up: None,
            network_class: NetworkClass::Unknown,
            power_save: false,
            memory_pressure: MemoryPressure::Normal,
            app_foreground: false,
            time_since_app_active_ms: None,
            free_memory_bytes: None,
            total_memory_bytes: None,
        }
    }
}

impl EnvironmentSnapshot {
    /// Battery percent with unknown read as full.
    pub fn effective_battery(&self) -> u8 {
        self.battery_percent.unwrap_or(100)
    }

    /// Connectivity with unknown read as up (fail-open).
    pub fn network_available(&self) -> bool {
        self.network_up.unwrap_or(true)
    }

    pub fn time_since_app_active(&self) -> Option<Duration> {
        self.time_since_app_active_ms.map(Duration::from_millis)
    }

    /// Applies a partial update; returns whether anything changed.
    pub fn apply(&mut self, delta: &EnvDelta) -> bool {
        let before = self.clone();
        if let Some(raw) = delta.battery_percent {
            self.battery_percent = battery_from_raw(i64::from(raw));
        }
        if let Some(v) = delta.charging {
            self.charging = v;
        }
        if let Some(v) = delta.screen_on {
            self.screen_on = v;
        }
        if let Some(v) = delta.network_up {
            self.network_up = Some(v);
        }
        if let Some(v) = delta.network_class {
            self.network_class = v;
        }
        if let Some(v) = delta.power_save {
            self.power_save = v;
        }
        if let Some(v) = delta.memory_pressure {
            self.memory_pressure = v;
        }
        if let Some(v) = delta.app_foreground {
            self.app_foreground = v;
        }
        if let Some(v) = delta.time_since_app_active_ms {
            self.time_since_app_active_ms = Some(v);
        }
        if let Some(v) = delta.free_memory_bytes {
            self.free_memory_bytes = Some(v);
        }
        if let Some(v) = delta.total_memory_bytes {
            self.total_memory_bytes = Some(v);
        }
        *self != before
    }
}

/// Partial environment update pushed by the host.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EnvDelta {
    /// Negative values mean "unknown".
    pub battery_percent: Option<i16>,
    pub charging: Option<bool>,
    pub screen_on: Option<bool>,
    pub network_up: Option<bool>,
    pub network_class: Option<NetworkClass>,
    pub power_save: Option<bool>,
    pub memory_pressure: Option<MemoryPressure>,
    pub app_foreground: Option<bool>,
    pub time_since_app_active_ms: Option<u64>,
    pub free_memory_bytes: Option<u64>,
    pub total_memory_bytes: Option<u64>,
}

impl EnvDelta {
    pub fn is_empty(&self) -> bool {
        *self == EnvDelta::default()
    }

    /// Folds `later` over `self`; fields set in `later` win.
    pub fn merge(&mut self, later: EnvDelta) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if later.$field.is_some() { self.$field = later.$field; })*
            };
        }
        take!(
            battery_percent,
            charging,
            screen_on,
            network_up,
            network_class,
            power_save,
            memory_pressure,
            app_foreground,
            time_since_app_active_ms,
            free_memory_bytes,
            total_memory_bytes
        );
    }
}

fn battery_from_raw(raw: i64) -> Option<u8> {
    if raw < 0 {
        None
    } else {
        Some(raw.min(100) as u8)
    }
}

/// Serializes an optional battery percent using the `-1` unknown sentinel.
pub mod battery_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_i16(i16::from(*v)),
            None => serializer.serialize_i16(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        let raw = Option::<i64>::deserialize(deserializer)?;
        Ok(raw.and_then(super::battery_from_raw))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Advisory flags forwarded to the host; the core never acts on them.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Advisories {
    pub manufacturer_optimization: bool,
    pub battery_whitelist: bool,
    pub autostart: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RestartBudget {
    pub window_seconds: u64,
    pub max_restarts: u32,
    pub used: u32,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_death_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_downtime_ms: Option<u64>,
}

/// Point-in-time view returned by `status()`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Status {
    pub state: SupervisorState,
    pub enabled: bool,
    pub level: StrategyLevel,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub restart_attempts: u32,
    pub heartbeat_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub cached_records: usize,
    pub memory_pressure: MemoryPressure,
    pub device_id: String,
    pub advisories: Advisories,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_label: Option<String>,
}

/// Aggregates over the ring returned by `get_stats()`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LogStats {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    pub average_interval_ms: u64,
    pub last_hour_count: usize,
    pub by_status: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strategy_levels_order_from_minimal_to_high() {
        assert!(StrategyLevel::Minimal < StrategyLevel::Low);
        assert!(StrategyLevel::Low < StrategyLevel::Normal);
        assert!(StrategyLevel::Normal < StrategyLevel::High);
        assert_eq!(StrategyLevel::High.step_down(), StrategyLevel::Normal);
        assert_eq!(StrategyLevel::Minimal.step_down(), StrategyLevel::Minimal);
    }

    #[test]
    fn strategy_level_slugs_round_trip() {
        for level in [
            StrategyLevel::High,
            StrategyLevel::Normal,
            StrategyLevel::Low,
            StrategyLevel::Minimal,
        ] {
            assert_eq!(StrategyLevel::from_slug(level.as_str()), Some(level));
        }
        assert_eq!(StrategyLevel::from_slug(" HIGH "), Some(StrategyLevel::High));
        assert_eq!(StrategyLevel::from_slug("paused"), None);
    }

    #[test]
    fn record_status_tags_match_wire_format() {
        assert_eq!(RecordStatus::Running.tag(), "running");
        assert_eq!(
            RecordStatus::Event(EventKind::PolicyChange).tag(),
            "event:policy_change"
        );
        assert_eq!(
            RecordStatus::from_tag("event:restart_failure"),
            Some(RecordStatus::Event(EventKind::RestartFailure))
        );
        assert_eq!(
            RecordStatus::from_tag("event:something_new"),
            Some(RecordStatus::Event(EventKind::Other))
        );
        assert_eq!(RecordStatus::from_tag("active"), None);
    }

    #[test]
    fn supervisor_state_maps_to_record_status() {
        assert_eq!(SupervisorState::Running.record_status(), RecordStatus::Running);
        assert_eq!(SupervisorState::Degraded.record_status(), RecordStatus::Degraded);
        assert_eq!(SupervisorState::Restarting.record_status(), RecordStatus::Stopped);
        assert_eq!(SupervisorState::from_slug("ERROR"), SupervisorState::Failed);
    }

    #[test]
    fn snapshot_reads_battery_sentinel() {
        let snapshot: EnvironmentSnapshot = serde_json::from_value(json!({
            "battery_percent": -1,
            "charging": true,
            "network_class": "cellular4g",
        }))
        .expect("snapshot parses");
        assert_eq!(snapshot.battery_percent, None);
        assert_eq!(snapshot.effective_battery(), 100);
        assert!(snapshot.network_available());
        assert_eq!(snapshot.network_class, NetworkClass::Cellular4g);
        assert!(snapshot.screen_on);

        let encoded = serde_json::to_value(&snapshot).expect("encode");
        assert_eq!(encoded["battery_percent"], json!(-1));
    }

    #[test]
    fn unknown_network_class_falls_back() {
        let class: NetworkClass = serde_json::from_value(json!("satellite")).expect("class");
        assert_eq!(class, NetworkClass::Unknown);
    }

    #[test]
    fn delta_apply_reports_changes() {
        let mut snapshot = EnvironmentSnapshot::default();
        let delta = EnvDelta {
            battery_percent: Some(150),
            screen_on: Some(true),
            ..EnvDelta::default()
        };
        assert!(snapshot.apply(&delta));
        assert_eq!(snapshot.battery_percent, Some(100));
        assert!(!snapshot.apply(&delta));

        let unknown = EnvDelta {
            battery_percent: Some(-1),
            ..EnvDelta::default()
        };
        assert!(snapshot.apply(&unknown));
        assert_eq!(snapshot.battery_percent, None);
    }

    #[test]
    fn delta_merge_prefers_later_fields() {
        let mut first = EnvDelta {
            charging: Some(true),
            screen_on: Some(true),
            ..EnvDelta::default()
        };
        first.merge(EnvDelta {
            screen_on: Some(false),
            network_up: Some(false),
            ..EnvDelta::default()
        });
        assert_eq!(first.charging, Some(true));
        assert_eq!(first.screen_on, Some(false));
        assert_eq!(first.network_up, Some(false));
        assert!(!first.is_empty());
        assert!(EnvDelta::default().is_empty());
    }

    #[test]
    fn heartbeat_interval_serializes_paused_distinctly() {
        let every = serde_json::to_value(HeartbeatInterval::Every(Duration::from_secs(30)))
            .expect("encode");
        assert_eq!(every, json!({"mode": "every", "interval_ms": 30000}));
        let paused = serde_json::to_value(HeartbeatInterval::Paused).expect("encode");
        assert_eq!(paused, json!({"mode": "paused"}));
    }

    #[test]
    fn log_record_round_trips_through_json() {
        let record = LogRecord {
            kind: RecordKind::Event,
            seq: 4,
            ordinal: 9,
            monotonic_ms: 120_000,
            timestamp: "2024-05-20T12:00:00Z".parse().expect("ts"),
            device_id: "dev".into(),
            app_version: "1.0".into(),
            os_version: "14".into(),
            status: RecordStatus::Event(EventKind::PolicyChange),
            battery_percent: None,
            charging: false,
            screen_on: true,
            network: NetworkClass::Wifi,
            free_memory_bytes: 10,
            total_memory_bytes: 20,
            event: Some(
                EventDetail::new(EventKind::PolicyChange, "High -> Minimal")
                    .with_field("from", "High")
                    .with_field("to", "Minimal"),
            ),
        };
        let encoded = serde_json::to_string(&record).expect("encode");
        assert!(encoded.contains("\"status\":\"event:policy_change\""));
        assert!(encoded.contains("\"battery_percent\":-1"));
        let decoded: LogRecord = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, record);
        assert_eq!(
            decoded.event.as_ref().and_then(|e| e.field_str("to")),
            Some("Minimal")
        );
    }

    #[test]
    fn record_schema_describes_wire_fields() {
        let schema = serde_json::to_value(schemars::schema_for!(LogRecord)).expect("schema");
        let props = &schema["properties"];
        assert_eq!(props["battery_percent"]["type"], "integer");
        assert_eq!(props["timestamp"]["format"], "date-time");
        let status = serde_json::to_string(&schema).expect("render");
        assert!(status.contains("event:[a-z_]+"));

        let status_schema = serde_json::to_value(schemars::schema_for!(Status)).expect("status");
        assert!(status_schema["properties"]["memory_pressure"].is_object());
    }
}
