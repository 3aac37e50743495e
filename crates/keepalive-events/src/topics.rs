//! Canonical event topic constants published by the keep-alive core.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Records
pub const TOPIC_EVENT_RECORDED: &str = "keepalive.event.recorded";
pub const TOPIC_HEARTBEAT_RECORDED: &str = "keepalive.heartbeat.recorded";
pub const TOPIC_LOGS_CLEARED: &str = "keepalive.logs.cleared";

// Lifecycle
pub const TOPIC_POLICY_CHANGED: &str = "keepalive.policy.changed";
pub const TOPIC_RESTART_SCHEDULED: &str = "keepalive.restart.scheduled";
pub const TOPIC_STATE_CHANGED: &str = "keepalive.state.changed";

// Uplink
pub const TOPIC_UPLINK_FLUSHED: &str = "keepalive.uplink.flushed";
