use std::fmt;

use serde::{Deserialize, Serialize};

/// Host capability the supervisor needs before it can start a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    ForegroundService,
    Notification,
    BatteryOpt,
    Autostart,
}

impl PermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::ForegroundService => "foreground_service",
            PermissionKind::Notification => "notification",
            PermissionKind::BatteryOpt => "battery_opt",
            PermissionKind::Autostart => "autostart",
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("config failed schema validation: {0}")]
    Schema(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config io error: {0}")]
    Io(String),
}

/// Reported by a `WorkerHandle` that refuses to start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker refused to start: {0}")]
    Refused(String),
    #[error("worker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence io error for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("persisted value for `{key}` is malformed: {reason}")]
    Malformed { key: String, reason: String },
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeepAliveError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("keep-alive is not initialized or disabled")]
    NotInitialized,
    #[error("permission `{kind}` denied by host")]
    PermissionDenied { kind: PermissionKind },
    #[error(transparent)]
    WorkerRefused(#[from] WorkerError),
    #[error("keep-alive worker is not running")]
    NotRunning,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl KeepAliveError {
    /// Stable slug used in status views and event fields.
    pub fn code(&self) -> &'static str {
        match self {
            KeepAliveError::Config(_) => "invalid_config",
            KeepAliveError::NotInitialized => "not_initialized",
            KeepAliveError::PermissionDenied { .. } => "permission_denied",
            KeepAliveError::WorkerRefused(_) => "worker_refused",
            KeepAliveError::NotRunning => "not_running",
            KeepAliveError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

pub type Result<T, E = KeepAliveError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_cause() {
        let err = KeepAliveError::PermissionDenied {
            kind: PermissionKind::Notification,
        };
        assert_eq!(err.to_string(), "permission `notification` denied by host");
        assert_eq!(err.code(), "permission_denied");

        let refused: KeepAliveError = WorkerError::Refused("busy".into()).into();
        assert_eq!(refused.to_string(), "worker refused to start: busy");
        assert_eq!(refused.code(), "worker_refused");

        let cfg: KeepAliveError = ConfigError::Parse("expected value at line 1".into()).into();
        assert!(cfg.to_string().contains("line 1"));
        assert_eq!(cfg.code(), "invalid_config");
    }
}
