use std::fmt;
use std::str::FromStr;

use keepalive_protocol::MemoryPressure;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;
const CRITICAL_FREE_BYTES: u64 = 20 * MIB;
const MODERATE_FREE_BYTES: u64 = 50 * MIB;
const LOW_FREE_BYTES: u64 = 100 * MIB;
/// Consecutive `Normal` readings needed to leave `Critical`.
const CRITICAL_CLEAR_STREAK: u8 = 2;

/// Raw memory signal as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimSignal {
    Normal,
    UiHidden,
    RunningModerate,
    RunningLow,
    RunningCritical,
    Background,
    Moderate,
    Complete,
    LowMemory,
}

impl TrimSignal {
    /// Maps the host's numeric trim levels.
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(TrimSignal::Normal),
            5 => Some(TrimSignal::RunningModerate),
            10 => Some(TrimSignal::RunningLow),
            15 => Some(TrimSignal::RunningCritical),
            20 => Some(TrimSignal::UiHidden),
            40 => Some(TrimSignal::Background),
            60 => Some(TrimSignal::Moderate),
            80 => Some(TrimSignal::Complete),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if let Ok(level) = trimmed.parse::<i64>() {
            return Self::from_level(level);
        }
        let upper = trimmed.to_ascii_uppercase().replace(['-', ' '], "_");
        let name = upper.strip_prefix("TRIM_MEMORY_").unwrap_or(&upper);
        match name {
            "NORMAL" => Some(TrimSignal::Normal),
            "UI_HIDDEN" => Some(TrimSignal::UiHidden),
            "RUNNING_MODERATE" => Some(TrimSignal::RunningModerate),
            "RUNNING_LOW" => Some(TrimSignal::RunningLow),
            "RUNNING_CRITICAL" => Some(TrimSignal::RunningCritical),
            "BACKGROUND" => Some(TrimSignal::Background),
            "MODERATE" => Some(TrimSignal::Moderate),
            "COMPLETE" => Some(TrimSignal::Complete),
            "LOW_MEMORY" | "LOWMEMORY" | "ON_LOW_MEMORY" => Some(TrimSignal::LowMemory),
            _ => None,
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        match self {
            TrimSignal::Normal | TrimSignal::UiHidden => MemoryPressure::Normal,
            TrimSignal::RunningModerate | TrimSignal::RunningLow => MemoryPressure::Low,
            TrimSignal::RunningCritical | TrimSignal::Background | TrimSignal::Moderate => {
                MemoryPressure::Moderate
            }
            TrimSignal::Complete | TrimSignal::LowMemory => MemoryPressure::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrimSignal::Normal => "normal",
            TrimSignal::UiHidden => "ui_hidden",
            TrimSignal::RunningModerate => "running_moderate",
            TrimSignal::RunningLow => "running_low",
            TrimSignal::RunningCritical => "running_critical",
            TrimSignal::Background => "background",
            TrimSignal::Moderate => "moderate",
            TrimSignal::Complete => "complete",
            TrimSignal::LowMemory => "low_memory",
        }
    }
}

impl fmt::Display for TrimSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized memory trim signal `{0}`")]
pub struct UnknownTrimSignal(pub String);

impl FromStr for TrimSignal {
    type Err = UnknownTrimSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrimSignal::parse(s).ok_or_else(|| UnknownTrimSignal(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for TrimSignal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Level(i64),
            Name(String),
        }
        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Level(level) => TrimSignal::from_level(level),
            Raw::Name(name) => TrimSignal::parse(&name),
        };
        parsed.ok_or_else(|| serde::de::Error::custom("unrecognized memory trim signal"))
    }
}

/// Outcome of one reading fed to the governor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryTransition {
    pub previous: MemoryPressure,
    pub current: MemoryPressure,
}

impl MemoryTransition {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    pub fn entered_critical(&self) -> bool {
        self.current == MemoryPressure::Critical && self.previous != MemoryPressure::Critical
    }

    pub fn left_critical(&self) -> bool {
        self.previous == MemoryPressure::Critical && self.current != MemoryPressure::Critical
    }
}

/// Folds raw memory readings into an effective pressure with hysteresis on
/// the way out of `Critical`.
#[derive(Clone, Debug, Default)]
pub struct MemoryGovernor {
    pressure: MemoryPressure,
    normal_streak: u8,
}

impl MemoryGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pressure(&self) -> MemoryPressure {
        self.pressure
    }

    pub fn is_critical(&self) -> bool {
        self.pressure == MemoryPressure::Critical
    }

    pub fn observe(&mut self, reading: MemoryPressure) -> MemoryTransition {
        let previous = self.pressure;
        if previous == MemoryPressure::Critical {
            if reading == MemoryPressure::Normal {
                self.normal_streak = self.normal_streak.saturating_add(1);
                if self.normal_streak >= CRITICAL_CLEAR_STREAK {
                    self.pressure = MemoryPressure::Normal;
                    self.normal_streak = 0;
                } else {
                    debug!(
                        target: "keepalive::memory",
                        streak = self.normal_streak,
                        "holding critical memory pressure"
                    );
                }
            } else {
                self.normal_streak = 0;
            }
        } else {
            self.pressure = reading;
            self.normal_streak = 0;
        }
        let transition = MemoryTransition {
            previous,
            current: self.pressure,
        };
        if transition.changed() {
            info!(
                target: "keepalive::memory",
                from = previous.as_str(),
                to = self.pressure.as_str(),
                "memory pressure changed"
            );
        }
        transition
    }

    pub fn on_trim(&mut self, signal: TrimSignal) -> MemoryTransition {
        debug!(target: "keepalive::memory", signal = %signal, "trim signal received");
        self.observe(signal.pressure())
    }

    pub fn observe_free_memory(&mut self, available_bytes: u64, low: bool) -> MemoryTransition {
        self.observe(classify_free_memory(available_bytes, low))
    }
}

/// Classifies available memory the way the host's memory monitor reports it.
pub fn classify_free_memory(available_bytes: u64, low: bool) -> MemoryPressure {
    if low || available_bytes < CRITICAL_FREE_BYTES {
        MemoryPressure::Critical
    } else if available_bytes < MODERATE_FREE_BYTES {
        MemoryPressure::Moderate
    } else if available_bytes < LOW_FREE_BYTES {
        MemoryPressure::Low
    } else {
        MemoryPressure::Normal
    }
}
