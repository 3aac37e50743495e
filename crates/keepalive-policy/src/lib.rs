//! Pure keep-alive policy: environment in, strategy level and heartbeat
//! interval out. No clock, no I/O, no failure modes.

use std::time::Duration;

use keepalive_protocol::{
    EnvironmentSnapshot, HeartbeatInterval, MemoryPressure, StrategyLevel,
    MAX_HEARTBEAT_INTERVAL, MIN_HEARTBEAT_INTERVAL,
};
use serde::{Deserialize, Serialize};

/// Activity within this window counts as "in use".
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Inactivity beyond this caps the level at `Low`.
pub const INACTIVE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
pub const BATTERY_LOW_PERCENT: u8 = 20;
pub const BATTERY_CRITICAL_PERCENT: u8 = 10;
/// Base interval at which nominal level intervals apply unscaled.
pub const BASELINE_INTERVAL: Duration = Duration::from_secs(30);

const BUSY_TICKS_PER_HOUR: usize = 150;
const SPARSE_TICKS_PER_HOUR: usize = 60;
const TUNE_SLOWER: f64 = 1.2;
const TUNE_FASTER: f64 = 0.9;
const BAND_LOW: f64 = 0.8;
const BAND_HIGH: f64 = 1.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyReason {
    AppActive,
    LongInactive,
    PowerSave,
    BatteryCritical,
    BatteryLow,
    MemoryCritical,
    MemoryModerate,
    ScreenOff,
    NetworkDown,
    ChargingRestore,
}

impl PolicyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyReason::AppActive => "app_active",
            PolicyReason::LongInactive => "long_inactive",
            PolicyReason::PowerSave => "power_save",
            PolicyReason::BatteryCritical => "battery_critical",
            PolicyReason::BatteryLow => "battery_low",
            PolicyReason::MemoryCritical => "memory_critical",
            PolicyReason::MemoryModerate => "memory_moderate",
            PolicyReason::ScreenOff => "screen_off",
            PolicyReason::NetworkDown => "network_down",
            PolicyReason::ChargingRestore => "charging_restore",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub previous: StrategyLevel,
    pub level: StrategyLevel,
    pub interval: HeartbeatInterval,
    #[serde(default)]
    pub reasons: Vec<PolicyReason>,
}

impl PolicyDecision {
    pub fn is_paused(&self) -> bool {
        self.interval.is_paused()
    }

    pub fn changed(&self) -> bool {
        self.previous != self.level
    }

    /// Minimal was forced by critical memory pressure.
    pub fn memory_forced(&self) -> bool {
        self.reasons.contains(&PolicyReason::MemoryCritical)
    }

    pub fn reason_summary(&self) -> String {
        if self.reasons.is_empty() {
            return "baseline".to_string();
        }
        self.reasons
            .iter()
            .map(PolicyReason::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyEngine {
    base_interval: Duration,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(BASELINE_INTERVAL)
    }
}

impl PolicyEngine {
    pub fn new(base_interval: Duration) -> Self {
        Self {
            base_interval: base_interval.clamp(MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL),
        }
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Applies the ordered rule set. Each rule after the activity rule can
    /// only lower the level, except the charging restore which undoes the
    /// screen-off step.
    pub fn evaluate(&self, env: &EnvironmentSnapshot, current: StrategyLevel) -> PolicyDecision {
        let mut reasons = Vec::new();
        let mut level = StrategyLevel::Normal;

        let since_active = env.time_since_app_active();
        let active =
            env.app_foreground || since_active.map(|d| d < ACTIVE_WINDOW).unwrap_or(false);
        if active {
            level = StrategyLevel::High;
            reasons.push(PolicyReason::AppActive);
        } else if since_active
            .map(|d| d > INACTIVE_THRESHOLD)
            .unwrap_or(false)
        {
            level = level.min(StrategyLevel::Low);
            reasons.push(PolicyReason::LongInactive);
        }

        if env.power_save {
            level = level.min(StrategyLevel::Low);
            reasons.push(PolicyReason::PowerSave);
        }

        let mut battery_triggered = false;
        if !env.charging {
            let battery = env.effective_battery();
            if battery < BATTERY_CRITICAL_PERCENT {
                level = StrategyLevel::Minimal;
                battery_triggered = true;
                reasons.push(PolicyReason::BatteryCritical);
            } else if battery < BATTERY_LOW_PERCENT {
                level = level.min(StrategyLevel::Low);
                battery_triggered = true;
                reasons.push(PolicyReason::BatteryLow);
            }
        }

        let mut memory_triggered = false;
        match env.memory_pressure {
            MemoryPressure::Critical => {
                level = StrategyLevel::Minimal;
                memory_triggered = true;
                reasons.push(PolicyReason::MemoryCritical);
            }
            MemoryPressure::Moderate => {
                level = level.min(StrategyLevel::Low);
                memory_triggered = true;
                reasons.push(PolicyReason::MemoryModerate);
            }
            MemoryPressure::Normal | MemoryPressure::Low => {}
        }

        let before_screen = level;
        if !env.screen_on && level > StrategyLevel::Low {
            level = level.step_down();
            reasons.push(PolicyReason::ScreenOff);
        }

        if !env.network_available() {
            reasons.push(PolicyReason::NetworkDown);
            return PolicyDecision {
                previous: current,
                level,
                interval: HeartbeatInterval::Paused,
                reasons,
            };
        }

        if env.charging && !battery_triggered && !memory_triggered && level != before_screen {
            level = before_screen;
            reasons.push(PolicyReason::ChargingRestore);
        }

        PolicyDecision {
            previous: current,
            level,
            interval: HeartbeatInterval::Every(self.interval_for(level)),
            reasons,
        }
    }

    /// Nominal interval for `level`, scaled by the configured base and
    /// clamped to the global bounds.
    pub fn interval_for(&self, level: StrategyLevel) -> Duration {
        self.scaled(level.nominal_interval(), 1.0)
    }

    /// Band the adaptive tuner may move within for `level`.
    pub fn level_band(&self, level: StrategyLevel) -> (Duration, Duration) {
        let nominal = level.nominal_interval();
        (self.scaled(nominal, BAND_LOW), self.scaled(nominal, BAND_HIGH))
    }

    /// Adjusts `interval` by the observed heartbeat density of the last hour.
    pub fn tune(&self, level: StrategyLevel, interval: Duration, ticks_last_hour: usize) -> Duration {
        let factor = if ticks_last_hour > BUSY_TICKS_PER_HOUR {
            TUNE_SLOWER
        } else if ticks_last_hour < SPARSE_TICKS_PER_HOUR {
            TUNE_FASTER
        } else {
            return interval;
        };
        let (lo, hi) = self.level_band(level);
        interval.mul_f64(factor).clamp(lo, hi)
    }

    fn scaled(&self, nominal: Duration, factor: f64) -> Duration {
        let scale = self.base_interval.as_secs_f64() / BASELINE_INTERVAL.as_secs_f64();
        nominal
            .mul_f64(scale * factor)
            .clamp(MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL)
    }
}
