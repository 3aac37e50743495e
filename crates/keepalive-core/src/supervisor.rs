use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use keepalive_events::{topics, Bus};
use keepalive_policy::PolicyEngine;
use keepalive_protocol::{
    EnvDelta, EnvironmentSnapshot, EventDetail, EventKind, HeartbeatInterval, LogRecord,
    LogStats, RecordKind, RecordStatus, RestartBudget, Status, StrategyLevel, SupervisorState,
    RING_CAPACITY,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::analysis::{analyze, HealthReport};
use crate::cache::{FlushStep, NetworkCache};
use crate::config::Config;
use crate::env::{EnvProbe, EnvUpdate, NetworkEdge};
use crate::error::{KeepAliveError, Result, WorkerError};
use crate::heartbeat::{HeartbeatLoop, LoopChange};
use crate::host::{
    Clock, DeathNotifier, Host, Mailbox, PermissionProbe, Persistence, Signal, TimerId,
    TimerToken, UplinkDispatch, UplinkOutcome, UplinkTicket, WorkerHandle,
};
use crate::memory::{MemoryGovernor, MemoryTransition, TrimSignal};
use crate::persistence::{DEVICE_ID_KEY, RING_KEY, UPLINK_CACHE_KEY};
use crate::store::HeartbeatStore;

pub const MAX_RESTART_ATTEMPTS: u32 = 5;
pub const RESTART_BASE_DELAY: Duration = Duration::from_secs(5);
pub const RESTART_MAX_DELAY: Duration = Duration::from_secs(5 * 60);
/// Quiet period after which the restart attempt counter starts over.
pub const RESTART_WINDOW: Duration = Duration::from_secs(10 * 60);

const UNKNOWN_VERSION: &str = "unknown";
/// Span of tick history the adaptive tuner looks at.
const TUNING_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Backoff before restart attempt number `attempts + 1`.
pub fn restart_delay(attempts: u32) -> Duration {
    RESTART_BASE_DELAY
        .saturating_mul(1u32 << attempts.min(16))
        .min(RESTART_MAX_DELAY)
}

#[derive(Debug, Default)]
struct Timers {
    heartbeat: Option<TimerToken>,
    restart: Option<TimerToken>,
    flush_retry: Option<TimerToken>,
    persist: Option<TimerToken>,
}

impl Timers {
    fn slot(&mut self, timer: TimerId) -> &mut Option<TimerToken> {
        match timer {
            TimerId::Heartbeat => &mut self.heartbeat,
            TimerId::Restart => &mut self.restart,
            TimerId::FlushRetry => &mut self.flush_retry,
            TimerId::Persist => &mut self.persist,
        }
    }
}

/// Interval chosen by the tuner, valid while the policy keeps `level` at
/// `policy` cadence.
#[derive(Clone, Copy, Debug)]
struct TunedInterval {
    level: StrategyLevel,
    policy: Duration,
    interval: Duration,
}

#[derive(Debug, Default)]
struct RestartTracker {
    attempts: u32,
    last_attempt_at: Option<Duration>,
    last_death_at: Option<Duration>,
    /// Set by a successful restart; the next tick clears the counter.
    awaiting_tick: bool,
}

/// Owns the keep-alive lifecycle: worker, heartbeat loop, ring, uplink cache
/// and restart policy. Driven from a single executor through `&mut self`.
pub struct Supervisor {
    config: Config,
    engine: PolicyEngine,
    clock: Arc<dyn Clock>,
    worker: Box<dyn WorkerHandle>,
    persistence: Arc<dyn Persistence>,
    mailbox: Mailbox,
    uplink: Option<Box<dyn UplinkDispatch>>,
    permissions: Option<Box<dyn PermissionProbe>>,
    bus: Option<Bus>,
    state: SupervisorState,
    level: StrategyLevel,
    heartbeat: HeartbeatLoop,
    policy_interval: HeartbeatInterval,
    tick_times: VecDeque<Duration>,
    tuned: Option<TunedInterval>,
    store: HeartbeatStore,
    cache: NetworkCache,
    governor: MemoryGovernor,
    env: EnvProbe,
    timers: Timers,
    restart: RestartTracker,
    generation: u64,
    worker_live: bool,
    ordinal: u64,
    device_id: String,
    last_error: Option<String>,
    ring_dirty: bool,
    cache_dirty: bool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("level", &self.level)
            .field("interval", &self.heartbeat.interval())
            .field("seq", &self.heartbeat.seq())
            .field("generation", &self.generation)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Supervisor {
    /// Validates `config`, wires the host and loads persisted state. No
    /// worker side effects; the supervisor stays `Idle`.
    pub fn init(config: Config, host: Host) -> Result<Self> {
        let config = config.normalized();
        let Host {
            clock,
            worker,
            persistence,
            mailbox,
            uplink,
            permissions,
            bus,
        } = host;

        let engine = PolicyEngine::new(config.base_interval());
        let env = EnvProbe::default();
        let governor = MemoryGovernor::new();
        let decision = engine.evaluate(env.snapshot(), StrategyLevel::default());

        let store = match persistence.load(RING_KEY) {
            Ok(Some(bytes)) => HeartbeatStore::decode(RING_CAPACITY, &bytes),
            Ok(None) => HeartbeatStore::default(),
            Err(err) => {
                warn!(
                    target: "keepalive::store",
                    error = %err,
                    "failed to load persisted ring"
                );
                HeartbeatStore::default()
            }
        };
        let mut cache = NetworkCache::new(config.max_retry_count);
        match persistence.load(UPLINK_CACHE_KEY) {
            Ok(Some(bytes)) => cache.restore(&bytes),
            Ok(None) => {}
            Err(err) => warn!(
                target: "keepalive::cache",
                error = %err,
                "failed to load persisted uplink cache"
            ),
        }

        let last_seq = store.iter().map(|r| r.seq).max().unwrap_or(0);
        let last_ordinal = store.iter().map(|r| r.ordinal).max().unwrap_or(0);
        let device_id = resolve_device_id(&config, persistence.as_ref());

        info!(
            target: "keepalive::supervisor",
            device = %device_id,
            enabled = config.enabled,
            interval_ms = config.heartbeat_interval_ms,
            restored = store.len(),
            cached = cache.len(),
            "keep-alive supervisor initialized"
        );

        Ok(Self {
            engine,
            clock,
            worker,
            persistence,
            mailbox,
            uplink,
            permissions,
            bus,
            state: SupervisorState::Idle,
            level: decision.level,
            heartbeat: HeartbeatLoop::new(decision.interval).resume_from(last_seq),
            policy_interval: decision.interval,
            tick_times: VecDeque::new(),
            tuned: None,
            store,
            cache,
            governor,
            env,
            timers: Timers::default(),
            restart: RestartTracker::default(),
            generation: 0,
            worker_live: false,
            ordinal: last_ordinal,
            device_id,
            last_error: None,
            ring_dirty: false,
            cache_dirty: false,
            config,
        })
    }

    /// `init` from the JSON payload handed over by a host bridge.
    pub fn init_json(raw: &str, host: Host) -> Result<Self> {
        let config = Config::from_json_str(raw)?;
        Self::init(config, host)
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn level(&self) -> StrategyLevel {
        self.level
    }

    pub fn interval(&self) -> HeartbeatInterval {
        self.heartbeat.interval()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn env(&self) -> &EnvironmentSnapshot {
        self.env.snapshot()
    }

    pub fn store(&self) -> &HeartbeatStore {
        &self.store
    }

    pub fn cache(&self) -> &NetworkCache {
        &self.cache
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Single entry point for everything posted to the mailbox.
    pub fn handle(&mut self, signal: Signal) {
        debug!(target: "keepalive::supervisor", signal = signal.label(), "handling signal");
        match signal {
            Signal::Env(snapshot) => self.on_env_change(snapshot),
            Signal::EnvDelta(delta) => self.on_env_delta(delta),
            Signal::MemoryTrim(trim) => self.on_memory_trim(trim),
            Signal::FreeMemory {
                available_bytes,
                low,
            } => self.on_free_memory(available_bytes, low),
            Signal::WorkerDied { generation, reason } => self.on_worker_exit(generation, reason),
            Signal::TimerFired { timer, token } => self.on_timer(timer, token),
            Signal::UplinkCompleted { ticket, outcome } => self.on_uplink_completed(ticket, outcome),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.config.enabled {
            return Err(KeepAliveError::NotInitialized);
        }
        match self.state {
            SupervisorState::Starting
            | SupervisorState::Running
            | SupervisorState::Degraded
            | SupervisorState::Restarting => return Ok(()),
            _ => {}
        }

        if let Some(kind) = self
            .permissions
            .as_ref()
            .and_then(|probe| probe.missing().into_iter().next())
        {
            let err = KeepAliveError::PermissionDenied { kind };
            warn!(
                target: "keepalive::supervisor",
                permission = %kind,
                "start refused: missing permission"
            );
            self.last_error = Some(err.to_string());
            self.record_event(
                EventDetail::new(EventKind::PermissionDenied, err.to_string())
                    .with_field("kind", kind.as_str()),
            );
            return Err(err);
        }

        self.restart = RestartTracker::default();
        self.transition(SupervisorState::Starting, "start requested");
        if let Err(err) = self.spawn_worker() {
            warn!(
                target: "keepalive::supervisor",
                error = %err,
                "worker refused to start"
            );
            self.last_error = Some(err.to_string());
            self.record_event(
                EventDetail::new(EventKind::WorkerFailure, err.to_string())
                    .with_field("phase", "start"),
            );
            self.transition(SupervisorState::Failed, "worker refused");
            return Err(err.into());
        }
        self.last_error = None;
        self.enter_active("worker started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            SupervisorState::Idle | SupervisorState::Stopped | SupervisorState::Stopping => {
                return Ok(())
            }
            _ => {}
        }
        self.transition(SupervisorState::Stopping, "stop requested");
        self.cancel_timer(TimerId::Heartbeat);
        self.cancel_timer(TimerId::Restart);
        self.cancel_timer(TimerId::FlushRetry);
        self.cache.abandon_in_flight();
        if self.worker_live {
            self.worker.stop();
            self.worker_live = false;
        }
        self.transition(SupervisorState::Stopped, "stop requested");
        self.flush_persistence();
        Ok(())
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state,
            enabled: self.config.enabled,
            level: self.level,
            paused: self.heartbeat.is_paused(),
            interval_ms: self
                .heartbeat
                .interval()
                .duration()
                .map(|d| d.as_millis() as u64),
            last_error: self.last_error.clone(),
            restart_attempts: self.restart.attempts,
            heartbeat_seq: self.heartbeat.seq(),
            last_heartbeat: self.store.last_heartbeat().map(|r| r.timestamp),
            cached_records: self.cache.len(),
            memory_pressure: self.governor.pressure(),
            device_id: self.device_id.clone(),
            advisories: self.config.advisories(),
            state_label: Some(self.state.display_label().to_string()),
        }
    }

    /// Takes one heartbeat now, exactly as a natural tick would.
    pub fn trigger_heartbeat(&mut self) -> LogRecord {
        self.tick()
    }

    pub fn set_notification(&mut self, title: &str, body: &str) -> Result<()> {
        let title = title.trim();
        let body = body.trim();
        if title.is_empty() && body.is_empty() {
            return Err(KeepAliveError::InvalidArgument(
                "notification title and body are both empty".into(),
            ));
        }
        if !self.worker_live || !self.state.is_active() {
            return Err(KeepAliveError::NotRunning);
        }
        if !title.is_empty() {
            self.config.notification.title = title.to_string();
        }
        if !body.is_empty() {
            self.config.notification.body = body.to_string();
        }
        let (title, body) = (
            self.config.notification.title.clone(),
            self.config.notification.body.clone(),
        );
        self.worker.update_presence(&title, &body);
        self.record_event(
            EventDetail::new(EventKind::NotificationUpdated, title.clone())
                .with_field("title", title)
                .with_field("body", body),
        );
        Ok(())
    }

    /// Forwards new presence text to the worker.
    pub fn update_notification_text(&mut self, title: &str, body: &str) -> Result<()> {
        self.set_notification(title, body)
    }

    /// Newest `limit` records (at most the ring size), oldest first.
    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogRecord> {
        let limit = limit.unwrap_or(RING_CAPACITY).min(RING_CAPACITY);
        self.store.last(limit)
    }

    pub fn clear_logs(&mut self) -> Result<()> {
        let removed = self.store.clear();
        self.ring_dirty = true;
        self.flush_persistence();
        info!(target: "keepalive::store", removed, "heartbeat log cleared");
        self.publish(topics::TOPIC_LOGS_CLEARED, &json!({ "removed": removed }));
        Ok(())
    }

    pub fn get_stats(&self) -> LogStats {
        self.store.stats(self.clock.wall())
    }

    pub fn analyze_logs(&self) -> HealthReport {
        let records: Vec<LogRecord> = self.store.iter().cloned().collect();
        let expected = self
            .heartbeat
            .interval()
            .duration()
            .unwrap_or_else(|| self.engine.interval_for(self.level));
        analyze(&records, expected)
    }

    pub fn restart_stats(&self) -> RestartBudget {
        let now = self.clock.monotonic();
        let down = matches!(
            self.state,
            SupervisorState::Restarting | SupervisorState::Failed
        );
        RestartBudget {
            window_seconds: RESTART_WINDOW.as_secs(),
            max_restarts: MAX_RESTART_ATTEMPTS,
            used: self.restart.attempts,
            remaining: MAX_RESTART_ATTEMPTS.saturating_sub(self.restart.attempts),
            last_attempt_ms: self.restart.last_attempt_at.map(|d| d.as_millis() as u64),
            last_death_ms: self.restart.last_death_at.map(|d| d.as_millis() as u64),
            current_downtime_ms: self
                .restart
                .last_death_at
                .filter(|_| down)
                .map(|at| now.saturating_sub(at).as_millis() as u64),
        }
    }

    pub fn on_env_change(&mut self, snapshot: EnvironmentSnapshot) {
        // A full snapshot repeats the last memory value it knew; only a change
        // counts as a reading, so it cannot clear a trim-driven Critical.
        let previous = self.env.snapshot().memory_pressure;
        let update = self.env.replace(snapshot);
        let reading = self.env.snapshot().memory_pressure;
        let memory = (reading != previous).then(|| self.governor.observe(reading));
        self.after_env(update, memory);
    }

    pub fn on_env_delta(&mut self, delta: EnvDelta) {
        let update = self.env.apply(&delta);
        let memory = delta.memory_pressure.map(|p| self.governor.observe(p));
        self.after_env(update, memory);
    }

    pub fn on_memory_trim(&mut self, trim: TrimSignal) {
        let transition = self.governor.on_trim(trim);
        self.apply_memory_transition(transition);
        self.reevaluate();
    }

    pub fn on_free_memory(&mut self, available_bytes: u64, low: bool) {
        let transition = self.governor.observe_free_memory(available_bytes, low);
        self.apply_memory_transition(transition);
        self.reevaluate();
    }

    /// Death report for the current worker, whatever its generation.
    pub fn on_worker_died(&mut self) {
        match self.state {
            SupervisorState::Starting
            | SupervisorState::Running
            | SupervisorState::Degraded
            | SupervisorState::Restarting => {
                self.worker_live = false;
                self.handle_death(None);
            }
            other => debug!(
                target: "keepalive::supervisor",
                state = other.as_str(),
                "ignoring worker death outside an active state"
            ),
        }
    }

    fn on_worker_exit(&mut self, generation: u64, reason: Option<String>) {
        if generation != self.generation || !self.worker_live {
            debug!(
                target: "keepalive::supervisor",
                generation,
                current = self.generation,
                "ignoring death of a stale worker"
            );
            return;
        }
        self.worker_live = false;
        if self.state.is_active() {
            self.handle_death(reason);
        }
    }

    fn after_env(&mut self, update: EnvUpdate, memory: Option<MemoryTransition>) {
        if let Some(transition) = memory {
            self.apply_memory_transition(transition);
        }
        self.reevaluate();
        match update.network_edge {
            Some(NetworkEdge::Up) => {
                info!(
                    target: "keepalive::cache",
                    cached = self.cache.len(),
                    "network up; flushing uplink cache"
                );
                self.cancel_timer(TimerId::FlushRetry);
                self.pump_uplink();
            }
            Some(NetworkEdge::Down) => {
                debug!(target: "keepalive::cache", "network down; holding uplink");
            }
            None => {}
        }
    }

    fn apply_memory_transition(&mut self, transition: MemoryTransition) {
        if transition.entered_critical() {
            warn!(
                target: "keepalive::memory",
                from = transition.previous.as_str(),
                "critical memory pressure; degrading"
            );
            self.record_event(
                EventDetail::new(EventKind::MemoryDegraded, "critical memory pressure")
                    .with_field("from", transition.previous.as_str()),
            );
            if self.state == SupervisorState::Running {
                self.transition(SupervisorState::Degraded, "memory critical");
            }
        } else if transition.left_critical() {
            info!(
                target: "keepalive::memory",
                to = transition.current.as_str(),
                "memory pressure recovered"
            );
            self.record_event(
                EventDetail::new(EventKind::MemoryRecovered, "memory pressure recovered")
                    .with_field("to", transition.current.as_str()),
            );
            if self.state == SupervisorState::Degraded {
                self.transition(SupervisorState::Running, "memory recovered");
            }
        }
    }

    fn effective_env(&self) -> EnvironmentSnapshot {
        let mut snapshot = self.env.snapshot().clone();
        snapshot.memory_pressure = self.governor.pressure();
        snapshot
    }

    fn reevaluate(&mut self) {
        let decision = self.engine.evaluate(&self.effective_env(), self.level);
        if decision.changed() {
            let reasons = decision.reason_summary();
            info!(
                target: "keepalive::supervisor",
                from = decision.previous.as_str(),
                to = decision.level.as_str(),
                reasons = %reasons,
                "strategy level changed"
            );
            self.record_event(
                EventDetail::new(
                    EventKind::PolicyChange,
                    format!("{} -> {}", decision.previous, decision.level),
                )
                .with_field("from", decision.previous.display_label())
                .with_field("to", decision.level.display_label())
                .with_field("reasons", reasons.clone()),
            );
            self.publish(
                topics::TOPIC_POLICY_CHANGED,
                &json!({
                    "from": decision.previous.as_str(),
                    "to": decision.level.as_str(),
                    "reasons": reasons,
                }),
            );
        }
        self.level = decision.level;
        self.policy_interval = decision.interval;
        let interval = self.tuned_or(decision.interval);
        self.apply_interval(interval);
    }

    /// Keeps a tuned cadence while the policy still asks for the one it was
    /// derived from.
    fn tuned_or(&mut self, policy: HeartbeatInterval) -> HeartbeatInterval {
        let HeartbeatInterval::Every(base) = policy else {
            return policy;
        };
        match self.tuned {
            Some(tuned) if tuned.level == self.level && tuned.policy == base => {
                HeartbeatInterval::Every(tuned.interval)
            }
            Some(_) => {
                self.tuned = None;
                policy
            }
            None => policy,
        }
    }

    fn apply_interval(&mut self, interval: HeartbeatInterval) {
        match self.heartbeat.set_interval(interval) {
            LoopChange::Unchanged => {}
            LoopChange::Paused => {
                self.cancel_timer(TimerId::Heartbeat);
                if self.loop_active() {
                    info!(target: "keepalive::heartbeat", "heartbeat loop paused");
                    self.record_event(EventDetail::new(EventKind::LoopPaused, "network down"));
                }
            }
            LoopChange::Resumed => {
                if self.loop_active() {
                    info!(target: "keepalive::heartbeat", "heartbeat loop resumed");
                    self.record_event(EventDetail::new(EventKind::LoopResumed, "network up"));
                    self.arm_timer(TimerId::Heartbeat, Duration::ZERO);
                }
            }
            LoopChange::Retimed => {
                debug!(
                    target: "keepalive::heartbeat",
                    interval_ms = interval.duration().map(|d| d.as_millis() as u64),
                    "heartbeat interval changed"
                );
                if self.loop_active() {
                    self.rearm_heartbeat();
                }
            }
        }
    }

    fn loop_active(&self) -> bool {
        matches!(
            self.state,
            SupervisorState::Running | SupervisorState::Degraded
        )
    }

    fn tick(&mut self) -> LogRecord {
        let now = self.clock.monotonic();
        let seq = self.heartbeat.next_seq();
        let record = self.compose(RecordKind::Heartbeat, seq, self.state.record_status(), None);
        self.heartbeat.record_fire(now);
        debug!(
            target: "keepalive::heartbeat",
            seq,
            status = %record.status,
            level = self.level.as_str(),
            "heartbeat"
        );
        self.append(record.clone());
        self.enqueue_uplink(record.clone());

        if self.restart.awaiting_tick {
            self.restart.awaiting_tick = false;
            self.restart.attempts = 0;
            info!(
                target: "keepalive::supervisor",
                seq,
                "first heartbeat after restart; attempts reset"
            );
        }
        if self.config.adaptive_tuning {
            self.tune_interval(now);
        }
        if self.loop_active() {
            self.rearm_heartbeat();
        }
        record
    }

    fn tune_interval(&mut self, now: Duration) {
        self.tick_times.push_back(now);
        while let Some(first) = self.tick_times.front() {
            if now.saturating_sub(*first) < TUNING_WINDOW {
                break;
            }
            self.tick_times.pop_front();
        }
        let (HeartbeatInterval::Every(current), HeartbeatInterval::Every(policy)) =
            (self.heartbeat.interval(), self.policy_interval)
        else {
            return;
        };
        let ticks = self.tick_times.len();
        let tuned = self.engine.tune(self.level, current, ticks);
        self.tuned = (tuned != policy).then_some(TunedInterval {
            level: self.level,
            policy,
            interval: tuned,
        });
        if tuned != current {
            debug!(
                target: "keepalive::heartbeat",
                ticks,
                from_ms = current.as_millis() as u64,
                to_ms = tuned.as_millis() as u64,
                "adaptive interval tuning"
            );
            self.heartbeat.set_interval(HeartbeatInterval::Every(tuned));
        }
    }

    fn rearm_heartbeat(&mut self) {
        match self.heartbeat.next_delay(self.clock.monotonic()) {
            Some(delay) => self.arm_timer(TimerId::Heartbeat, delay),
            None => self.cancel_timer(TimerId::Heartbeat),
        }
    }

    fn enter_active(&mut self, reason: &str) {
        let target = if self.governor.is_critical() {
            SupervisorState::Degraded
        } else {
            SupervisorState::Running
        };
        self.transition(target, reason);
        self.reevaluate();
        if !self.heartbeat.is_paused() {
            self.arm_timer(TimerId::Heartbeat, Duration::ZERO);
        }
        self.pump_uplink();
    }

    fn spawn_worker(&mut self) -> std::result::Result<(), WorkerError> {
        self.generation += 1;
        let notifier = DeathNotifier::new(self.generation, self.mailbox.clone());
        self.worker.start(notifier)?;
        self.worker_live = true;
        let notification = &self.config.notification;
        self.worker
            .update_presence(&notification.title, &notification.body);
        info!(
            target: "keepalive::supervisor",
            generation = self.generation,
            "worker started"
        );
        Ok(())
    }

    fn handle_death(&mut self, reason: Option<String>) {
        let now = self.clock.monotonic();
        self.restart.last_death_at = Some(now);
        self.restart.awaiting_tick = false;
        self.cancel_timer(TimerId::Heartbeat);

        let reason = reason.unwrap_or_else(|| "worker died".to_string());
        warn!(
            target: "keepalive::supervisor",
            generation = self.generation,
            attempts = self.restart.attempts,
            reason = %reason,
            "worker died"
        );
        self.record_event(
            EventDetail::new(EventKind::WorkerFailure, reason.clone())
                .with_field("generation", self.generation),
        );

        if let Some(last) = self.restart.last_attempt_at {
            if now.saturating_sub(last) > RESTART_WINDOW {
                debug!(
                    target: "keepalive::supervisor",
                    attempts = self.restart.attempts,
                    "restart window elapsed; attempts reset"
                );
                self.restart.attempts = 0;
            }
        }

        if self.restart.attempts >= MAX_RESTART_ATTEMPTS {
            self.cancel_timer(TimerId::Restart);
            let total = self.restart.attempts;
            let message = format!("restart budget exhausted after {total} attempts");
            warn!(target: "keepalive::supervisor", total_attempts = total, "{message}");
            self.last_error = Some(message.clone());
            self.transition(SupervisorState::Failed, "restart budget exhausted");
            self.record_event(
                EventDetail::new(EventKind::RestartFailure, message)
                    .with_field("total_attempts", total)
                    .with_field("last_reason", reason),
            );
            return;
        }

        let delay = restart_delay(self.restart.attempts);
        self.arm_timer(TimerId::Restart, delay);
        self.restart.attempts += 1;
        self.restart.last_attempt_at = Some(now);
        self.last_error = Some(reason);
        if self.state != SupervisorState::Restarting {
            self.transition(SupervisorState::Restarting, "worker died");
        }
        let attempt = self.restart.attempts;
        let delay_ms = delay.as_millis() as u64;
        info!(
            target: "keepalive::supervisor",
            attempt,
            delay_ms,
            "restart scheduled"
        );
        self.record_event(
            EventDetail::new(
                EventKind::RestartScheduled,
                format!("restart attempt {attempt} in {delay_ms}ms"),
            )
            .with_field("attempt", attempt)
            .with_field("delay_ms", delay_ms),
        );
        self.publish(
            topics::TOPIC_RESTART_SCHEDULED,
            &json!({ "attempt": attempt, "delay_ms": delay_ms }),
        );
    }

    fn restart_now(&mut self) {
        if self.state != SupervisorState::Restarting {
            return;
        }
        match self.spawn_worker() {
            Ok(()) => {
                self.restart.awaiting_tick = true;
                self.last_error = None;
                self.enter_active("worker restarted");
            }
            Err(err) => self.handle_death(Some(format!("restart failed: {err}"))),
        }
    }

    fn on_timer(&mut self, timer: TimerId, token: TimerToken) {
        let slot = self.timers.slot(timer);
        if *slot != Some(token) {
            debug!(
                target: "keepalive::supervisor",
                timer = timer.as_str(),
                "ignoring stale timer fire"
            );
            return;
        }
        *slot = None;
        match timer {
            TimerId::Heartbeat => {
                if self.loop_active() {
                    self.tick();
                }
            }
            TimerId::Restart => self.restart_now(),
            TimerId::FlushRetry => self.pump_uplink(),
            TimerId::Persist => self.flush_persistence(),
        }
    }

    fn arm_timer(&mut self, timer: TimerId, delay: Duration) {
        let token = self.clock.schedule_once(delay, timer);
        if let Some(previous) = self.timers.slot(timer).replace(token) {
            self.clock.cancel(previous);
        }
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        if let Some(token) = self.timers.slot(timer).take() {
            self.clock.cancel(token);
        }
    }

    fn enqueue_uplink(&mut self, record: LogRecord) {
        if self.uplink.is_none() {
            return;
        }
        self.cache.push(record);
        self.cache_dirty = true;
        self.schedule_persist();
        self.pump_uplink();
    }

    fn pump_uplink(&mut self) {
        let Some(uplink) = self.uplink.as_mut() else {
            return;
        };
        if !self.env.snapshot().network_available() || self.timers.flush_retry.is_some() {
            return;
        }
        if let Some((ticket, record)) = self.cache.next_to_send() {
            debug!(
                target: "keepalive::cache",
                seq = record.seq,
                queued = self.cache.len(),
                "uplink dispatch"
            );
            uplink.dispatch(ticket, record);
        }
    }

    fn on_uplink_completed(&mut self, ticket: UplinkTicket, outcome: UplinkOutcome) {
        match self.cache.complete(ticket, &outcome) {
            FlushStep::Stale => {
                debug!(target: "keepalive::cache", "ignoring stale uplink completion");
            }
            FlushStep::Sent { drained } => {
                self.mark_cache_dirty();
                if drained {
                    debug!(target: "keepalive::cache", "uplink cache drained");
                    self.publish(topics::TOPIC_UPLINK_FLUSHED, &json!({ "pending": 0 }));
                }
                self.pump_uplink();
            }
            FlushStep::Retry { delay, attempts } => {
                let delay_ms = delay.as_millis() as u64;
                warn!(
                    target: "keepalive::cache",
                    attempts,
                    delay_ms,
                    outcome = ?outcome,
                    "uplink failed; retry scheduled"
                );
                self.mark_cache_dirty();
                self.arm_timer(TimerId::FlushRetry, delay);
                self.record_event(
                    EventDetail::new(
                        EventKind::FlushRetryScheduled,
                        format!("uplink retry in {delay_ms}ms"),
                    )
                    .with_field("attempts", attempts)
                    .with_field("delay_ms", delay_ms),
                );
            }
            FlushStep::Dropped {
                record,
                reason,
                retry_after,
            } => {
                warn!(
                    target: "keepalive::cache",
                    seq = record.seq,
                    reason = %reason,
                    "uplink record dropped"
                );
                self.mark_cache_dirty();
                self.record_event(
                    EventDetail::new(EventKind::UplinkDropped, reason)
                        .with_field("dropped_seq", record.seq),
                );
                match retry_after {
                    Some(delay) => self.arm_timer(TimerId::FlushRetry, delay),
                    None => self.pump_uplink(),
                }
            }
        }
    }

    fn mark_cache_dirty(&mut self) {
        self.cache_dirty = true;
        self.schedule_persist();
    }

    fn compose(
        &mut self,
        kind: RecordKind,
        seq: u64,
        status: RecordStatus,
        event: Option<EventDetail>,
    ) -> LogRecord {
        self.ordinal += 1;
        let env = self.env.snapshot();
        LogRecord {
            kind,
            seq,
            ordinal: self.ordinal,
            monotonic_ms: self.clock.monotonic().as_millis() as u64,
            timestamp: self.clock.wall(),
            device_id: self.device_id.clone(),
            app_version: self
                .config
                .app_version
                .clone()
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
            os_version: self
                .config
                .os_version
                .clone()
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
            status,
            battery_percent: env.battery_percent,
            charging: env.charging,
            screen_on: env.screen_on,
            network: env.network_class,
            free_memory_bytes: env.free_memory_bytes.unwrap_or(0),
            total_memory_bytes: env.total_memory_bytes.unwrap_or(0),
            event,
        }
    }

    fn record_event(&mut self, detail: EventDetail) {
        let status = RecordStatus::Event(detail.kind);
        let record = self.compose(RecordKind::Event, self.heartbeat.seq(), status, Some(detail));
        self.append(record);
    }

    fn append(&mut self, record: LogRecord) {
        let topic = if record.is_heartbeat() {
            topics::TOPIC_HEARTBEAT_RECORDED
        } else {
            topics::TOPIC_EVENT_RECORDED
        };
        self.publish(topic, &record);
        self.store.append(record);
        self.ring_dirty = true;
        self.schedule_persist();
    }

    fn transition(&mut self, to: SupervisorState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(
            target: "keepalive::supervisor",
            from = from.as_str(),
            to = to.as_str(),
            reason,
            "state transition"
        );
        self.record_event(
            EventDetail::new(EventKind::StateChange, format!("{from} -> {to}"))
                .with_field("from", from.as_str())
                .with_field("to", to.as_str())
                .with_field("reason", reason),
        );
        self.publish(
            topics::TOPIC_STATE_CHANGED,
            &json!({ "from": from.as_str(), "to": to.as_str(), "reason": reason }),
        );
    }

    fn publish<T: Serialize>(&self, topic: &str, payload: &T) {
        if let Some(bus) = &self.bus {
            bus.publish(topic, payload);
        }
    }

    fn schedule_persist(&mut self) {
        if self.config.persist_debounce_ms == 0 {
            self.flush_persistence();
        } else if self.timers.persist.is_none() {
            self.arm_timer(TimerId::Persist, self.config.persist_debounce());
        }
    }

    /// Writes dirty state now. Failures are logged and retried on the next
    /// mutation.
    pub fn flush_persistence(&mut self) {
        self.cancel_timer(TimerId::Persist);
        if self.ring_dirty {
            match self.store.encode() {
                Ok(bytes) => match self.persistence.store(RING_KEY, &bytes) {
                    Ok(()) => self.ring_dirty = false,
                    Err(err) => warn!(
                        target: "keepalive::store",
                        error = %err,
                        "failed to persist ring"
                    ),
                },
                Err(err) => warn!(
                    target: "keepalive::store",
                    error = %err,
                    "failed to encode ring"
                ),
            }
        }
        if self.cache_dirty {
            match self.cache.encode() {
                Ok(bytes) => match self.persistence.store(UPLINK_CACHE_KEY, &bytes) {
                    Ok(()) => self.cache_dirty = false,
                    Err(err) => warn!(
                        target: "keepalive::cache",
                        error = %err,
                        "failed to persist uplink cache"
                    ),
                },
                Err(err) => warn!(
                    target: "keepalive::cache",
                    error = %err,
                    "failed to encode uplink cache"
                ),
            }
        }
    }
}

/// Host-provided id, else the persisted one, else a fresh uuid that is
/// persisted for next time.
fn resolve_device_id(config: &Config, persistence: &dyn Persistence) -> String {
    if let Some(id) = &config.device_id {
        return id.clone();
    }
    match persistence.load(DEVICE_ID_KEY) {
        Ok(Some(bytes)) => {
            if let Ok(id) = String::from_utf8(bytes) {
                let id = id.trim();
                if !id.is_empty() {
                    return id.to_string();
                }
            }
            warn!(target: "keepalive::store", "discarding malformed persisted device id");
        }
        Ok(None) => {}
        Err(err) => warn!(
            target: "keepalive::store",
            error = %err,
            "failed to load persisted device id"
        ),
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Err(err) = persistence.store(DEVICE_ID_KEY, id.as_bytes()) {
        warn!(
            target: "keepalive::store",
            error = %err,
            "failed to persist device id"
        );
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delays_double_and_cap() {
        let delays: Vec<u64> = (0..8).map(|a| restart_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }
}
