//! Deterministic host for driving a [`Supervisor`] in virtual time.
//!
//! Every fake shares state through `Arc<Mutex<_>>` so a test can keep a
//! handle while the supervisor owns another. Nothing here sleeps or spawns.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keepalive_events::Bus;
use keepalive_protocol::{
    EnvDelta, EnvironmentSnapshot, EventKind, LogRecord, RecordStatus,
};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{PermissionKind, Result, WorkerError};
use crate::host::{
    Clock, DeathNotifier, Host, Mailbox, PermissionProbe, Signal, TimerId, TimerToken,
    UplinkDispatch, UplinkOutcome, UplinkTicket, WorkerHandle,
};
use crate::persistence::MemoryPersistence;
use crate::supervisor::Supervisor;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTimer {
    pub due: Duration,
    pub timer: TimerId,
    pub token: TimerToken,
}

#[derive(Debug)]
struct ClockState {
    now: Duration,
    origin: DateTime<Utc>,
    next_token: u64,
    pending: Vec<PendingTimer>,
}

/// Virtual clock. Timers only fire when the harness advances time.
#[derive(Clone, Debug)]
pub struct SimClock {
    state: Arc<Mutex<ClockState>>,
    mailbox: Mailbox,
}

impl SimClock {
    pub fn new(mailbox: Mailbox, origin: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                now: Duration::ZERO,
                origin,
                next_token: 0,
                pending: Vec::new(),
            })),
            mailbox,
        }
    }

    pub fn now(&self) -> Duration {
        lock(&self.state).now
    }

    /// Moves time forward without firing anything.
    pub fn set_now(&self, now: Duration) {
        let mut state = lock(&self.state);
        state.now = state.now.max(now);
    }

    pub fn pending(&self) -> Vec<PendingTimer> {
        let mut pending = lock(&self.state).pending.clone();
        pending.sort_by_key(|p| (p.due, p.token));
        pending
    }

    /// Due time of the armed timer of `kind`, if any.
    pub fn due(&self, kind: TimerId) -> Option<Duration> {
        lock(&self.state)
            .pending
            .iter()
            .filter(|p| p.timer == kind)
            .map(|p| p.due)
            .min()
    }

    /// Fires the earliest timer due at or before `until`, moving time to its
    /// deadline. Returns false when none is due.
    pub fn fire_next(&self, until: Duration) -> bool {
        let fired = {
            let mut state = lock(&self.state);
            let next = state
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.due <= until)
                .min_by_key(|(_, p)| (p.due, p.token))
                .map(|(idx, _)| idx);
            match next {
                Some(idx) => {
                    let timer = state.pending.remove(idx);
                    state.now = state.now.max(timer.due);
                    Some(timer)
                }
                None => None,
            }
        };
        match fired {
            Some(timer) => {
                self.mailbox.post(Signal::TimerFired {
                    timer: timer.timer,
                    token: timer.token,
                });
                true
            }
            None => false,
        }
    }
}

impl Clock for SimClock {
    fn monotonic(&self) -> Duration {
        self.now()
    }

    fn wall(&self) -> DateTime<Utc> {
        let state = lock(&self.state);
        let offset = chrono::Duration::milliseconds(state.now.as_millis() as i64);
        state.origin + offset
    }

    fn schedule_once(&self, delay: Duration, timer: TimerId) -> TimerToken {
        let mut state = lock(&self.state);
        state.next_token += 1;
        let token = TimerToken(state.next_token);
        let due = state.now + delay;
        state.pending.push(PendingTimer { due, timer, token });
        token
    }

    fn cancel(&self, token: TimerToken) {
        lock(&self.state).pending.retain(|p| p.token != token);
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    running: bool,
    refuse: bool,
    starts: u32,
    stops: u32,
    notifier: Option<DeathNotifier>,
    presence: Option<(String, String)>,
}

/// Scripted worker: starts unless told to refuse, dies on `kill`.
#[derive(Clone, Debug, Default)]
pub struct SimWorker {
    state: Arc<Mutex<WorkerState>>,
}

impl SimWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Kills the running worker through its death notifier.
    pub fn kill(&self, reason: &str) -> bool {
        let notifier = {
            let mut state = lock(&self.state);
            state.running = false;
            state.notifier.take()
        };
        notifier
            .map(|n| n.notify(Some(reason.to_string())))
            .unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn starts(&self) -> u32 {
        lock(&self.state).starts
    }

    pub fn stops(&self) -> u32 {
        lock(&self.state).stops
    }

    pub fn presence(&self) -> Option<(String, String)> {
        lock(&self.state).presence.clone()
    }
}

impl WorkerHandle for SimWorker {
    fn start(&mut self, on_death: DeathNotifier) -> std::result::Result<(), WorkerError> {
        let mut state = lock(&self.state);
        if state.refuse {
            return Err(WorkerError::Refused("scripted refusal".into()));
        }
        state.starts += 1;
        state.running = true;
        state.notifier = Some(on_death);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.running = false;
        state.notifier = None;
    }

    fn update_presence(&mut self, title: &str, body: &str) {
        lock(&self.state).presence = Some((title.to_string(), body.to_string()));
    }
}

#[derive(Debug, Default)]
struct SinkState {
    in_flight: VecDeque<(UplinkTicket, LogRecord)>,
    delivered: Vec<LogRecord>,
    dispatched: usize,
    auto_reply: Option<UplinkOutcome>,
}

/// Uplink that holds each dispatch until the test replies.
#[derive(Clone, Debug)]
pub struct SimSink {
    state: Arc<Mutex<SinkState>>,
    mailbox: Mailbox,
}

impl SimSink {
    pub fn new(mailbox: Mailbox) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::default())),
            mailbox,
        }
    }

    /// Answers every future dispatch with `outcome` as soon as it arrives.
    pub fn set_auto_reply(&self, outcome: Option<UplinkOutcome>) {
        lock(&self.state).auto_reply = outcome;
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    pub fn dispatched(&self) -> usize {
        lock(&self.state).dispatched
    }

    pub fn delivered(&self) -> Vec<LogRecord> {
        lock(&self.state).delivered.clone()
    }

    /// Completes the oldest in-flight send. Returns its record.
    pub fn reply(&self, outcome: UplinkOutcome) -> Option<LogRecord> {
        let (ticket, record) = {
            let mut state = lock(&self.state);
            let (ticket, record) = state.in_flight.pop_front()?;
            if outcome.is_success() {
                state.delivered.push(record.clone());
            }
            (ticket, record)
        };
        self.mailbox
            .post(Signal::UplinkCompleted { ticket, outcome });
        Some(record)
    }
}

impl UplinkDispatch for SimSink {
    fn dispatch(&mut self, ticket: UplinkTicket, record: LogRecord) {
        let auto = {
            let mut state = lock(&self.state);
            state.dispatched += 1;
            state.in_flight.push_back((ticket, record));
            state.auto_reply.clone()
        };
        if let Some(outcome) = auto {
            self.reply(outcome);
        }
    }
}

/// Permission probe whose answer the test controls.
#[derive(Clone, Debug, Default)]
pub struct SimPermissions {
    missing: Arc<Mutex<Vec<PermissionKind>>>,
}

impl SimPermissions {
    pub fn set_missing(&self, missing: Vec<PermissionKind>) {
        *lock(&self.missing) = missing;
    }
}

impl PermissionProbe for SimPermissions {
    fn missing(&self) -> Vec<PermissionKind> {
        lock(&self.missing).clone()
    }
}

/// Supervisor wired to simulated host parts plus the receiving end of its
/// mailbox.
pub struct Harness {
    pub supervisor: Supervisor,
    pub clock: SimClock,
    pub worker: SimWorker,
    pub sink: SimSink,
    pub permissions: SimPermissions,
    pub persistence: Arc<MemoryPersistence>,
    pub bus: Bus,
    mailbox: Mailbox,
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl Harness {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_persistence(config, Arc::new(MemoryPersistence::new()))
    }

    pub fn with_persistence(config: Config, persistence: Arc<MemoryPersistence>) -> Result<Self> {
        let (mailbox, rx) = Mailbox::channel();
        let origin = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let clock = SimClock::new(mailbox.clone(), origin);
        let worker = SimWorker::new();
        let sink = SimSink::new(mailbox.clone());
        let permissions = SimPermissions::default();
        let bus = Bus::new(256);
        let host = Host::new(
            Arc::new(clock.clone()),
            Box::new(worker.clone()),
            persistence.clone(),
            mailbox.clone(),
        )
        .with_uplink(Box::new(sink.clone()))
        .with_permissions(Box::new(permissions.clone()))
        .with_bus(bus.clone());
        let supervisor = Supervisor::init(config, host)?;
        Ok(Self {
            supervisor,
            clock,
            worker,
            sink,
            permissions,
            persistence,
            bus,
            mailbox,
            rx,
        })
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Hands every queued signal to the supervisor. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(signal) = self.rx.try_recv() {
            self.supervisor.handle(signal);
            handled += 1;
        }
        handled
    }

    /// Runs queued signals and timers due at the current instant.
    pub fn settle(&mut self) {
        self.advance(Duration::ZERO);
    }

    /// Advances virtual time by `by`, firing timers in deadline order and
    /// draining the mailbox after each.
    pub fn advance(&mut self, by: Duration) {
        let target = self.clock.now() + by;
        loop {
            self.drain();
            if !self.clock.fire_next(target) {
                break;
            }
        }
        self.clock.set_now(target);
    }

    pub fn advance_to(&mut self, at: Duration) {
        let by = at.saturating_sub(self.clock.now());
        self.advance(by);
    }

    pub fn post(&mut self, signal: Signal) {
        self.mailbox.post(signal);
        self.settle();
    }

    pub fn deliver_env(&mut self, snapshot: EnvironmentSnapshot) {
        self.post(Signal::Env(snapshot));
    }

    pub fn deliver_delta(&mut self, delta: EnvDelta) {
        self.post(Signal::EnvDelta(delta));
    }

    /// Replies to the oldest in-flight uplink and runs the follow-up.
    pub fn reply(&mut self, outcome: UplinkOutcome) -> Option<LogRecord> {
        let record = self.sink.reply(outcome);
        self.settle();
        record
    }

    pub fn heartbeats(&self) -> Vec<LogRecord> {
        self.supervisor
            .store()
            .iter()
            .filter(|r| r.is_heartbeat())
            .cloned()
            .collect()
    }

    pub fn running_heartbeats(&self) -> usize {
        self.supervisor
            .store()
            .iter()
            .filter(|r| r.is_heartbeat() && r.status == RecordStatus::Running)
            .count()
    }

    pub fn events(&self, kind: EventKind) -> Vec<LogRecord> {
        self.supervisor
            .store()
            .iter()
            .filter(|r| r.event_kind() == Some(kind))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("now", &self.clock.now())
            .field("supervisor", &self.supervisor)
            .finish()
    }
}
