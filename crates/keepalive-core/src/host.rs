//! Seams between the supervisor and its embedding host.
//!
//! The supervisor never blocks and never owns a thread: everything the host
//! reports back (timer fires, worker deaths, uplink completions, environment
//! updates) arrives as a [`Signal`] posted through a [`Mailbox`] and is
//! handled to completion by whoever owns the `Supervisor`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepalive_events::Bus;
use keepalive_protocol::{EnvDelta, EnvironmentSnapshot, LogRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{PermissionKind, PersistenceError, WorkerError};
use crate::memory::TrimSignal;

/// Logical timers owned by the supervisor. At most one of each is armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerId {
    Heartbeat,
    Restart,
    FlushRetry,
    Persist,
}

impl TimerId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerId::Heartbeat => "heartbeat",
            TimerId::Restart => "restart",
            TimerId::FlushRetry => "flush_retry",
            TimerId::Persist => "persist",
        }
    }
}

/// Cancel handle returned by [`Clock::schedule_once`]. Fires carrying a token
/// that no longer matches the armed one are stale and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u64);

/// Identifies one in-flight uplink send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UplinkTicket(pub u64);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum UplinkOutcome {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
}

impl UplinkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UplinkOutcome::Success)
    }
}

/// Messages delivered to the supervisor's executor.
#[derive(Clone, Debug)]
pub enum Signal {
    Env(EnvironmentSnapshot),
    EnvDelta(EnvDelta),
    MemoryTrim(TrimSignal),
    FreeMemory { available_bytes: u64, low: bool },
    WorkerDied { generation: u64, reason: Option<String> },
    TimerFired { timer: TimerId, token: TimerToken },
    UplinkCompleted { ticket: UplinkTicket, outcome: UplinkOutcome },
}

impl Signal {
    pub fn label(&self) -> &'static str {
        match self {
            Signal::Env(_) => "env",
            Signal::EnvDelta(_) => "env_delta",
            Signal::MemoryTrim(_) => "memory_trim",
            Signal::FreeMemory { .. } => "free_memory",
            Signal::WorkerDied { .. } => "worker_died",
            Signal::TimerFired { .. } => "timer_fired",
            Signal::UplinkCompleted { .. } => "uplink_completed",
        }
    }
}

/// Sending half of the supervisor's signal queue.
#[derive(Clone, Debug)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Mailbox {
    pub fn channel() -> (Mailbox, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Mailbox { tx }, rx)
    }

    /// Posts a signal; returns false once the executor has gone away.
    pub fn post(&self, signal: Signal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handed to the worker on every successful start. Consuming it reports the
/// death of exactly that start, so it can fire at most once.
#[derive(Debug)]
pub struct DeathNotifier {
    generation: u64,
    mailbox: Mailbox,
}

impl DeathNotifier {
    pub(crate) fn new(generation: u64, mailbox: Mailbox) -> Self {
        Self {
            generation,
            mailbox,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(self, reason: Option<String>) -> bool {
        self.mailbox.post(Signal::WorkerDied {
            generation: self.generation,
            reason,
        })
    }
}

/// The host's resident background task.
pub trait WorkerHandle: Send {
    fn start(&mut self, on_death: DeathNotifier) -> Result<(), WorkerError>;
    fn stop(&mut self);
    fn update_presence(&mut self, title: &str, body: &str);
}

/// Time source plus one-shot timers. A fired timer must post
/// `Signal::TimerFired` carrying the token it returned.
pub trait Clock: Send + Sync {
    /// Elapsed time since the clock's origin.
    fn monotonic(&self) -> Duration;
    fn wall(&self) -> DateTime<Utc>;
    fn schedule_once(&self, delay: Duration, timer: TimerId) -> TimerToken;
    fn cancel(&self, token: TimerToken);
}

/// Key/value substrate for the ring, the uplink cache and the device id.
pub trait Persistence: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
}

/// Fire-and-forget uplink. The result comes back later as
/// `Signal::UplinkCompleted` with the same ticket.
pub trait UplinkDispatch: Send {
    fn dispatch(&mut self, ticket: UplinkTicket, record: LogRecord);
}

/// Async network sink wrapped by the tokio driver into an `UplinkDispatch`.
#[async_trait]
pub trait NetworkSink: Send + Sync {
    async fn send(&self, record: &LogRecord) -> UplinkOutcome;
}

/// Reports capabilities the host is missing. The supervisor refuses to start
/// while any are reported and does not retry.
pub trait PermissionProbe: Send {
    fn missing(&self) -> Vec<PermissionKind>;
}

/// Everything the supervisor needs from its embedding.
pub struct Host {
    pub clock: Arc<dyn Clock>,
    pub worker: Box<dyn WorkerHandle>,
    pub persistence: Arc<dyn Persistence>,
    pub mailbox: Mailbox,
    pub uplink: Option<Box<dyn UplinkDispatch>>,
    pub permissions: Option<Box<dyn PermissionProbe>>,
    pub bus: Option<Bus>,
}

impl Host {
    pub fn new(
        clock: Arc<dyn Clock>,
        worker: Box<dyn WorkerHandle>,
        persistence: Arc<dyn Persistence>,
        mailbox: Mailbox,
    ) -> Self {
        Self {
            clock,
            worker,
            persistence,
            mailbox,
            uplink: None,
            permissions: None,
            bus: None,
        }
    }

    pub fn with_uplink(mut self, uplink: Box<dyn UplinkDispatch>) -> Self {
        self.uplink = Some(uplink);
        self
    }

    pub fn with_permissions(mut self, probe: Box<dyn PermissionProbe>) -> Self {
        self.permissions = Some(probe);
        self
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("uplink", &self.uplink.is_some())
            .field("permissions", &self.permissions.is_some())
            .field("bus", &self.bus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn death_notifier_posts_its_generation() {
        let (mailbox, mut rx) = Mailbox::channel();
        let notifier = DeathNotifier::new(7, mailbox);
        assert_eq!(notifier.generation(), 7);
        assert!(notifier.notify(Some("oom".into())));
        match rx.try_recv().expect("signal") {
            Signal::WorkerDied { generation, reason } => {
                assert_eq!(generation, 7);
                assert_eq!(reason.as_deref(), Some("oom"));
            }
            other => panic!("unexpected signal {}", other.label()),
        }
    }

    #[test]
    fn mailbox_reports_closed_executor() {
        let (mailbox, rx) = Mailbox::channel();
        drop(rx);
        assert!(mailbox.is_closed());
        assert!(!mailbox.post(Signal::EnvDelta(EnvDelta::default())));
    }

    #[test]
    fn uplink_outcome_serializes_with_reason() {
        let encoded =
            serde_json::to_value(UplinkOutcome::TransientFailure("timeout".into())).expect("json");
        assert_eq!(encoded["outcome"], "transient_failure");
        assert_eq!(encoded["reason"], "timeout");
    }
}
