use std::time::Duration;

use keepalive_protocol::HeartbeatInterval;

/// Floor between a reschedule and the next fire.
pub const MIN_GAP: Duration = Duration::from_secs(1);

/// How an interval update affected the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopChange {
    Unchanged,
    Retimed,
    Paused,
    Resumed,
}

/// Scheduling state of the single heartbeat timer. Time values are
/// monotonic offsets from the clock's origin.
#[derive(Clone, Debug)]
pub struct HeartbeatLoop {
    interval: HeartbeatInterval,
    seq: u64,
    last_fire: Option<Duration>,
}

impl HeartbeatLoop {
    pub fn new(interval: HeartbeatInterval) -> Self {
        Self {
            interval,
            seq: 0,
            last_fire: None,
        }
    }

    /// Continues numbering after `seq`, e.g. from a persisted ring.
    pub fn resume_from(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn interval(&self) -> HeartbeatInterval {
        self.interval
    }

    pub fn is_paused(&self) -> bool {
        self.interval.is_paused()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn last_fire(&self) -> Option<Duration> {
        self.last_fire
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn record_fire(&mut self, now: Duration) {
        self.last_fire = Some(now);
    }

    pub fn set_interval(&mut self, interval: HeartbeatInterval) -> LoopChange {
        let previous = self.interval;
        self.interval = interval;
        match (previous, interval) {
            (a, b) if a == b => LoopChange::Unchanged,
            (HeartbeatInterval::Every(_), HeartbeatInterval::Paused) => LoopChange::Paused,
            (HeartbeatInterval::Paused, HeartbeatInterval::Every(_)) => LoopChange::Resumed,
            _ => LoopChange::Retimed,
        }
    }

    /// Delay until the next fire, or `None` while paused.
    ///
    /// `max(last_fire + interval, now + MIN_GAP)`; a loop that never fired
    /// is due immediately.
    pub fn next_delay(&self, now: Duration) -> Option<Duration> {
        let interval = self.interval.duration()?;
        let Some(last) = self.last_fire else {
            return Some(Duration::ZERO);
        };
        let due = (last + interval).max(now + MIN_GAP);
        Some(due.saturating_sub(now))
    }
}
