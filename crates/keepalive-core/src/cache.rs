use std::collections::VecDeque;
use std::time::Duration;

use keepalive_protocol::{LogRecord, CACHE_CAPACITY};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::host::{UplinkOutcome, UplinkTicket};

const FLUSH_RETRY_BASE: Duration = Duration::from_secs(5);
const FLUSH_RETRY_MAX: Duration = Duration::from_secs(60);

/// An unsent record plus its transient failure count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub record: LogRecord,
    #[serde(default)]
    pub attempts: u32,
}

/// What the supervisor should do after an uplink completes.
#[derive(Clone, Debug, PartialEq)]
pub enum FlushStep {
    /// Ticket did not match the in-flight send.
    Stale,
    /// Head record delivered; `drained` when nothing is left.
    Sent { drained: bool },
    /// Head record kept; retry the flush after `delay`.
    Retry { delay: Duration, attempts: u32 },
    /// Head record given up on. `retry_after` is set for transient drops.
    Dropped {
        record: Box<LogRecord>,
        reason: String,
        retry_after: Option<Duration>,
    },
}

/// FIFO of records waiting for the uplink, sent one at a time in order.
#[derive(Clone, Debug)]
pub struct NetworkCache {
    queue: VecDeque<CachedRecord>,
    capacity: usize,
    max_retry_count: u32,
    failed_flush_attempts: u32,
    in_flight: Option<UplinkTicket>,
    next_ticket: u64,
    dropped_total: u64,
}

impl NetworkCache {
    pub fn new(max_retry_count: u32) -> Self {
        Self::with_capacity(CACHE_CAPACITY, max_retry_count)
    }

    pub fn with_capacity(capacity: usize, max_retry_count: u32) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            max_retry_count,
            failed_flush_attempts: 0,
            in_flight: None,
            next_ticket: 0,
            dropped_total: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn failed_flush_attempts(&self) -> u32 {
        self.failed_flush_attempts
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
        self.queue.iter().map(|c| &c.record)
    }

    /// Queues a record behind any unsent ones. Returns the record evicted to
    /// stay within capacity.
    pub fn push(&mut self, record: LogRecord) -> Option<LogRecord> {
        let evicted = if self.queue.len() >= self.capacity {
            if self.in_flight.take().is_some() {
                debug!(target: "keepalive::cache", "evicting the record in flight");
            }
            self.queue.pop_front().map(|c| c.record)
        } else {
            None
        };
        self.queue.push_back(CachedRecord {
            record,
            attempts: 0,
        });
        if let Some(old) = &evicted {
            self.dropped_total += 1;
            warn!(
                target: "keepalive::cache",
                seq = old.seq,
                capacity = self.capacity,
                "uplink cache full; dropped oldest record"
            );
        }
        evicted
    }

    /// Claims the head record for sending unless one is already in flight.
    pub fn next_to_send(&mut self) -> Option<(UplinkTicket, LogRecord)> {
        if self.in_flight.is_some() {
            return None;
        }
        let head = self.queue.front()?;
        self.next_ticket += 1;
        let ticket = UplinkTicket(self.next_ticket);
        self.in_flight = Some(ticket);
        Some((ticket, head.record.clone()))
    }

    pub fn complete(&mut self, ticket: UplinkTicket, outcome: &UplinkOutcome) -> FlushStep {
        if self.in_flight != Some(ticket) {
            return FlushStep::Stale;
        }
        self.in_flight = None;
        match outcome {
            UplinkOutcome::Success => {
                self.queue.pop_front();
                let drained = self.queue.is_empty();
                if drained {
                    self.failed_flush_attempts = 0;
                }
                FlushStep::Sent { drained }
            }
            UplinkOutcome::PermanentFailure(reason) => match self.queue.pop_front() {
                Some(head) => {
                    self.dropped_total += 1;
                    FlushStep::Dropped {
                        record: Box::new(head.record),
                        reason: reason.clone(),
                        retry_after: None,
                    }
                }
                None => FlushStep::Sent { drained: true },
            },
            UplinkOutcome::TransientFailure(reason) => {
                let delay = self.next_retry_delay();
                let Some(head) = self.queue.front_mut() else {
                    return FlushStep::Sent { drained: true };
                };
                head.attempts += 1;
                if head.attempts > self.max_retry_count {
                    let attempts = head.attempts;
                    self.dropped_total += 1;
                    let dropped = self.queue.pop_front().map(|c| c.record);
                    return match dropped {
                        Some(record) => FlushStep::Dropped {
                            record: Box::new(record),
                            reason: format!("{reason} (after {attempts} attempts)"),
                            retry_after: Some(delay),
                        },
                        None => FlushStep::Sent { drained: true },
                    };
                }
                FlushStep::Retry {
                    delay,
                    attempts: head.attempts,
                }
            }
        }
    }

    /// Forgets the in-flight send; its completion will be stale.
    pub fn abandon_in_flight(&mut self) {
        self.in_flight = None;
    }

    pub fn reset_backoff(&mut self) {
        self.failed_flush_attempts = 0;
    }

    fn next_retry_delay(&mut self) -> Duration {
        let exp = self.failed_flush_attempts.min(16);
        let delay = FLUSH_RETRY_BASE
            .saturating_mul(1u32 << exp)
            .min(FLUSH_RETRY_MAX);
        self.failed_flush_attempts = self.failed_flush_attempts.saturating_add(1);
        delay
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.queue)
    }

    /// Restores persisted entries; malformed data keeps the current entries.
    pub fn restore(&mut self, bytes: &[u8]) {
        match serde_json::from_slice::<Vec<CachedRecord>>(bytes) {
            Ok(entries) => {
                self.queue.clear();
                self.in_flight = None;
                let skip = entries.len().saturating_sub(self.capacity);
                self.queue.extend(entries.into_iter().skip(skip));
            }
            Err(err) => warn!(
                target: "keepalive::cache",
                error = %err,
                "discarding malformed persisted uplink cache"
            ),
        }
    }
}
