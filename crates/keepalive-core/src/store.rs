use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use keepalive_protocol::{LogRecord, LogStats, RecordStatus, RING_CAPACITY};
use tracing::warn;

/// Number of trailing records scanned by [`HeartbeatStore::has_recent_anomaly`].
const ANOMALY_WINDOW: usize = 10;

/// Bounded FIFO ring of heartbeat and event records.
#[derive(Clone, Debug)]
pub struct HeartbeatStore {
    ring: VecDeque<LogRecord>,
    capacity: usize,
}

impl Default for HeartbeatStore {
    fn default() -> Self {
        Self::new(RING_CAPACITY)
    }
}

impl HeartbeatStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuilds a ring from persisted records, keeping the newest ones.
    pub fn with_records(capacity: usize, records: impl IntoIterator<Item = LogRecord>) -> Self {
        let mut store = Self::new(capacity);
        for record in records {
            store.append(record);
        }
        store
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Appends a record, returning the evicted one when the ring was full.
    pub fn append(&mut self, record: LogRecord) -> Option<LogRecord> {
        let evicted = if self.ring.len() >= self.capacity {
            self.ring.pop_front()
        } else {
            None
        };
        self.ring.push_back(record);
        evicted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogRecord> + ExactSizeIterator {
        self.ring.iter()
    }

    /// The newest `k` records, oldest first.
    pub fn last(&self, k: usize) -> Vec<LogRecord> {
        let skip = self.ring.len().saturating_sub(k);
        self.ring.iter().skip(skip).cloned().collect()
    }

    /// Records with `from <= timestamp < to`, oldest first.
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<LogRecord> {
        self.ring
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .cloned()
            .collect()
    }

    pub fn last_heartbeat(&self) -> Option<&LogRecord> {
        self.ring.iter().rev().find(|r| r.is_heartbeat())
    }

    /// Heartbeats recorded at or after `since`.
    pub fn heartbeats_since(&self, since: DateTime<Utc>) -> usize {
        self.ring
            .iter()
            .filter(|r| r.is_heartbeat() && r.timestamp >= since)
            .count()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> LogStats {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for record in &self.ring {
            *by_status.entry(record.status.tag()).or_default() += 1;
        }
        let hour_ago = now - ChronoDuration::hours(1);
        let last_hour_count = self.ring.iter().filter(|r| r.timestamp >= hour_ago).count();

        let beats: Vec<&LogRecord> = self.ring.iter().filter(|r| r.is_heartbeat()).collect();
        let average_interval_ms = if beats.len() >= 2 {
            let total: i64 = beats
                .windows(2)
                .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds().max(0))
                .sum();
            (total / (beats.len() as i64 - 1)) as u64
        } else {
            0
        };

        LogStats {
            count: self.ring.len(),
            first_timestamp: self.ring.front().map(|r| r.timestamp),
            last_timestamp: self.ring.back().map(|r| r.timestamp),
            average_interval_ms,
            last_hour_count,
            by_status,
        }
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.ring.len();
        self.ring.clear();
        removed
    }

    /// Drops every record older than `cutoff`; returns how many went.
    pub fn clear_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.ring.len();
        self.ring.retain(|r| r.timestamp >= cutoff);
        before - self.ring.len()
    }

    /// Whether any of the last few records reports a failure or a degraded tick.
    pub fn has_recent_anomaly(&self) -> bool {
        self.ring.iter().rev().take(ANOMALY_WINDOW).any(|r| {
            r.status == RecordStatus::Degraded
                || r.event_kind().map(|k| k.is_failure()).unwrap_or(false)
        })
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        let records: Vec<&LogRecord> = self.ring.iter().collect();
        serde_json::to_string_pretty(&records)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let records: Vec<&LogRecord> = self.ring.iter().collect();
        serde_json::to_vec(&records)
    }

    /// Decodes a persisted ring. Malformed data yields an empty ring.
    pub fn decode(capacity: usize, bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Vec<LogRecord>>(bytes) {
            Ok(records) => Self::with_records(capacity, records),
            Err(err) => {
                warn!(
                    target: "keepalive::store",
                    error = %err,
                    "discarding malformed persisted ring"
                );
                Self::new(capacity)
            }
        }
    }
}
