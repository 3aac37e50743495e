//! Offline health analysis over a slice of the ring.

use std::time::Duration;

use chrono::{DateTime, Utc};
use keepalive_protocol::LogRecord;
use serde::{Deserialize, Serialize};

const GAP_FACTOR: u32 = 2;
const LONG_GAP_FACTOR: u32 = 5;
const CONSECUTIVE_FAILURE_THRESHOLD: usize = 3;
const NETWORK_SWITCH_RATIO: f64 = 0.3;
const MAX_REPORTED_GAPS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl HealthLevel {
    fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            HealthLevel::Excellent
        } else if score >= 75.0 {
            HealthLevel::Good
        } else if score >= 60.0 {
            HealthLevel::Fair
        } else {
            HealthLevel::Poor
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    ConsecutiveFailures { count: usize },
    LongGap { gap: Gap },
    FrequentNetworkSwitch { switches: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub sample_count: usize,
    pub heartbeat_count: usize,
    pub failure_count: usize,
    pub reliability_score: f64,
    pub level: HealthLevel,
    pub max_gap_ms: u64,
    pub avg_gap_ms: u64,
    pub large_gap_count: usize,
    /// The largest gaps, longest first.
    pub large_gaps: Vec<Gap>,
    pub anomalies: Vec<Anomaly>,
}

impl HealthReport {
    fn empty(sample_count: usize, heartbeat_count: usize, failure_count: usize) -> Self {
        Self {
            sample_count,
            heartbeat_count,
            failure_count,
            reliability_score: 0.0,
            level: HealthLevel::Unknown,
            max_gap_ms: 0,
            avg_gap_ms: 0,
            large_gap_count: 0,
            large_gaps: Vec::new(),
            anomalies: Vec::new(),
        }
    }
}

fn is_failure(record: &LogRecord) -> bool {
    record.event_kind().map(|k| k.is_failure()).unwrap_or(false)
}

/// Scores heartbeat regularity against `expected_interval`. `records` must
/// be oldest first.
pub fn analyze(records: &[LogRecord], expected_interval: Duration) -> HealthReport {
    let beats: Vec<&LogRecord> = records.iter().filter(|r| r.is_heartbeat()).collect();
    let failure_count = records.iter().filter(|r| is_failure(r)).count();
    let mut report = HealthReport::empty(records.len(), beats.len(), failure_count);

    let mut anomalies = Vec::new();
    let mut run = 0usize;
    let mut worst_run = 0usize;
    for record in records {
        if is_failure(record) {
            run += 1;
            worst_run = worst_run.max(run);
        } else if record.is_heartbeat() {
            run = 0;
        }
    }
    if worst_run >= CONSECUTIVE_FAILURE_THRESHOLD {
        anomalies.push(Anomaly::ConsecutiveFailures { count: worst_run });
    }

    if beats.len() < 2 {
        report.anomalies = anomalies;
        return report;
    }

    let expected_ms = expected_interval.as_millis() as u64;
    let gap_threshold = expected_ms * u64::from(GAP_FACTOR);
    let long_gap_threshold = expected_ms * u64::from(LONG_GAP_FACTOR);

    let gaps: Vec<Gap> = beats
        .windows(2)
        .map(|w| Gap {
            start: w[0].timestamp,
            end: w[1].timestamp,
            duration_ms: (w[1].timestamp - w[0].timestamp).num_milliseconds().max(0) as u64,
        })
        .collect();
    let mut large: Vec<Gap> = gaps
        .iter()
        .filter(|g| g.duration_ms > gap_threshold)
        .cloned()
        .collect();
    for gap in gaps.iter().filter(|g| g.duration_ms > long_gap_threshold) {
        anomalies.push(Anomaly::LongGap { gap: gap.clone() });
    }

    let switches = beats
        .windows(2)
        .filter(|w| w[0].network != w[1].network)
        .count();
    if switches as f64 > beats.len() as f64 * NETWORK_SWITCH_RATIO {
        anomalies.push(Anomaly::FrequentNetworkSwitch { switches });
    }

    let total: u64 = gaps.iter().map(|g| g.duration_ms).sum();
    let gap_penalty = large.len() as f64 / beats.len() as f64 * 50.0;
    let failure_penalty = failure_count as f64 / records.len() as f64 * 50.0;
    let score = (100.0 - gap_penalty - failure_penalty).max(0.0);

    report.max_gap_ms = gaps.iter().map(|g| g.duration_ms).max().unwrap_or(0);
    report.avg_gap_ms = total / gaps.len() as u64;
    report.large_gap_count = large.len();
    large.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
    large.truncate(MAX_REPORTED_GAPS);
    report.large_gaps = large;
    report.reliability_score = (score * 10.0).round() / 10.0;
    report.level = HealthLevel::from_score(score);
    report.anomalies = anomalies;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepalive_protocol::{
        EventDetail, EventKind, NetworkClass, RecordKind, RecordStatus,
    };

    fn beat(at: i64, network: NetworkClass) -> LogRecord {
        LogRecord {
            kind: RecordKind::Heartbeat,
            seq: at as u64,
            ordinal: at as u64,
            monotonic_ms: at as u64 * 1000,
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + at, 0).expect("ts"),
            device_id: "dev".into(),
            app_version: "1".into(),
            os_version: "1".into(),
            status: RecordStatus::Running,
            battery_percent: Some(50),
            charging: false,
            screen_on: true,
            network,
            free_memory_bytes: 0,
            total_memory_bytes: 0,
            event: None,
        }
    }

    fn failure(at: i64) -> LogRecord {
        LogRecord {
            kind: RecordKind::Event,
            status: RecordStatus::Event(EventKind::WorkerFailure),
            event: Some(EventDetail::new(EventKind::WorkerFailure, "died")),
            ..beat(at, NetworkClass::Wifi)
        }
    }

    #[test]
    fn regular_heartbeats_score_excellent() {
        let records: Vec<_> = (0..10).map(|i| beat(i * 30, NetworkClass::Wifi)).collect();
        let report = analyze(&records, Duration::from_secs(30));
        assert_eq!(report.reliability_score, 100.0);
        assert_eq!(report.level, HealthLevel::Excellent);
        assert_eq!(report.avg_gap_ms, 30_000);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn long_gaps_and_failures_lower_the_score() {
        let mut records: Vec<_> = (0..4).map(|i| beat(i * 30, NetworkClass::Wifi)).collect();
        records.push(failure(100));
        records.push(failure(101));
        records.push(failure(102));
        records.push(beat(400, NetworkClass::Wifi));
        let report = analyze(&records, Duration::from_secs(30));
        assert_eq!(report.large_gap_count, 1);
        assert_eq!(report.max_gap_ms, 310_000);
        assert!(report.reliability_score < 75.0);
        assert!(report
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::ConsecutiveFailures { count: 3 })));
        assert!(report.anomalies.iter().any(|a| matches!(a, Anomaly::LongGap { .. })));
    }

    #[test]
    fn network_flapping_is_reported() {
        let records: Vec<_> = (0..10)
            .map(|i| {
                let net = if i % 2 == 0 { NetworkClass::Wifi } else { NetworkClass::Cellular4g };
                beat(i * 30, net)
            })
            .collect();
        let report = analyze(&records, Duration::from_secs(30));
        assert!(report
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::FrequentNetworkSwitch { switches: 9 })));
    }

    #[test]
    fn too_few_heartbeats_is_unknown() {
        let report = analyze(&[beat(0, NetworkClass::Wifi)], Duration::from_secs(30));
        assert_eq!(report.level, HealthLevel::Unknown);
        assert_eq!(report.sample_count, 1);
    }
}
