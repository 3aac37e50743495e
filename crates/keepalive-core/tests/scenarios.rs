use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use keepalive_core::persistence::{RING_KEY, UPLINK_CACHE_KEY};
use keepalive_core::sim::Harness;
use keepalive_core::{
    Config, EnvDelta, EnvironmentSnapshot, EventKind, HealthLevel, HeartbeatStore,
    KeepAliveError, MemoryPersistence, MemoryPressure, NetworkClass, PermissionKind, PolicyEngine,
    RecordStatus, Signal, StrategyLevel, SupervisorState, TimerId, TrimSignal, UplinkOutcome,
    RING_CAPACITY,
};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn foreground() -> EnvironmentSnapshot {
    EnvironmentSnapshot {
        battery_percent: Some(80),
        charging: false,
        screen_on: true,
        network_up: Some(true),
        network_class: NetworkClass::Wifi,
        memory_pressure: MemoryPressure::Normal,
        app_foreground: true,
        time_since_app_active_ms: Some(0),
        ..EnvironmentSnapshot::default()
    }
}

fn harness() -> Harness {
    init_tracing();
    Harness::new(Config::default()).expect("harness")
}

/// Foreground app on wifi, started at t=0 and run for 125s.
fn steady() -> Harness {
    let mut h = harness();
    h.sink.set_auto_reply(Some(UplinkOutcome::Success));
    h.deliver_env(foreground());
    h.supervisor.start().expect("start");
    h.settle();
    h.advance(secs(125));
    h
}

fn heartbeat_seqs(h: &Harness) -> Vec<u64> {
    h.heartbeats().iter().map(|r| r.seq).collect()
}

#[test]
fn steady_state_runs_at_high_cadence() {
    let h = steady();
    assert_eq!(h.running_heartbeats(), 5);
    assert_eq!(heartbeat_seqs(&h), vec![1, 2, 3, 4, 5]);

    let status = h.supervisor.status();
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.level, StrategyLevel::High);
    assert_eq!(status.interval_ms, Some(30_000));
    assert!(!status.paused);

    let gaps: Vec<u64> = h
        .heartbeats()
        .windows(2)
        .map(|w| w[1].monotonic_ms - w[0].monotonic_ms)
        .collect();
    assert_eq!(gaps, vec![30_000; 4]);
    assert_eq!(h.sink.delivered().len(), 5);
    assert!(h.supervisor.cache().is_empty());
}

#[test]
fn screen_off_drops_to_normal() {
    let mut h = steady();
    h.deliver_delta(EnvDelta {
        screen_on: Some(false),
        ..EnvDelta::default()
    });
    assert_eq!(h.supervisor.level(), StrategyLevel::Normal);
    assert_eq!(h.supervisor.status().interval_ms, Some(60_000));

    h.advance_to(secs(185));
    let beats = h.heartbeats();
    let last_two = &beats[beats.len() - 2..];
    assert_eq!(last_two[1].monotonic_ms - last_two[0].monotonic_ms, 60_000);
}

#[test]
fn critical_battery_forces_minimal() {
    let mut h = steady();
    let before = h.events(EventKind::PolicyChange).len();
    h.deliver_delta(EnvDelta {
        battery_percent: Some(8),
        charging: Some(false),
        ..EnvDelta::default()
    });

    assert_eq!(h.supervisor.level(), StrategyLevel::Minimal);
    assert_eq!(h.supervisor.status().interval_ms, Some(300_000));
    let changes = h.events(EventKind::PolicyChange);
    assert_eq!(changes.len(), before + 1);
    let detail = changes
        .last()
        .and_then(|r| r.event.as_ref())
        .expect("policy change detail");
    assert_eq!(detail.field_str("from"), Some("High"));
    assert_eq!(detail.field_str("to"), Some("Minimal"));
}

#[test]
fn network_outage_caches_and_recovers_in_order() {
    let mut h = steady();
    h.sink.set_auto_reply(None);

    h.deliver_delta(EnvDelta {
        network_up: Some(false),
        ..EnvDelta::default()
    });
    assert!(h.supervisor.status().paused);
    assert_eq!(h.clock.due(TimerId::Heartbeat), None);
    assert_eq!(h.events(EventKind::LoopPaused).len(), 1);

    let beats_before = h.heartbeats().len();
    let dispatched_before = h.sink.dispatched();
    let triggered: Vec<u64> = (0..3)
        .map(|_| h.supervisor.trigger_heartbeat().seq)
        .collect();
    h.settle();
    assert_eq!(h.supervisor.cache().len(), 3);
    assert_eq!(h.heartbeats().len(), beats_before + 3);
    assert_eq!(h.sink.dispatched(), dispatched_before);

    h.advance(secs(10));
    let resumed_at = h.now();
    h.deliver_delta(EnvDelta {
        network_up: Some(true),
        ..EnvDelta::default()
    });
    assert!(!h.supervisor.status().paused);
    assert_eq!(h.events(EventKind::LoopResumed).len(), 1);
    assert_eq!(h.sink.in_flight(), 1);
    let resume_tick = h.heartbeats().last().cloned().expect("resume tick");
    assert_eq!(resume_tick.monotonic_ms, resumed_at.as_millis() as u64);

    let flushed: Vec<u64> = (0..3)
        .filter_map(|_| h.reply(UplinkOutcome::Success))
        .map(|r| r.seq)
        .collect();
    assert_eq!(flushed, triggered);

    let last = h.reply(UplinkOutcome::Success).expect("resume tick uplink");
    assert_eq!(last.seq, resume_tick.seq);
    assert!(h.supervisor.cache().is_empty());

    let delivered: Vec<u64> = h.sink.delivered().iter().map(|r| r.seq).collect();
    let unique: HashSet<u64> = delivered.iter().copied().collect();
    assert_eq!(unique.len(), delivered.len());
}

#[test]
fn crash_storm_backs_off_then_fails() {
    let mut h = steady();
    let expected = [5, 10, 20, 40, 80];
    for (i, delay) in expected.iter().enumerate() {
        if i > 0 {
            h.advance(Duration::from_millis(100));
        }
        h.supervisor.on_worker_died();
        h.settle();
        assert_eq!(
            h.clock.due(TimerId::Restart),
            Some(h.now() + secs(*delay)),
            "restart {i}"
        );
        assert_eq!(h.supervisor.state(), SupervisorState::Restarting);
    }
    assert_eq!(h.supervisor.status().restart_attempts, 5);
    assert_eq!(h.events(EventKind::RestartScheduled).len(), 5);

    h.worker.set_refuse(true);
    h.advance(secs(80));
    assert_eq!(h.supervisor.state(), SupervisorState::Failed);
    assert_eq!(h.clock.due(TimerId::Restart), None);

    let failure = h
        .events(EventKind::RestartFailure)
        .pop()
        .and_then(|r| r.event)
        .expect("restart failure event");
    assert_eq!(failure.fields.get("total_attempts"), Some(&json!(5)));
    assert!(h.supervisor.status().last_error.is_some());
}

#[test]
fn memory_critical_degrades_with_hysteresis() {
    let mut h = steady();
    let critical = EnvDelta {
        memory_pressure: Some(MemoryPressure::Critical),
        ..EnvDelta::default()
    };
    let normal = EnvDelta {
        memory_pressure: Some(MemoryPressure::Normal),
        ..EnvDelta::default()
    };

    h.deliver_delta(critical);
    assert_eq!(h.supervisor.state(), SupervisorState::Degraded);
    assert_eq!(h.supervisor.level(), StrategyLevel::Minimal);
    assert_eq!(h.supervisor.status().interval_ms, Some(300_000));
    assert_eq!(h.events(EventKind::MemoryDegraded).len(), 1);

    h.advance_to(secs(425));
    let last = h.heartbeats().last().cloned().expect("degraded tick");
    assert_eq!(last.status, RecordStatus::Degraded);
    assert_eq!(last.monotonic_ms, 420_000);

    h.deliver_delta(normal.clone());
    assert_eq!(h.supervisor.level(), StrategyLevel::Minimal);
    assert_eq!(h.supervisor.state(), SupervisorState::Degraded);

    h.deliver_delta(normal);
    assert_eq!(h.supervisor.level(), StrategyLevel::High);
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.events(EventKind::MemoryRecovered).len(), 1);
}

#[test]
fn trim_signals_feed_the_governor() {
    let mut h = steady();
    h.post(Signal::MemoryTrim(TrimSignal::Complete));
    assert_eq!(h.supervisor.state(), SupervisorState::Degraded);
    assert_eq!(h.supervisor.status().memory_pressure, MemoryPressure::Critical);

    h.post(Signal::FreeMemory {
        available_bytes: 512 * 1024 * 1024,
        low: false,
    });
    assert_eq!(h.supervisor.state(), SupervisorState::Degraded);
    h.post(Signal::FreeMemory {
        available_bytes: 512 * 1024 * 1024,
        low: false,
    });
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
}

#[test]
fn full_snapshots_do_not_clear_trim_pressure() {
    let mut h = steady();
    h.post(Signal::MemoryTrim(TrimSignal::Complete));
    assert_eq!(h.supervisor.level(), StrategyLevel::Minimal);

    h.deliver_env(EnvironmentSnapshot {
        screen_on: false,
        ..foreground()
    });
    h.deliver_env(foreground());
    assert_eq!(h.supervisor.level(), StrategyLevel::Minimal);
    assert_eq!(h.supervisor.state(), SupervisorState::Degraded);
    assert_eq!(h.supervisor.status().memory_pressure, MemoryPressure::Critical);

    // A snapshot that actually reports a new memory value is still a reading.
    h.deliver_env(EnvironmentSnapshot {
        memory_pressure: MemoryPressure::Moderate,
        ..foreground()
    });
    h.deliver_env(foreground());
    assert_eq!(h.supervisor.status().memory_pressure, MemoryPressure::Critical);
    h.post(Signal::MemoryTrim(TrimSignal::Normal));
    assert_eq!(h.supervisor.level(), StrategyLevel::High);
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
}

fn tuned(base_ms: u64) -> (Harness, PolicyEngine) {
    init_tracing();
    let config = Config {
        heartbeat_interval_ms: base_ms as i64,
        adaptive_tuning: true,
        ..Config::default()
    };
    let mut h = Harness::new(config).expect("harness");
    h.sink.set_auto_reply(Some(UplinkOutcome::Success));
    h.deliver_env(foreground());
    h.supervisor.start().expect("start");
    h.settle();
    (h, PolicyEngine::new(Duration::from_millis(base_ms)))
}

fn interval(h: &Harness) -> Duration {
    Duration::from_millis(h.supervisor.status().interval_ms.expect("interval"))
}

#[test]
fn busy_cadence_tunes_slower_and_holds() {
    let (mut h, engine) = tuned(15_000);
    let (_, ceiling) = engine.level_band(StrategyLevel::High);
    let ceiling = Duration::from_millis(ceiling.as_millis() as u64);
    assert_eq!(interval(&h), secs(15));

    h.advance(secs(3600));
    assert!(h.heartbeats().len() <= RING_CAPACITY);
    assert_eq!(interval(&h), ceiling);

    // Tick history is kept apart from the ring.
    h.supervisor.clear_logs().expect("clear");
    h.advance(secs(60));
    assert_eq!(interval(&h), ceiling);

    h.deliver_delta(EnvDelta {
        battery_percent: Some(70),
        ..EnvDelta::default()
    });
    assert_eq!(h.supervisor.level(), StrategyLevel::High);
    assert_eq!(interval(&h), ceiling);

    h.deliver_delta(EnvDelta {
        screen_on: Some(false),
        ..EnvDelta::default()
    });
    assert_eq!(h.supervisor.level(), StrategyLevel::Normal);
    assert_eq!(interval(&h), engine.interval_for(StrategyLevel::Normal));
}

#[test]
fn sparse_cadence_tunes_faster_within_the_band() {
    let (mut h, engine) = tuned(30_000);
    let (floor, _) = engine.level_band(StrategyLevel::High);
    let first = engine.tune(StrategyLevel::High, secs(30), 1);
    assert!(first < secs(30));
    assert_eq!(interval(&h), Duration::from_millis(first.as_millis() as u64));

    h.advance(secs(28));
    assert_eq!(h.heartbeats().len(), 2);
    assert!(interval(&h) < first);

    h.advance(secs(120));
    assert_eq!(interval(&h), Duration::from_millis(floor.as_millis() as u64));

    h.deliver_delta(EnvDelta {
        charging: Some(true),
        ..EnvDelta::default()
    });
    assert_eq!(h.supervisor.level(), StrategyLevel::High);
    assert_eq!(interval(&h), Duration::from_millis(floor.as_millis() as u64));
}

#[test]
fn idle_supervisor_records_no_loop_events() {
    let mut h = harness();
    h.deliver_delta(EnvDelta {
        network_up: Some(false),
        ..EnvDelta::default()
    });
    h.deliver_delta(EnvDelta {
        network_up: Some(true),
        ..EnvDelta::default()
    });
    assert!(h.events(EventKind::LoopPaused).is_empty());
    assert!(h.events(EventKind::LoopResumed).is_empty());
    assert_eq!(h.clock.due(TimerId::Heartbeat), None);

    let mut h = steady();
    h.supervisor.stop().expect("stop");
    h.deliver_delta(EnvDelta {
        network_up: Some(false),
        ..EnvDelta::default()
    });
    h.deliver_delta(EnvDelta {
        network_up: Some(true),
        ..EnvDelta::default()
    });
    assert!(h.events(EventKind::LoopPaused).is_empty());
    assert!(h.events(EventKind::LoopResumed).is_empty());
    assert!(h.heartbeats().iter().all(|r| r.status == RecordStatus::Running));
}

#[test]
fn restart_window_resets_attempts() {
    let mut h = steady();
    h.deliver_delta(EnvDelta {
        network_up: Some(false),
        ..EnvDelta::default()
    });

    h.supervisor.on_worker_died();
    h.settle();
    assert_eq!(h.clock.due(TimerId::Restart), Some(h.now() + secs(5)));
    h.advance(secs(5));
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.supervisor.restart_stats().used, 1);

    h.advance(secs(11 * 60));
    h.supervisor.on_worker_died();
    h.settle();
    assert_eq!(h.clock.due(TimerId::Restart), Some(h.now() + secs(5)));
    assert_eq!(h.supervisor.restart_stats().used, 1);
}

#[test]
fn first_tick_after_restart_clears_attempts() {
    let mut h = steady();
    assert!(h.worker.kill("oom killed"));
    h.settle();
    assert_eq!(h.supervisor.state(), SupervisorState::Restarting);
    assert_eq!(h.supervisor.status().last_error.as_deref(), Some("oom killed"));

    h.advance(secs(5));
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.supervisor.generation(), 2);
    assert_eq!(h.worker.starts(), 2);
    assert_eq!(h.supervisor.status().restart_attempts, 0);
    assert_eq!(h.supervisor.status().last_error, None);

    let budget = h.supervisor.restart_stats();
    assert_eq!(budget.max_restarts, 5);
    assert_eq!(budget.remaining, 5);
    assert_eq!(budget.current_downtime_ms, None);
}

#[test]
fn stale_worker_deaths_are_ignored() {
    let mut h = steady();
    h.worker.kill("crash");
    h.advance(secs(5));
    assert_eq!(h.supervisor.generation(), 2);

    let failures = h.events(EventKind::WorkerFailure).len();
    h.post(Signal::WorkerDied {
        generation: 1,
        reason: Some("late report".into()),
    });
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.events(EventKind::WorkerFailure).len(), failures);
}

#[test]
fn cache_keeps_the_newest_fifty_while_offline() {
    let mut h = harness();
    h.deliver_delta(EnvDelta {
        network_up: Some(false),
        ..EnvDelta::default()
    });
    for _ in 0..60 {
        h.supervisor.trigger_heartbeat();
    }
    h.settle();

    let cached: Vec<u64> = h.supervisor.cache().iter().map(|r| r.seq).collect();
    assert_eq!(cached.len(), 50);
    assert_eq!(cached, (11..=60).collect::<Vec<_>>());
    assert_eq!(h.sink.dispatched(), 0);
}

#[test]
fn ring_keeps_the_newest_hundred() {
    let mut h = harness();
    for _ in 0..200 {
        h.supervisor.trigger_heartbeat();
    }
    let logs = h.supervisor.get_logs(None);
    assert_eq!(logs.len(), RING_CAPACITY);
    assert_eq!(logs[0].seq, 101);
    assert_eq!(logs[RING_CAPACITY - 1].seq, 200);

    let tail: Vec<u64> = h.supervisor.get_logs(Some(3)).iter().map(|r| r.seq).collect();
    assert_eq!(tail, vec![198, 199, 200]);
    assert_eq!(h.supervisor.get_logs(Some(1_000)).len(), RING_CAPACITY);
    assert_eq!(h.supervisor.status().heartbeat_seq, 200);
}

#[test]
fn start_refuses_without_permission() {
    let mut h = harness();
    h.permissions.set_missing(vec![PermissionKind::Notification]);
    let err = h.supervisor.start().expect_err("permission missing");
    assert_eq!(
        err,
        KeepAliveError::PermissionDenied {
            kind: PermissionKind::Notification
        }
    );
    assert_eq!(err.code(), "permission_denied");
    assert_eq!(h.supervisor.state(), SupervisorState::Idle);
    assert_eq!(h.worker.starts(), 0);

    let denied = h
        .events(EventKind::PermissionDenied)
        .pop()
        .and_then(|r| r.event)
        .expect("permission event");
    assert_eq!(denied.field_str("kind"), Some("notification"));
}

#[test]
fn refused_worker_fails_start_until_it_cooperates() {
    let mut h = harness();
    h.worker.set_refuse(true);
    let err = h.supervisor.start().expect_err("worker refuses");
    assert!(matches!(err, KeepAliveError::WorkerRefused(_)));
    assert_eq!(h.supervisor.state(), SupervisorState::Failed);
    assert_eq!(h.events(EventKind::WorkerFailure).len(), 1);

    h.worker.set_refuse(false);
    h.supervisor.start().expect("second start");
    h.settle();
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    assert_eq!(h.heartbeats().len(), 1);
}

#[test]
fn disabled_config_cannot_start() {
    init_tracing();
    let config = Config {
        enabled: false,
        ..Config::default()
    };
    let mut h = Harness::new(config).expect("harness");
    assert_eq!(h.supervisor.start(), Err(KeepAliveError::NotInitialized));
    assert_eq!(h.supervisor.state(), SupervisorState::Idle);
}

#[test]
fn start_and_stop_are_idempotent() {
    let mut h = steady();
    h.supervisor.start().expect("second start");
    assert_eq!(h.worker.starts(), 1);

    h.supervisor.stop().expect("stop");
    h.supervisor.stop().expect("second stop");
    assert_eq!(h.supervisor.state(), SupervisorState::Stopped);
    assert_eq!(h.worker.stops(), 1);
    assert!(!h.worker.is_running());
    assert_eq!(h.clock.due(TimerId::Heartbeat), None);
    assert_eq!(h.clock.due(TimerId::Restart), None);

    let beats = h.heartbeats().len();
    h.advance(secs(600));
    assert_eq!(h.heartbeats().len(), beats);

    let transitions: Vec<String> = h
        .events(EventKind::StateChange)
        .iter()
        .filter_map(|r| r.event.as_ref())
        .filter_map(|e| e.field_str("to").map(str::to_string))
        .collect();
    assert_eq!(transitions, vec!["starting", "running", "stopping", "stopped"]);
}

#[test]
fn notification_updates_reach_the_worker() {
    let mut h = steady();
    h.supervisor.set_notification("Syncing", "").expect("update");
    let (title, body) = h.worker.presence().expect("presence");
    assert_eq!(title, "Syncing");
    assert_eq!(body, h.supervisor.config().notification.body);
    assert_eq!(h.events(EventKind::NotificationUpdated).len(), 1);

    assert!(matches!(
        h.supervisor.update_notification_text("  ", ""),
        Err(KeepAliveError::InvalidArgument(_))
    ));

    h.supervisor.stop().expect("stop");
    assert_eq!(
        h.supervisor.set_notification("Later", "body"),
        Err(KeepAliveError::NotRunning)
    );
}

#[test]
fn transient_uplink_failures_retry_then_drop() {
    init_tracing();
    let config = Config {
        max_retry_count: 1,
        ..Config::default()
    };
    let mut h = Harness::new(config).expect("harness");
    h.supervisor.start().expect("start");
    h.settle();
    assert_eq!(h.sink.in_flight(), 1);

    h.reply(UplinkOutcome::TransientFailure("timeout".into()));
    assert_eq!(h.clock.due(TimerId::FlushRetry), Some(h.now() + secs(5)));
    assert_eq!(h.events(EventKind::FlushRetryScheduled).len(), 1);
    assert_eq!(h.supervisor.cache().len(), 1);

    h.advance(secs(5));
    assert_eq!(h.sink.in_flight(), 1);
    h.reply(UplinkOutcome::TransientFailure("timeout".into()));

    let dropped = h
        .events(EventKind::UplinkDropped)
        .pop()
        .and_then(|r| r.event)
        .expect("drop event");
    assert_eq!(dropped.fields.get("dropped_seq"), Some(&json!(1)));
    assert!(h.supervisor.cache().is_empty());
    assert_eq!(h.clock.due(TimerId::FlushRetry), Some(h.now() + secs(10)));
}

#[test]
fn permanent_uplink_failure_drops_immediately() {
    let mut h = harness();
    h.supervisor.start().expect("start");
    h.settle();
    h.reply(UplinkOutcome::PermanentFailure("rejected".into()));
    assert!(h.supervisor.cache().is_empty());
    assert_eq!(h.events(EventKind::UplinkDropped).len(), 1);
    assert_eq!(h.clock.due(TimerId::FlushRetry), None);
}

#[test]
fn state_survives_a_reload() {
    init_tracing();
    let persistence = Arc::new(MemoryPersistence::new());
    let (device_id, records, max_ordinal) = {
        let mut h = Harness::with_persistence(Config::default(), persistence.clone())
            .expect("first harness");
        h.sink.set_auto_reply(Some(UplinkOutcome::Success));
        h.deliver_env(foreground());
        h.supervisor.start().expect("start");
        h.settle();
        h.advance(secs(65));
        h.supervisor.stop().expect("stop");
        let max_ordinal = h.supervisor.store().iter().map(|r| r.ordinal).max();
        (
            h.supervisor.device_id().to_string(),
            h.supervisor.store().len(),
            max_ordinal.unwrap_or(0),
        )
    };

    let mut h = Harness::with_persistence(Config::default(), persistence).expect("reload");
    assert_eq!(h.supervisor.device_id(), device_id);
    assert_eq!(h.supervisor.store().len(), records);
    assert_eq!(h.supervisor.state(), SupervisorState::Idle);

    let next = h.supervisor.trigger_heartbeat();
    assert_eq!(next.seq, 4);
    assert!(next.ordinal > max_ordinal);
}

#[test]
fn offline_cache_survives_a_reload() {
    init_tracing();
    let persistence = Arc::new(MemoryPersistence::new());
    {
        let mut h = Harness::with_persistence(Config::default(), persistence.clone())
            .expect("first harness");
        h.deliver_delta(EnvDelta {
            network_up: Some(false),
            ..EnvDelta::default()
        });
        for _ in 0..3 {
            h.supervisor.trigger_heartbeat();
        }
        h.supervisor.flush_persistence();
    }
    assert!(persistence.peek(UPLINK_CACHE_KEY).is_some());

    let mut h = Harness::with_persistence(Config::default(), persistence).expect("reload");
    assert_eq!(h.supervisor.cache().len(), 3);
    h.deliver_delta(EnvDelta {
        network_up: Some(false),
        ..EnvDelta::default()
    });
    assert_eq!(h.sink.dispatched(), 0);
    h.deliver_delta(EnvDelta {
        network_up: Some(true),
        ..EnvDelta::default()
    });
    let first = h.reply(UplinkOutcome::Success).expect("flushed");
    assert_eq!(first.seq, 1);
}

#[test]
fn configured_device_id_wins() {
    init_tracing();
    let config = Config {
        device_id: Some("  host-fingerprint ".into()),
        ..Config::default()
    };
    let h = Harness::new(config).expect("harness");
    assert_eq!(h.supervisor.device_id(), "host-fingerprint");
    let generated = harness();
    assert_eq!(generated.supervisor.device_id().len(), 36);
}

#[test]
fn persistence_failures_are_not_fatal() {
    let mut h = steady();
    h.persistence.set_failing(true);
    let beats = h.heartbeats().len();
    h.advance(secs(60));
    assert_eq!(h.heartbeats().len(), beats + 2);
    assert_eq!(h.supervisor.state(), SupervisorState::Running);
    let stored = h.persistence.peek(RING_KEY).expect("earlier snapshot");
    assert!(HeartbeatStore::decode(RING_CAPACITY, &stored).len() < h.supervisor.store().len());

    h.persistence.set_failing(false);
    h.advance(secs(31));
    let stored = h.persistence.peek(RING_KEY).expect("snapshot");
    assert_eq!(
        HeartbeatStore::decode(RING_CAPACITY, &stored).len(),
        h.supervisor.store().len()
    );
}

#[test]
fn clear_logs_empties_and_persists() {
    let mut h = steady();
    let mut rx = h.bus.subscribe();
    h.supervisor.clear_logs().expect("clear");
    assert!(h.supervisor.store().is_empty());
    assert!(h.supervisor.get_logs(None).is_empty());

    let stored = h.persistence.peek(RING_KEY).expect("persisted");
    assert!(HeartbeatStore::decode(RING_CAPACITY, &stored).is_empty());

    let mut kinds = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        kinds.push(envelope.kind);
    }
    assert!(kinds
        .iter()
        .any(|k| k == keepalive_events::topics::TOPIC_LOGS_CLEARED));
}

#[test]
fn status_stats_and_analysis_describe_a_healthy_run() {
    let h = steady();
    let status = h.supervisor.status();
    assert_eq!(status.heartbeat_seq, 5);
    assert_eq!(status.cached_records, 0);
    assert_eq!(status.last_error, None);
    assert!(status.advisories.autostart);
    assert!(status.last_heartbeat.is_some());
    assert_eq!(status.state_label.as_deref(), Some("Running"));

    let stats = h.supervisor.get_stats();
    assert_eq!(stats.count, h.supervisor.store().len());
    assert_eq!(stats.by_status.get("running"), Some(&5));
    assert_eq!(stats.average_interval_ms, 30_000);

    let report = h.supervisor.analyze_logs();
    assert_eq!(report.heartbeat_count, 5);
    assert_eq!(report.level, HealthLevel::Excellent);
    assert!(report.anomalies.is_empty());
    assert_eq!(report.max_gap_ms, 30_000);
}

#[test]
fn init_json_accepts_bridge_payload() {
    init_tracing();
    let (mailbox, _rx) = keepalive_core::Mailbox::channel();
    let clock = Arc::new(keepalive_core::sim::SimClock::new(mailbox.clone(), chrono::Utc::now()));
    let host = keepalive_core::Host::new(
        clock,
        Box::new(keepalive_core::sim::SimWorker::new()),
        Arc::new(MemoryPersistence::new()),
        mailbox,
    );
    let supervisor = keepalive_core::Supervisor::init_json(
        r#"{"enabled": true, "heartbeatInterval": 5000, "notification": {"title": "", "content": "On"}}"#,
        host,
    )
    .expect("init");
    assert_eq!(supervisor.config().heartbeat_interval_ms, 15_000);
    assert_eq!(supervisor.config().notification.body, "On");
    assert!(!supervisor.config().notification.title.is_empty());
}

#[test]
fn init_json_rejects_malformed_payload() {
    let (mailbox, _rx) = keepalive_core::Mailbox::channel();
    let clock = Arc::new(keepalive_core::sim::SimClock::new(mailbox.clone(), chrono::Utc::now()));
    let host = keepalive_core::Host::new(
        clock,
        Box::new(keepalive_core::sim::SimWorker::new()),
        Arc::new(MemoryPersistence::new()),
        mailbox,
    );
    let err = keepalive_core::Supervisor::init_json(r#"{"enabled": "sometimes"}"#, host)
        .expect_err("schema");
    assert_eq!(err.code(), "invalid_config");
}
