use crate::anomaly::{AnomalyReason, NetworkAnomalyDetector};
use crate::evaluator::AlertEvaluator;
use crate::history::{derive_rate, MetricsHistory};
use crate::reload::RuleWatchScheduler;
use crate::Notifier;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use virtmon_common::types::{
    Alert, AlertRule, AlertState, Condition, CustomThresholdConfig, EngineEvent, Guest,
    GuestFilter, GuestMetrics, MetricThreshold, MetricValue, RuleKind, RulePatch, ThresholdBand,
};
use virtmon_storage::{files, save_document, DurableStore, FileStore, MemoryStore};

const GIB: u64 = 1024 * 1024 * 1024;

fn make_guest(vmid: &str, name: &str) -> Guest {
    Guest {
        endpoint_id: "pve1".into(),
        node: "node1".into(),
        vmid: vmid.into(),
        name: name.into(),
        kind: "qemu".into(),
        status: "running".into(),
        maxmem: 4 * GIB,
        maxdisk: 32 * GIB,
    }
}

fn make_metrics(guest: &Guest, cpu: f64) -> GuestMetrics {
    GuestMetrics {
        endpoint_id: guest.endpoint_id.clone(),
        node: guest.node.clone(),
        vmid: guest.vmid.clone(),
        timestamp: Utc::now(),
        cpu: Some(cpu),
        mem: None,
        disk: None,
        diskread: None,
        diskwrite: None,
        netin: None,
        netout: None,
        status: Some("running".into()),
    }
}

fn cpu_rule(id: &str, threshold: f64, duration_ms: i64) -> AlertRule {
    AlertRule {
        id: id.into(),
        name: format!("{id} rule"),
        description: String::new(),
        group: String::new(),
        tags: Vec::new(),
        enabled: true,
        kind: RuleKind::SingleMetric {
            metric: "cpu".into(),
            condition: Condition::GreaterThan,
            threshold: MetricValue::Number(threshold),
            duration_ms,
        },
        escalation_ms: 15 * 60 * 1000,
        auto_resolve: true,
        suppression_ms: 0,
        send_email: true,
        send_webhook: false,
    }
}

/// Evaluator over an empty rule file (no default seeding).
fn empty_evaluator() -> AlertEvaluator {
    let store = Arc::new(MemoryStore::new());
    store.write(files::ALERT_RULES, "{}").unwrap();
    AlertEvaluator::new(store).unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---- rule store ----

#[test]
fn seeds_default_rules_when_no_file_exists() {
    let evaluator = AlertEvaluator::new(Arc::new(MemoryStore::new())).unwrap();
    let ids: Vec<String> = evaluator.rule_list().into_iter().map(|r| r.id).collect();
    assert!(ids.contains(&"cpu_high".to_string()));
    assert!(ids.contains(&"memory_high".to_string()));
    assert!(ids.contains(&"disk_high".to_string()));
}

#[test]
fn add_rule_rejects_duplicates_and_malformed_compounds() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();
    assert!(evaluator.add_rule(cpu_rule("cpu_high", 70.0, 0)).is_err());

    let mut compound = cpu_rule("compound", 0.0, 0);
    compound.kind = RuleKind::CompoundThreshold {
        thresholds: Vec::new(),
    };
    assert!(evaluator.add_rule(compound).is_err());
}

#[test]
fn rules_survive_reload_from_the_same_store() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    {
        let mut evaluator = AlertEvaluator::new(store.clone()).unwrap();
        evaluator.add_rule(cpu_rule("custom", 50.0, 0)).unwrap();
    }
    let evaluator = AlertEvaluator::new(store).unwrap();
    assert!(evaluator.rule(&"custom".to_string()).is_some());
}

// ---- state machine ----

#[test]
fn alert_fires_immediately_when_duration_is_zero() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();
    let mut rx = evaluator.subscribe();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);

    let alerts = evaluator.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].state, AlertState::Active);
    // CPU 0.90 is a fraction and normalizes to 90%
    assert_eq!(alerts[0].current_value, MetricValue::Number(90.0));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::Alert { .. })));
}

#[test]
fn at_most_one_alert_per_key_across_repeated_ticks() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();
    let mut rx = evaluator.subscribe();

    let guest = make_guest("100", "web");
    for _ in 0..5 {
        evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    }

    assert_eq!(evaluator.active_alerts().len(), 1);
    let fired = drain(&mut rx)
        .iter()
        .filter(|e| matches!(e, EngineEvent::Alert { .. }))
        .count();
    assert_eq!(fired, 1, "exactly one alert event for a sustained condition");
}

#[test]
fn pending_alert_clears_silently_when_condition_drops_before_duration() {
    let mut evaluator = empty_evaluator();
    evaluator
        .add_rule(cpu_rule("cpu_high", 85.0, 60_000))
        .unwrap();
    let mut rx = evaluator.subscribe();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    assert_eq!(evaluator.active_alerts()[0].state, AlertState::Pending);

    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.50)]);
    assert!(evaluator.active_alerts().is_empty());
    assert!(drain(&mut rx).is_empty(), "transient conditions emit nothing");
}

#[test]
fn pending_alert_activates_once_duration_elapses() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 50)).unwrap();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    assert_eq!(evaluator.active_alerts()[0].state, AlertState::Pending);

    std::thread::sleep(StdDuration::from_millis(80));
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    assert_eq!(evaluator.active_alerts()[0].state, AlertState::Active);
}

#[test]
fn full_lifecycle_emits_one_alert_and_one_resolution() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 50)).unwrap();
    let mut rx = evaluator.subscribe();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    std::thread::sleep(StdDuration::from_millis(80));
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.50)]);

    let events = drain(&mut rx);
    let fired = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Alert { .. }))
        .count();
    let resolved = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::AlertResolved { .. }))
        .count();
    assert_eq!(fired, 1);
    assert_eq!(resolved, 1);
    assert!(
        evaluator.active_alerts().is_empty(),
        "auto-resolved alerts leave the active set"
    );
}

#[test]
fn non_auto_resolve_alert_lingers_until_cleared() {
    let mut evaluator = empty_evaluator();
    let mut rule = cpu_rule("cpu_high", 85.0, 0);
    rule.auto_resolve = false;
    evaluator.add_rule(rule).unwrap();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.50)]);

    let alerts = evaluator.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].state, AlertState::Resolved);

    evaluator.clear_alert(&alerts[0].id).unwrap();
    assert!(evaluator.active_alerts().is_empty());
}

#[test]
fn acknowledged_alert_is_frozen_until_unacknowledged() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    let alert_id = evaluator.active_alerts()[0].id.clone();

    evaluator
        .acknowledge_alert(&alert_id, "operator", Some("looking into it".into()))
        .unwrap();

    // Value changes are ignored while acknowledged
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.99)]);
    let alert = evaluator.alert_by_id(&alert_id).unwrap();
    assert_eq!(alert.current_value, MetricValue::Number(90.0));

    // The condition clearing does not resolve an acknowledged alert
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.50)]);
    let alert = evaluator.alert_by_id(&alert_id).unwrap();
    assert_eq!(alert.state, AlertState::Active);

    // After unacknowledging, the next clear tick resolves it
    evaluator.unacknowledge_alert(&alert_id).unwrap();
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.50)]);
    assert!(evaluator.active_alerts().is_empty());
}

#[test]
fn evaluate_current_state_bypasses_the_duration_gate() {
    let mut evaluator = empty_evaluator();
    evaluator
        .add_rule(cpu_rule("cpu_high", 85.0, 600_000))
        .unwrap();

    let guest = make_guest("100", "web");
    evaluator.evaluate_current_state(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    assert_eq!(evaluator.active_alerts()[0].state, AlertState::Active);
}

#[test]
fn disabling_a_rule_cascades_alert_cleanup() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
    assert_eq!(evaluator.active_alerts().len(), 1);

    evaluator
        .update_rule(
            "cpu_high",
            RulePatch {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(evaluator.active_alerts().is_empty());
}

#[test]
fn active_alerts_are_restored_on_startup() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    store.write(files::ALERT_RULES, "{}").unwrap();
    let guest = make_guest("100", "web");
    {
        let mut evaluator = AlertEvaluator::new(store.clone()).unwrap();
        evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();
        evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.90)]);
        assert_eq!(evaluator.active_alerts().len(), 1);
    }
    let evaluator = AlertEvaluator::new(store).unwrap();
    let alerts = evaluator.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].state, AlertState::Active);
    assert_eq!(alerts[0].guest.vmid, guest.vmid);
}

// ---- compound rules ----

fn compound_rule() -> AlertRule {
    let mut rule = cpu_rule("cpu_and_mem", 0.0, 0);
    rule.kind = RuleKind::CompoundThreshold {
        thresholds: vec![
            MetricThreshold {
                metric: "cpu".into(),
                condition: Condition::GreaterThan,
                threshold: 80.0,
            },
            MetricThreshold {
                metric: "memory".into(),
                condition: Condition::GreaterThan,
                threshold: 90.0,
            },
        ],
    };
    rule
}

fn metrics_with_mem(guest: &Guest, cpu: f64, mem: u64) -> GuestMetrics {
    let mut m = make_metrics(guest, cpu);
    m.mem = Some(mem);
    m
}

#[test]
fn compound_rule_requires_all_thresholds() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(compound_rule()).unwrap();
    let guest = make_guest("100", "web");

    // cpu 90%, mem 95% -> both hold
    evaluator.check_metrics(
        &[guest.clone()],
        &[metrics_with_mem(&guest, 0.90, 4 * GIB * 95 / 100)],
    );
    assert_eq!(evaluator.active_alerts().len(), 1);

    // mem drops to 50% -> AND fails, active alert resolves
    evaluator.check_metrics(
        &[guest.clone()],
        &[metrics_with_mem(&guest, 0.90, 2 * GIB)],
    );
    assert!(evaluator.active_alerts().is_empty());
}

#[test]
fn compound_rule_fails_closed_on_missing_data() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(compound_rule()).unwrap();
    let guest = make_guest("100", "web");

    // cpu present and loud, mem absent -> never triggers
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.99)]);
    assert!(evaluator.active_alerts().is_empty());
}

// ---- custom thresholds ----

#[test]
fn custom_threshold_overrides_the_rule_and_reverts_on_removal() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();
    let guest = make_guest("400", "db");

    evaluator
        .thresholds_mut()
        .set_thresholds(CustomThresholdConfig {
            endpoint_id: guest.endpoint_id.clone(),
            vmid: "400".into(),
            enabled: true,
            cpu: Some(ThresholdBand {
                warning: 50.0,
                critical: 90.0,
            }),
            memory: None,
            disk: None,
        })
        .unwrap();

    // 60% triggers against the override even though the rule says 85
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.60)]);
    let alerts = evaluator.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].effective_threshold, MetricValue::Number(50.0));

    // Removing the override reverts to the global threshold: 60% no longer
    // holds, so the alert resolves
    evaluator
        .thresholds_mut()
        .remove_thresholds(&guest.endpoint_id, "400");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.60)]);
    assert!(evaluator.active_alerts().is_empty());
}

#[test]
fn threshold_validation_rejects_inverted_and_out_of_range_bands() {
    let mut evaluator = empty_evaluator();
    let mut config = CustomThresholdConfig {
        endpoint_id: "pve1".into(),
        vmid: "400".into(),
        enabled: true,
        cpu: Some(ThresholdBand {
            warning: 90.0,
            critical: 50.0,
        }),
        memory: None,
        disk: None,
    };
    assert!(evaluator.thresholds_mut().set_thresholds(config.clone()).is_err());

    config.cpu = Some(ThresholdBand {
        warning: 50.0,
        critical: 150.0,
    });
    assert!(evaluator.thresholds_mut().set_thresholds(config).is_err());
}

// ---- suppression ----

#[test]
fn suppression_silences_matching_guests_until_expiry() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();
    let guest = make_guest("400", "db");

    evaluator
        .suppress_alert(
            "cpu_high",
            GuestFilter {
                endpoint_id: None,
                node: None,
                vmid: Some("400".into()),
            },
            50,
            "maintenance",
        )
        .unwrap();

    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.95)]);
    assert!(evaluator.active_alerts().is_empty());

    std::thread::sleep(StdDuration::from_millis(80));
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.95)]);
    assert_eq!(evaluator.active_alerts().len(), 1);
}

#[test]
fn suppression_does_not_touch_other_guests_or_rules() {
    let mut evaluator = empty_evaluator();
    evaluator.add_rule(cpu_rule("cpu_high", 85.0, 0)).unwrap();
    let suppressed = make_guest("400", "db");
    let other = make_guest("401", "web");

    evaluator
        .suppress_alert(
            "cpu_high",
            GuestFilter {
                endpoint_id: None,
                node: None,
                vmid: Some("400".into()),
            },
            3_600_000,
            "maintenance",
        )
        .unwrap();

    evaluator.check_metrics(
        &[suppressed.clone(), other.clone()],
        &[
            make_metrics(&suppressed, 0.95),
            make_metrics(&other, 0.95),
        ],
    );
    let alerts = evaluator.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].guest.vmid, "401");
}

// ---- escalation ----

#[test]
fn escalation_promotes_stale_unacknowledged_alerts() {
    let mut evaluator = empty_evaluator();
    let mut rule = cpu_rule("cpu_high", 85.0, 0);
    rule.escalation_ms = 10;
    evaluator.add_rule(rule).unwrap();
    let mut rx = evaluator.subscribe();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.95)]);

    let escalated = evaluator.escalate_due(Utc::now() + Duration::milliseconds(50));
    assert_eq!(escalated, 1);
    assert!(evaluator.active_alerts()[0].escalated);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::AlertEscalated { .. })));

    // Already-escalated alerts are not promoted again
    assert_eq!(evaluator.escalate_due(Utc::now() + Duration::hours(1)), 0);
}

#[test]
fn acknowledged_alerts_never_escalate() {
    let mut evaluator = empty_evaluator();
    let mut rule = cpu_rule("cpu_high", 85.0, 0);
    rule.escalation_ms = 10;
    evaluator.add_rule(rule).unwrap();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.95)]);
    let alert_id = evaluator.active_alerts()[0].id.clone();
    evaluator
        .acknowledge_alert(&alert_id, "operator", None)
        .unwrap();

    assert_eq!(evaluator.escalate_due(Utc::now() + Duration::hours(1)), 0);
}

// ---- rule reload ----

fn rule_file_with(rule: AlertRule) -> HashMap<String, AlertRule> {
    HashMap::from([(rule.id.clone(), rule)])
}

#[test]
fn reload_surfaces_rules_added_out_of_band() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    store.write(files::ALERT_RULES, "{}").unwrap();
    let mut evaluator = AlertEvaluator::new(store.clone()).unwrap();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.95)]);
    assert!(evaluator.active_alerts().is_empty());

    // External edit to the rule file, past the evaluator's back
    let doc = rule_file_with(cpu_rule("cpu_high", 85.0, 600_000));
    save_document(store.as_ref(), files::ALERT_RULES, &doc).unwrap();

    // Reload replays the last snapshot and bypasses the duration gate
    evaluator.reload_rules();
    let alerts = evaluator.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].state, AlertState::Active);
}

#[tokio::test]
async fn rule_watcher_reloads_when_the_file_changes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()).unwrap());
    store.write(files::ALERT_RULES, "{}").unwrap();

    let guest = make_guest("100", "web");
    let evaluator = {
        let mut evaluator = AlertEvaluator::new(store.clone()).unwrap();
        evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.95)]);
        Arc::new(Mutex::new(evaluator))
    };

    let _handle = RuleWatchScheduler::new(
        evaluator.clone(),
        store.path(files::ALERT_RULES),
        StdDuration::from_millis(20),
    )
    .spawn();

    // Ensure the mtime actually differs even on coarse-grained filesystems.
    tokio::time::sleep(StdDuration::from_millis(1100)).await;
    let doc = rule_file_with(cpu_rule("cpu_high", 85.0, 600_000));
    save_document(store.as_ref(), files::ALERT_RULES, &doc).unwrap();

    let mut surfaced = false;
    for _ in 0..100 {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        if evaluator.lock().unwrap().active_alerts().len() == 1 {
            surfaced = true;
            break;
        }
    }
    assert!(surfaced, "reloaded rule should surface an active alert");
}

// ---- cleanup ----

#[derive(Default)]
struct RecordingNotifier {
    pruned: Mutex<Vec<HashSet<String>>>,
}

impl Notifier for RecordingNotifier {
    fn dispatch(&self, _alert: Alert, _urgent: bool) {}

    fn prune(&self, live: &HashSet<String>) {
        self.pruned.lock().unwrap().push(live.clone());
    }
}

#[test]
fn cleanup_prunes_notification_records_for_dropped_alerts() {
    let mut evaluator = empty_evaluator();
    let notifier = Arc::new(RecordingNotifier::default());
    evaluator.set_notifier(notifier.clone());

    let mut rule = cpu_rule("cpu_high", 85.0, 0);
    rule.auto_resolve = false;
    evaluator.add_rule(rule).unwrap();

    let guest = make_guest("100", "web");
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.95)]);
    let alert_id = evaluator.active_alerts()[0].id.clone();
    evaluator.check_metrics(&[guest.clone()], &[make_metrics(&guest, 0.50)]);
    assert_eq!(evaluator.active_alerts()[0].state, AlertState::Resolved);

    // Within retention the lingering alert keeps its delivery record
    evaluator.cleanup(Utc::now());
    let last = notifier.pruned.lock().unwrap().last().cloned().unwrap();
    assert!(last.contains(&alert_id));

    // Past retention the alert is dropped and its record pruned with it
    evaluator.cleanup(Utc::now() + Duration::hours(25));
    assert!(evaluator.active_alerts().is_empty());
    let last = notifier.pruned.lock().unwrap().last().cloned().unwrap();
    assert!(last.is_empty());
}

// ---- metrics history ----

#[test]
fn derives_rates_from_cumulative_counters() {
    // 100 bytes at t0, 1100 bytes at t0+10s -> 100 bytes/s
    assert_eq!(derive_rate(Some(100), Some(1100), 10.0), Some(100.0));
}

#[test]
fn counter_reset_yields_no_rate_never_negative() {
    assert_eq!(derive_rate(Some(1100), Some(100), 10.0), None);
    assert_eq!(derive_rate(None, Some(100), 10.0), None);
    assert_eq!(derive_rate(Some(100), Some(200), 0.0), None);
}

#[test]
fn history_caps_points_and_prunes_by_retention() {
    let mut history = MetricsHistory::new(5, 60);
    let guest = make_guest("100", "web");
    for i in 0..10 {
        let mut m = make_metrics(&guest, 0.5);
        m.timestamp = Utc::now() + Duration::seconds(i);
        history.add_metric_data(&guest.guest_id(), &m);
    }
    assert_eq!(history.points(&guest.guest_id()).unwrap().len(), 5);

    // Prune everything past retention; the emptied guest disappears
    history.cleanup(Utc::now() + Duration::seconds(600));
    assert_eq!(history.guest_count(), 0);
}

#[test]
fn chart_projection_resolves_percentages_against_capacity() {
    let mut history = MetricsHistory::new(10, 3600);
    let guest = make_guest("100", "web");
    let mut m = make_metrics(&guest, 0.5);
    m.mem = Some(2 * GIB);
    m.disk = Some(8 * GIB);
    history.add_metric_data(&guest.guest_id(), &m);

    let charts = history.all_guest_chart_data(&[guest.clone()]);
    let chart = charts.get(&guest.guest_id()).unwrap();
    assert_eq!(chart.cpu[0].value, 50.0);
    assert_eq!(chart.memory[0].value, 50.0);
    assert_eq!(chart.disk[0].value, 25.0);
}

// ---- anomaly detector ----

#[test]
fn anomaly_detector_skips_near_idle_guests() {
    let detector = NetworkAnomalyDetector::default();
    let guest = make_guest("100", "web");
    assert!(detector
        .evaluate(&guest, Some(1000.0), Some(2000.0))
        .is_none());
}

#[test]
fn anomaly_detector_flags_excessive_volume() {
    let detector = NetworkAnomalyDetector::default();
    let guest = make_guest("100", "web");
    let rate = 120.0 * 1024.0 * 1024.0;
    let anomaly = detector.evaluate(&guest, Some(rate), Some(rate)).unwrap();
    assert!(matches!(anomaly.reason, AnomalyReason::Volume { .. }));
}

#[test]
fn anomaly_detector_raises_threshold_for_backup_guests() {
    let detector = NetworkAnomalyDetector::default();
    let backup = make_guest("100", "nightly-backup");
    let rate = 120.0 * 1024.0 * 1024.0;
    // Same traffic that flags a generic guest passes for a backup guest
    assert!(detector.evaluate(&backup, Some(rate), Some(rate)).is_none());
}

#[test]
fn anomaly_detector_flags_loud_asymmetry() {
    let detector = NetworkAnomalyDetector::default();
    let guest = make_guest("100", "web");
    let outbound = 60.0 * 1024.0 * 1024.0;
    let inbound = outbound / 100.0;
    let anomaly = detector.evaluate(&guest, Some(inbound), Some(outbound)).unwrap();
    assert!(matches!(anomaly.reason, AnomalyReason::Asymmetry { .. }));
}

// ---- conditions ----

#[test]
fn status_conditions_compare_text() {
    let stopped = MetricValue::Text("stopped".into());
    let expected = MetricValue::Text("stopped".into());
    assert!(Condition::Equals.check(&stopped, &expected));
    assert!(!Condition::NotEquals.check(&stopped, &expected));
    assert!(Condition::Contains.check(
        &MetricValue::Text("running (qemu)".into()),
        &MetricValue::Text("running".into())
    ));
}

#[test]
fn generic_anomaly_condition_never_matches() {
    assert!(!Condition::Anomaly.check(
        &MetricValue::Number(1000.0),
        &MetricValue::Number(0.0)
    ));
}

#[test]
fn non_finite_values_fail_closed() {
    let nan = MetricValue::Number(f64::NAN);
    let threshold = MetricValue::Number(50.0);
    assert!(!Condition::GreaterThan.check(&nan, &threshold));
    assert!(!Condition::Equals.check(&nan, &threshold));
}
