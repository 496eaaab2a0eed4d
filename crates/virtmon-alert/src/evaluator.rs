use crate::anomaly::{AnomalyReason, NetworkAnomalyDetector};
use crate::history::{normalize_cpu, MetricsHistory};
use crate::rules::RuleStore;
use crate::thresholds::ThresholdResolver;
use crate::{EngineError, Notifier, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use virtmon_common::id;
use virtmon_common::types::{
    AckRecord, Alert, AlertKey, AlertRule, AlertState, EngineEvent, Guest, GuestFilter,
    GuestMetrics, MetricValue, RuleKind, RulePatch, Suppression,
};
use virtmon_storage::{files, load_document, save_document, DurableStore};

/// Default bound on stored points per guest.
const HISTORY_MAX_POINTS: usize = 360;
/// Default history retention window in seconds.
const HISTORY_RETENTION_SECS: i64 = 3600;
/// Alerts resolved longer ago than this are dropped by the cleanup sweep.
const RESOLVED_RETENTION_HOURS: i64 = 24;

/// A satisfied rule condition: the value that triggered and the threshold it
/// was compared against.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub value: MetricValue,
    pub threshold: MetricValue,
}

/// The alert state machine.
///
/// All mutation funnels through `&mut self`; callers share the evaluator
/// behind `Arc<Mutex<_>>` so the evaluation tick and the escalation tick
/// observe single-writer discipline. Overlapping evaluation or reload
/// invocations are skipped via a compare-and-swap guard, never queued.
pub struct AlertEvaluator {
    store: Arc<dyn DurableStore>,
    rules: RuleStore,
    thresholds: ThresholdResolver,
    history: MetricsHistory,
    anomaly: NetworkAnomalyDetector,
    active: HashMap<AlertKey, Alert>,
    /// Last seen guest/metrics snapshot, replayed by rule reloads.
    last_guests: Vec<Guest>,
    last_metrics: Vec<GuestMetrics>,
    acks: HashMap<String, AckRecord>,
    suppressions: HashMap<String, Suppression>,
    events: broadcast::Sender<EngineEvent>,
    notifier: Option<Arc<dyn Notifier>>,
    alerts_enabled: bool,
    busy: Arc<AtomicBool>,
}

impl AlertEvaluator {
    /// Build an evaluator over the given store, restoring rules, custom
    /// thresholds, active alerts and acknowledgements from disk.
    pub fn new(store: Arc<dyn DurableStore>) -> Result<Self> {
        let rules = RuleStore::load_or_seed(store.clone())?;
        let thresholds = ThresholdResolver::load(store.clone())?;

        let active: HashMap<AlertKey, Alert> =
            load_document::<HashMap<String, Alert>>(store.as_ref(), files::ACTIVE_ALERTS)?
                .map(|alerts| alerts.into_values().map(|a| (a.key(), a)).collect())
                .unwrap_or_default();
        let acks: HashMap<String, AckRecord> =
            load_document(store.as_ref(), files::ACKNOWLEDGEMENTS)?.unwrap_or_default();

        if !active.is_empty() {
            tracing::info!(count = active.len(), "Restored active alerts");
        }

        let (events, _) = broadcast::channel(256);

        Ok(Self {
            store,
            rules,
            thresholds,
            history: MetricsHistory::new(HISTORY_MAX_POINTS, HISTORY_RETENTION_SECS),
            anomaly: NetworkAnomalyDetector::default(),
            active,
            last_guests: Vec::new(),
            last_metrics: Vec::new(),
            acks,
            suppressions: HashMap::new(),
            events,
            notifier: None,
            alerts_enabled: true,
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The shared event sender, so the notification dispatcher can report
    /// delivery outcomes on the same stream.
    pub fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.events.clone()
    }

    pub fn set_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    /// Global kill switch: disables all evaluation.
    pub fn set_alerts_enabled(&mut self, enabled: bool) {
        self.alerts_enabled = enabled;
    }

    pub fn thresholds(&self) -> &ThresholdResolver {
        &self.thresholds
    }

    pub fn thresholds_mut(&mut self) -> &mut ThresholdResolver {
        &mut self.thresholds
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    pub fn rule(&self, id: &str) -> Option<&AlertRule> {
        self.rules.get(id)
    }

    pub fn rule_list(&self) -> Vec<AlertRule> {
        self.rules.rules().cloned().collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.values().cloned().collect()
    }

    pub fn alert_by_id(&self, alert_id: &str) -> Option<&Alert> {
        self.active.values().find(|a| a.id == alert_id)
    }

    // ---- evaluation ----

    /// Evaluate one metrics snapshot against every enabled, non-suppressed
    /// rule. Skipped (with a log line) when a check or rule reload is
    /// already in flight.
    pub fn check_metrics(&mut self, guests: &[Guest], metrics: &[GuestMetrics]) {
        if !self.alerts_enabled {
            tracing::debug!("Alert evaluation globally disabled, skipping check");
            return;
        }
        let Some(_guard) = self.try_begin("check_metrics") else {
            return;
        };
        self.run_evaluation(guests, metrics, false);
    }

    /// Evaluate without the pending/duration gate: conditions that already
    /// hold surface as Active immediately. Used when rules are freshly
    /// (re)enabled.
    pub fn evaluate_current_state(&mut self, guests: &[Guest], metrics: &[GuestMetrics]) {
        if !self.alerts_enabled {
            return;
        }
        let Some(_guard) = self.try_begin("evaluate_current_state") else {
            return;
        };
        self.run_evaluation(guests, metrics, true);
    }

    /// Guarded reload of the rule file followed by an immediate
    /// current-state pass over the last seen snapshot, so newly enabled
    /// rules surface without waiting for the next scrape.
    pub fn reload_rules(&mut self) {
        let Some(_guard) = self.try_begin("rule reload") else {
            return;
        };
        match self.rules.reload() {
            Ok(true) => {
                let guests = self.last_guests.clone();
                let metrics = self.last_metrics.clone();
                self.run_evaluation(&guests, &metrics, true);
            }
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Rule reload failed, keeping current rule set"),
        }
    }

    fn try_begin(&self, operation: &str) -> Option<BusyGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(BusyGuard(self.busy.clone()))
        } else {
            tracing::warn!(operation, "Previous check still in flight, skipping");
            None
        }
    }

    fn run_evaluation(&mut self, guests: &[Guest], metrics: &[GuestMetrics], immediate: bool) {
        self.last_guests = guests.to_vec();
        self.last_metrics = metrics.to_vec();

        let now = Utc::now();
        let by_guest: HashMap<String, &GuestMetrics> =
            metrics.iter().map(|m| (m.guest_id(), m)).collect();

        let rule_ids: Vec<String> = self
            .rules
            .rules()
            .filter(|r| r.enabled)
            .map(|r| r.id.clone())
            .collect();

        let mut changed = false;
        for guest in guests {
            let snapshot = by_guest.get(&guest.guest_id()).copied();
            if let (Some(m), false) = (snapshot, immediate) {
                self.history.add_metric_data(&guest.guest_id(), m);
            }

            for rule_id in &rule_ids {
                let Some(rule) = self.rules.get(rule_id).cloned() else {
                    continue;
                };
                if self.is_suppressed(&rule.id, guest, now) {
                    continue;
                }
                match self.evaluate_rule(&rule, guest, snapshot) {
                    Ok(outcome) => {
                        changed |= self.apply_outcome(&rule, guest, outcome, now, immediate);
                    }
                    Err(e) => {
                        // One bad rule or guest must not abort the batch.
                        tracing::error!(
                            rule_id = %rule.id,
                            guest = %guest.guest_id(),
                            error = %e,
                            "Rule evaluation failed"
                        );
                    }
                }
            }
        }

        if changed {
            self.persist_active();
        }
    }

    /// Evaluate one rule against one guest. `Ok(None)` means the condition
    /// does not hold (including missing/NaN data, which fails closed).
    pub fn evaluate_rule(
        &self,
        rule: &AlertRule,
        guest: &Guest,
        metrics: Option<&GuestMetrics>,
    ) -> Result<Option<Trigger>> {
        match &rule.kind {
            RuleKind::SingleMetric {
                metric,
                condition,
                threshold,
                ..
            } => {
                if metric == "network_combined" {
                    return Ok(self.evaluate_network_anomaly(guest));
                }

                let Some(value) = self.extract_value(metric, guest, metrics) else {
                    return Ok(None);
                };
                let effective = self.thresholds.effective_threshold(
                    metric,
                    threshold,
                    &guest.endpoint_id,
                    &guest.vmid,
                );
                if condition.check(&value, &effective) {
                    Ok(Some(Trigger {
                        value,
                        threshold: effective,
                    }))
                } else {
                    Ok(None)
                }
            }
            RuleKind::CompoundThreshold { thresholds } => {
                if thresholds.is_empty() {
                    return Err(EngineError::InvalidRule(format!(
                        "compound rule '{}' has no thresholds",
                        rule.id
                    )));
                }
                let mut representative: Option<Trigger> = None;
                for entry in thresholds {
                    let Some(value) = self.extract_value(&entry.metric, guest, metrics) else {
                        return Ok(None);
                    };
                    let effective = self.thresholds.effective_threshold(
                        &entry.metric,
                        &MetricValue::Number(entry.threshold),
                        &guest.endpoint_id,
                        &guest.vmid,
                    );
                    if !entry.condition.check(&value, &effective) {
                        return Ok(None);
                    }
                    if representative.is_none() {
                        representative = Some(Trigger {
                            value,
                            threshold: effective,
                        });
                    }
                }
                Ok(representative)
            }
        }
    }

    fn evaluate_network_anomaly(&self, guest: &Guest) -> Option<Trigger> {
        let latest = self.history.latest(&guest.guest_id())?;
        let anomaly = self
            .anomaly
            .evaluate(guest, latest.netin_rate, latest.netout_rate)?;
        let threshold = match anomaly.reason {
            AnomalyReason::Volume { threshold } => threshold,
            AnomalyReason::Asymmetry { ratio } => ratio,
        };
        tracing::warn!(
            guest = %guest.guest_id(),
            combined = anomaly.combined_rate,
            reason = ?anomaly.reason,
            "Network anomaly detected"
        );
        Some(Trigger {
            value: MetricValue::Number(anomaly.combined_rate),
            threshold: MetricValue::Number(threshold),
        })
    }

    /// Extract a single metric value for a guest. `None` when the metric is
    /// absent, not finite, or unknown.
    fn extract_value(
        &self,
        metric: &str,
        guest: &Guest,
        metrics: Option<&GuestMetrics>,
    ) -> Option<MetricValue> {
        let finite = |v: f64| if v.is_finite() { Some(v) } else { None };
        match metric {
            "status" => {
                let status = metrics
                    .and_then(|m| m.status.clone())
                    .unwrap_or_else(|| guest.status.clone());
                Some(MetricValue::Text(status))
            }
            "cpu" => metrics?
                .cpu
                .map(normalize_cpu)
                .and_then(finite)
                .map(MetricValue::Number),
            "memory" => {
                let used = metrics?.mem?;
                if guest.maxmem == 0 {
                    return None;
                }
                finite(used as f64 / guest.maxmem as f64 * 100.0).map(MetricValue::Number)
            }
            "disk" => {
                let used = metrics?.disk?;
                if guest.maxdisk == 0 {
                    return None;
                }
                finite(used as f64 / guest.maxdisk as f64 * 100.0).map(MetricValue::Number)
            }
            "diskread" | "diskwrite" | "netin" | "netout" => {
                let latest = self.history.latest(&guest.guest_id())?;
                let rate = match metric {
                    "diskread" => latest.diskread_rate,
                    "diskwrite" => latest.diskwrite_rate,
                    "netin" => latest.netin_rate,
                    _ => latest.netout_rate,
                };
                rate.and_then(finite).map(MetricValue::Number)
            }
            _ => None,
        }
    }

    /// Drive the state machine for one (rule, guest) key. Returns whether
    /// the active set changed.
    fn apply_outcome(
        &mut self,
        rule: &AlertRule,
        guest: &Guest,
        outcome: Option<Trigger>,
        now: DateTime<Utc>,
        immediate: bool,
    ) -> bool {
        let key = AlertKey::new(&rule.id, guest);
        let existing = self.active.remove(&key);

        match (existing, outcome) {
            (None, Some(trigger)) => {
                let mut alert = Alert {
                    id: id::next_id(),
                    rule: rule.clone(),
                    guest: guest.clone(),
                    start_time: now,
                    last_update: now,
                    triggered_at: None,
                    resolved_at: None,
                    current_value: trigger.value,
                    effective_threshold: trigger.threshold,
                    state: AlertState::Pending,
                    escalated: false,
                    acknowledged: false,
                    ack: None,
                };
                if immediate || rule.duration_ms() <= 0 {
                    self.activate(&mut alert, now);
                } else {
                    tracing::debug!(
                        rule_id = %rule.id,
                        guest = %guest.guest_id(),
                        "Condition triggered, alert pending"
                    );
                }
                self.active.insert(key, alert);
                true
            }

            (Some(mut alert), Some(trigger)) => {
                if alert.acknowledged {
                    // Frozen until the acknowledgement is cleared.
                    self.active.insert(key, alert);
                    return false;
                }
                alert.current_value = trigger.value;
                alert.effective_threshold = trigger.threshold;
                alert.last_update = now;

                match alert.state {
                    AlertState::Pending => {
                        let dwell = now - alert.start_time;
                        if immediate || dwell >= Duration::milliseconds(rule.duration_ms()) {
                            self.activate(&mut alert, now);
                        }
                    }
                    AlertState::Active => {}
                    AlertState::Resolved => {
                        // A lingering resolved alert whose condition returned
                        // starts a fresh cycle under the same key.
                        alert.state = AlertState::Pending;
                        alert.start_time = now;
                        alert.resolved_at = None;
                        alert.escalated = false;
                        alert.triggered_at = None;
                        if immediate || rule.duration_ms() <= 0 {
                            self.activate(&mut alert, now);
                        }
                    }
                }
                self.active.insert(key, alert);
                true
            }

            (Some(mut alert), None) => match alert.state {
                AlertState::Pending => {
                    // Transient condition: cleared before its duration
                    // elapsed, never surfaced.
                    tracing::debug!(
                        rule_id = %rule.id,
                        guest = %guest.guest_id(),
                        "Pending condition cleared"
                    );
                    true
                }
                AlertState::Active => {
                    if alert.acknowledged {
                        self.active.insert(key, alert);
                        return false;
                    }
                    alert.state = AlertState::Resolved;
                    alert.resolved_at = Some(now);
                    alert.last_update = now;
                    tracing::info!(
                        alert_id = %alert.id,
                        rule_id = %rule.id,
                        guest = %guest.guest_id(),
                        "Alert resolved"
                    );
                    self.emit(EngineEvent::AlertResolved {
                        alert: alert.clone(),
                    });
                    if alert.rule.auto_resolve {
                        if alert.rule.suppression_ms > 0 {
                            self.suppress_after_resolve(&alert, now);
                        }
                        // Auto-resolved alerts leave the active set.
                    } else {
                        // Lingers as resolved-but-visible until cleared.
                        self.active.insert(key, alert);
                    }
                    true
                }
                AlertState::Resolved => {
                    self.active.insert(key, alert);
                    false
                }
            },

            (None, None) => false,
        }
    }

    fn activate(&mut self, alert: &mut Alert, now: DateTime<Utc>) {
        alert.state = AlertState::Active;
        alert.triggered_at = Some(now);
        alert.last_update = now;
        tracing::info!(
            alert_id = %alert.id,
            rule_id = %alert.rule.id,
            guest = %alert.guest.guest_id(),
            value = %alert.current_value,
            threshold = %alert.effective_threshold,
            "Alert active"
        );
        self.emit(EngineEvent::Alert {
            alert: alert.clone(),
        });
        if let Some(notifier) = &self.notifier {
            notifier.dispatch(alert.clone(), false);
        }
    }

    // ---- acknowledgement ----

    pub fn acknowledge_alert(
        &mut self,
        alert_id: &str,
        user: &str,
        note: Option<String>,
    ) -> Result<Alert> {
        let key = self
            .active
            .values()
            .find(|a| a.id == alert_id)
            .map(Alert::key)
            .ok_or_else(|| EngineError::UnknownAlert(alert_id.to_string()))?;

        let record = AckRecord {
            user: user.to_string(),
            note,
            at: Utc::now(),
        };
        let alert = self
            .active
            .get_mut(&key)
            .ok_or_else(|| EngineError::UnknownAlert(alert_id.to_string()))?;
        alert.acknowledged = true;
        alert.ack = Some(record.clone());

        let snapshot = alert.clone();
        self.acks.insert(key.to_string(), record);
        self.persist_acks();
        self.persist_active();
        self.emit(EngineEvent::AlertAcknowledged {
            alert: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub fn unacknowledge_alert(&mut self, alert_id: &str) -> Result<Alert> {
        let key = self
            .active
            .values()
            .find(|a| a.id == alert_id)
            .map(Alert::key)
            .ok_or_else(|| EngineError::UnknownAlert(alert_id.to_string()))?;

        let alert = self
            .active
            .get_mut(&key)
            .ok_or_else(|| EngineError::UnknownAlert(alert_id.to_string()))?;
        alert.acknowledged = false;
        alert.ack = None;
        let snapshot = alert.clone();

        self.acks.remove(&key.to_string());
        self.persist_acks();
        self.persist_active();
        Ok(snapshot)
    }

    /// Remove a lingering resolved alert (non-auto-resolve rules keep their
    /// alerts visible until explicitly cleared).
    pub fn clear_alert(&mut self, alert_id: &str) -> Result<Alert> {
        let key = self
            .active
            .values()
            .find(|a| a.id == alert_id)
            .map(Alert::key)
            .ok_or_else(|| EngineError::UnknownAlert(alert_id.to_string()))?;
        let alert = self
            .active
            .remove(&key)
            .ok_or_else(|| EngineError::UnknownAlert(alert_id.to_string()))?;
        self.acks.remove(&key.to_string());
        self.persist_acks();
        self.persist_active();
        Ok(alert)
    }

    // ---- suppression ----

    pub fn suppress_alert(
        &mut self,
        rule_id: &str,
        guest_filter: GuestFilter,
        duration_ms: i64,
        reason: &str,
    ) -> Result<()> {
        if duration_ms <= 0 {
            return Err(EngineError::InvalidRule(
                "suppression duration must be positive".into(),
            ));
        }
        let now = Utc::now();
        let suppression = Suppression {
            rule_id: rule_id.to_string(),
            guest_filter,
            reason: reason.to_string(),
            suppressed_at: now,
            expires_at: now + Duration::milliseconds(duration_ms),
        };
        tracing::info!(
            rule_id,
            filter = %suppression.guest_filter,
            expires_at = %suppression.expires_at,
            reason,
            "Suppression added"
        );
        self.suppressions.insert(suppression.key(), suppression);
        Ok(())
    }

    pub fn is_suppressed(&self, rule_id: &str, guest: &Guest, now: DateTime<Utc>) -> bool {
        self.suppressions.values().any(|s| {
            s.rule_id == rule_id && s.is_active(now) && s.guest_filter.matches(guest)
        })
    }

    fn suppress_after_resolve(&mut self, alert: &Alert, now: DateTime<Utc>) {
        let suppression = Suppression {
            rule_id: alert.rule.id.clone(),
            guest_filter: GuestFilter {
                endpoint_id: Some(alert.guest.endpoint_id.clone()),
                node: Some(alert.guest.node.clone()),
                vmid: Some(alert.guest.vmid.clone()),
            },
            reason: "post-resolve suppression window".to_string(),
            suppressed_at: now,
            expires_at: now + Duration::milliseconds(alert.rule.suppression_ms),
        };
        self.suppressions.insert(suppression.key(), suppression);
    }

    // ---- rule CRUD (cascades + events) ----

    pub fn add_rule(&mut self, rule: AlertRule) -> Result<()> {
        self.rules.add_rule(rule.clone())?;
        self.emit(EngineEvent::RuleAdded { rule });
        Ok(())
    }

    pub fn update_rule(&mut self, id: &str, patch: RulePatch) -> Result<AlertRule> {
        let updated = self.rules.update_rule(id, patch)?;
        if !updated.enabled {
            self.drop_alerts_for_rule(id);
        }
        self.emit(EngineEvent::RuleUpdated {
            rule: updated.clone(),
        });
        Ok(updated)
    }

    pub fn remove_rule(&mut self, id: &str) -> Result<AlertRule> {
        let removed = self.rules.remove_rule(id)?;
        self.drop_alerts_for_rule(id);
        self.emit(EngineEvent::RuleRemoved {
            rule_id: id.to_string(),
        });
        Ok(removed)
    }

    fn drop_alerts_for_rule(&mut self, rule_id: &str) {
        let before = self.active.len();
        self.active.retain(|key, _| key.rule_id != rule_id);
        if self.active.len() != before {
            tracing::info!(
                rule_id,
                dropped = before - self.active.len(),
                "Cascaded alert cleanup"
            );
            self.persist_active();
        }
    }

    // ---- escalation & cleanup sweeps ----

    /// Promote every active, unacknowledged, unescalated alert older than
    /// its rule's escalation time. Returns the number escalated.
    pub fn escalate_due(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<AlertKey> = self
            .active
            .values()
            .filter(|a| {
                a.state == AlertState::Active
                    && !a.acknowledged
                    && !a.escalated
                    && a.rule.escalation_ms > 0
                    && now - a.triggered_at.unwrap_or(a.start_time)
                        >= Duration::milliseconds(a.rule.escalation_ms)
            })
            .map(Alert::key)
            .collect();

        for key in &due {
            let Some(alert) = self.active.get_mut(key) else {
                continue;
            };
            alert.escalated = true;
            alert.last_update = now;
            let snapshot = alert.clone();
            tracing::warn!(
                alert_id = %snapshot.id,
                rule_id = %snapshot.rule.id,
                guest = %snapshot.guest.guest_id(),
                "Alert escalated"
            );
            self.emit(EngineEvent::AlertEscalated {
                alert: snapshot.clone(),
            });
            if let Some(notifier) = &self.notifier {
                notifier.dispatch(snapshot, true);
            }
        }

        if !due.is_empty() {
            self.persist_active();
        }
        due.len()
    }

    /// Drop alerts resolved beyond the retention window, expire
    /// suppressions, and prune metrics history.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(RESOLVED_RETENTION_HOURS);
        let before = self.active.len();
        self.active.retain(|_, a| {
            !(a.state == AlertState::Resolved
                && a.resolved_at.map(|t| t < cutoff).unwrap_or(false))
        });
        if self.active.len() != before {
            self.persist_active();
        }

        self.suppressions.retain(|_, s| s.is_active(now));
        self.history.cleanup(now);

        // Delivery bookkeeping for alerts no longer tracked is dead weight.
        if let Some(notifier) = &self.notifier {
            let live: HashSet<String> = self.active.values().map(|a| a.id.clone()).collect();
            notifier.prune(&live);
        }
    }

    // ---- persistence ----

    /// Full-file rewrite of the active alert set. An alert that cannot be
    /// serialized is stored in a minimal-but-valid form and purged from the
    /// active set so it cannot fail repeatedly.
    fn persist_active(&mut self) {
        let mut doc = serde_json::Map::new();
        let mut malformed = Vec::new();
        for (key, alert) in &self.active {
            match serde_json::to_value(alert) {
                Ok(value) => {
                    doc.insert(key.to_string(), value);
                }
                Err(e) => {
                    tracing::error!(
                        alert_id = %alert.id,
                        error = %e,
                        "Alert not serializable; storing minimal form and purging"
                    );
                    doc.insert(key.to_string(), minimal_alert_value(alert));
                    malformed.push(key.clone());
                }
            }
        }
        for key in malformed {
            self.active.remove(&key);
        }

        let raw = serde_json::Value::Object(doc).to_string();
        if let Err(e) = self.store.write(files::ACTIVE_ALERTS, &raw) {
            tracing::error!(error = %e, "Failed to persist active alerts; memory remains authoritative");
        }
    }

    fn persist_acks(&self) {
        if let Err(e) = save_document(self.store.as_ref(), files::ACKNOWLEDGEMENTS, &self.acks) {
            tracing::error!(error = %e, "Failed to persist acknowledgements");
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; the engine does not depend on listeners.
        let _ = self.events.send(event);
    }
}

/// Minimal fallback representation for an alert whose full form cannot be
/// serialized.
fn minimal_alert_value(alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "id": alert.id,
        "rule_id": alert.rule.id,
        "endpoint_id": alert.guest.endpoint_id,
        "node": alert.guest.node,
        "vmid": alert.guest.vmid,
        "state": alert.state.to_string(),
        "start_time": alert.start_time.to_rfc3339(),
    })
}

/// Clears the re-entrancy flag when the guarded operation ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
