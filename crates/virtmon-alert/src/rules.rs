use crate::{EngineError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use virtmon_common::types::{AlertRule, Condition, MetricValue, RuleKind, RulePatch};
use virtmon_storage::{files, load_document, save_document, DurableStore};

/// Default rule template seeded on first run, with thresholds taken from
/// legacy environment variables when present.
struct RuleTemplate {
    id: &'static str,
    name: &'static str,
    metric: &'static str,
    env_var: &'static str,
    default_threshold: f64,
    duration_ms: i64,
}

const DEFAULT_RULES: &[RuleTemplate] = &[
    RuleTemplate {
        id: "cpu_high",
        name: "CPU usage high",
        metric: "cpu",
        env_var: "VIRTMON_CPU_THRESHOLD",
        default_threshold: 85.0,
        duration_ms: 5 * 60 * 1000,
    },
    RuleTemplate {
        id: "memory_high",
        name: "Memory usage high",
        metric: "memory",
        env_var: "VIRTMON_MEMORY_THRESHOLD",
        default_threshold: 85.0,
        duration_ms: 5 * 60 * 1000,
    },
    RuleTemplate {
        id: "disk_high",
        name: "Disk usage high",
        metric: "disk",
        env_var: "VIRTMON_DISK_THRESHOLD",
        default_threshold: 90.0,
        duration_ms: 10 * 60 * 1000,
    },
];

/// CRUD and persistence for alert rule definitions.
///
/// Rules are held in memory and rewritten to `alert-rules.json` in full on
/// every mutation. Event emission and alert cascade cleanup are handled by
/// the evaluator wrapping this store.
pub struct RuleStore {
    store: Arc<dyn DurableStore>,
    rules: HashMap<String, AlertRule>,
}

impl RuleStore {
    /// Load rules from the store, seeding the default templates when no
    /// rule file exists yet.
    pub fn load_or_seed(store: Arc<dyn DurableStore>) -> Result<Self> {
        let loaded: Option<HashMap<String, AlertRule>> =
            load_document(store.as_ref(), files::ALERT_RULES)?;

        let rules = match loaded {
            Some(rules) => rules,
            None => {
                let seeded = seed_default_rules();
                tracing::info!(count = seeded.len(), "No rule file found, seeding defaults");
                let store_ref = store.as_ref();
                if let Err(e) = save_document(store_ref, files::ALERT_RULES, &seeded) {
                    tracing::error!(error = %e, "Failed to persist seeded rules");
                }
                seeded
            }
        };

        Ok(Self { store, rules })
    }

    pub fn get(&self, id: &str) -> Option<&AlertRule> {
        self.rules.get(id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn add_rule(&mut self, rule: AlertRule) -> Result<()> {
        validate_rule(&rule)?;
        if self.rules.contains_key(&rule.id) {
            return Err(EngineError::InvalidRule(format!(
                "rule '{}' already exists",
                rule.id
            )));
        }
        self.rules.insert(rule.id.clone(), rule);
        self.persist();
        Ok(())
    }

    pub fn update_rule(&mut self, id: &str, patch: RulePatch) -> Result<AlertRule> {
        let existing = self
            .rules
            .get(id)
            .ok_or_else(|| EngineError::UnknownRule(id.to_string()))?;

        let mut updated = existing.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(description) = patch.description {
            updated.description = description;
        }
        if let Some(group) = patch.group {
            updated.group = group;
        }
        if let Some(tags) = patch.tags {
            updated.tags = tags;
        }
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(kind) = patch.kind {
            updated.kind = kind;
        }
        if let Some(escalation_ms) = patch.escalation_ms {
            updated.escalation_ms = escalation_ms;
        }
        if let Some(auto_resolve) = patch.auto_resolve {
            updated.auto_resolve = auto_resolve;
        }
        if let Some(suppression_ms) = patch.suppression_ms {
            updated.suppression_ms = suppression_ms;
        }
        if let Some(send_email) = patch.send_email {
            updated.send_email = send_email;
        }
        if let Some(send_webhook) = patch.send_webhook {
            updated.send_webhook = send_webhook;
        }

        validate_rule(&updated)?;
        self.rules.insert(id.to_string(), updated.clone());
        self.persist();
        Ok(updated)
    }

    pub fn remove_rule(&mut self, id: &str) -> Result<AlertRule> {
        let removed = self
            .rules
            .remove(id)
            .ok_or_else(|| EngineError::UnknownRule(id.to_string()))?;
        self.persist();
        Ok(removed)
    }

    /// Re-read the rule file, replacing the in-memory set. Used by the
    /// file-watch reload path; a missing or unreadable file keeps the
    /// current set.
    pub fn reload(&mut self) -> Result<bool> {
        match load_document::<HashMap<String, AlertRule>>(self.store.as_ref(), files::ALERT_RULES)?
        {
            Some(rules) => {
                self.rules = rules;
                tracing::info!(count = self.rules.len(), "Rule file reloaded");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&self) {
        if let Err(e) = save_document(self.store.as_ref(), files::ALERT_RULES, &self.rules) {
            tracing::error!(error = %e, "Failed to persist rules; memory remains authoritative");
        }
    }
}

fn seed_default_rules() -> HashMap<String, AlertRule> {
    DEFAULT_RULES
        .iter()
        .map(|t| {
            let threshold = std::env::var(t.env_var)
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(t.default_threshold);
            let rule = AlertRule {
                id: t.id.to_string(),
                name: t.name.to_string(),
                description: String::new(),
                group: "defaults".to_string(),
                tags: Vec::new(),
                enabled: true,
                kind: RuleKind::SingleMetric {
                    metric: t.metric.to_string(),
                    condition: Condition::GreaterThanOrEqual,
                    threshold: MetricValue::Number(threshold),
                    duration_ms: t.duration_ms,
                },
                escalation_ms: 15 * 60 * 1000,
                auto_resolve: true,
                suppression_ms: 0,
                send_email: true,
                send_webhook: false,
            };
            (rule.id.clone(), rule)
        })
        .collect()
}

/// Synchronous validation; malformed rules are rejected, never absorbed.
pub fn validate_rule(rule: &AlertRule) -> Result<()> {
    if rule.id.trim().is_empty() {
        return Err(EngineError::InvalidRule("rule id must not be empty".into()));
    }
    if rule.name.trim().is_empty() {
        return Err(EngineError::InvalidRule(format!(
            "rule '{}' has an empty name",
            rule.id
        )));
    }
    if rule.escalation_ms < 0 || rule.suppression_ms < 0 {
        return Err(EngineError::InvalidRule(format!(
            "rule '{}' has a negative escalation or suppression time",
            rule.id
        )));
    }

    match &rule.kind {
        RuleKind::SingleMetric {
            metric,
            threshold,
            duration_ms,
            ..
        } => {
            if metric.trim().is_empty() {
                return Err(EngineError::InvalidRule(format!(
                    "rule '{}' has an empty metric",
                    rule.id
                )));
            }
            if *duration_ms < 0 {
                return Err(EngineError::InvalidRule(format!(
                    "rule '{}' has a negative duration",
                    rule.id
                )));
            }
            if let MetricValue::Number(n) = threshold {
                if !n.is_finite() {
                    return Err(EngineError::InvalidRule(format!(
                        "rule '{}' has a non-finite threshold",
                        rule.id
                    )));
                }
            }
        }
        RuleKind::CompoundThreshold { thresholds } => {
            if thresholds.is_empty() {
                return Err(EngineError::InvalidRule(format!(
                    "compound rule '{}' has no thresholds",
                    rule.id
                )));
            }
            for t in thresholds {
                if t.metric.trim().is_empty() {
                    return Err(EngineError::InvalidRule(format!(
                        "compound rule '{}' has an entry with an empty metric",
                        rule.id
                    )));
                }
                if !t.threshold.is_finite() {
                    return Err(EngineError::InvalidRule(format!(
                        "compound rule '{}' has a non-finite threshold for '{}'",
                        rule.id, t.metric
                    )));
                }
            }
        }
    }
    Ok(())
}
