use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_escalation_ms() -> i64 {
    // 15 minutes
    15 * 60 * 1000
}

/// Immutable snapshot of a monitored guest (VM or container).
///
/// The engine never holds a live reference into the discovery layer: every
/// alert embeds its own copy of the guest as seen at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    pub endpoint_id: String,
    pub node: String,
    pub vmid: String,
    pub name: String,
    /// Guest flavor, e.g. `"qemu"` or `"lxc"`.
    pub kind: String,
    pub status: String,
    /// Configured memory capacity in bytes.
    pub maxmem: u64,
    /// Configured disk capacity in bytes.
    pub maxdisk: u64,
}

impl Guest {
    /// Stable identifier used to key metrics history and chart series.
    pub fn guest_id(&self) -> String {
        format!("{}:{}:{}", self.endpoint_id, self.node, self.vmid)
    }
}

/// One metrics snapshot for one guest, as delivered by the external poller.
///
/// `diskread`/`diskwrite`/`netin`/`netout` are cumulative byte counters;
/// rates are derived by the engine, never by the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestMetrics {
    pub endpoint_id: String,
    pub node: String,
    pub vmid: String,
    pub timestamp: DateTime<Utc>,
    /// CPU load. Pollers disagree on units: values <= 1.0 are fractions,
    /// values > 1.0 are already percentages.
    pub cpu: Option<f64>,
    /// Memory used in bytes.
    pub mem: Option<u64>,
    /// Disk used in bytes.
    pub disk: Option<u64>,
    pub diskread: Option<u64>,
    pub diskwrite: Option<u64>,
    pub netin: Option<u64>,
    pub netout: Option<u64>,
    pub status: Option<String>,
}

impl GuestMetrics {
    pub fn guest_id(&self) -> String {
        format!("{}:{}:{}", self.endpoint_id, self.node, self.vmid)
    }
}

/// Comparison operator applied between an extracted metric value and a
/// threshold.
///
/// `Anomaly` exists so persisted rules naming it still parse, but the generic
/// dispatcher never matches on it; network anomaly detection runs through a
/// dedicated detector keyed on the `network_combined` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GreaterThan,
    LessThan,
    Equals,
    NotEquals,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    Anomaly,
}

impl std::str::FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greater_than" | "gt" => Ok(Self::GreaterThan),
            "less_than" | "lt" => Ok(Self::LessThan),
            "equals" | "eq" => Ok(Self::Equals),
            "not_equals" | "ne" => Ok(Self::NotEquals),
            "greater_than_or_equal" | "gte" => Ok(Self::GreaterThanOrEqual),
            "less_than_or_equal" | "lte" => Ok(Self::LessThanOrEqual),
            "contains" => Ok(Self::Contains),
            "anomaly" => Ok(Self::Anomaly),
            _ => Err(format!("unknown condition: {s}")),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThanOrEqual => "greater_than_or_equal",
            Self::LessThanOrEqual => "less_than_or_equal",
            Self::Contains => "contains",
            Self::Anomaly => "anomaly",
        };
        write!(f, "{s}")
    }
}

impl Condition {
    /// Apply the operator. Missing or non-finite values never satisfy a
    /// condition (fail closed).
    pub fn check(&self, value: &MetricValue, threshold: &MetricValue) -> bool {
        match self {
            Self::GreaterThan => Self::numeric(value, threshold, |v, t| v > t),
            Self::LessThan => Self::numeric(value, threshold, |v, t| v < t),
            Self::GreaterThanOrEqual => Self::numeric(value, threshold, |v, t| v >= t),
            Self::LessThanOrEqual => Self::numeric(value, threshold, |v, t| v <= t),
            Self::Equals => match (value, threshold) {
                (MetricValue::Number(v), MetricValue::Number(t)) => {
                    v.is_finite() && (v - t).abs() < f64::EPSILON
                }
                (MetricValue::Text(v), MetricValue::Text(t)) => v.eq_ignore_ascii_case(t),
                _ => false,
            },
            Self::NotEquals => match (value, threshold) {
                (MetricValue::Number(v), MetricValue::Number(t)) => {
                    v.is_finite() && (v - t).abs() >= f64::EPSILON
                }
                (MetricValue::Text(v), MetricValue::Text(t)) => !v.eq_ignore_ascii_case(t),
                _ => false,
            },
            Self::Contains => match (value, threshold) {
                (MetricValue::Text(v), MetricValue::Text(t)) => {
                    v.to_lowercase().contains(&t.to_lowercase())
                }
                _ => false,
            },
            // Never reachable as a generic condition; anomaly detection runs
            // through its own detector.
            Self::Anomaly => false,
        }
    }

    fn numeric(value: &MetricValue, threshold: &MetricValue, op: fn(f64, f64) -> bool) -> bool {
        match (value, threshold) {
            (MetricValue::Number(v), MetricValue::Number(t))
                if v.is_finite() && t.is_finite() =>
            {
                op(*v, *t)
            }
            _ => false,
        }
    }
}

/// A metric value or threshold: numeric for utilisation metrics, textual for
/// status comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n:.2}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for MetricValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// One metric/condition/threshold tuple inside a compound rule. Compound
/// thresholds are numeric only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub metric: String,
    pub condition: Condition,
    pub threshold: f64,
}

/// The two rule shapes, modelled as an explicit sum type so dispatch is an
/// exhaustive match rather than field sniffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    SingleMetric {
        metric: String,
        condition: Condition,
        threshold: MetricValue,
        /// How long the condition must hold before the alert fires, in ms.
        #[serde(default)]
        duration_ms: i64,
    },
    /// All entries must hold simultaneously (logical AND).
    CompoundThreshold { thresholds: Vec<MetricThreshold> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Age after which an unacknowledged active alert escalates, in ms.
    #[serde(default = "default_escalation_ms")]
    pub escalation_ms: i64,
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
    /// Suppression window applied to the guest after auto-resolve, in ms.
    #[serde(default)]
    pub suppression_ms: i64,
    #[serde(default = "default_true")]
    pub send_email: bool,
    #[serde(default)]
    pub send_webhook: bool,
}

impl AlertRule {
    /// Duration gate for the pending state. Compound rules fire immediately.
    pub fn duration_ms(&self) -> i64 {
        match &self.kind {
            RuleKind::SingleMetric { duration_ms, .. } => *duration_ms,
            RuleKind::CompoundThreshold { .. } => 0,
        }
    }
}

/// Partial update for an existing rule. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub group: Option<String>,
    pub tags: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub kind: Option<RuleKind>,
    pub escalation_ms: Option<i64>,
    pub auto_resolve: Option<bool>,
    pub suppression_ms: Option<i64>,
    pub send_email: Option<bool>,
    pub send_webhook: Option<bool>,
}

/// Alert lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Pending,
    Active,
    Resolved,
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Identity of an alert: at most one alert exists per key at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub rule_id: String,
    pub endpoint_id: String,
    pub node: String,
    pub vmid: String,
}

impl AlertKey {
    pub fn new(rule_id: &str, guest: &Guest) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            endpoint_id: guest.endpoint_id.clone(),
            node: guest.node.clone(),
            vmid: guest.vmid.clone(),
        }
    }
}

impl std::fmt::Display for AlertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.rule_id, self.endpoint_id, self.node, self.vmid
        )
    }
}

/// Acknowledgement record attached to an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRecord {
    pub user: String,
    #[serde(default)]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Generated once, stable for the alert's lifetime.
    pub id: String,
    /// Rule snapshot taken at creation time.
    pub rule: AlertRule,
    /// Guest snapshot taken at creation time.
    pub guest: Guest,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub current_value: MetricValue,
    pub effective_threshold: MetricValue,
    pub state: AlertState,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub ack: Option<AckRecord>,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey::new(&self.rule.id, &self.guest)
    }
}

/// Glob patterns selecting guests for a suppression. Absent fields match
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestFilter {
    pub endpoint_id: Option<String>,
    pub node: Option<String>,
    pub vmid: Option<String>,
}

impl GuestFilter {
    pub fn matches(&self, guest: &Guest) -> bool {
        let field = |pattern: &Option<String>, value: &str| match pattern {
            Some(p) => glob_match::glob_match(p, value),
            None => true,
        };
        field(&self.endpoint_id, &guest.endpoint_id)
            && field(&self.node, &guest.node)
            && field(&self.vmid, &guest.vmid)
    }
}

impl std::fmt::Display for GuestFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.endpoint_id.as_deref().unwrap_or("*"),
            self.node.as_deref().unwrap_or("*"),
            self.vmid.as_deref().unwrap_or("*")
        )
    }
}

/// A temporary silence for one rule against matching guests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suppression {
    pub rule_id: String,
    pub guest_filter: GuestFilter,
    pub reason: String,
    pub suppressed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Suppression {
    pub fn key(&self) -> String {
        format!("{}|{}", self.rule_id, self.guest_filter)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A warning/critical pair for one metric of a custom threshold config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub warning: f64,
    pub critical: f64,
}

/// Per-guest threshold overrides.
///
/// Keyed by `(endpoint_id, vmid)` only: the node is intentionally excluded
/// so a live migration does not orphan the override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomThresholdConfig {
    pub endpoint_id: String,
    pub vmid: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cpu: Option<ThresholdBand>,
    #[serde(default)]
    pub memory: Option<ThresholdBand>,
    #[serde(default)]
    pub disk: Option<ThresholdBand>,
}

impl CustomThresholdConfig {
    pub fn key(&self) -> String {
        format!("{}:{}", self.endpoint_id, self.vmid)
    }

    pub fn band(&self, metric: &str) -> Option<&ThresholdBand> {
        match metric {
            "cpu" => self.cpu.as_ref(),
            "memory" => self.memory.as_ref(),
            "disk" => self.disk.as_ref(),
            _ => None,
        }
    }
}

/// The closed set of events the engine emits towards the API/UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    Alert { alert: Alert },
    AlertAcknowledged { alert: Alert },
    AlertResolved { alert: Alert },
    AlertEscalated { alert: Alert },
    RuleAdded { rule: AlertRule },
    RuleUpdated { rule: AlertRule },
    RuleRemoved { rule_id: String },
    Notification { alert_id: String, channel: String },
    NotificationError {
        alert_id: String,
        channel: String,
        error: String,
    },
}
