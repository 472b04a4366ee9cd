use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ComparisonOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            ComparisonOp::Gt => lhs > rhs,
            ComparisonOp::Lt => lhs < rhs,
            ComparisonOp::Gte => lhs >= rhs,
            ComparisonOp::Lte => lhs <= rhs,
            ComparisonOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
            ComparisonOp::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Avg,
    Min,
    Max,
    Stddev,
    Count,
}

/// The condition DSL as a sum type over the four rule shapes. Stored as
/// JSON in the control-plane store; this is the in-memory compiled form
/// the rule cache holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum Condition {
    Threshold {
        key: String,
        operator: ComparisonOp,
        value: f64,
    },
    Comparison {
        key_a: String,
        operator: ComparisonOp,
        key_b: String,
    },
    Statistical {
        key: String,
        aggregate: AggregateKind,
        window_seconds: i64,
        operator: ComparisonOp,
        value: f64,
    },
    TimeWindow {
        schedule_cron_expr: String,
        inner_condition: Box<Condition>,
    },
}

impl Condition {
    /// Telemetry keys this condition reads. The reactive path only
    /// evaluates rules whose keys include the just-ingested reading's key.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Condition::Threshold { key, .. } => vec![key.as_str()],
            Condition::Comparison { key_a, key_b, .. } => vec![key_a.as_str(), key_b.as_str()],
            Condition::Statistical { key, .. } => vec![key.as_str()],
            Condition::TimeWindow { inner_condition, .. } => inner_condition.keys(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }

    /// TTA/TTR targets in minutes (table).
    pub fn sla_targets(&self) -> (i64, i64) {
        match self {
            Severity::Critical => (5, 30),
            Severity::High => (15, 120),
            Severity::Medium => (60, 480),
            Severity::Low => (240, 1440),
            Severity::Info => (1440, 10080),
        }
    }

    /// Rule priority maps onto severity; higher priority = more severe.
    pub fn from_priority(priority: i64) -> Self {
        match priority {
            p if p >= 40 => Severity::Critical,
            p if p >= 30 => Severity::High,
            p if p >= 20 => Severity::Medium,
            p if p >= 10 => Severity::Low,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationAction {
    Email { to: String },
    Sms { to: String },
    Webhook { name: String, url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope_type", rename_all = "snake_case")]
pub enum RuleScope {
    Device { device_id: String },
    DeviceSet { device_ids: Vec<String> },
    Tenant,
}

impl RuleScope {
    pub fn includes(&self, device_id: &str) -> bool {
        match self {
            RuleScope::Device { device_id: d } => d == device_id,
            RuleScope::DeviceSet { device_ids } => device_ids.iter().any(|d| d == device_id),
            RuleScope::Tenant => true,
        }
    }
}

/// Compiled rule spec held by the rule cache; decoded once from the row's
/// JSON columns.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub condition: Condition,
    pub actions: Vec<NotificationAction>,
    pub priority: i64,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub eval_interval_secs: i64,
    pub scope: RuleScope,
}

/// Row as stored in the control-plane database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub condition_spec: String,
    pub action_spec: String,
    pub priority: i64,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub eval_interval_secs: i64,
    pub scope_spec: String,
    pub last_evaluated_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub condition: serde_json::Value,
    #[serde(default)]
    pub action: Vec<NotificationAction>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cooldown")]
    pub cooldown: i64,
    #[serde(default = "default_eval_interval")]
    pub eval_interval: i64,
    pub scope: serde_json::Value,
}

fn default_priority() -> i64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_cooldown() -> i64 {
    300
}
fn default_eval_interval() -> i64 {
    30
}

pub type UpdateRuleRequest = CreateRuleRequest;
