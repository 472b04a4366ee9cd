use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    New,
    Acknowledged,
    Investigating,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::New => "new",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Investigating => "investigating",
            AlertState::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(AlertState::New),
            "acknowledged" => Some(AlertState::Acknowledged),
            "investigating" => Some(AlertState::Investigating),
            "resolved" => Some(AlertState::Resolved),
            _ => None,
        }
    }

    /// Allowed transitions for the alert lifecycle. The `resolved -> new`
    /// edge is allowed here but gated by an extra system-admin check at
    /// the call site (see `is_reopen`).
    pub fn can_transition_to(&self, next: AlertState) -> bool {
        use AlertState::*;
        matches!(
            (self, next),
            (New, Acknowledged)
                | (New, Investigating)
                | (New, Resolved)
                | (Acknowledged, Investigating)
                | (Acknowledged, Resolved)
                | (Investigating, Resolved)
                | (Resolved, New)
        )
    }

    pub fn is_reopen(&self, next: AlertState) -> bool {
        *self == AlertState::Resolved && next == AlertState::New
    }

    /// Anything not resolved. Open alerts hold the rule cooldown; resolved
    /// ones release it immediately.
    pub fn is_open(&self) -> bool {
        *self != AlertState::Resolved
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub tenant_id: String,
    pub device_id: String,
    pub rule_id: Option<String>,
    pub severity: String,
    pub message: String,
    pub created_at: String,
    pub metadata: String,
    pub escalation_policy_id: Option<String>,
    pub current_escalation_tier: i64,
    pub last_escalation_at: Option<String>,
    pub grouped_alert_id: Option<String>,
    pub duplicate_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStateRow {
    pub id: String,
    pub alert_id: String,
    pub state: String,
    pub changed_by: String,
    pub changed_at: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertGroup {
    pub id: String,
    pub tenant_id: String,
    pub device_id: String,
    pub rule_id: Option<String>,
    pub severity: String,
    pub first_occurrence_at: String,
    pub last_occurrence_at: String,
    pub occurrence_count: i64,
    pub status: String,
    pub representative_alert_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSla {
    pub alert_id: String,
    pub severity: String,
    pub tta_target_minutes: i64,
    pub ttr_target_minutes: i64,
    pub tta_actual: Option<f64>,
    pub ttr_actual: Option<f64>,
    pub tta_breached: bool,
    pub ttr_breached: bool,
    pub tta_breach_notified: bool,
    pub ttr_breach_notified: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertHistoryResponse {
    pub alert: Alert,
    pub states: Vec<AlertStateRow>,
    pub sla: Option<AlertSla>,
}

/// Candidate produced by the rule engine or an external source, not yet
/// grouped/persisted.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub tenant_id: String,
    pub device_id: String,
    pub rule_id: Option<String>,
    pub external_source_key: Option<String>,
    pub severity: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub actions: Vec<crate::models::rule::NotificationAction>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    pub device_id: String,
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub escalation_policy_id: Option<String>,
    #[serde(default)]
    pub external_source_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddNoteRequest {
    pub note: String,
}
