use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTarget(pub String);

impl EscalationTarget {
    /// `user:<id>` or `oncall:<schedule_id>`.
    pub fn parse(&self) -> Option<TargetRef> {
        if let Some(id) = self.0.strip_prefix("user:") {
            Some(TargetRef::User(id.to_string()))
        } else if let Some(id) = self.0.strip_prefix("oncall:") {
            Some(TargetRef::OnCall(id.to_string()))
        } else {
            None
        }
    }
}

pub enum TargetRef {
    User(String),
    OnCall(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTier {
    pub delay_minutes: i64,
    pub targets: Vec<EscalationTarget>,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub tiers: Vec<EscalationTier>,
    pub severity_filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicyRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub tiers_spec: String,
    pub severity_filter: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateEscalationPolicyRequest {
    pub name: String,
    pub tiers: Vec<EscalationTier>,
    pub severity_filter: Vec<String>,
}
