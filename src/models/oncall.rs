use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RotationSpec {
    Weekly { users: Vec<String> },
    Daily { users: Vec<String> },
    Custom { ranges: Vec<CustomRange> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRange {
    pub start_date: String,
    pub end_date: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnCallScheduleRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub rotation_spec: String,
    pub overrides_spec: String,
    pub timezone: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOnCallScheduleRequest {
    pub name: String,
    pub rotation: RotationSpec,
    #[serde(default)]
    pub overrides: HashMap<String, String>,
    pub timezone: String,
}
