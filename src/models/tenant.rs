use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Startup,
    Professional,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Startup => "startup",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "startup" => Some(Tier::Startup),
            "professional" => Some(Tier::Professional),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

/// Resource caps; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub max_devices: Option<i64>,
    pub max_users: Option<i64>,
    pub max_telemetry_points_per_day: Option<i64>,
    pub max_retention_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub tier: String,
    pub max_devices: Option<i64>,
    pub max_users: Option<i64>,
    pub max_telemetry_points_per_day: Option<i64>,
    pub max_retention_days: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Tenant {
    pub fn caps(&self) -> ResourceCaps {
        ResourceCaps {
            max_devices: self.max_devices,
            max_users: self.max_users,
            max_telemetry_points_per_day: self.max_telemetry_points_per_day,
            max_retention_days: self.max_retention_days,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub slug: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default)]
    pub max_devices: Option<i64>,
    #[serde(default)]
    pub max_users: Option<i64>,
    #[serde(default)]
    pub max_telemetry_points_per_day: Option<i64>,
    #[serde(default)]
    pub max_retention_days: Option<i64>,
}

fn default_tier() -> String {
    "free".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub tier: Option<String>,
    pub max_devices: Option<i64>,
    pub max_users: Option<i64>,
    pub max_telemetry_points_per_day: Option<i64>,
    pub max_retention_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TenantStats {
    pub device_count: i64,
    pub user_count: i64,
    pub telemetry_points_today: u64,
    pub telemetry_points_per_sec: f64,
    pub open_alert_count: i64,
}

#[derive(Debug, Serialize)]
pub struct TenantQuotas {
    pub devices_used: i64,
    pub devices_cap: Option<i64>,
    pub users_used: i64,
    pub users_cap: Option<i64>,
    pub telemetry_points_today: i64,
    pub telemetry_points_cap: Option<i64>,
}
