use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Coap,
    Amqp,
    Opcua,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Coap => "coap",
            Protocol::Amqp => "amqp",
            Protocol::Opcua => "opcua",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mqtt" => Some(Protocol::Mqtt),
            "coap" => Some(Protocol::Coap),
            "amqp" => Some(Protocol::Amqp),
            "opcua" => Some(Protocol::Opcua),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Offline,
    Error,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DeviceStatus::Active),
            "offline" => Some(DeviceStatus::Offline),
            "error" => Some(DeviceStatus::Error),
            "maintenance" => Some(DeviceStatus::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub device_type: String,
    pub protocol: String,
    pub status: String,
    /// Stored as a JSON object string; serialized as a real object on the wire.
    pub metadata: String,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceResponse {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub device_type: String,
    pub protocol: String,
    pub status: String,
    pub metadata: serde_json::Value,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

impl From<Device> for DeviceResponse {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            tenant_id: d.tenant_id,
            name: d.name,
            device_type: d.device_type,
            protocol: d.protocol,
            status: d.status,
            metadata: serde_json::from_str(&d.metadata).unwrap_or(serde_json::json!({})),
            last_seen_at: d.last_seen_at,
            created_at: d.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub device_type: String,
    pub protocol: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeviceRequest {
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub status: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
