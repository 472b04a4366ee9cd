use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};

/// One normalized `(device_id, key, value, timestamp)` reading as it lands
/// in the time-series store. Exactly one of
/// `value_numeric` / `value_string` is populated.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct TelemetryRow {
    pub tenant_id: String,
    pub device_id: String,
    pub key: String,
    pub value_numeric: Option<f64>,
    pub value_string: Option<String>,
    pub unit: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub ingestion_timestamp: DateTime<Utc>,
    pub data_quality: f64,
    pub anomaly: bool,
    pub source_protocol: String,
}

#[derive(Debug, Clone)]
pub struct Reading {
    pub key: String,
    pub value_numeric: Option<f64>,
    pub value_string: Option<String>,
    pub unit: Option<String>,
    pub quality: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub enum Aggregate {
    Avg,
    Min,
    Max,
    Count,
    Stddev,
}

impl Aggregate {
    pub fn sql_fn(&self) -> &'static str {
        match self {
            Aggregate::Avg => "avg",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::Count => "count",
            Aggregate::Stddev => "stddevPop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReading {
    pub value: RawValue,
    pub unit: Option<String>,
    pub quality: Option<f64>,
}
