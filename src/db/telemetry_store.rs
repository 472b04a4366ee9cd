use std::time::Duration;

use chrono::{DateTime, Utc};
use clickhouse::Client;

use crate::error::{AppError, AppResult};
use crate::models::telemetry::{Aggregate, TelemetryRow};

/// Time-series telemetry store backed by ClickHouse. Network
/// calls get a small bounded retry since this store sits across the network,
/// unlike the local `ConfigDb`.
#[derive(Clone)]
pub struct TelemetryStore {
    client: Client,
}

const RETRY_DELAYS_MS: &[u64] = &[100, 400, 1600];

#[derive(clickhouse::Row, serde::Deserialize)]
struct ScalarRow {
    value: Option<f64>,
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct KeyRow {
    key: String,
}

impl TelemetryStore {
    pub fn connect(url: &str, database: &str, user: &str, password: &str) -> Self {
        let client = Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(user)
            .with_password(password);
        Self { client }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, clickhouse::error::Error>>,
    {
        let mut last_err = None;
        for delay in RETRY_DELAYS_MS.iter().chain(std::iter::once(&0)) {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = Some(e);
                    if *delay > 0 {
                        tokio::time::sleep(Duration::from_millis(*delay)).await;
                    }
                }
            }
        }
        Err(AppError::StorageUnavailable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Batch insert; idempotent at the storage layer via `ReplacingMergeTree`
    /// keyed on `(tenant_id, device_id, key, timestamp)` with
    /// `ingestion_timestamp` as the version column, so re-delivery of the
    /// same reading from an at-least-once adapter collapses on the
    /// next background merge rather than double-counting.
    pub async fn insert_batch(&self, rows: &[TelemetryRow]) -> AppResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_retry(|| async {
            let mut inserter = self.client.insert("telemetry_points")?;
            for row in rows {
                inserter.write(row).await?;
            }
            inserter.end().await
        })
        .await
    }

    /// Ordered oldest-first so consumers can stream a window incrementally.
    pub async fn fetch_range(
        &self,
        tenant_id: &str,
        device_id: &str,
        key: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<TelemetryRow>> {
        let mut sql = String::from(
            "SELECT tenant_id, device_id, key, value_numeric, value_string, unit, timestamp,
             ingestion_timestamp, data_quality, anomaly, source_protocol
             FROM telemetry_points
             WHERE tenant_id = ? AND device_id = ? AND timestamp >= ? AND timestamp <= ?",
        );
        if key.is_some() {
            sql.push_str(" AND key = ?");
        }
        sql.push_str(" ORDER BY timestamp ASC LIMIT ?");

        self.with_retry(|| async {
            let mut q = self
                .client
                .query(&sql)
                .bind(tenant_id)
                .bind(device_id)
                .bind(from)
                .bind(to);
            if let Some(k) = key {
                q = q.bind(k);
            }
            q.bind(limit as u64).fetch_all::<TelemetryRow>().await
        })
        .await
    }

    /// Evaluates a `Statistical` condition's aggregate over a trailing
    /// window. Returns `None` when there is no data in range,
    /// which the rule engine treats as "condition not met" rather than erroring.
    pub async fn aggregate_over_window(
        &self,
        tenant_id: &str,
        device_id: &str,
        key: &str,
        aggregate: Aggregate,
        window_seconds: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Option<f64>> {
        let from = now - chrono::Duration::seconds(window_seconds);
        let sql = format!(
            "SELECT toNullable(toFloat64({}(value_numeric))) AS value FROM telemetry_points
             WHERE tenant_id = ? AND device_id = ? AND key = ? AND timestamp >= ? AND timestamp <= ?
               AND value_numeric IS NOT NULL",
            aggregate.sql_fn()
        );
        let result: Vec<ScalarRow> = self
            .with_retry(|| async {
                self.client
                    .query(&sql)
                    .bind(tenant_id)
                    .bind(device_id)
                    .bind(key)
                    .bind(from)
                    .bind(now)
                    .fetch_all::<ScalarRow>()
                    .await
            })
            .await?;
        Ok(result.into_iter().next().and_then(|r| r.value))
    }

    /// Last reading for `key` on `device_id`, used by `Comparison` and
    /// reactive `Threshold` evaluation against the just-ingested point.
    pub async fn latest_value(&self, tenant_id: &str, device_id: &str, key: &str) -> AppResult<Option<f64>> {
        let sql = "SELECT value_numeric AS value FROM telemetry_points
                   WHERE tenant_id = ? AND device_id = ? AND key = ? AND value_numeric IS NOT NULL
                   ORDER BY timestamp DESC LIMIT 1";
        let result: Vec<ScalarRow> = self
            .with_retry(|| async {
                self.client
                    .query(sql)
                    .bind(tenant_id)
                    .bind(device_id)
                    .bind(key)
                    .fetch_all::<ScalarRow>()
                    .await
            })
            .await?;
        Ok(result.into_iter().next().and_then(|r| r.value))
    }

    /// Distinct reading keys ever seen for a device, used by the OPC UA
    /// adapter to know which `Telemetry` variables to keep in sync without
    /// hardcoding a key list per device type.
    pub async fn distinct_keys(&self, tenant_id: &str, device_id: &str) -> AppResult<Vec<String>> {
        let sql = "SELECT DISTINCT key FROM telemetry_points WHERE tenant_id = ? AND device_id = ?";
        let rows: Vec<KeyRow> = self
            .with_retry(|| async {
                self.client
                    .query(sql)
                    .bind(tenant_id)
                    .bind(device_id)
                    .fetch_all::<KeyRow>()
                    .await
            })
            .await?;
        Ok(rows.into_iter().map(|r| r.key).collect())
    }

    pub async fn count_today(&self, tenant_id: &str, day: &str) -> AppResult<u64> {
        let sql = "SELECT count() AS count FROM telemetry_points WHERE tenant_id = ? AND toDate(timestamp) = ?";
        let result: Vec<CountRow> = self
            .with_retry(|| async { self.client.query(sql).bind(tenant_id).bind(day).fetch_all::<CountRow>().await })
            .await?;
        Ok(result.into_iter().next().map(|r| r.count).unwrap_or(0))
    }

    /// Per-tenant retention enforcement, run
    /// periodically by a background task with each tenant's configured
    /// `max_retention_days`, falling back to the platform default.
    pub async fn delete_older_than(&self, tenant_id: &str, cutoff: DateTime<Utc>) -> AppResult<()> {
        let sql = "ALTER TABLE telemetry_points DELETE WHERE tenant_id = ? AND timestamp < ?";
        self.with_retry(|| async { self.client.query(sql).bind(tenant_id).bind(cutoff).execute().await })
            .await
    }
}
