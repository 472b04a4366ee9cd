use clickhouse::Client;

/// Ordered list of DDL statements for the telemetry time-series schema.
/// Every statement is idempotent (`IF NOT EXISTS`) so it is safe to run on
/// every startup.
const MIGRATIONS: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS insa_iiot",
    r"CREATE TABLE IF NOT EXISTS insa_iiot.telemetry_points
(
    tenant_id           LowCardinality(String) CODEC(ZSTD(1)),
    device_id           String CODEC(ZSTD(1)),
    key                 LowCardinality(String) CODEC(ZSTD(1)),
    value_numeric       Nullable(Float64) CODEC(Gorilla, ZSTD(1)),
    value_string        Nullable(String) CODEC(ZSTD(1)),
    unit                LowCardinality(String) CODEC(ZSTD(1)),
    timestamp           DateTime64(3, 'UTC') CODEC(Delta, ZSTD(1)),
    ingestion_timestamp DateTime64(3, 'UTC') CODEC(Delta, ZSTD(1)),
    data_quality        Float64 CODEC(ZSTD(1)),
    anomaly             Bool CODEC(ZSTD(1)),
    source_protocol     LowCardinality(String) CODEC(ZSTD(1)),
    INDEX idx_device device_id TYPE bloom_filter(0.001) GRANULARITY 1
)
ENGINE = ReplacingMergeTree(ingestion_timestamp)
PARTITION BY (tenant_id, toDate(timestamp))
ORDER BY (tenant_id, device_id, key, timestamp)
SETTINGS index_granularity = 8192",

    // Materialized rollup feeding statistical-condition evaluation without
    // rescanning raw points for every statistical rule check.
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS insa_iiot.telemetry_minutely
ENGINE = AggregatingMergeTree()
PARTITION BY (tenant_id, toDate(minute))
ORDER BY (tenant_id, device_id, key, minute)
AS SELECT
    tenant_id,
    device_id,
    key,
    toStartOfMinute(timestamp) AS minute,
    avgState(value_numeric) AS avg_state,
    minState(value_numeric) AS min_state,
    maxState(value_numeric) AS max_state,
    countState() AS count_state,
    stddevPopState(value_numeric) AS stddev_state
FROM insa_iiot.telemetry_points
WHERE value_numeric IS NOT NULL
GROUP BY tenant_id, device_id, key, minute",
];

/// Runs every migration in order against ClickHouse. Connects without a
/// default database first so `CREATE DATABASE` succeeds on a fresh instance.
pub async fn run(url: &str, user: &str, password: &str) -> anyhow::Result<()> {
    let client = Client::default()
        .with_url(url)
        .with_user(user)
        .with_password(password);

    tracing::info!("running clickhouse migrations ({} statements)", MIGRATIONS.len());
    for (i, sql) in MIGRATIONS.iter().enumerate() {
        client.query(sql).execute().await.map_err(|e| {
            tracing::error!("migration {}/{} failed: {e}", i + 1, MIGRATIONS.len());
            e
        })?;
    }
    tracing::info!("clickhouse migrations complete");
    Ok(())
}
