use std::sync::Arc;
use std::time::Duration;

use crate::db::{ConfigDb, TelemetryStore};

const SWEEP_INTERVAL_SECS: u64 = 6 * 3600;

/// Spawn the per-tenant retention sweeper as a background task
/// (fire-and-forget). Tenants without a `max_retention_days` cap keep
/// telemetry indefinitely and are skipped.
pub fn spawn(config_db: Arc<ConfigDb>, store: Arc<TelemetryStore>) {
    tokio::spawn(async move {
        // Wait 60s on startup to let tables settle
        tokio::time::sleep(Duration::from_secs(60)).await;
        tracing::info!("retention sweeper started (interval={SWEEP_INTERVAL_SECS}s)");
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(e) = sweep(&config_db, &store).await {
                tracing::error!("retention sweep failed: {e}");
            }
        }
    });
}

async fn sweep(db: &ConfigDb, store: &TelemetryStore) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    for tenant in db.list_tenants()? {
        let Some(days) = tenant.max_retention_days else { continue };
        let cutoff = now - chrono::Duration::days(days);
        if let Err(e) = store.delete_older_than(&tenant.id, cutoff).await {
            tracing::warn!("retention delete for tenant {} failed: {e}", tenant.id);
        }
    }
    Ok(())
}
