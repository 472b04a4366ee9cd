use chrono::{DateTime, Utc};

use crate::adapters::{IngestOutcome, NormalizedTelemetryEvent};
use crate::cache::Caches;
use crate::config::RuleDefaults;
use crate::db::{ConfigDb, TelemetryStore};
use crate::error::{AppError, AppResult};
use crate::models::telemetry::{RawValue, Reading, TelemetryRow};
use crate::notify::NotifyDispatcher;

/// Per-device `(tenant_id, protocol)` binding used to resolve tenant
/// context from a bare device id. Cached with a long TTL and
/// invalidated on device deletion.
async fn resolve_tenant(db: &ConfigDb, caches: &Caches, device_id: &str) -> AppResult<Option<(String, String)>> {
    if let Some(cached) = caches.device_bindings.get(device_id).await {
        return Ok(Some((*cached).clone()));
    }
    let Some(device) = db.get_device_any_tenant(device_id)? else {
        return Ok(None);
    };
    let binding = (device.tenant_id.clone(), device.protocol.clone());
    caches
        .device_bindings
        .insert(device_id.to_string(), std::sync::Arc::new(binding.clone()))
        .await;
    Ok(Some(binding))
}

/// Resolves tenant, checks quota, writes telemetry, and refreshes device
/// status: resolve, validate, quota, write, touch device, publish.
/// Returns the readings actually admitted (quota rejection drops the whole
/// batch rather than partially admitting it, keeping per-call accounting
/// simple to reason about).
///
/// A `tenant_hint` on the event (CoAP payloads may carry `tenant_id`
/// explicitly) is trusted only to pick the tenant when no device binding is
/// on record yet; once a device is bound, its recorded tenant always wins.
pub async fn ingest(
    db: &ConfigDb,
    store: &TelemetryStore,
    caches: &Caches,
    notifier: &NotifyDispatcher,
    defaults: &RuleDefaults,
    mut event: NormalizedTelemetryEvent,
    now: DateTime<Utc>,
) -> AppResult<Vec<Reading>> {
    let ack = event.ack.take();
    let result = ingest_inner(db, store, caches, notifier, defaults, &event, now).await;
    if let Some(ack) = ack {
        let outcome = match &result {
            Ok(_) => IngestOutcome::Admitted,
            Err(AppError::NotFound | AppError::TenantContextRequired) => IngestOutcome::UnknownTenant,
            Err(AppError::QuotaExceeded(_)) => IngestOutcome::QuotaExceeded,
            Err(_) => IngestOutcome::Failed,
        };
        let _ = ack.send(outcome);
    }
    result
}

async fn ingest_inner(
    db: &ConfigDb,
    store: &TelemetryStore,
    caches: &Caches,
    notifier: &NotifyDispatcher,
    defaults: &RuleDefaults,
    event: &NormalizedTelemetryEvent,
    now: DateTime<Utc>,
) -> AppResult<Vec<Reading>> {
    let tenant_id = match resolve_tenant(db, caches, &event.device_id).await? {
        Some((tenant_id, _)) => tenant_id,
        // Unknown device with an explicit tenant: auto-provision it under
        // that tenant, subject to the device cap.
        None => {
            let hint = event
                .tenant_hint
                .clone()
                .ok_or_else(AppError::not_found_or_forbidden)?;
            auto_provision_device(db, caches, &hint, event, now).await?
        }
    };

    let tenant = db.get_tenant(&tenant_id)?.ok_or_else(AppError::not_found_or_forbidden)?;
    let day = now.format("%Y-%m-%d").to_string();
    let admitted = db.try_consume_telemetry_quota(&tenant_id, &day, event.readings.len() as i64, tenant.max_telemetry_points_per_day)?;
    if !admitted {
        return Err(AppError::QuotaExceeded(format!("tenant {tenant_id} exceeded its daily telemetry quota")));
    }

    let rows: Vec<TelemetryRow> = event
        .readings
        .iter()
        .map(|r| TelemetryRow {
            tenant_id: tenant_id.clone(),
            device_id: event.device_id.clone(),
            key: r.key.clone(),
            value_numeric: r.value_numeric,
            value_string: r.value_string.clone(),
            unit: r.unit.clone().unwrap_or_default(),
            timestamp: event.timestamp,
            ingestion_timestamp: now,
            data_quality: r.quality.unwrap_or(1.0),
            anomaly: false,
            source_protocol: event.protocol.to_string(),
        })
        .collect();
    store.insert_batch(&rows).await?;
    db.touch_device_status(&tenant_id, &event.device_id, "active", &now.to_rfc3339())?;

    trigger_reactive_rules(db, store, caches, notifier, defaults, &tenant_id, event, now).await;

    Ok(event.readings.clone())
}

async fn auto_provision_device(
    db: &ConfigDb,
    caches: &Caches,
    tenant_id: &str,
    event: &NormalizedTelemetryEvent,
    now: DateTime<Utc>,
) -> AppResult<String> {
    let tenant = db.get_tenant(tenant_id)?.ok_or_else(AppError::not_found_or_forbidden)?;
    let device = crate::models::device::Device {
        id: event.device_id.clone(),
        tenant_id: tenant_id.to_string(),
        name: event.device_id.clone(),
        device_type: "auto-provisioned".to_string(),
        protocol: event.protocol.to_string(),
        status: "active".to_string(),
        metadata: "{}".to_string(),
        last_seen_at: None,
        created_at: now.to_rfc3339(),
    };
    match db.create_device_checked(&device, tenant.max_devices)? {
        Ok(()) => {
            tracing::info!("auto-provisioned device {} for tenant {tenant_id}", device.id);
            caches
                .device_bindings
                .insert(
                    device.id.clone(),
                    std::sync::Arc::new((tenant_id.to_string(), device.protocol.clone())),
                )
                .await;
            Ok(tenant_id.to_string())
        }
        Err("quota") => Err(AppError::QuotaExceeded(format!(
            "tenant {tenant_id} is at its device cap"
        ))),
        Err(_) => Err(AppError::Internal("unexpected auto-provision failure".into())),
    }
}

/// Evaluates every numeric reading against the tenant's compiled rules
/// immediately, on top of the periodic
/// sweep in `rules::engine`, so a threshold breach doesn't wait for the next
/// tick. A rule-evaluation failure here is logged, never propagated; the
/// telemetry write it rides on has already succeeded.
async fn trigger_reactive_rules(
    db: &ConfigDb,
    store: &TelemetryStore,
    caches: &Caches,
    notifier: &NotifyDispatcher,
    defaults: &RuleDefaults,
    tenant_id: &str,
    event: &NormalizedTelemetryEvent,
    now: DateTime<Utc>,
) {
    let rules = match crate::rules::cache::rules_for_tenant(db, caches, tenant_id).await {
        Ok(rules) => rules,
        Err(e) => {
            tracing::warn!("reactive rule lookup failed for tenant {tenant_id}: {e}");
            return;
        }
    };
    for reading in &event.readings {
        let Some(value) = reading.value_numeric else {
            // A string reading can never satisfy a numeric condition; track
            // the mismatch against every rule watching this key.
            for rule in rules.iter() {
                if rule.scope.includes(&event.device_id) && rule.condition.keys().contains(&reading.key.as_str()) {
                    let count = caches.note_malformed_data(&rule.id);
                    tracing::warn!(
                        "rule {}: non-numeric reading for key {} on device {} ({count} so far)",
                        rule.id,
                        reading.key,
                        event.device_id
                    );
                }
            }
            continue;
        };
        for rule in rules.iter() {
            if !rule.condition.keys().contains(&reading.key.as_str()) {
                continue;
            }
            // Coalesce repeat triggers for the same (rule, device, key)
            // within a short window; the periodic sweep covers the rest.
            let coalesce_key = format!("{}|{}|{}", rule.id, event.device_id, reading.key);
            if caches.reactive_seen.contains_key(&coalesce_key) {
                continue;
            }
            caches.reactive_seen.insert(coalesce_key, ()).await;

            let reactive = Some((event.device_id.as_str(), reading.key.as_str(), value));
            if let Err(e) = crate::rules::engine::evaluate_rule(db, store, notifier, defaults, rule, reactive, now).await {
                tracing::warn!("reactive eval of rule {} failed: {e}", rule.id);
            }
        }
    }
}

pub fn reading_from_raw(key: &str, raw: &crate::models::telemetry::RawReading) -> Reading {
    match &raw.value {
        RawValue::Number(n) => Reading {
            key: key.to_string(),
            value_numeric: Some(*n),
            value_string: None,
            unit: raw.unit.clone(),
            quality: raw.quality,
        },
        RawValue::Text(s) => Reading {
            key: key.to_string(),
            value_numeric: None,
            value_string: Some(s.clone()),
            unit: raw.unit.clone(),
            quality: raw.quality,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::Device;
    use crate::models::tenant::Tenant;

    fn setup() -> (ConfigDb, Caches) {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&Tenant {
            id: "t1".into(),
            slug: "acme".into(),
            name: "Acme".into(),
            tier: "free".into(),
            max_devices: None,
            max_users: None,
            max_telemetry_points_per_day: Some(10),
            max_retention_days: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
        db.create_device(&Device {
            id: "d1".into(),
            tenant_id: "t1".into(),
            name: "P1".into(),
            device_type: "sensor".into(),
            protocol: "mqtt".into(),
            status: "active".into(),
            metadata: "{}".into(),
            last_seen_at: None,
            created_at: String::new(),
        })
        .unwrap();
        (db, Caches::new(600, 3600, 500))
    }

    #[tokio::test]
    async fn unknown_device_rejected() {
        let (db, caches) = setup();
        let resolved = resolve_tenant(&db, &caches, "ghost").await.unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn tenant_hint_auto_provisions_device() {
        let (db, caches) = setup();
        let event = NormalizedTelemetryEvent {
            device_id: "d-new".into(),
            protocol: "coap",
            readings: vec![],
            timestamp: chrono::Utc::now(),
            tenant_hint: Some("t1".into()),
            ack: None,
        };
        let tenant_id = auto_provision_device(&db, &caches, "t1", &event, chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(tenant_id, "t1");
        let device = db.get_device("t1", "d-new").unwrap().unwrap();
        assert_eq!(device.protocol, "coap");
        assert_eq!(device.device_type, "auto-provisioned");
    }

    #[tokio::test]
    async fn device_binding_caches() {
        let (db, caches) = setup();
        let first = resolve_tenant(&db, &caches, "d1").await.unwrap().unwrap();
        assert_eq!(first.0, "t1");
        let second = resolve_tenant(&db, &caches, "d1").await.unwrap().unwrap();
        assert_eq!(second, first);
    }
}
