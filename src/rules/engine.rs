use std::sync::Arc;

use chrono::Utc;

use crate::alerts;
use crate::cache::Caches;
use crate::clock::Clock;
use crate::config::RuleDefaults;
use crate::db::{ConfigDb, TelemetryStore};
use crate::models::alert::{AlertCandidate, AlertState};
use crate::models::rule::CompiledRule;
use crate::notify::NotifyDispatcher;

/// Periodic rule evaluation loop: a single `tokio::spawn` task ticking on
/// an interval, pulling due work from the control-plane store, and logging
/// rather than dying on a per-rule error
/// so one bad rule never stalls the whole tenant's evaluation pass.
pub fn spawn(
    config_db: Arc<ConfigDb>,
    store: Arc<TelemetryStore>,
    caches: Arc<Caches>,
    notifier: Arc<NotifyDispatcher>,
    clock: Arc<dyn Clock>,
    defaults: RuleDefaults,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(defaults.evaluation_interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = evaluate_all(&config_db, &store, &caches, &notifier, clock.as_ref(), &defaults).await {
                tracing::error!("rule engine tick failed: {e}");
            }
        }
    });
}

async fn evaluate_all(
    db: &ConfigDb,
    store: &TelemetryStore,
    caches: &Caches,
    notifier: &NotifyDispatcher,
    clock: &dyn Clock,
    defaults: &RuleDefaults,
) -> anyhow::Result<()> {
    let now = clock.now();
    for tenant in db.list_tenants()? {
        let rules = crate::rules::cache::rules_for_tenant(db, caches, &tenant.id).await?;
        for rule in rules.iter() {
            if !rule_is_due(db, &rule.id, rule.eval_interval_secs, now)? {
                continue;
            }
            if let Err(e) = evaluate_rule(db, store, notifier, defaults, rule, None, now).await {
                tracing::warn!("rule {} eval failed: {e}", rule.id);
            }
            db.touch_rule_last_evaluated(&rule.id, &now.to_rfc3339())?;
        }
    }
    Ok(())
}

/// A rule is due when its previous evaluation is older than its own
/// interval. The compiled rule carries the interval but not the
/// last-evaluated stamp (the cache would go stale), so that is read fresh.
fn rule_is_due(db: &ConfigDb, rule_id: &str, interval_secs: i64, now: chrono::DateTime<Utc>) -> anyhow::Result<bool> {
    let Some(last) = db.get_rule_last_evaluated(rule_id)? else {
        return Ok(true);
    };
    let Ok(last) = last.parse::<chrono::DateTime<Utc>>() else {
        return Ok(true);
    };
    Ok((now - last).num_seconds() >= interval_secs)
}

/// Evaluates one compiled rule across every device in its scope. When
/// `reactive_value` is set, the caller is the ingestion hot path reacting to
/// a single device's freshly-ingested reading rather than the periodic
/// sweep, so only that device is checked.
pub async fn evaluate_rule(
    db: &ConfigDb,
    store: &TelemetryStore,
    notifier: &NotifyDispatcher,
    defaults: &RuleDefaults,
    rule: &CompiledRule,
    reactive: Option<(&str, &str, f64)>,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    let device_ids: Vec<String> = if let Some((device_id, _, _)) = reactive {
        if rule.scope.includes(device_id) {
            vec![device_id.to_string()]
        } else {
            vec![]
        }
    } else {
        db.list_devices(&rule.tenant_id)?
            .into_iter()
            .filter(|d| rule.scope.includes(&d.id))
            .map(|d| d.id)
            .collect()
    };

    for device_id in device_ids {
        let reactive_value = reactive.and_then(|(d, key, v)| if d == device_id { Some((key, v)) } else { None });
        let matched = crate::rules::evaluate_condition(store, &rule.tenant_id, &device_id, &rule.condition, reactive_value, now).await?;
        if !matched {
            continue;
        }

        let last_fired = db
            .latest_alert_for_rule_device(&rule.tenant_id, &rule.id, &device_id)?
            .and_then(|(alert, state)| {
                let still_open = AlertState::parse(&state).map(|s| s.is_open()).unwrap_or(false);
                if still_open { alert.created_at.parse().ok() } else { None }
            });
        if !crate::rules::cooldown_elapsed(last_fired, rule.cooldown_seconds, now) {
            continue;
        }

        let severity = crate::models::rule::Severity::from_priority(rule.priority);
        let candidate = AlertCandidate {
            tenant_id: rule.tenant_id.clone(),
            device_id: device_id.clone(),
            rule_id: Some(rule.id.clone()),
            external_source_key: None,
            severity: severity.as_str().to_string(),
            message: format!("rule '{}' triggered on device {}", rule.name, device_id),
            metadata: serde_json::json!({}),
            actions: rule.actions.clone(),
        };
        let (alert, is_representative) = alerts::emit(db, candidate, defaults.grouping_window_secs, now)?;

        if is_representative {
            notifier.notify_new_alert(db, &alert, &rule.actions).await;
        }
    }
    Ok(())
}
