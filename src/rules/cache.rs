use std::sync::Arc;

use crate::cache::Caches;
use crate::db::ConfigDb;
use crate::error::AppResult;
use crate::models::rule::{Condition, CompiledRule, NotificationAction, RuleRow, RuleScope};

fn compile(row: &RuleRow) -> anyhow::Result<CompiledRule> {
    let condition: Condition = serde_json::from_str(&row.condition_spec)?;
    let actions: Vec<NotificationAction> = serde_json::from_str(&row.action_spec)?;
    let scope: RuleScope = serde_json::from_str(&row.scope_spec)?;
    Ok(CompiledRule {
        id: row.id.clone(),
        tenant_id: row.tenant_id.clone(),
        name: row.name.clone(),
        condition,
        actions,
        priority: row.priority,
        enabled: row.enabled,
        cooldown_seconds: row.cooldown_seconds,
        eval_interval_secs: row.eval_interval_secs,
        scope,
    })
}

/// Returns the tenant's compiled, enabled rules, populating the cache on
/// miss. A row that fails to compile (malformed
/// JSON left over from a bad migration, say) is logged and skipped rather
/// than failing the whole lookup.
pub async fn rules_for_tenant(db: &ConfigDb, caches: &Caches, tenant_id: &str) -> AppResult<Arc<Vec<CompiledRule>>> {
    if let Some(cached) = caches.rules.get(tenant_id).await {
        return Ok(cached);
    }
    let rows = db.list_rules(tenant_id)?;
    let compiled: Vec<CompiledRule> = rows
        .iter()
        .filter(|r| r.enabled)
        .filter_map(|r| match compile(r) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("rule {} failed to compile: {e}", r.id);
                None
            }
        })
        .collect();
    let compiled = Arc::new(compiled);
    caches.rules.insert(tenant_id.to_string(), compiled.clone()).await;
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_miss_then_hit() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&crate::models::tenant::Tenant {
            id: "t1".into(),
            slug: "acme".into(),
            name: "Acme".into(),
            tier: "free".into(),
            max_devices: None,
            max_users: None,
            max_telemetry_points_per_day: None,
            max_retention_days: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
        db.create_rule(&RuleRow {
            id: "r1".into(),
            tenant_id: "t1".into(),
            name: "hot".into(),
            condition_spec: r#"{"rule_type":"threshold","key":"temperature","operator":">","value":90.0}"#.into(),
            action_spec: "[]".into(),
            priority: 20,
            enabled: true,
            cooldown_seconds: 60,
            eval_interval_secs: 30,
            scope_spec: r#"{"scope_type":"tenant"}"#.into(),
            last_evaluated_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
        let caches = Caches::new(600, 3600, 500);
        let rules = rules_for_tenant(&db, &caches, "t1").await.unwrap();
        assert_eq!(rules.len(), 1);
        let rules2 = rules_for_tenant(&db, &caches, "t1").await.unwrap();
        assert_eq!(rules2.len(), 1);
    }
}
