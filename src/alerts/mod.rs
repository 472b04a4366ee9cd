pub mod grouping;
pub mod sla;
pub mod sla_monitor;
pub mod state_machine;

use chrono::{DateTime, Utc};

use crate::db::ConfigDb;
use crate::error::AppResult;
use crate::models::alert::{Alert, AlertCandidate};
use crate::models::rule::Severity;

/// Turns an `AlertCandidate` into a persisted `Alert`, grouping it against
/// any active group for the same `(device_id, rule_id, severity)` key.
/// Returns the alert plus whether it is the group's representative. Only
/// representatives drive escalation; duplicates keep a full history row via
/// `grouped_alert_id` but do not re-trigger tiers or their own SLA clock.
pub fn emit(
    db: &ConfigDb,
    candidate: AlertCandidate,
    grouping_window_secs: i64,
    now: DateTime<Utc>,
) -> AppResult<(Alert, bool)> {
    let severity = Severity::parse(&candidate.severity).unwrap_or(Severity::Info);
    let (tta_target, ttr_target) = severity.sla_targets();
    let source_key = candidate
        .rule_id
        .as_deref()
        .or(candidate.external_source_key.as_deref());
    let key = grouping::group_key(&candidate.device_id, source_key, candidate.severity.as_str());

    let alert_id = uuid::Uuid::new_v4().to_string();
    let now_str = now.to_rfc3339();

    let (representative_id, is_new_group) = match &key {
        Some(key) => db.upsert_alert_group(
            &candidate.tenant_id,
            &candidate.device_id,
            candidate.rule_id.as_deref(),
            &candidate.severity,
            key,
            &now_str,
            grouping_window_secs,
            &alert_id,
        )?,
        // No rule and no external source key: the alert stands alone.
        None => (alert_id.clone(), true),
    };
    let is_representative = is_new_group || representative_id == alert_id;

    let escalation_policy_id = db
        .find_policy_for_severity(&candidate.tenant_id, &candidate.severity)?
        .map(|p| p.id);

    let alert = Alert {
        id: alert_id.clone(),
        tenant_id: candidate.tenant_id,
        device_id: candidate.device_id,
        rule_id: candidate.rule_id,
        severity: candidate.severity,
        message: candidate.message,
        created_at: now_str,
        metadata: candidate.metadata.to_string(),
        escalation_policy_id: if is_representative { escalation_policy_id } else { None },
        current_escalation_tier: 0,
        last_escalation_at: None,
        grouped_alert_id: if is_representative { None } else { Some(representative_id) },
        duplicate_count: 1,
    };

    db.create_alert(&alert, tta_target, ttr_target)?;
    Ok((alert, is_representative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tenant::Tenant;

    fn setup() -> ConfigDb {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&Tenant {
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
        db
    }

    fn candidate() -> AlertCandidate {
        AlertCandidate {
            tenant_id: "t1".into(),
            device_id: "d1".into(),
            rule_id: Some("r1".into()),
            external_source_key: None,
            severity: "high".into(),
            message: "hot".into(),
            metadata: serde_json::json!({}),
            actions: vec![],
        }
    }

    #[test]
    fn first_emission_is_representative() {
        let db = setup();
        let (alert, is_rep) = emit(&db, candidate(), 300, Utc::now()).unwrap();
        assert!(is_rep);
        assert!(alert.grouped_alert_id.is_none());
    }

    #[test]
    fn burst_within_window_groups_to_one_representative() {
        let db = setup();
        let now = Utc::now();
        let (first, _) = emit(&db, candidate(), 300, now).unwrap();
        for i in 1..5 {
            let (dup, is_rep) = emit(&db, candidate(), 300, now + chrono::Duration::seconds(i)).unwrap();
            assert!(!is_rep);
            assert_eq!(dup.grouped_alert_id.as_deref(), Some(first.id.as_str()));
        }
    }

    #[test]
    fn duplicates_carry_no_sla_of_their_own() {
        let db = setup();
        let now = Utc::now();
        let (first, _) = emit(&db, candidate(), 300, now).unwrap();
        let (dup, _) = emit(&db, candidate(), 300, now + chrono::Duration::seconds(1)).unwrap();
        assert!(db.get_alert_sla(&first.id).unwrap().is_some());
        assert!(db.get_alert_sla(&dup.id).unwrap().is_none());
    }

    #[test]
    fn external_alerts_group_by_source_key() {
        let db = setup();
        let now = Utc::now();
        let mut external = candidate();
        external.rule_id = None;
        external.external_source_key = Some("scada-gateway".into());
        let (first, rep1) = emit(&db, external.clone(), 300, now).unwrap();
        assert!(rep1);
        let (dup, rep2) = emit(&db, external, 300, now + chrono::Duration::seconds(5)).unwrap();
        assert!(!rep2);
        assert_eq!(dup.grouped_alert_id.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn sourceless_external_alerts_stand_alone() {
        let db = setup();
        let now = Utc::now();
        let mut external = candidate();
        external.rule_id = None;
        let (_, rep1) = emit(&db, external.clone(), 300, now).unwrap();
        let (second, rep2) = emit(&db, external, 300, now + chrono::Duration::seconds(1)).unwrap();
        assert!(rep1);
        assert!(rep2);
        assert!(second.grouped_alert_id.is_none());
    }
}
