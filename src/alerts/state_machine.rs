use chrono::{DateTime, Utc};

use crate::alerts::sla::{breached, minutes_elapsed_ceil};
use crate::db::ConfigDb;
use crate::error::{AppError, AppResult};
use crate::models::alert::AlertState;

/// Validates and applies a state transition, recording it as a new
/// `AlertState` row. The read-then-append happens while the
/// caller already holds no lock of its own; `ConfigDb`'s internal mutex is
/// what actually serializes concurrent transitions on the same alert, so
/// "first wins, second sees a stale precondition" falls out of
/// lock ordering rather than anything in this function.
pub fn transition(
    db: &ConfigDb,
    alert_id: &str,
    next: AlertState,
    changed_by: &str,
    is_system_admin: bool,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let current_str = db
        .latest_alert_state(alert_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    let current = AlertState::parse(&current_str).ok_or_else(|| AppError::Internal("corrupt alert state".into()))?;

    if !current.can_transition_to(next) {
        return Err(AppError::InvalidStateTransition(format!(
            "{} -> {}",
            current.as_str(),
            next.as_str()
        )));
    }
    if current.is_reopen(next) && !is_system_admin {
        return Err(AppError::Forbidden);
    }

    db.append_alert_state(alert_id, next.as_str(), changed_by, &now.to_rfc3339(), note)?;

    // TTA/TTR actuals are stamped with the transition that closes them so
    // they land in the same serialized section as the state row itself.
    if next == AlertState::Acknowledged || next == AlertState::Resolved {
        if let (Ok(Some(alert)), Ok(Some(sla))) = (db.get_alert_by_id(alert_id), db.get_alert_sla(alert_id)) {
            if let Ok(created_at) = alert.created_at.parse::<DateTime<Utc>>() {
                let elapsed = minutes_elapsed_ceil(created_at, now);
                match next {
                    AlertState::Acknowledged if sla.tta_actual.is_none() => {
                        db.update_sla_tta(alert_id, elapsed, breached(elapsed, sla.tta_target_minutes))?;
                    }
                    AlertState::Resolved => {
                        db.update_sla_ttr(alert_id, elapsed, breached(elapsed, sla.ttr_target_minutes))?;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
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
        db.create_alert(
            &crate::models::alert::Alert {
                id: "a1".into(),
                tenant_id: "t1".into(),
                device_id: "d1".into(),
                rule_id: None,
                severity: "high".into(),
                message: "hot".into(),
                created_at: Utc::now().to_rfc3339(),
                metadata: "{}".into(),
                escalation_policy_id: None,
                current_escalation_tier: 0,
                last_escalation_at: None,
                grouped_alert_id: None,
                duplicate_count: 1,
            },
            15,
            120,
        )
        .unwrap();
        db
    }

    #[test]
    fn new_to_acknowledged_allowed() {
        let db = setup();
        transition(&db, "a1", AlertState::Acknowledged, "u1", false, None, Utc::now()).unwrap();
        assert_eq!(db.latest_alert_state("a1").unwrap().unwrap(), "acknowledged");
    }

    fn created_at(db: &ConfigDb) -> chrono::DateTime<Utc> {
        db.get_alert_by_id("a1").unwrap().unwrap().created_at.parse().unwrap()
    }

    #[test]
    fn acknowledge_stamps_tta() {
        let db = setup();
        let later = created_at(&db) + chrono::Duration::minutes(20);
        transition(&db, "a1", AlertState::Acknowledged, "u1", false, None, later).unwrap();
        let sla = db.get_alert_sla("a1").unwrap().unwrap();
        assert_eq!(sla.tta_actual, Some(20.0));
        assert!(sla.tta_breached);
    }

    #[test]
    fn resolve_stamps_ttr() {
        let db = setup();
        let later = created_at(&db) + chrono::Duration::minutes(60);
        transition(&db, "a1", AlertState::Resolved, "u1", false, None, later).unwrap();
        let sla = db.get_alert_sla("a1").unwrap().unwrap();
        assert_eq!(sla.ttr_actual, Some(60.0));
        assert!(!sla.ttr_breached);
    }

    #[test]
    fn resolved_to_acknowledged_rejected() {
        let db = setup();
        transition(&db, "a1", AlertState::Resolved, "u1", false, None, Utc::now()).unwrap();
        let err = transition(&db, "a1", AlertState::Acknowledged, "u1", false, None, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition(_)));
    }

    #[test]
    fn reopen_requires_system_admin() {
        let db = setup();
        transition(&db, "a1", AlertState::Resolved, "u1", false, None, Utc::now()).unwrap();
        let err = transition(&db, "a1", AlertState::New, "u1", false, None, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
        transition(&db, "a1", AlertState::New, "admin", true, None, Utc::now()).unwrap();
        assert_eq!(db.latest_alert_state("a1").unwrap().unwrap(), "new");
    }
}
