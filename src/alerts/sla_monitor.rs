use std::sync::Arc;

use chrono::Utc;

use crate::alerts::sla::{breached, minutes_elapsed_ceil};
use crate::clock::Clock;
use crate::db::ConfigDb;
use crate::notify::NotifyDispatcher;

/// Periodic breach check for still-open alerts: flips `tta_breached` once an
/// unacknowledged alert passes its TTA target, and `ttr_breached` once any
/// open alert passes its TTR target. The `_notified` flags make a second
/// pass over an already-flagged alert a no-op, so each target breaches at
/// most one notification per alert. Actuals for acknowledged/resolved
/// alerts are stamped by the state machine at transition time; this loop
/// only ever touches the breach flags of alerts that haven't got there yet.
pub fn spawn(config_db: Arc<ConfigDb>, notifier: Arc<NotifyDispatcher>, clock: Arc<dyn Clock>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = run_once(&config_db, &notifier, clock.as_ref()).await {
                tracing::error!("sla monitor tick failed: {e}");
            }
        }
    });
}

async fn run_once(db: &ConfigDb, notifier: &NotifyDispatcher, clock: &dyn Clock) -> anyhow::Result<()> {
    let now = clock.now();
    for (alert, sla, state) in db.list_open_alerts_with_sla()? {
        let created_at: chrono::DateTime<Utc> = alert.created_at.parse()?;
        let elapsed = minutes_elapsed_ceil(created_at, now);

        // TTA only counts while the alert has never been acknowledged; an
        // alert taken straight to investigating is still unacknowledged.
        let unacknowledged = state == "new" || state == "investigating";
        if !sla.tta_breach_notified && unacknowledged && breached(elapsed, sla.tta_target_minutes) {
            db.mark_tta_breach_notified(&alert.id, true)?;
            notifier.notify_sla_breach(db, &alert, "tta").await;
        }

        if !sla.ttr_breach_notified && breached(elapsed, sla.ttr_target_minutes) {
            db.mark_ttr_breach_notified(&alert.id, true)?;
            notifier.notify_sla_breach(db, &alert, "ttr").await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Caches;
    use crate::clock::test_support::FixedClock;
    use crate::config::SmtpSettings;
    use crate::escalation::oncall_resolver::OnCallResolver;
    use crate::models::alert::Alert;
    use crate::models::tenant::Tenant;

    fn setup() -> (ConfigDb, NotifyDispatcher, chrono::DateTime<Utc>) {
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
        let created = Utc::now();
        db.create_alert(
            &Alert {
                id: "a1".into(),
                tenant_id: "t1".into(),
                device_id: "d1".into(),
                rule_id: None,
                severity: "critical".into(),
                message: "hot".into(),
                created_at: created.to_rfc3339(),
                metadata: "{}".into(),
                escalation_policy_id: None,
                current_escalation_tier: 0,
                last_escalation_at: None,
                grouped_alert_id: None,
                duplicate_count: 1,
            },
            5,
            30,
        )
        .unwrap();
        let caches = Arc::new(Caches::new(600, 3600, 500));
        let notifier = NotifyDispatcher::new(
            SmtpSettings::default(),
            None,
            b"secret".to_vec(),
            Arc::new(OnCallResolver::new(caches, Arc::new(crate::clock::SystemClock))),
            None,
        );
        (db, notifier, created)
    }

    #[tokio::test]
    async fn tta_breach_flagged_once() {
        let (db, notifier, created) = setup();
        let clock = FixedClock::new(created + chrono::Duration::minutes(6));
        run_once(&db, &notifier, &clock).await.unwrap();
        let sla = db.get_alert_sla("a1").unwrap().unwrap();
        assert!(sla.tta_breached);
        assert!(sla.tta_breach_notified);
        assert!(!sla.ttr_breached);

        // A later pass must not re-notify; the flag is already set.
        clock.advance(chrono::Duration::minutes(1));
        run_once(&db, &notifier, &clock).await.unwrap();
        let again = db.get_alert_sla("a1").unwrap().unwrap();
        assert!(again.tta_breach_notified);
    }

    #[tokio::test]
    async fn investigating_without_ack_still_breaches_tta() {
        let (db, notifier, created) = setup();
        crate::alerts::state_machine::transition(
            &db,
            "a1",
            crate::models::alert::AlertState::Investigating,
            "u1",
            false,
            None,
            created + chrono::Duration::minutes(1),
        )
        .unwrap();
        let clock = FixedClock::new(created + chrono::Duration::minutes(6));
        run_once(&db, &notifier, &clock).await.unwrap();
        let sla = db.get_alert_sla("a1").unwrap().unwrap();
        assert!(sla.tta_breached);
        assert!(sla.tta_breach_notified);
    }

    #[tokio::test]
    async fn ttr_breach_flagged_for_open_alert() {
        let (db, notifier, created) = setup();
        let clock = FixedClock::new(created + chrono::Duration::minutes(31));
        run_once(&db, &notifier, &clock).await.unwrap();
        let sla = db.get_alert_sla("a1").unwrap().unwrap();
        assert!(sla.ttr_breached);
        assert!(sla.ttr_breach_notified);
    }

    #[tokio::test]
    async fn within_target_not_flagged() {
        let (db, notifier, created) = setup();
        let clock = FixedClock::new(created + chrono::Duration::minutes(3));
        run_once(&db, &notifier, &clock).await.unwrap();
        let sla = db.get_alert_sla("a1").unwrap().unwrap();
        assert!(!sla.tta_breached);
        assert!(!sla.ttr_breached);
    }
}
