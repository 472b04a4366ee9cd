use std::sync::Arc;

use chrono::Utc;

use crate::clock::Clock;
use crate::db::ConfigDb;
use crate::notify::NotifyDispatcher;

/// Periodic tier dispatcher: the same `tokio::spawn` + interval shape as
/// the rule engine, running every 60s. Every alert still in
/// `new`/`investigating` is re-checked each tick; an
/// acknowledged or resolved alert simply stops appearing in
/// `list_escalatable_alerts` so halting falls out of the query, not an
/// explicit cancellation signal.
pub fn spawn(config_db: Arc<ConfigDb>, notifier: Arc<NotifyDispatcher>, clock: Arc<dyn Clock>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = run_once(&config_db, &notifier, clock.as_ref()).await {
                tracing::error!("escalation executor tick failed: {e}");
            }
        }
    });
}

async fn run_once(db: &ConfigDb, notifier: &NotifyDispatcher, clock: &dyn Clock) -> anyhow::Result<()> {
    let now = clock.now();
    for alert in db.list_escalatable_alerts()? {
        let Some(policy_id) = &alert.escalation_policy_id else { continue };
        let Some(policy_row) = db.get_escalation_policy(&alert.tenant_id, policy_id)? else {
            continue;
        };
        let tiers: Vec<crate::models::escalation::EscalationTier> = match serde_json::from_str(&policy_row.tiers_spec) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("policy {policy_id} has malformed tiers_spec: {e}");
                continue;
            }
        };

        let created_at: chrono::DateTime<Utc> = match alert.created_at.parse() {
            Ok(t) => t,
            Err(_) => continue,
        };
        let elapsed_minutes = (now - created_at).num_minutes();

        // Highest tier whose delay has elapsed and that hasn't fired yet.
        // Tiers are numbered from 1; `current_escalation_tier == 0` means no
        // tier has fired, so the number only ever increases.
        let due_tier = tiers
            .iter()
            .enumerate()
            .map(|(idx, tier)| (idx as i64 + 1, tier))
            .filter(|(number, tier)| *number > alert.current_escalation_tier && tier.delay_minutes <= elapsed_minutes)
            .next_back();

        let Some((number, tier)) = due_tier else { continue };
        notifier.notify_tier(db, &alert, tier).await;
        db.update_escalation_tier(&alert.id, number, &now.to_rfc3339())?;
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
    use crate::models::alert::{Alert, AlertState};
    use crate::models::escalation::EscalationPolicyRow;
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
        db.create_escalation_policy(&EscalationPolicyRow {
            id: "p1".into(),
            tenant_id: "t1".into(),
            name: "critical-path".into(),
            tiers_spec: serde_json::json!([
                { "delay_minutes": 0, "targets": ["user:u1"], "channels": ["email"] },
                { "delay_minutes": 5, "targets": ["user:u2"], "channels": ["email"] },
            ])
            .to_string(),
            severity_filter: r#"["critical"]"#.into(),
            created_at: String::new(),
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
                escalation_policy_id: Some("p1".into()),
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
    async fn first_tier_fires_immediately_and_tier_advances() {
        let (db, notifier, created) = setup();
        let clock = FixedClock::new(created + chrono::Duration::minutes(1));
        run_once(&db, &notifier, &clock).await.unwrap();
        let alert = db.get_alert_by_id("a1").unwrap().unwrap();
        assert_eq!(alert.current_escalation_tier, 1);

        // Same tick again: tier 1 already fired, tier 2 not yet due.
        run_once(&db, &notifier, &clock).await.unwrap();
        assert_eq!(db.get_alert_by_id("a1").unwrap().unwrap().current_escalation_tier, 1);

        clock.advance(chrono::Duration::minutes(5));
        run_once(&db, &notifier, &clock).await.unwrap();
        assert_eq!(db.get_alert_by_id("a1").unwrap().unwrap().current_escalation_tier, 2);
    }

    #[tokio::test]
    async fn acknowledged_alert_stops_escalating() {
        let (db, notifier, created) = setup();
        let clock = FixedClock::new(created + chrono::Duration::minutes(1));
        run_once(&db, &notifier, &clock).await.unwrap();

        crate::alerts::state_machine::transition(
            &db,
            "a1",
            AlertState::Acknowledged,
            "u1",
            false,
            None,
            clock.now(),
        )
        .unwrap();

        clock.advance(chrono::Duration::minutes(10));
        run_once(&db, &notifier, &clock).await.unwrap();
        assert_eq!(db.get_alert_by_id("a1").unwrap().unwrap().current_escalation_tier, 1);
    }
}
