use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;

use crate::cache::Caches;
use crate::clock::Clock;
use crate::db::ConfigDb;
use crate::error::AppResult;
use crate::models::oncall::{OnCallScheduleRow, RotationSpec};

/// Resolves an on-call schedule to its current assignee, backed by the
/// same cache-aside + TTL pattern as the rule cache: cached for 1 hour,
/// invalidated on schedule edits. Time comes from the injected clock so
/// rotation boundaries are testable.
pub struct OnCallResolver {
    caches: Arc<Caches>,
    clock: Arc<dyn Clock>,
}

impl OnCallResolver {
    pub fn new(caches: Arc<Caches>, clock: Arc<dyn Clock>) -> Self {
        Self { caches, clock }
    }

    pub async fn resolve(&self, db: &ConfigDb, tenant_id: &str, schedule_id: &str) -> AppResult<Option<String>> {
        if let Some(cached) = self.caches.oncall_resolution.get(schedule_id).await {
            return Ok(Some((*cached).clone()));
        }
        let Some(row) = db.get_on_call_schedule(tenant_id, schedule_id)? else {
            return Ok(None);
        };
        let Some(user_id) = resolve_row(&row, self.clock.now()) else {
            return Ok(None);
        };
        self.caches
            .oncall_resolution
            .insert(schedule_id.to_string(), Arc::new(user_id.clone()))
            .await;
        Ok(Some(user_id))
    }
}

fn resolve_row(row: &OnCallScheduleRow, now: DateTime<Utc>) -> Option<String> {
    let tz: Tz = row.timezone.parse().unwrap_or(chrono_tz::UTC);
    let local = now.with_timezone(&tz);
    let local_date = local.format("%Y-%m-%d").to_string();

    let overrides: std::collections::HashMap<String, String> = serde_json::from_str(&row.overrides_spec).unwrap_or_default();
    if let Some(user_id) = overrides.get(&local_date) {
        return Some(user_id.clone());
    }

    let rotation: RotationSpec = serde_json::from_str(&row.rotation_spec).ok()?;
    match rotation {
        RotationSpec::Weekly { users } => {
            if users.is_empty() {
                return None;
            }
            let week = local.iso_week().week() as usize;
            Some(users[week % users.len()].clone())
        }
        RotationSpec::Daily { users } => {
            if users.is_empty() {
                return None;
            }
            let weekday = local.weekday().num_days_from_monday() as usize;
            Some(users[weekday % users.len()].clone())
        }
        RotationSpec::Custom { ranges } => ranges
            .into_iter()
            .find(|r| r.start_date.as_str() <= local_date.as_str() && local_date.as_str() <= r.end_date.as_str())
            .map(|r| r.user_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(rotation: RotationSpec) -> OnCallScheduleRow {
        OnCallScheduleRow {
            id: "s1".into(),
            tenant_id: "t1".into(),
            name: "primary".into(),
            rotation_spec: serde_json::to_string(&rotation).unwrap(),
            overrides_spec: "{}".into(),
            timezone: "UTC".into(),
            created_at: String::new(),
        }
    }

    #[test]
    fn daily_rotation_maps_weekday() {
        let row = schedule(RotationSpec::Daily {
            users: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into(), "f".into(), "g".into()],
        });
        let monday = DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(resolve_row(&row, monday).as_deref(), Some("a"));
    }

    #[test]
    fn override_takes_precedence() {
        let mut row = schedule(RotationSpec::Daily { users: vec!["a".into()] });
        row.overrides_spec = serde_json::json!({"2026-01-05": "z"}).to_string();
        let monday = DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(resolve_row(&row, monday).as_deref(), Some("z"));
    }

    #[test]
    fn custom_range_scans_dates() {
        let row = schedule(RotationSpec::Custom {
            ranges: vec![crate::models::oncall::CustomRange {
                start_date: "2026-01-01".into(),
                end_date: "2026-01-10".into(),
                user_id: "u1".into(),
            }],
        });
        let inside = DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z").unwrap().with_timezone(&Utc);
        let outside = DateTime::parse_from_rfc3339("2026-02-05T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(resolve_row(&row, inside).as_deref(), Some("u1"));
        assert_eq!(resolve_row(&row, outside), None);
    }
}
