pub mod cache;
pub mod engine;

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::db::TelemetryStore;
use crate::error::AppResult;
use crate::models::rule::{Condition, ComparisonOp};

/// Evaluates a compiled condition against the telemetry store, returning
/// whether it currently holds. `reactive_value`
/// is the just-ingested reading when called from the reactive path; it lets
/// `Threshold` skip a round-trip to the store for the value that triggered
/// evaluation in the first place.
pub async fn evaluate_condition(
    store: &TelemetryStore,
    tenant_id: &str,
    device_id: &str,
    condition: &Condition,
    reactive_value: Option<(&str, f64)>,
    now: DateTime<Utc>,
) -> AppResult<bool> {
    match condition {
        Condition::Threshold { key, operator, value } => {
            let actual = match reactive_value {
                Some((k, v)) if k == key => Some(v),
                _ => store.latest_value(tenant_id, device_id, key).await?,
            };
            Ok(actual.map(|a| operator.apply(a, *value)).unwrap_or(false))
        }
        Condition::Comparison { key_a, operator, key_b } => {
            let a = store.latest_value(tenant_id, device_id, key_a).await?;
            let b = store.latest_value(tenant_id, device_id, key_b).await?;
            Ok(match (a, b) {
                (Some(a), Some(b)) => operator.apply(a, b),
                _ => false,
            })
        }
        Condition::Statistical {
            key,
            aggregate,
            window_seconds,
            operator,
            value,
        } => {
            let ch_aggregate = match aggregate {
                crate::models::rule::AggregateKind::Avg => crate::models::telemetry::Aggregate::Avg,
                crate::models::rule::AggregateKind::Min => crate::models::telemetry::Aggregate::Min,
                crate::models::rule::AggregateKind::Max => crate::models::telemetry::Aggregate::Max,
                crate::models::rule::AggregateKind::Stddev => crate::models::telemetry::Aggregate::Stddev,
                crate::models::rule::AggregateKind::Count => crate::models::telemetry::Aggregate::Count,
            };
            let actual = store
                .aggregate_over_window(tenant_id, device_id, key, ch_aggregate, *window_seconds, now)
                .await?;
            Ok(actual.map(|a| operator.apply(a, *value)).unwrap_or(false))
        }
        Condition::TimeWindow {
            schedule_cron_expr,
            inner_condition,
        } => {
            if !cron_matches_now(schedule_cron_expr, now) {
                return Ok(false);
            }
            Box::pin(evaluate_condition(store, tenant_id, device_id, inner_condition, reactive_value, now)).await
        }
    }
}

/// True when `now` falls within the minute matched by `cron_expr`, the
/// schedule the rule is active during.
fn cron_matches_now(cron_expr: &str, now: DateTime<Utc>) -> bool {
    match cron::Schedule::from_str(cron_expr) {
        Ok(schedule) => {
            let window_start = now - chrono::Duration::seconds(60);
            schedule
                .after(&window_start)
                .next()
                .map(|next| next <= now)
                .unwrap_or(false)
        }
        Err(e) => {
            tracing::warn!("invalid cron expression {cron_expr:?}: {e}");
            false
        }
    }
}

/// Whether `actual` satisfies the cooldown gate since `last_fired`: a rule
/// does not re-fire for the same device within its cooldown window.
pub fn cooldown_elapsed(last_fired: Option<DateTime<Utc>>, cooldown_seconds: i64, now: DateTime<Utc>) -> bool {
    match last_fired {
        None => true,
        Some(last) => (now - last).num_seconds() >= cooldown_seconds,
    }
}

pub fn parse_comparison(op: &str) -> Option<ComparisonOp> {
    match op {
        ">" => Some(ComparisonOp::Gt),
        "<" => Some(ComparisonOp::Lt),
        ">=" => Some(ComparisonOp::Gte),
        "<=" => Some(ComparisonOp::Lte),
        "==" => Some(ComparisonOp::Eq),
        "!=" => Some(ComparisonOp::Ne),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_within_window() {
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(30);
        assert!(!cooldown_elapsed(Some(last), 60, now));
        assert!(cooldown_elapsed(Some(last), 20, now));
        assert!(cooldown_elapsed(None, 60, now));
    }

    #[test]
    fn cron_window_matches_current_minute() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T09:30:00Z").unwrap().with_timezone(&Utc);
        assert!(cron_matches_now("0 30 9 * * *", now));
        assert!(!cron_matches_now("0 0 3 * * *", now));
    }
}
