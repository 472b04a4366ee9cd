use chrono::{DateTime, Utc};

/// `ttr_actual = ceil((resolved_at - created_at) / 60s)`.
pub fn minutes_elapsed_ceil(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let secs = (to - from).num_milliseconds().max(0) as f64 / 1000.0;
    (secs / 60.0).ceil()
}

pub fn breached(actual_minutes: f64, target_minutes: i64) -> bool {
    actual_minutes > target_minutes as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_minute_not_breached() {
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(15);
        let actual = minutes_elapsed_ceil(start, end);
        assert_eq!(actual, 15.0);
        assert!(!breached(actual, 15));
    }

    #[test]
    fn one_second_over_rounds_up_and_breaches() {
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(15) + chrono::Duration::seconds(1);
        let actual = minutes_elapsed_ceil(start, end);
        assert_eq!(actual, 16.0);
        assert!(breached(actual, 15));
    }
}
