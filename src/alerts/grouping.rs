/// Deterministic `group_key = (device_id, source, severity)` where `source`
/// is the rule id for rule-emitted alerts or the external source key for
/// alerts created through the management API without a rule. An external
/// alert with neither stands alone and never groups.
pub fn group_key(device_id: &str, source_key: Option<&str>, severity: &str) -> Option<String> {
    source_key.map(|s| format!("{device_id}|{s}|{severity}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_severities_produce_distinct_keys() {
        assert_ne!(
            group_key("d1", Some("r1"), "high"),
            group_key("d1", Some("r1"), "critical")
        );
    }

    #[test]
    fn same_inputs_produce_same_key() {
        assert_eq!(group_key("d1", Some("r1"), "high"), group_key("d1", Some("r1"), "high"));
    }

    #[test]
    fn sourceless_alert_has_no_key() {
        assert_eq!(group_key("d1", None, "high"), None);
    }
}
