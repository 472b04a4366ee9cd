pub mod bus;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::future::Cache;

use crate::models::rule::CompiledRule;

/// Per-process TTL caches sitting in front of `ConfigDb` reads that are on
/// every rule-evaluation or ingestion hot path. Each is invalidated either
/// by TTL expiry or an explicit `invalidate` call triggered by the redis
/// pub/sub bus.
#[derive(Clone)]
pub struct Caches {
    /// tenant_id -> compiled rules for that tenant
    pub rules: Cache<String, Arc<Vec<CompiledRule>>>,
    /// device_id -> (tenant_id, protocol) binding, used by adapters that
    /// receive a bare device id with no tenant context (CoAP routing)
    pub device_bindings: Cache<String, Arc<(String, String)>>,
    /// on-call schedule id -> resolved current assignee user id
    pub oncall_resolution: Cache<String, Arc<String>>,
    /// (rule id, device id, key) recently evaluated reactively; entries
    /// expire after the coalescing window so a burst of identical readings
    /// triggers one evaluation, not one per reading
    pub reactive_seen: Cache<String, ()>,
    /// rule id -> count of readings whose string value could not satisfy a
    /// numeric condition; surfaced in logs, reset on process restart
    malformed_data: Arc<Mutex<HashMap<String, u64>>>,
}

impl Caches {
    pub fn new(rule_cache_ttl_secs: u64, oncall_cache_ttl_secs: u64, reactive_coalesce_ms: u64) -> Self {
        Self {
            rules: Cache::builder()
                .time_to_live(Duration::from_secs(rule_cache_ttl_secs))
                .max_capacity(10_000)
                .build(),
            device_bindings: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .max_capacity(100_000)
                .build(),
            oncall_resolution: Cache::builder()
                .time_to_live(Duration::from_secs(oncall_cache_ttl_secs))
                .max_capacity(10_000)
                .build(),
            reactive_seen: Cache::builder()
                .time_to_live(Duration::from_millis(reactive_coalesce_ms.max(1)))
                .max_capacity(100_000)
                .build(),
            malformed_data: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Counts a reading whose string value met a numeric condition; the
    /// condition does not fire but the mismatch is tracked per rule.
    pub fn note_malformed_data(&self, rule_id: &str) -> u64 {
        let mut counters = self.malformed_data.lock().unwrap();
        let count = counters.entry(rule_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub async fn invalidate_tenant_rules(&self, tenant_id: &str) {
        self.rules.invalidate(tenant_id).await;
    }

    pub async fn invalidate_device_binding(&self, device_id: &str) {
        self.device_bindings.invalidate(device_id).await;
    }

    pub async fn invalidate_oncall(&self, schedule_id: &str) {
        self.oncall_resolution.invalidate(schedule_id).await;
    }
}
