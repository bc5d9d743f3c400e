use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use parking_lot::RwLock;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::kv::RemoteKv;
use crate::record::{FieldCache, Record};
use crate::ruleset::{CountType, Threshold, ThresholdBackend};

/// 64-bit group key over the configured tuple of field values. The scheme
/// prefix keeps EVENTS/SUM/CLASSIFY windows for the same tuple apart.
pub fn group_key(scheme: &str, key_prefix: &str, values: &[String]) -> u64 {
    let mut buf = String::with_capacity(
        scheme.len() + key_prefix.len() + values.iter().map(String::len).sum::<usize>(),
    );
    buf.push_str(scheme);
    buf.push_str(key_prefix);
    for value in values {
        buf.push_str(value);
    }
    xxh64(buf.as_bytes(), 0)
}

struct CounterSlot {
    value: AtomicI64,
    ttl: Duration,
}

struct SlotExpiry;

impl Expiry<u64, Arc<CounterSlot>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &u64,
        slot: &Arc<CounterSlot>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(slot.ttl)
    }
}

/// In-process sliding-window counter store: a cost-bounded cache of counter
/// slots, each expiring after its threshold's window. Writes are awaited so
/// counting stays monotonic within a window.
pub struct CounterCache {
    cache: Cache<u64, Arc<CounterSlot>>,
}

impl CounterCache {
    pub fn new(max_entries: u64, max_cost: u64) -> Self {
        let entry_cost = (std::mem::size_of::<u64>() + std::mem::size_of::<CounterSlot>()) as u64;
        let cache = Cache::builder()
            .weigher(move |_key: &u64, _slot: &Arc<CounterSlot>| entry_cost as u32)
            .max_capacity(max_cost.min(max_entries.saturating_mul(entry_cost)))
            .expire_after(SlotExpiry)
            .build();
        CounterCache { cache }
    }

    /// Add `delta` to the window counter for `key`, creating the slot with
    /// `ttl` when absent, and return the new count.
    pub async fn incr(&self, key: u64, delta: i64, ttl: Duration) -> i64 {
        let slot = self
            .cache
            .get_with(key, async move {
                Arc::new(CounterSlot {
                    value: AtomicI64::new(0),
                    ttl,
                })
            })
            .await;
        slot.value.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// Insert a presence marker for `key` (distinct-member tracking).
    /// Returns true when the marker was newly created within the window.
    pub async fn mark(&self, key: u64, ttl: Duration) -> bool {
        let entry = self
            .cache
            .entry(key)
            .or_insert_with(async move {
                Arc::new(CounterSlot {
                    value: AtomicI64::new(1),
                    ttl,
                })
            })
            .await;
        entry.is_fresh()
    }

    pub fn contains(&self, key: &u64) -> bool {
        self.cache.contains_key(key)
    }

    /// Drop the window for `key` (threshold fired).
    pub async fn reset(&self, key: u64) {
        self.cache.invalidate(&key).await;
    }

    pub async fn close(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

struct ClassifySet {
    members: RwLock<HashSet<u64>>,
    ttl: Duration,
}

struct SetExpiry;

impl Expiry<u64, Arc<ClassifySet>> for SetExpiry {
    fn expire_after_create(
        &self,
        _key: &u64,
        set: &Arc<ClassifySet>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(set.ttl)
    }
}

/// Group → distinct-member index for CLASSIFY thresholds. Sets live twice
/// as long as their window; member liveness is cross-checked against the
/// primary counter cache so stale members are pruned lazily.
pub struct ClassifyIndex {
    cache: Cache<u64, Arc<ClassifySet>>,
}

impl ClassifyIndex {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(SetExpiry)
            .build();
        ClassifyIndex { cache }
    }

    /// Record `member` under `group` and return the live distinct count.
    pub async fn record_member(
        &self,
        group: u64,
        member: u64,
        set_ttl: Duration,
        primary: &CounterCache,
    ) -> u64 {
        let set = self
            .cache
            .get_with(group, async move {
                Arc::new(ClassifySet {
                    members: RwLock::new(HashSet::new()),
                    ttl: set_ttl,
                })
            })
            .await;
        let mut members = set.members.write();
        members.insert(member);
        members.retain(|m| primary.contains(m));
        members.len() as u64
    }

    /// Drop the group's member set and its markers (threshold fired).
    pub async fn reset_group(&self, group: u64, primary: &CounterCache) {
        if let Some(set) = self.cache.get(&group).await {
            let members: Vec<u64> = set.members.write().drain().collect();
            for member in members {
                primary.reset(member).await;
            }
        }
        self.cache.invalidate(&group).await;
    }

    pub async fn close(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

/// Shared threshold backends owned by the enclosing ruleset.
pub(crate) struct ThresholdState<'a> {
    pub counter: Option<&'a Arc<CounterCache>>,
    pub classify: Option<&'a Arc<ClassifyIndex>>,
    pub kv: Option<&'a Arc<dyn RemoteKv>>,
}

impl Threshold {
    fn scheme(&self) -> &'static str {
        match self.count_type {
            CountType::Events => "F_",
            CountType::Sum => "FS_",
            CountType::Classify => "FC_",
        }
    }

    fn window_seconds(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    /// Evaluate this threshold for one record: bump the window aggregate
    /// and report whether it fired. Firing resets the window for that
    /// group. Backend errors fail closed (false).
    pub(crate) async fn evaluate(
        &self,
        state: &ThresholdState<'_>,
        record: &Record,
        cache: &mut FieldCache,
    ) -> bool {
        let mut values = Vec::with_capacity(self.group_by.len());
        for path in &self.group_by {
            values.push(cache.lookup(record, path).0);
        }
        let group = group_key(self.scheme(), &self.key_prefix, &values);

        match self.count_type {
            CountType::Events => self.count(state, group, 1).await,
            CountType::Sum => {
                let field = self.count_field.as_deref().unwrap_or_default();
                let (raw, _) = cache.lookup(record, field);
                let Ok(delta) = raw.trim().parse::<i64>() else {
                    // Unparseable sums contribute nothing and cannot fire.
                    return false;
                };
                self.count(state, group, delta).await
            }
            CountType::Classify => {
                let field = self.count_field.as_deref().unwrap_or_default();
                let (member, _) = cache.lookup(record, field);
                self.classify(state, group, &member).await
            }
        }
    }

    async fn count(&self, state: &ThresholdState<'_>, group: u64, delta: i64) -> bool {
        let limit = self.value as i64;
        match self.backend {
            ThresholdBackend::Local => {
                let Some(counter) = state.counter else {
                    warn!(prefix = %self.key_prefix, "local threshold has no counter cache");
                    return false;
                };
                let count = counter.incr(group, delta, self.window).await;
                if count > limit {
                    counter.reset(group).await;
                    debug!(prefix = %self.key_prefix, count, "threshold fired");
                    true
                } else {
                    false
                }
            }
            ThresholdBackend::Remote => {
                let Some(kv) = state.kv else {
                    warn!(prefix = %self.key_prefix, "remote threshold has no KV store bound");
                    return false;
                };
                let key = format!("{}{}", self.scheme(), group);
                let outcome: crate::error::Result<i64> = async {
                    kv.set_if_absent(&key, 0, self.window_seconds()).await?;
                    kv.incr_by(&key, delta).await
                }
                .await;
                match outcome {
                    Ok(count) if count > limit => {
                        if let Err(e) = kv.delete(&key).await {
                            warn!(key = %key, error = %e, "failed to reset remote threshold");
                        }
                        debug!(prefix = %self.key_prefix, count, "threshold fired");
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        warn!(key = %key, error = %e, "remote threshold evaluation failed");
                        false
                    }
                }
            }
        }
    }

    async fn classify(&self, state: &ThresholdState<'_>, group: u64, member: &str) -> bool {
        let limit = self.value;
        match self.backend {
            ThresholdBackend::Local => {
                let (Some(counter), Some(index)) = (state.counter, state.classify) else {
                    warn!(prefix = %self.key_prefix, "classify threshold has no local caches");
                    return false;
                };
                let member_key = xxh64(member.as_bytes(), group);
                counter.mark(member_key, self.window).await;
                let distinct = index
                    .record_member(group, member_key, self.window * 2, counter)
                    .await;
                if distinct > limit {
                    index.reset_group(group, counter).await;
                    debug!(prefix = %self.key_prefix, distinct, "classify threshold fired");
                    true
                } else {
                    false
                }
            }
            ThresholdBackend::Remote => {
                let Some(kv) = state.kv else {
                    warn!(prefix = %self.key_prefix, "remote threshold has no KV store bound");
                    return false;
                };
                let base = format!("{}{}", self.scheme(), group);
                let member_key = format!("{}_{}", base, xxh64(member.as_bytes(), 0));
                let outcome: crate::error::Result<Vec<String>> = async {
                    kv.set_if_absent(&member_key, 1, self.window_seconds()).await?;
                    kv.keys(&format!("{}_", base)).await
                }
                .await;
                match outcome {
                    Ok(members) if members.len() as u64 > limit => {
                        for key in &members {
                            if let Err(e) = kv.delete(key).await {
                                warn!(key = %key, error = %e, "failed to reset classify member");
                            }
                        }
                        debug!(prefix = %self.key_prefix, distinct = members.len(), "classify threshold fired");
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        warn!(key = %base, error = %e, "remote classify evaluation failed");
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::record::acquire_field_cache;
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn threshold(count_type: CountType, backend: ThresholdBackend, value: u64) -> Threshold {
        Threshold {
            group_by: vec!["src".to_string()],
            window: Duration::from_secs(10),
            backend,
            count_type,
            count_field: Some("amount".to_string()),
            value,
            key_prefix: "rs.r1.0".to_string(),
            line: 1,
        }
    }

    #[test]
    fn group_keys_are_deterministic_and_scheme_scoped() {
        let values = vec!["A".to_string(), "B".to_string()];
        assert_eq!(
            group_key("F_", "rs.r1.0", &values),
            group_key("F_", "rs.r1.0", &values)
        );
        assert_ne!(
            group_key("F_", "rs.r1.0", &values),
            group_key("FC_", "rs.r1.0", &values)
        );
        assert_ne!(
            group_key("F_", "rs.r1.0", &values),
            group_key("F_", "rs.r2.0", &values)
        );
    }

    #[tokio::test]
    async fn local_events_fires_above_threshold_and_resets() {
        let counter = Arc::new(CounterCache::new(1024, 1 << 20));
        let state = ThresholdState {
            counter: Some(&counter),
            classify: None,
            kv: None,
        };
        let t = threshold(CountType::Events, ThresholdBackend::Local, 3);
        let rec = record(json!({"src": "A"}));
        let mut cache = acquire_field_cache();

        for _ in 0..3 {
            assert!(!t.evaluate(&state, &rec, &mut cache).await);
        }
        assert!(t.evaluate(&state, &rec, &mut cache).await);

        // The window was reset on fire; the count starts over.
        assert!(!t.evaluate(&state, &rec, &mut cache).await);
    }

    #[tokio::test]
    async fn local_groups_are_independent() {
        let counter = Arc::new(CounterCache::new(1024, 1 << 20));
        let state = ThresholdState {
            counter: Some(&counter),
            classify: None,
            kv: None,
        };
        let t = threshold(CountType::Events, ThresholdBackend::Local, 1);
        let rec_a = record(json!({"src": "A"}));
        let rec_b = record(json!({"src": "B"}));
        let mut cache_a = acquire_field_cache();
        let mut cache_b = acquire_field_cache();

        assert!(!t.evaluate(&state, &rec_a, &mut cache_a).await);
        assert!(!t.evaluate(&state, &rec_b, &mut cache_b).await);
        assert!(t.evaluate(&state, &rec_a, &mut cache_a).await);
    }

    #[tokio::test]
    async fn sum_parses_integers_and_ignores_garbage() {
        let counter = Arc::new(CounterCache::new(1024, 1 << 20));
        let state = ThresholdState {
            counter: Some(&counter),
            classify: None,
            kv: None,
        };
        let t = threshold(CountType::Sum, ThresholdBackend::Local, 10);

        let mut cache = acquire_field_cache();
        let rec = record(json!({"src": "A", "amount": "6"}));
        assert!(!t.evaluate(&state, &rec, &mut cache).await);

        let mut cache = acquire_field_cache();
        let bad = record(json!({"src": "A", "amount": "lots"}));
        assert!(!t.evaluate(&state, &bad, &mut cache).await);

        let mut cache = acquire_field_cache();
        let rec = record(json!({"src": "A", "amount": 5}));
        assert!(t.evaluate(&state, &rec, &mut cache).await);
    }

    #[tokio::test]
    async fn local_classify_counts_distinct_members() {
        let counter = Arc::new(CounterCache::new(1024, 1 << 20));
        let index = Arc::new(ClassifyIndex::new(1024));
        let state = ThresholdState {
            counter: Some(&counter),
            classify: Some(&index),
            kv: None,
        };
        let t = threshold(CountType::Classify, ThresholdBackend::Local, 2);

        for port in ["22", "22", "80"] {
            let mut cache = acquire_field_cache();
            let rec = record(json!({"src": "A", "amount": port}));
            assert!(!t.evaluate(&state, &rec, &mut cache).await);
        }
        let mut cache = acquire_field_cache();
        let rec = record(json!({"src": "A", "amount": "443"}));
        assert!(t.evaluate(&state, &rec, &mut cache).await);

        // Fired groups start a fresh distinct set.
        let mut cache = acquire_field_cache();
        let rec = record(json!({"src": "A", "amount": "22"}));
        assert!(!t.evaluate(&state, &rec, &mut cache).await);
    }

    #[tokio::test]
    async fn remote_events_counts_through_the_kv() {
        let kv: Arc<dyn RemoteKv> = Arc::new(MemoryKv::new());
        let state = ThresholdState {
            counter: None,
            classify: None,
            kv: Some(&kv),
        };
        let t = threshold(CountType::Events, ThresholdBackend::Remote, 3);
        let rec = record(json!({"src": "A"}));

        for _ in 0..3 {
            let mut cache = acquire_field_cache();
            assert!(!t.evaluate(&state, &rec, &mut cache).await);
        }
        let mut cache = acquire_field_cache();
        assert!(t.evaluate(&state, &rec, &mut cache).await);
        let mut cache = acquire_field_cache();
        assert!(!t.evaluate(&state, &rec, &mut cache).await);
    }

    #[tokio::test]
    async fn remote_classify_scans_member_keys() {
        let kv: Arc<dyn RemoteKv> = Arc::new(MemoryKv::new());
        let state = ThresholdState {
            counter: None,
            classify: None,
            kv: Some(&kv),
        };
        let t = threshold(CountType::Classify, ThresholdBackend::Remote, 2);

        for user in ["alice", "alice", "bob"] {
            let mut cache = acquire_field_cache();
            let rec = record(json!({"src": "A", "amount": user}));
            assert!(!t.evaluate(&state, &rec, &mut cache).await);
        }
        let mut cache = acquire_field_cache();
        let rec = record(json!({"src": "A", "amount": "carol"}));
        assert!(t.evaluate(&state, &rec, &mut cache).await);
    }

    #[tokio::test]
    async fn missing_backend_fails_closed() {
        let state = ThresholdState {
            counter: None,
            classify: None,
            kv: None,
        };
        let local = threshold(CountType::Events, ThresholdBackend::Local, 1);
        let remote = threshold(CountType::Events, ThresholdBackend::Remote, 1);
        let rec = record(json!({"src": "A"}));

        let mut cache = acquire_field_cache();
        assert!(!local.evaluate(&state, &rec, &mut cache).await);
        let mut cache = acquire_field_cache();
        assert!(!remote.evaluate(&state, &rec, &mut cache).await);
    }
}
