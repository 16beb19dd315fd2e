//! Global response-time ring and TP90 engine (SPEC_FULL.md §4.1).
//!
//! Grounded on `examples/original_source/tsproxy/common.py`'s `FIFOList`
//! (time+count windowed ring with `checkout(prefix)` eviction) and
//! `examples/original_source/tsproxy/proxy.py`'s `ProxyStat.calc_tp90`.
//! The origin keeps this ring as a class-level (global) mutable list;
//! here it is an explicit, dependency-injected service (SPEC_FULL.md §9).

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// One observation: elapsed seconds (negative sentinel `-1.0` means the
/// attempt failed and contributes no latency sample), whether it was a
/// failure/timeout, and `"<proxy_short_name>/<resolved_ip>"`.
#[derive(Debug, Clone)]
pub struct RingEntry {
    pub elapsed: f64,
    pub failed: bool,
    pub key: String,
    inserted_at: Instant,
}

struct GlobalCache {
    value: f64,
    computed_at: Instant,
    len: usize,
}

pub struct StatStore {
    ring: RwLock<VecDeque<RingEntry>>,
    /// `100 * |pool|`-ish capacity; grows with `set_capacity` as proxies
    /// are added/removed.
    capacity: RwLock<usize>,
    ttl: Duration,
    global_cache: RwLock<GlobalCache>,
}

impl StatStore {
    pub fn new(initial_capacity: usize, ttl: Duration) -> Self {
        Self {
            ring: RwLock::new(VecDeque::new()),
            capacity: RwLock::new(initial_capacity),
            ttl,
            global_cache: RwLock::new(GlobalCache {
                value: 0.0,
                computed_at: Instant::now() - Duration::from_secs(3600),
                len: 0,
            }),
        }
    }

    pub async fn set_capacity(&self, capacity: usize) {
        *self.capacity.write().await = capacity.max(1);
    }

    /// Append one observation, evicting TTL-expired and over-capacity
    /// entries from the front (oldest first), matching `FIFOList`'s
    /// `_check_timeout_` called before every insert.
    pub async fn record(&self, key: &str, elapsed: f64, failed: bool) {
        let mut ring = self.ring.write().await;
        Self::evict(&mut ring, self.ttl, *self.capacity.read().await);
        ring.push_back(RingEntry {
            elapsed,
            failed,
            key: key.to_string(),
            inserted_at: Instant::now(),
        });
    }

    fn evict(ring: &mut VecDeque<RingEntry>, ttl: Duration, capacity: usize) {
        let now = Instant::now();
        while let Some(front) = ring.front() {
            if now.duration_since(front.inserted_at) > ttl {
                ring.pop_front();
            } else {
                break;
            }
        }
        while ring.len() > capacity {
            ring.pop_front();
        }
    }

    /// Removes every entry whose key starts with `prefix` — the literal
    /// mechanism backing "removing a proxy removes all ring entries whose
    /// third field starts with its short name" (SPEC_FULL.md §8).
    pub async fn checkout(&self, prefix: &str) {
        let mut ring = self.ring.write().await;
        ring.retain(|e| !e.key.starts_with(prefix));
    }

    /// Global TP90 over the whole ring, cached for 500ms. Mirrors the
    /// origin's cache short-circuit: if the freshly computed value is
    /// `< 0.1` (i.e. the current window is "nothing but failures") and a
    /// positive cached value exists, the stale cached value is returned
    /// instead. This is a deliberate compatibility decision, not a bug
    /// fix — see DESIGN.md.
    pub async fn tp90_global(&self) -> f64 {
        {
            let cache = self.global_cache.read().await;
            if cache.computed_at.elapsed() < Duration::from_millis(500) && cache.value > 0.0 {
                return cache.value;
            }
        }
        let ring = self.ring.read().await;
        let samples: Vec<f64> = ring.iter().filter(|e| e.elapsed >= 0.0).map(|e| e.elapsed).collect();
        let len = samples.len();
        let computed = calc_tp90(&samples);
        drop(ring);

        let mut cache = self.global_cache.write().await;
        if computed < 0.1 && cache.value > 0.0 {
            cache.computed_at = Instant::now();
            return cache.value;
        }
        cache.value = computed;
        cache.len = len;
        cache.computed_at = Instant::now();
        computed
    }

    /// `(tp90, sample_count)` for entries whose key starts with `prefix`.
    pub async fn tp90_for(&self, prefix: &str) -> (f64, usize) {
        let ring = self.ring.read().await;
        let samples: Vec<f64> = ring
            .iter()
            .filter(|e| e.key.starts_with(prefix) && e.elapsed >= 0.0)
            .map(|e| e.elapsed)
            .collect();
        let len = samples.len();
        (calc_tp90(&samples), len)
    }

    /// Count of recent ring entries for this proxy (`proxy_count` in the
    /// origin), regardless of outcome.
    pub async fn recent_count(&self, prefix: &str) -> usize {
        let ring = self.ring.read().await;
        ring.iter().filter(|e| e.key.starts_with(prefix)).count()
    }

    /// Count of recent failed/timeout entries for this proxy.
    pub async fn recent_fail_count(&self, prefix: &str) -> usize {
        let ring = self.ring.read().await;
        ring.iter().filter(|e| e.key.starts_with(prefix) && e.failed).count()
    }

    /// `(key, elapsed, failed)` for every live entry, for the persisted
    /// state snapshot. `inserted_at` isn't carried across restarts — a
    /// restored ring starts its TTL clock fresh from process start.
    pub async fn snapshot(&self) -> Vec<(String, f64, bool)> {
        self.ring.read().await.iter().map(|e| (e.key.clone(), e.elapsed, e.failed)).collect()
    }

    pub async fn restore(&self, entries: Vec<(String, f64, bool)>) {
        let mut ring = self.ring.write().await;
        let now = Instant::now();
        for (key, elapsed, failed) in entries {
            ring.push_back(RingEntry { elapsed, failed, key, inserted_at: now });
        }
    }
}

/// 90th percentile by the origin's definition: with N samples, drop the
/// top `floor(N * 0.1)` and return the largest of what remains.
pub fn calc_tp90(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let c90 = (samples.len() as f64 * 0.1) as usize;
    let mut count = 0usize;
    for v in sorted {
        count += 1;
        if count > c90 {
            return v;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp90_drops_top_decile() {
        // 10 samples 1..=10: drop top 1 (the "10"), largest remaining is 9.
        let samples: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(calc_tp90(&samples), 9.0);
    }

    #[test]
    fn tp90_empty_is_zero() {
        assert_eq!(calc_tp90(&[]), 0.0);
    }

    #[tokio::test]
    async fn checkout_removes_matching_prefix_only() {
        let store = StatStore::new(1000, Duration::from_secs(3 * 3600));
        store.record("alpha/1.2.3.4", 0.5, false).await;
        store.record("alpha/5.6.7.8", 0.6, false).await;
        store.record("beta/1.2.3.4", 0.7, false).await;
        store.checkout("alpha").await;
        assert_eq!(store.recent_count("alpha").await, 0);
        assert_eq!(store.recent_count("beta").await, 1);
    }

    #[tokio::test]
    async fn capacity_eviction_drops_oldest_first() {
        let store = StatStore::new(2, Duration::from_secs(3600));
        store.record("a", 0.1, false).await;
        store.record("a", 0.2, false).await;
        store.record("a", 0.3, false).await;
        assert_eq!(store.recent_count("a").await, 2);
    }
}
