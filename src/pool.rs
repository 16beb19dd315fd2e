//! Proxy pool: ordered list with head discipline, sort-key ranking, and
//! per-proxy derived health signals (SPEC_FULL.md §3, §4.1, §4.2).
//!
//! Grounded on `examples/original_source/tsproxy/proxyholder.py`
//! (`ProxyHolder`: `proxy_list`/`proxy_dict`, `sort_proxies`,
//! `move_head_to_tail`, `try_select_head_proxy`) and
//! `examples/original_source/tsproxy/proxy.py` (`Proxy`/`ProxyStat`: the
//! `sort_key`/`fail_rate`/`tp90_increment`/`sort_key_decrement`
//! formulas).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Thresholds;
use crate::stat::StatStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Direct,
    Http,
    Socks5,
    Shadowsocks,
}

/// Per-proxy fields the handshake codecs need beyond hostname/port: a
/// Shadowsocks password/method (hot-reloadable from a `<host>.json`
/// sidecar) or nothing at all for SOCKS5/HTTP/Direct.
#[derive(Debug, Clone, Default)]
pub struct ProxyCredentials {
    pub password: Option<String>,
    pub method: Option<String>,
    pub sidecar_path: Option<std::path::PathBuf>,
    pub sidecar_mtime: Option<std::time::SystemTime>,
}

struct ProxyState {
    pause: bool,
    auto_paused: bool,
    resolved_addr: Option<IpAddr>,
    /// Seconds-since-epoch-ish monotonic stamp of the last demotion; the
    /// origin compares `error_time < retry_interval_on_error * error_count`
    /// using wall-clock floats, reproduced here with `Instant` deltas.
    error_time: Instant,
    error_count: u32,
    head_time: Option<Instant>,
    sort_key_onhead: f64,
    down_speed: f64,
    down_speed_set_time: Instant,
    last_tp90: f64,
    sort_key_cache: Option<(f64, Instant)>,
    sess_count: u64,
    total_count: HashMap<IpAddr, u64>,
    total_fail: HashMap<IpAddr, u64>,
    credentials: ProxyCredentials,
}

impl ProxyState {
    fn new() -> Self {
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(365 * 24 * 3600))
            .unwrap_or_else(Instant::now);
        ProxyState {
            pause: false,
            auto_paused: false,
            resolved_addr: None,
            error_time: long_ago,
            error_count: 0,
            head_time: None,
            sort_key_onhead: 0.0,
            down_speed: 0.0,
            down_speed_set_time: long_ago,
            last_tp90: 0.0,
            sort_key_cache: None,
            sess_count: 0,
            total_count: HashMap::new(),
            total_fail: HashMap::new(),
            credentials: ProxyCredentials::default(),
        }
    }
}

pub struct Proxy {
    pub hostname: String,
    pub port: u16,
    pub short_hostname: String,
    pub kind: ProxyKind,
    state: RwLock<ProxyState>,
}

impl Proxy {
    pub fn new(hostname: impl Into<String>, port: u16, short_hostname: impl Into<String>, kind: ProxyKind) -> Self {
        Proxy {
            hostname: hostname.into(),
            port,
            short_hostname: short_hostname.into(),
            kind,
            state: RwLock::new(ProxyState::new()),
        }
    }

    pub async fn pause(&self) -> bool {
        self.state.read().await.pause
    }

    pub async fn set_pause(&self, pause: bool) {
        self.state.write().await.pause = pause;
    }

    pub async fn resolved_addr(&self) -> Option<IpAddr> {
        self.state.read().await.resolved_addr
    }

    /// Records a newly resolved address. If it differs from the previous
    /// one, the stale IP's per-IP lifetime counters are dropped, matching
    /// the origin's `resolved_addr` setter.
    pub async fn set_resolved_addr(&self, addr: IpAddr) {
        let mut state = self.state.write().await;
        if state.resolved_addr != Some(addr) {
            if let Some(old) = state.resolved_addr {
                state.total_count.remove(&old);
                state.total_fail.remove(&old);
            }
            state.resolved_addr = Some(addr);
        }
    }

    pub async fn credentials(&self) -> ProxyCredentials {
        self.state.read().await.credentials.clone()
    }

    pub async fn set_credentials(&self, credentials: ProxyCredentials) {
        self.state.write().await.credentials = credentials;
    }

    /// Re-reads the `<host>.json` sidecar if its mtime changed, matching
    /// the origin's hot-reloadable Shadowsocks password/method.
    pub async fn reload_credentials_if_stale(&self) {
        let path = {
            let state = self.state.read().await;
            match state.credentials.sidecar_path.clone() {
                Some(p) => p,
                None => return,
            }
        };
        let Ok(metadata) = std::fs::metadata(&path) else { return };
        let mtime = metadata.modified().ok();
        {
            let state = self.state.read().await;
            if mtime.is_some() && mtime == state.credentials.sidecar_mtime {
                return;
            }
        }
        let Ok(text) = std::fs::read_to_string(&path) else { return };
        let Ok(json): Result<serde_json::Value, _> = serde_json::from_str(&text) else { return };
        let password = json.get("password").and_then(|v| v.as_str()).map(|s| s.to_string());
        let method = json.get("method").and_then(|v| v.as_str()).map(|s| s.to_string());
        let mut state = self.state.write().await;
        state.credentials.password = password;
        state.credentials.method = method;
        state.credentials.sidecar_mtime = mtime;
    }

    pub async fn error_count(&self) -> u32 {
        self.state.read().await.error_count
    }

    pub async fn error_elapsed_secs(&self) -> f64 {
        self.state.read().await.error_time.elapsed().as_secs_f64()
    }

    pub async fn down_speed(&self) -> f64 {
        self.state.read().await.down_speed
    }

    pub async fn set_down_speed(&self, speed: f64) {
        let mut state = self.state.write().await;
        state.down_speed = speed;
        state.down_speed_set_time = Instant::now();
    }

    pub async fn sess_count(&self) -> u64 {
        self.state.read().await.sess_count
    }

    /// Called once per accepted connection while this proxy is the head,
    /// regardless of the connection's eventual outcome (SPEC_FULL.md §4.2
    /// resolved supplement).
    pub async fn increment_sess_count(&self) {
        self.state.write().await.sess_count += 1;
    }

    /// `(fail_count, total_count, resolved_addr)` stat bump for one
    /// finished attempt: `elapsed < 0.0` marks a failure/timeout and does
    /// not contribute a latency sample.
    pub async fn record_outcome(&self, stats: &StatStore, addr: IpAddr, elapsed: f64, failed: bool) {
        let key = format!("{}/{}", self.short_hostname, addr);
        stats.record(&key, elapsed, failed).await;
        let mut state = self.state.write().await;
        *state.total_count.entry(addr).or_insert(0) += 1;
        if failed {
            *state.total_fail.entry(addr).or_insert(0) += 1;
        }
    }

    pub async fn record_error(&self) {
        let mut state = self.state.write().await;
        state.error_time = Instant::now();
        state.error_count += 1;
    }

    fn prefix(&self) -> &str {
        &self.short_hostname
    }

    pub async fn tp90(&self, stats: &StatStore) -> f64 {
        stats.tp90_for(self.prefix()).await.0
    }

    pub async fn tp90_len(&self, stats: &StatStore) -> usize {
        stats.tp90_for(self.prefix()).await.1
    }

    pub async fn recent_count(&self, stats: &StatStore) -> usize {
        stats.recent_count(self.prefix()).await
    }

    async fn total_count(&self) -> u64 {
        self.state.read().await.total_count.values().sum()
    }

    async fn total_fail(&self) -> u64 {
        self.state.read().await.total_fail.values().sum()
    }

    /// `fail_rate`: recent-window failure ratio. `<= 10` samples return 0
    /// unless at least 5 of them failed (the origin's anti-noise floor).
    pub async fn fail_rate(&self, stats: &StatStore) -> f64 {
        let proxy_count = stats.recent_count(self.prefix()).await;
        let fail_count = stats.recent_fail_count(self.prefix()).await;
        let total_count = self.total_count().await;
        let total_fail = self.total_fail().await;
        if total_count > 10 && total_count == total_fail {
            return 1.0;
        }
        if proxy_count <= 10 {
            if fail_count >= 5 {
                return fail_count as f64 / proxy_count as f64;
            }
            return 0.0;
        }
        fail_count as f64 / proxy_count as f64
    }

    /// `total_fail_rate`: lifetime failure ratio, same anti-noise floor.
    pub async fn total_fail_rate(&self) -> f64 {
        let total_count = self.total_count().await;
        let total_fail = self.total_fail().await;
        if total_count <= 10 {
            if total_fail >= 5 {
                return total_fail as f64 / total_count as f64;
            }
            return 0.0;
        }
        total_fail as f64 / total_count as f64
    }

    /// `sort_key`: composite throughput/reliability/latency ranking score,
    /// cached for 500ms. `global_tp90` must already be computed by the
    /// caller (shared across every proxy's evaluation in one pass).
    pub async fn sort_key(&self, stats: &StatStore, thresholds: &Thresholds, global_tp90: f64) -> f64 {
        {
            let state = self.state.read().await;
            if let Some((value, at)) = state.sort_key_cache {
                if at.elapsed() < Duration::from_millis(500) {
                    return value;
                }
            }
        }
        if global_tp90 <= 0.0 {
            return 0.0;
        }
        let down_speed = self.down_speed().await;
        if down_speed <= 0.0 {
            let mut state = self.state.write().await;
            state.sort_key_cache = Some((0.0, Instant::now()));
            return 0.0;
        }

        let (tp90, tp90_len) = stats.tp90_for(self.prefix()).await;
        let proxy_count = stats.recent_count(self.prefix()).await;

        let fail_rate = if tp90_len == 0 || proxy_count as f64 >= thresholds.tp90_calc_count as f64 * 0.9 {
            self.fail_rate(stats).await
        } else {
            self.total_fail_rate().await
        };
        let f1 = (1.0 - fail_rate).powi(3);

        let mut f2 = (global_tp90 - round1(tp90)) / global_tp90 + 0.9f64.powi(4);
        f2 = if f2 > 0.0 { f2.powf(0.25) } else { 0.0 };

        let s = (down_speed / 102400.0).round();
        let sort_key = s * f1 * f2 * 10.0;

        let mut state = self.state.write().await;
        state.sort_key_cache = Some((sort_key, Instant::now()));
        sort_key
    }

    /// `(increment_ratio, last_tp90, increment)` versus the TP90 value
    /// cached by the last `reset_stat_info` call.
    pub async fn tp90_increment(&self, stats: &StatStore) -> (f64, f64, f64) {
        let tp90 = self.tp90(stats).await;
        let last_tp90 = self.state.read().await.last_tp90;
        let inc = tp90 - last_tp90;
        if last_tp90 < 0.1 {
            (0.0, last_tp90, inc)
        } else {
            (inc / last_tp90, last_tp90, inc)
        }
    }

    /// `(decrement_ratio, last_sort_key)` versus the sort_key cached when
    /// this proxy was last promoted to head.
    pub async fn sort_key_decrement(&self, stats: &StatStore, thresholds: &Thresholds, global_tp90: f64) -> (f64, f64) {
        let current = self.sort_key(stats, thresholds, global_tp90).await;
        let state = self.state.read().await;
        let onhead = state.sort_key_onhead;
        drop(state);
        if onhead == 0.0 {
            (0.0, 0.0)
        } else {
            ((onhead - current) / onhead, onhead)
        }
    }

    /// Stamps `head_time` and snapshots the current sort_key as the
    /// baseline for future `sort_key_decrement` comparisons.
    pub async fn promote_to_head(&self, stats: &StatStore, thresholds: &Thresholds, global_tp90: f64) {
        let sort_key = self.sort_key(stats, thresholds, global_tp90).await;
        let mut state = self.state.write().await;
        state.head_time = Some(Instant::now());
        state.sort_key_onhead = sort_key;
    }

    pub async fn head_time(&self) -> Option<Instant> {
        self.state.read().await.head_time
    }

    /// Saves the current TP90 as the new baseline and zeroes `sess_count`,
    /// matching `reset_stat_info()`'s `save_last_tp90()` + `sess_count=0`.
    pub async fn reset_stat_info(&self, stats: &StatStore) {
        let tp90 = self.tp90(stats).await;
        let mut state = self.state.write().await;
        state.last_tp90 = tp90;
        state.sess_count = 0;
    }

    pub async fn is_auto_paused(&self) -> bool {
        self.state.read().await.auto_paused
    }

    async fn set_auto_paused(&self, value: bool) {
        self.state.write().await.auto_paused = value;
    }
}

/// `sort_proxies`: paused proxies sort after everything else; among the
/// rest, larger `sort_key` sorts first.
fn sort_key_rank(pause: bool, sort_key: f64) -> f64 {
    if pause {
        100.0
    } else {
        -sort_key
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub struct ProxyPool {
    proxies: RwLock<Vec<Arc<Proxy>>>,
    fix_top: AtomicBool,
    available: AtomicBool,
    stats: Arc<StatStore>,
    thresholds: Thresholds,
}

impl ProxyPool {
    pub fn new(stats: Arc<StatStore>, thresholds: Thresholds) -> Self {
        ProxyPool {
            proxies: RwLock::new(Vec::new()),
            fix_top: AtomicBool::new(false),
            available: AtomicBool::new(true),
            stats,
            thresholds,
        }
    }

    pub async fn add(&self, proxy: Arc<Proxy>, insert_at_front: bool) {
        let mut proxies = self.proxies.write().await;
        if insert_at_front {
            proxies.insert(0, proxy);
        } else {
            proxies.push(proxy);
        }
        self.stats.set_capacity(self.thresholds.tp90_calc_count * proxies.len().max(1)).await;
    }

    pub async fn remove(&self, short_hostname: &str) -> Option<Arc<Proxy>> {
        let mut proxies = self.proxies.write().await;
        let idx = proxies.iter().position(|p| p.short_hostname == short_hostname)?;
        let removed = proxies.remove(idx);
        self.stats.checkout(&removed.short_hostname).await;
        self.stats.set_capacity(self.thresholds.tp90_calc_count * proxies.len().max(1)).await;
        Some(removed)
    }

    pub async fn find(&self, name_or_host: &str) -> Option<Arc<Proxy>> {
        let proxies = self.proxies.read().await;
        proxies
            .iter()
            .find(|p| p.short_hostname == name_or_host || p.hostname == name_or_host)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.proxies.read().await.len()
    }

    pub async fn head(&self) -> Option<Arc<Proxy>> {
        self.proxies.read().await.first().cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Proxy>> {
        self.proxies.read().await.clone()
    }

    pub fn fix_top(&self) -> bool {
        self.fix_top.load(Ordering::Relaxed)
    }

    pub fn set_fix_top(&self, value: bool) {
        self.fix_top.store(value, Ordering::Relaxed);
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn set_available(&self, value: bool) {
        let was = self.available.swap(value, Ordering::Relaxed);
        if was != value {
            warn!("TSProxy status: {}", if value { "available" } else { "unavailable" });
        }
    }

    async fn global_tp90(&self) -> f64 {
        round1(self.stats.tp90_global().await)
    }

    /// Sorts the pool in place by `sort_proxies` rank (paused last,
    /// otherwise descending `sort_key`).
    async fn resort(&self) {
        let global_tp90 = self.global_tp90().await;
        let mut ranked = Vec::new();
        for p in self.proxies.read().await.iter() {
            let pause = p.pause().await;
            let key = if pause {
                100.0
            } else {
                -p.sort_key(&self.stats, &self.thresholds, global_tp90).await
            };
            ranked.push((key, p.clone()));
        }
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        *self.proxies.write().await = ranked.into_iter().map(|(_, p)| p).collect();
    }

    /// Moves the current head to the tail (skipping past any paused
    /// proxies that land at the new front), then tries to promote a new
    /// head by force. No-op on a single-proxy pool.
    pub async fn move_head_to_tail(&self, expected_head: &Arc<Proxy>, reason: &str) -> bool {
        let len = self.len().await;
        if len <= 1 {
            return false;
        }
        {
            let proxies = self.proxies.read().await;
            match proxies.first() {
                Some(h) if Arc::ptr_eq(h, expected_head) => {}
                _ => return false,
            }
        }
        info!("move_head_to_tail({}): {}", expected_head.short_hostname, reason);
        self.set_fix_top(false);
        expected_head.record_error().await;

        let mut proxies = self.proxies.write().await;
        let head = proxies.remove(0);
        proxies.push(head);
        let n = proxies.len();
        for _ in 1..n.saturating_sub(1) {
            if !proxies[0].pause().await {
                break;
            }
            let p = proxies.remove(0);
            proxies.push(p);
        }
        drop(proxies);

        self.try_select_head_proxy(true, false, 1.1).await;
        true
    }

    /// Searches the pool (excluding the head unless `force_to_head`) for a
    /// proxy eligible to become head, per the origin's five gates:
    /// retry-cooldown, not paused / not cold-with-traffic, `tp90` within
    /// `tp90_factor` of the current head (or force mode with acceptable
    /// `fail_rate`), and sort_key not worse than the head's (unless
    /// forced). `only_select` reports the candidate without promoting it.
    pub async fn try_select_head_proxy(
        &self,
        force_to_head: bool,
        only_select: bool,
        tp90_factor: f64,
    ) -> Option<Arc<Proxy>> {
        let len = self.len().await;
        if len <= 1 {
            return None;
        }
        if self.fix_top() {
            return None;
        }

        let global_tp90 = self.global_tp90().await;
        let proxies = self.proxies.read().await.clone();
        let head = proxies[0].clone();
        let head_sort_key = head.sort_key(&self.stats, &self.thresholds, global_tp90).await;
        let head_tp90 = head.tp90(&self.stats).await;

        let (start, end) = if force_to_head && !only_select {
            (0, proxies.len() - 1)
        } else {
            (1, proxies.len())
        };
        let mut candidates = proxies[start..end].to_vec();
        let mut ranked: Vec<(f64, Arc<Proxy>)> = Vec::new();
        for p in candidates.drain(..) {
            let pause = p.pause().await;
            let key = if pause {
                100.0
            } else {
                -p.sort_key(&self.stats, &self.thresholds, global_tp90).await
            };
            ranked.push((key, p));
        }
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        for (_, proxy) in ranked {
            let sort_key = proxy.sort_key(&self.stats, &self.thresholds, global_tp90).await;
            if head_sort_key > sort_key && !force_to_head {
                debug!(
                    "try_select_head_proxy(): NOT move {} to HEAD, sort_key {} <= head's {}",
                    proxy.short_hostname, sort_key, head_sort_key
                );
                break;
            }
            let tp90 = proxy.tp90(&self.stats).await;
            let fail_rate = proxy.fail_rate(&self.stats).await;
            if !(tp90 <= head_tp90 * tp90_factor || (force_to_head && fail_rate <= self.thresholds.fail_rate_threshold)) {
                continue;
            }
            let error_count = proxy.error_count().await;
            if proxy.error_elapsed_secs().await < self.thresholds.retry_interval_on_error_secs as f64 * error_count as f64 {
                continue;
            }
            let tp90_len = proxy.tp90_len(&self.stats).await;
            let total_count = proxy.total_count().await;
            if proxy.pause().await || (tp90_len == 0 && total_count > 0) {
                continue;
            }

            if only_select {
                return Some(proxy);
            }

            proxy.reset_stat_info(&self.stats).await;
            if !Arc::ptr_eq(&proxy, &head) {
                let mut proxies = self.proxies.write().await;
                if let Some(idx) = proxies.iter().position(|p| Arc::ptr_eq(p, &proxy)) {
                    let p = proxies.remove(idx);
                    proxies.insert(0, p);
                }
                drop(proxies);
                info!(
                    "try_select_HEAD_proxy(): select {} to HEAD {{global_tp90={:.1}}} old_head={}",
                    proxy.short_hostname, global_tp90, head.short_hostname
                );
            }
            proxy.promote_to_head(&self.stats, &self.thresholds, global_tp90).await;
            self.set_available(true);
            return Some(proxy);
        }

        if force_to_head {
            if !only_select {
                self.set_available(false);
            }
            warn!("try_select_HEAD_proxy(): sorry, we CAN NOT select head proxy");
        }
        None
    }

    /// One sweep of the auto-pause/resume hysteresis over every non-head
    /// proxy: pause when `tp90 >= global_tp90*3` with `>10` samples, or
    /// `proxy_count > 10` and `fail_rate >= auto_pause_fail_rate_threshold`
    /// (0.3); resume only a proxy this sweep previously auto-paused, once
    /// both conditions relax below the (lower, 0.2) `fail_rate_threshold`.
    pub async fn auto_pause_sweep(&self) {
        let global_tp90 = self.global_tp90().await;
        let proxies = self.proxies.read().await.clone();
        for proxy in proxies.iter().skip(1) {
            let pause = proxy.pause().await;
            if !pause {
                let tp90 = proxy.tp90(&self.stats).await;
                let tp90_len = proxy.tp90_len(&self.stats).await;
                let proxy_count = proxy.recent_count(&self.stats).await;
                let fail_rate = proxy.fail_rate(&self.stats).await;
                if (tp90 >= global_tp90 * 3.0 && tp90_len > 10)
                    || (proxy_count > 10 && fail_rate >= self.thresholds.auto_pause_fail_rate_threshold)
                {
                    proxy.set_pause(true).await;
                    proxy.set_auto_paused(true).await;
                    info!("{} auto pause", proxy.short_hostname);
                }
            } else if proxy.is_auto_paused().await {
                let tp90 = proxy.tp90(&self.stats).await;
                let tp90_len = proxy.tp90_len(&self.stats).await;
                let proxy_count = proxy.recent_count(&self.stats).await;
                let fail_rate = proxy.fail_rate(&self.stats).await;
                if (tp90 <= global_tp90 || tp90_len <= 10)
                    && (proxy_count <= 10 || fail_rate < self.thresholds.fail_rate_threshold)
                {
                    proxy.set_pause(false).await;
                    proxy.set_auto_paused(false).await;
                    info!("{} auto resume", proxy.short_hostname);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds::default()
    }

    #[tokio::test]
    async fn fail_rate_is_zero_below_noise_floor() {
        let stats = Arc::new(StatStore::new(1000, Duration::from_secs(3600)));
        let proxy = Proxy::new("p1.example.com", 1080, "p1", ProxyKind::Socks5);
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        for _ in 0..3 {
            proxy.record_outcome(&stats, addr, 0.2, false).await;
        }
        proxy.record_outcome(&stats, addr, -1.0, true).await;
        assert_eq!(proxy.fail_rate(&stats).await, 0.0);
    }

    #[tokio::test]
    async fn fail_rate_counts_once_past_noise_floor() {
        let stats = Arc::new(StatStore::new(1000, Duration::from_secs(3600)));
        let proxy = Proxy::new("p1.example.com", 1080, "p1", ProxyKind::Socks5);
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        for _ in 0..5 {
            proxy.record_outcome(&stats, addr, -1.0, true).await;
        }
        proxy.record_outcome(&stats, addr, 0.1, false).await;
        assert!((proxy.fail_rate(&stats).await - (5.0 / 6.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pool_move_head_to_tail_noop_on_single_proxy() {
        let stats = Arc::new(StatStore::new(1000, Duration::from_secs(3600)));
        let pool = ProxyPool::new(stats, thresholds());
        let p = Arc::new(Proxy::new("only.example.com", 1080, "only", ProxyKind::Socks5));
        pool.add(p.clone(), false).await;
        assert!(!pool.move_head_to_tail(&p, "test").await);
    }
}
