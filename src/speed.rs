//! Speed sites list, per-domain fastest-proxy map, and the throughput
//! probe that populates both (SPEC_FULL.md §4.1 domain-speed map, §4.5
//! speed test, §8 scenario 4).
//!
//! Grounded on `examples/original_source/tsproxy/proxyholder.py`
//! (`test_proxies_speed`, `domain_speed_map`, `speed_host_map`) for the
//! probe/averaging/promotion algorithm; `examples/original_source/tsproxy/
//! common.py` for the plain-text speed-sites file format (one host suffix
//! per line, `-`-prefixed entries blacklisted).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::codec::{http_connect, shadowsocks, socks5, Target};
use crate::config::Thresholds;
use crate::dns::DnsResolver;
use crate::pool::{Proxy, ProxyKind, ProxyPool};

/// Host suffixes eligible for throughput probing, plus a blacklist of
/// suffixes (`-`-prefixed lines) excluded even if a broader entry would
/// otherwise match.
pub struct SpeedSites {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl SpeedSites {
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut allow = Vec::new();
        let mut deny = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('-') {
                deny.push(rest.trim().to_string());
            } else {
                allow.push(line.to_string());
            }
        }
        Ok(SpeedSites { allow, deny })
    }

    pub fn empty() -> Self {
        SpeedSites { allow: Vec::new(), deny: Vec::new() }
    }

    /// The configured speed-host suffix `host` falls under, if any and not
    /// blacklisted.
    pub fn speed_host_for(&self, host: &str) -> Option<&str> {
        if self.deny.iter().any(|d| host.ends_with(d.as_str())) {
            return None;
        }
        self.allow.iter().map(|s| s.as_str()).find(|suffix| host.ends_with(suffix))
    }

    pub fn sites(&self) -> &[String] {
        &self.allow
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedEntry {
    pub bytes_per_sec: f64,
    #[serde(skip, default = "Instant::now")]
    pub measured_at: Instant,
}

/// `speed_host -> "<proxy_short_name>/<resolved_ip>" -> throughput`,
/// guarded by the pool mutex in the origin; here its own lock since
/// consultation (forwarding engine) and mutation (speed prober) don't
/// otherwise share state with the pool.
pub struct DomainSpeedMap {
    map: RwLock<HashMap<String, HashMap<String, SpeedEntry>>>,
}

impl DomainSpeedMap {
    pub fn new() -> Self {
        DomainSpeedMap { map: RwLock::new(HashMap::new()) }
    }

    pub async fn record(&self, speed_host: &str, proxy_ip_key: &str, bytes_per_sec: f64) {
        let mut map = self.map.write().await;
        map.entry(speed_host.to_string())
            .or_default()
            .insert(proxy_ip_key.to_string(), SpeedEntry { bytes_per_sec, measured_at: Instant::now() });
    }

    /// The fastest non-expired entry for `speed_host`, `(proxy_short_name,
    /// ip, bytes_per_sec)`. Entries older than `lifetime` are treated as
    /// unknown speed and skipped, matching `speed_lifetime`'s expiry.
    pub async fn fastest(&self, speed_host: &str, lifetime: Duration) -> Option<(String, IpAddr, f64)> {
        let map = self.map.read().await;
        let entries = map.get(speed_host)?;
        entries
            .iter()
            .filter(|(_, e)| e.measured_at.elapsed() < lifetime)
            .filter_map(|(key, e)| {
                let (name, ip) = key.split_once('/')?;
                let ip: IpAddr = ip.parse().ok()?;
                Some((name.to_string(), ip, e.bytes_per_sec))
            })
            .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Removes every proxy-keyed entry belonging to `short_name`, mirroring
    /// the pool-remove invariant that a removed proxy's speed-map entries
    /// disappear with it.
    pub async fn remove_proxy(&self, short_name: &str) {
        let prefix = format!("{}/", short_name);
        let mut map = self.map.write().await;
        for entries in map.values_mut() {
            entries.retain(|k, _| !k.starts_with(&prefix));
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, HashMap<String, f64>> {
        self.map
            .read()
            .await
            .iter()
            .map(|(host, entries)| (host.clone(), entries.iter().map(|(k, e)| (k.clone(), e.bytes_per_sec)).collect()))
            .collect()
    }

    pub async fn restore(&self, snapshot: HashMap<String, HashMap<String, f64>>) {
        let mut map = self.map.write().await;
        for (host, entries) in snapshot {
            let dest = map.entry(host).or_default();
            for (key, speed) in entries {
                dest.insert(key, SpeedEntry { bytes_per_sec: speed, measured_at: Instant::now() });
            }
        }
    }

    pub async fn dump(&self) -> String {
        let map = self.map.read().await;
        if map.is_empty() {
            return "(no domain speed data)".to_string();
        }
        let mut lines = Vec::new();
        for (host, entries) in map.iter() {
            for (key, e) in entries.iter() {
                lines.push(format!("{} {} {:.0}B/s", host, key, e.bytes_per_sec));
            }
        }
        lines.join("\n")
    }
}

impl Default for DomainSpeedMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives `test_proxies_speed`: probes every eligible proxy against every
/// configured speed site, averages same-ballpark retries, and records the
/// result both on the `Proxy` (`down_speed`) and in the domain-speed map.
pub struct SpeedProber {
    pool: Arc<ProxyPool>,
    dns: Arc<DnsResolver>,
    thresholds: Thresholds,
    sites: Arc<RwLock<SpeedSites>>,
    pub domain_map: Arc<DomainSpeedMap>,
}

impl SpeedProber {
    /// `sites` and `domain_map` are shared with the forwarding engine (the
    /// engine reads the map to steer `ANY_PROXY` connects; this prober is
    /// the map's only writer) so both ends of main.rs's wiring take the
    /// same `Arc`s.
    pub fn new(pool: Arc<ProxyPool>, dns: Arc<DnsResolver>, thresholds: Thresholds, sites: Arc<RwLock<SpeedSites>>, domain_map: Arc<DomainSpeedMap>) -> Self {
        SpeedProber { pool, dns, thresholds, sites, domain_map }
    }

    pub async fn reload_sites(&self, path: &Path) {
        match SpeedSites::load(path) {
            Ok(sites) => *self.sites.write().await = sites,
            Err(e) => warn!("could not load speed sites file {:?}: {}", path, e),
        }
    }

    /// One full sweep: every non-paused proxy against every speed site.
    /// Returns a human-readable summary for the admin `/speed`/`/fspeed`
    /// commands.
    pub async fn run_once(&self) -> String {
        let sites: Vec<String> = self.sites.read().await.sites().to_vec();
        if sites.is_empty() {
            return "(no speed sites configured)".to_string();
        }
        let proxies = self.pool.all().await;
        let mut report = Vec::new();

        for proxy in &proxies {
            if proxy.pause().await {
                continue;
            }
            for site in &sites {
                match self.probe_averaged(proxy, site).await {
                    Ok((ip, speed)) => {
                        let key = format!("{}/{}", proxy.short_hostname, ip);
                        self.domain_map.record(site, &key, speed).await;
                        proxy.set_down_speed(speed).await;
                        report.push(format!("{} {} -> {:.0}B/s", proxy.short_hostname, site, speed));
                    }
                    Err(e) => debug!("speed probe {} via {} failed: {}", site, proxy.short_hostname, e),
                }
            }
        }

        self.pool
            .try_select_head_proxy(true, false, self.thresholds.global_tp90_threshold.max(1.1))
            .await;

        if report.is_empty() {
            "(no successful speed probes)".to_string()
        } else {
            report.join("\n")
        }
    }

    /// Probes `site` through `proxy` up to `speed_retry_count` times,
    /// keeping only samples whose max/min ratio stays within
    /// `speed_average_threshold` percent of each other, then averages them
    /// — the ratio-tolerance simplification of the origin's incremental
    /// buffer-size gate (see DESIGN.md).
    async fn probe_averaged(&self, proxy: &Arc<Proxy>, site: &str) -> anyhow::Result<(IpAddr, f64)> {
        let mut samples = Vec::new();
        let mut last_ip = None;
        for _ in 0..self.thresholds.speed_retry_count.max(1) {
            match self.probe_once(proxy, site).await {
                Ok((ip, speed)) => {
                    last_ip = Some(ip);
                    samples.push(speed);
                }
                Err(e) => debug!("speed probe attempt failed: {}", e),
            }
        }
        if samples.is_empty() {
            anyhow::bail!("all probe attempts failed");
        }
        let max = samples.iter().cloned().fold(f64::MIN, f64::max);
        let min = samples.iter().cloned().fold(f64::MAX, f64::min);
        let tolerance = 1.0 + self.thresholds.speed_average_threshold / 100.0;
        let kept: Vec<f64> = if min > 0.0 && max / min <= tolerance {
            samples
        } else {
            vec![max]
        };
        let avg = kept.iter().sum::<f64>() / kept.len() as f64;
        Ok((last_ip.expect("at least one sample recorded"), avg))
    }

    async fn probe_once(&self, proxy: &Arc<Proxy>, site: &str) -> anyhow::Result<(IpAddr, f64)> {
        let timeout = Duration::from_secs(self.thresholds.speed_test_timeout_secs);
        let proxy_ip = match proxy.resolved_addr().await {
            Some(ip) => ip,
            None => {
                let ip = self.dns.resolve_one(&proxy.hostname).await?;
                proxy.set_resolved_addr(ip).await;
                ip
            }
        };

        let mut tcp = tokio::time::timeout(timeout, TcpStream::connect((proxy_ip, proxy.port))).await??;
        let target = Target::Domain(site.to_string());

        match proxy.kind {
            ProxyKind::Direct => {}
            ProxyKind::Socks5 => {
                tokio::time::timeout(timeout, socks5::handshake(&mut tcp, &target, 80)).await??;
            }
            ProxyKind::Shadowsocks => {
                proxy.reload_credentials_if_stale().await;
                let creds = proxy.credentials().await;
                let password = creds.password.ok_or_else(|| anyhow::anyhow!("missing shadowsocks password"))?;
                let method = creds.method.ok_or_else(|| anyhow::anyhow!("missing shadowsocks method"))?;
                let cryptor = shadowsocks::Cryptor::new(&password, &method)?;
                let mut wrapped = tokio::time::timeout(timeout, shadowsocks::connect(tcp, &cryptor, &target, 80)).await??;
                return self.read_and_time(&mut wrapped, site, proxy_ip, timeout).await;
            }
            ProxyKind::Http => {
                tokio::time::timeout(timeout, http_connect::handshake(&mut tcp, site, 80, &[])).await??;
            }
        }
        self.read_and_time(&mut tcp, site, proxy_ip, timeout).await
    }

    async fn read_and_time<S>(&self, stream: &mut S, site: &str, proxy_ip: IpAddr, timeout: Duration) -> anyhow::Result<(IpAddr, f64)>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let request = format!("GET / HTTP/1.1\r\nHost: {site}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        let start = Instant::now();
        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match tokio::time::timeout(timeout.saturating_sub(start.elapsed()), stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n as u64,
                Ok(Err(_)) => break,
                Err(_) => break,
            }
            if start.elapsed() >= timeout {
                break;
            }
        }
        let secs = start.elapsed().as_secs_f64().max(0.001);
        Ok((proxy_ip, total as f64 / secs))
    }
}

/// Load path convenience matching `PathsConfig::speed_sites`.
pub fn default_sites_path() -> PathBuf {
    PathBuf::from("speed_sites.conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_sites_parses_allow_and_deny() {
        let dir = std::env::temp_dir().join(format!("speedsites-{:?}", std::thread::current().id()));
        std::fs::write(&dir, "example.com\n-ads.example.com\n# comment\n").unwrap();
        let sites = SpeedSites::load(&dir).unwrap();
        assert!(sites.speed_host_for("www.example.com").is_some());
        assert!(sites.speed_host_for("www.ads.example.com").is_none());
        std::fs::remove_file(&dir).ok();
    }

    #[tokio::test]
    async fn domain_speed_map_returns_fastest() {
        let map = DomainSpeedMap::new();
        map.record("example.com", "a/1.2.3.4", 1000.0).await;
        map.record("example.com", "b/5.6.7.8", 5000.0).await;
        let (name, _, speed) = map.fastest("example.com", Duration::from_secs(3600)).await.unwrap();
        assert_eq!(name, "b");
        assert_eq!(speed, 5000.0);
    }

    #[tokio::test]
    async fn domain_speed_map_removes_by_proxy_prefix() {
        let map = DomainSpeedMap::new();
        map.record("example.com", "a/1.2.3.4", 1000.0).await;
        map.remove_proxy("a").await;
        assert!(map.fastest("example.com", Duration::from_secs(3600)).await.is_none());
    }
}
