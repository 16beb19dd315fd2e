//! Resolver with a hosts-file override and a round-robin response cache
//! (SPEC_FULL.md §2 component B).
//!
//! Grounded on `examples/original_source/tsproxy/topendns.py`
//! (`dns_query_ex`, `dns_query`, `update_hosts`, `del_cache`).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

const HOSTS_FILE: &str = "/etc/hosts";

struct CacheEntry {
    ips: Vec<IpAddr>,
    inserted_at: Instant,
}

struct DnsState {
    cache: HashMap<String, CacheEntry>,
    hosts: HashMap<String, IpAddr>,
    hosts_mtime: Option<std::time::SystemTime>,
    hosts_last_check: Instant,
}

pub struct DnsResolver {
    hosts_path: PathBuf,
    cache_ttl: Duration,
    state: RwLock<DnsState>,
}

impl DnsResolver {
    pub fn new(cache_ttl: Duration) -> Self {
        DnsResolver {
            hosts_path: PathBuf::from(HOSTS_FILE),
            cache_ttl,
            state: RwLock::new(DnsState {
                cache: HashMap::new(),
                hosts: HashMap::new(),
                hosts_mtime: None,
                hosts_last_check: Instant::now() - Duration::from_secs(60),
            }),
        }
    }

    async fn reload_hosts_if_stale(&self) {
        let mut state = self.state.write().await;
        if state.hosts_last_check.elapsed() < Duration::from_secs(1) {
            return;
        }
        state.hosts_last_check = Instant::now();

        let Ok(metadata) = std::fs::metadata(&self.hosts_path) else {
            return;
        };
        let mtime = metadata.modified().ok();
        if mtime.is_some() && mtime == state.hosts_mtime {
            return;
        }
        let Ok(text) = std::fs::read_to_string(&self.hosts_path) else {
            return;
        };

        let mut hosts = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(ip_str) = parts.next() else { continue };
            let Ok(ip) = ip_str.parse::<IpAddr>() else { continue };
            for name in parts {
                if name.starts_with('#') {
                    break;
                }
                hosts.insert(name.to_string(), ip);
            }
        }
        state.hosts = hosts;
        state.hosts_mtime = mtime;
        info!("{:?} reloaded", self.hosts_path);
    }

    /// Drops a cached resolution, used when a proxy's last-known address
    /// is found stale (`del_cache`).
    pub async fn invalidate(&self, qname: &str) {
        self.state.write().await.cache.remove(qname);
    }

    /// Resolves `qname` to every known address, preferring a literal IP,
    /// then `/etc/hosts`, then the cache, then a live lookup.
    pub async fn resolve_all(&self, qname: &str) -> std::io::Result<Vec<IpAddr>> {
        if let Ok(ip) = qname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        self.reload_hosts_if_stale().await;
        {
            let state = self.state.read().await;
            if let Some(ip) = state.hosts.get(qname) {
                return Ok(vec![*ip]);
            }
            if let Some(entry) = state.cache.get(qname) {
                if entry.inserted_at.elapsed() < self.cache_ttl {
                    return Ok(entry.ips.clone());
                }
            }
        }

        debug!("dns lookup {} ...", qname);
        let lookup_target = format!("{}:0", qname);
        let ips: Vec<IpAddr> = tokio::net::lookup_host(lookup_target)
            .await?
            .map(|addr| addr.ip())
            .collect();

        let mut state = self.state.write().await;
        state.cache.insert(
            qname.to_string(),
            CacheEntry {
                ips: ips.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(ips)
    }

    /// Resolves to a single address, round-robining the cached list (the
    /// chosen address is rotated to the back) when more than one exists.
    pub async fn resolve_one(&self, qname: &str) -> std::io::Result<IpAddr> {
        let mut ips = self.resolve_all(qname).await?;
        if ips.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"));
        }
        if ips.len() > 1 {
            let first = ips.remove(0);
            ips.push(first);
            let mut state = self.state.write().await;
            if let Some(entry) = state.cache.get_mut(qname) {
                entry.ips = ips.clone();
            }
            Ok(first)
        } else {
            Ok(ips[0])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ip_short_circuits_lookup() {
        let resolver = DnsResolver::new(Duration::from_secs(60));
        let ips = resolver.resolve_all("203.0.113.5").await.unwrap();
        assert_eq!(ips, vec!["203.0.113.5".parse::<IpAddr>().unwrap()]);
    }
}
