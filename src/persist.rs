//! Persistent state snapshot: ACL, pool (with per-proxy stats), `fix_top`,
//! last known WAN/LAN IP, last speed-test timestamp, domain-speed map, and
//! the global TP90 ring — written on exit and on operator command, loaded
//! back at startup (SPEC_FULL.md §6).
//!
//! Grounded on `examples/original_source/tsproxy/proxyholder.py`
//! (`load_json`/`dump_json`) for the exact field set; `examples/original_source/tsproxy/
//! common.py`'s `FIFOList` serialization for the ring entries carried
//! across restarts.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::acl::AclList;
use crate::pool::{Proxy, ProxyCredentials, ProxyKind, ProxyPool};
use crate::speed::DomainSpeedMap;
use crate::stat::StatStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedProxy {
    hostname: String,
    port: u16,
    short_hostname: String,
    kind: PersistedKind,
    pause: bool,
    sidecar_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum PersistedKind {
    Direct,
    Http,
    Socks5,
    Shadowsocks,
}

impl From<ProxyKind> for PersistedKind {
    fn from(kind: ProxyKind) -> Self {
        match kind {
            ProxyKind::Direct => PersistedKind::Direct,
            ProxyKind::Http => PersistedKind::Http,
            ProxyKind::Socks5 => PersistedKind::Socks5,
            ProxyKind::Shadowsocks => PersistedKind::Shadowsocks,
        }
    }
}

impl From<PersistedKind> for ProxyKind {
    fn from(kind: PersistedKind) -> Self {
        match kind {
            PersistedKind::Direct => ProxyKind::Direct,
            PersistedKind::Http => ProxyKind::Http,
            PersistedKind::Socks5 => ProxyKind::Socks5,
            PersistedKind::Shadowsocks => ProxyKind::Shadowsocks,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    acl: Vec<String>,
    proxies: Vec<PersistedProxy>,
    fix_top: bool,
    last_wan_ip: Option<IpAddr>,
    last_lan_ip: Option<IpAddr>,
    last_speed_test: Option<chrono::DateTime<chrono::Utc>>,
    domain_speed_map: std::collections::HashMap<String, std::collections::HashMap<String, f64>>,
    #[serde(default)]
    stat_ring: Vec<(String, f64, bool)>,
}

/// The live references the snapshot is built from / restored into.
pub struct PersistenceContext<'a> {
    pub pool: &'a ProxyPool,
    pub acl: &'a AclList,
    pub stats: &'a StatStore,
    pub domain_map: &'a DomainSpeedMap,
    pub last_wan_ip: Option<IpAddr>,
    pub last_lan_ip: Option<IpAddr>,
    pub last_speed_test: Option<chrono::DateTime<chrono::Utc>>,
}

/// Writes the current state of every subsystem in `ctx` to `path` as JSON.
pub async fn save(path: impl AsRef<Path>, ctx: &PersistenceContext<'_>) -> Result<()> {
    let mut proxies = Vec::new();
    for proxy in ctx.pool.all().await {
        proxies.push(PersistedProxy {
            hostname: proxy.hostname.clone(),
            port: proxy.port,
            short_hostname: proxy.short_hostname.clone(),
            kind: proxy.kind.into(),
            pause: proxy.pause().await,
            sidecar_path: proxy.credentials().await.sidecar_path.map(|p| p.to_string_lossy().into_owned()),
        });
    }

    let state = PersistedState {
        acl: ctx.acl.list(),
        proxies,
        fix_top: ctx.pool.fix_top(),
        last_wan_ip: ctx.last_wan_ip,
        last_lan_ip: ctx.last_lan_ip,
        last_speed_test: ctx.last_speed_test,
        domain_speed_map: ctx.domain_map.snapshot().await,
        stat_ring: ctx.stats.snapshot().await,
    };

    let json = serde_json::to_string_pretty(&state).context("serialize persisted state")?;
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).context("write persisted state tmp file")?;
    std::fs::rename(&tmp, path).context("rename persisted state into place")?;
    info!("persisted state to {:?} ({} proxies)", path, ctx.pool.len().await);
    Ok(())
}

/// Loads `path` if present and repopulates `pool`, `acl`, `stats`, and
/// `domain_map`. Missing file is not an error (fresh start); a malformed
/// file is logged and ignored rather than aborting startup, since losing
/// persisted rank is recoverable but refusing to start is not.
pub async fn load(path: impl AsRef<Path>, pool: &ProxyPool, acl: &AclList, stats: &StatStore, domain_map: &DomainSpeedMap) -> Option<PersistedState> {
    let path = path.as_ref();
    if !path.exists() {
        return None;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!("could not read persisted state {:?}: {}", path, e);
            return None;
        }
    };
    let state: PersistedState = match serde_json::from_str(&text) {
        Ok(s) => s,
        Err(e) => {
            warn!("could not parse persisted state {:?}: {}", path, e);
            return None;
        }
    };

    for entry in &state.acl {
        acl.add(entry);
    }
    for p in &state.proxies {
        let proxy = Proxy::new(p.hostname.clone(), p.port, p.short_hostname.clone(), p.kind.into());
        if let Some(sidecar) = &p.sidecar_path {
            proxy
                .set_credentials(ProxyCredentials {
                    sidecar_path: Some(std::path::PathBuf::from(sidecar)),
                    ..Default::default()
                })
                .await;
            proxy.reload_credentials_if_stale().await;
        }
        if p.pause {
            proxy.set_pause(true).await;
        }
        pool.add(std::sync::Arc::new(proxy), false).await;
    }
    pool.set_fix_top(state.fix_top);
    stats.restore(state.stat_ring.clone()).await;
    domain_map.restore(state.domain_speed_map.clone()).await;

    info!("restored persisted state from {:?} ({} proxies)", path, state.proxies.len());
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn round_trips_pool_and_acl() {
        let stats = Arc::new(StatStore::new(100, Duration::from_secs(3600)));
        let pool = ProxyPool::new(stats.clone(), Thresholds::default());
        pool.add(Arc::new(Proxy::new("proxy.example.com", 1080, "p1", ProxyKind::Socks5)), false).await;
        let acl = AclList::new(&["10.0.0.0/24".to_string()]);
        let domain_map = DomainSpeedMap::new();
        domain_map.record("example.com", "p1/1.2.3.4", 1000.0).await;

        let path = std::env::temp_dir().join(format!("tsproxy-persist-test-{:?}.json", std::thread::current().id()));
        let ctx = PersistenceContext {
            pool: &pool,
            acl: &acl,
            stats: &stats,
            domain_map: &domain_map,
            last_wan_ip: None,
            last_lan_ip: None,
            last_speed_test: None,
        };
        save(&path, &ctx).await.unwrap();

        let stats2 = Arc::new(StatStore::new(100, Duration::from_secs(3600)));
        let pool2 = ProxyPool::new(stats2.clone(), Thresholds::default());
        let acl2 = AclList::new(&[]);
        let domain_map2 = DomainSpeedMap::new();
        let loaded = load(&path, &pool2, &acl2, &stats2, &domain_map2).await;
        assert!(loaded.is_some());
        assert_eq!(pool2.len().await, 1);
        assert!(acl2.is_allowed("10.0.0.5".parse().unwrap()));
        assert!(!acl2.is_allowed("10.0.1.5".parse().unwrap()));

        std::fs::remove_file(&path).ok();
    }
}
