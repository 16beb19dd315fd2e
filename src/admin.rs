//! In-band admin surface: a path-routed command dispatch reachable on the
//! same listener as ordinary forwarding, triggered whenever a request
//! arrives with no `Host` header and no absolute-form target — i.e. it
//! was addressed straight at the proxy itself (SPEC_FULL.md §4.6).
//!
//! Grounded on `examples/original_source/tsproxy/listener.py`
//! (`ManageableHttpListener.on_no_forwardhost`'s flag table and the
//! plain-text response shape with its version+timestamp footer).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::acl::AclList;
use crate::persist::{self, PersistenceContext};
use crate::pool::{Proxy, ProxyCredentials, ProxyKind, ProxyPool};
use crate::router::Router;
use crate::speed::SpeedProber;
use crate::stat::StatStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AdminSurface {
    pool: Arc<ProxyPool>,
    stats: Arc<StatStore>,
    router: Arc<Router>,
    acl: Arc<AclList>,
    speed: Arc<SpeedProber>,
    state_path: PathBuf,
    last_speed_test: RwLock<Option<DateTime<Utc>>>,
}

impl AdminSurface {
    pub fn new(pool: Arc<ProxyPool>, stats: Arc<StatStore>, router: Arc<Router>, acl: Arc<AclList>, speed: Arc<SpeedProber>, state_path: PathBuf) -> Self {
        AdminSurface {
            pool,
            stats,
            router,
            acl,
            speed,
            state_path,
            last_speed_test: RwLock::new(None),
        }
    }

    /// Current value tracked by `/speed` and `/fspeed`, for the shutdown
    /// persistence snapshot.
    pub async fn last_speed_test(&self) -> Option<DateTime<Utc>> {
        *self.last_speed_test.read().await
    }

    /// Dispatches on the request path, ignoring everything the origin
    /// doesn't need to decide a command (query strings are handled inline
    /// per command since only a couple of them take one).
    pub async fn handle(&self, path: &str, _method: &str, _headers: &HashMap<String, String>, _peer: SocketAddr) -> (u16, String) {
        let (command, rest) = split_command(path);
        let body = match command {
            "list" => self.cmd_list().await,
            "conn" => self.cmd_conn().await,
            "pause" => self.cmd_pause(rest, true).await,
            "resume" => self.cmd_pause(rest, false).await,
            "head" => self.cmd_head(rest).await,
            "tail" => self.cmd_tail(rest).await,
            "top" => {
                self.pool.set_fix_top(true);
                "top: fix_top enabled".to_string()
            }
            "untop" => {
                self.pool.set_fix_top(false);
                "untop: fix_top disabled".to_string()
            }
            "speed" => self.cmd_speed(false).await,
            "fspeed" => self.cmd_speed(true).await,
            "domain" => self.cmd_domain().await,
            "delete" => self.cmd_delete(rest).await,
            "dump" => self.cmd_dump().await,
            "stack" => "stack traces are not captured in this build".to_string(),
            "acl" => self.cmd_acl_list(),
            "acl_add" => self.cmd_acl_add(rest),
            "acl_del" => self.cmd_acl_del(rest),
            "add" | "insert" => self.cmd_add(rest, command == "insert").await,
            "" | "/" => self.cmd_list().await,
            other => format!("unknown command: {}", other),
        };
        (200, self.with_footer(body).await)
    }

    async fn with_footer(&self, body: String) -> String {
        let mark = if self.pool.available() { "+" } else { "-" };
        let speed_stamp = self
            .last_speed_test
            .read()
            .await
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        format!(
            "{}\n{} TSProxy v{} {} (last speed test: {})\n",
            body,
            mark,
            VERSION,
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            speed_stamp,
        )
    }

    async fn cmd_list(&self) -> String {
        let proxies = self.pool.all().await;
        if proxies.is_empty() {
            return "(no proxies configured)".to_string();
        }
        let mut lines = Vec::with_capacity(proxies.len());
        for (i, p) in proxies.iter().enumerate() {
            lines.push(self.describe(i, p).await);
        }
        lines.join("\n")
    }

    async fn describe(&self, index: usize, p: &Arc<Proxy>) -> String {
        let tp90 = p.tp90(&self.stats).await;
        let fail_rate = p.fail_rate(&self.stats).await;
        let pause = p.pause().await;
        let auto = p.is_auto_paused().await;
        format!(
            "{:>2} {:<20} {:?} tp90={:.1} fail_rate={:.2} sess={} {}{}",
            index,
            p.short_hostname,
            p.kind,
            tp90,
            fail_rate,
            p.sess_count().await,
            if pause { "PAUSED " } else { "" },
            if auto { "(auto)" } else { "" },
        )
    }

    async fn cmd_conn(&self) -> String {
        let proxies = self.pool.all().await;
        let mut lines = Vec::new();
        for p in &proxies {
            lines.push(format!("{}: sess_count={}", p.short_hostname, p.sess_count().await));
        }
        if lines.is_empty() {
            "(no active proxies)".to_string()
        } else {
            lines.join("\n")
        }
    }

    async fn cmd_pause(&self, name: &str, pause: bool) -> String {
        match self.pool.find(name).await {
            Some(p) => {
                p.set_pause(pause).await;
                format!("{}: {}", name, if pause { "paused" } else { "resumed" })
            }
            None => format!("no such proxy: {}", name),
        }
    }

    async fn cmd_head(&self, name: &str) -> String {
        match self.pool.find(name).await {
            Some(_) => {
                let moved = self.pool.try_select_head_proxy(true, false, 10.0).await;
                match moved {
                    Some(p) if p.short_hostname == name => format!("{} promoted to head", name),
                    _ => format!("{} could not be promoted (gates not satisfied)", name),
                }
            }
            None => format!("no such proxy: {}", name),
        }
    }

    async fn cmd_tail(&self, name: &str) -> String {
        match self.pool.find(name).await {
            Some(p) => {
                self.pool.move_head_to_tail(&p, "admin /tail command").await;
                format!("{}: moved to tail (if it was head)", name)
            }
            None => format!("no such proxy: {}", name),
        }
    }

    async fn cmd_speed(&self, foreground: bool) -> String {
        if foreground {
            let report = self.speed.run_once().await;
            *self.last_speed_test.write().await = Some(Utc::now());
            report
        } else {
            let speed = self.speed.clone();
            tokio::spawn(async move {
                speed.run_once().await;
            });
            *self.last_speed_test.write().await = Some(Utc::now());
            "speed test triggered in background".to_string()
        }
    }

    async fn cmd_domain(&self) -> String {
        self.speed.domain_map.dump().await
    }

    fn cmd_acl_list(&self) -> String {
        let entries = self.acl.list();
        if entries.is_empty() {
            "(acl empty: all peers allowed)".to_string()
        } else {
            entries.join("\n")
        }
    }

    fn cmd_acl_add(&self, entry: &str) -> String {
        if entry.is_empty() {
            return "usage: /acl_add/<entry>".to_string();
        }
        if self.acl.add(entry) {
            format!("acl: added {}", entry)
        } else {
            format!("acl: could not parse {}", entry)
        }
    }

    fn cmd_acl_del(&self, entry: &str) -> String {
        if self.acl.remove(entry) {
            format!("acl: removed {}", entry)
        } else {
            format!("acl: no such entry {}", entry)
        }
    }

    async fn cmd_delete(&self, name: &str) -> String {
        match self.pool.remove(name).await {
            Some(_) => {
                self.speed.domain_map.remove_proxy(name).await;
                format!("{}: removed", name)
            }
            None => format!("no such proxy: {}", name),
        }
    }

    /// `/add/<spec>` or `/insert/<spec>`: `add` appends to the tail,
    /// `insert` places at the front, matching the origin's two verbs.
    async fn cmd_add(&self, rest: &str, insert: bool) -> String {
        if rest.is_empty() {
            return "usage: /add/<spec> or /insert/<spec>".to_string();
        }
        match Self::parse_spec(rest).await {
            Some(proxy) => {
                let short = proxy.short_hostname.clone();
                self.pool.add(Arc::new(proxy), insert).await;
                format!("{}: added", short)
            }
            None => format!("could not parse proxy spec: {}", rest),
        }
    }

    async fn cmd_dump(&self) -> String {
        let ctx = PersistenceContext {
            pool: &self.pool,
            acl: &self.acl,
            stats: &self.stats,
            domain_map: &self.speed.domain_map,
            last_wan_ip: None,
            last_lan_ip: None,
            last_speed_test: *self.last_speed_test.read().await,
        };
        match persist::save(&self.state_path, &ctx).await {
            Ok(()) => format!("state persisted to {}", self.state_path.display()),
            Err(e) => format!("failed to persist state: {}", e),
        }
    }

    /// Parses `host:port`, `host:port/shortname`, `password/method@host:port`,
    /// a bare `host` (Shadowsocks with a `<host>.json` sidecar), or
    /// `http://host:port[/shortname]` into a pool-ready `Proxy`, matching
    /// the grammar `/add` and `/insert` both accept.
    pub async fn parse_spec(spec: &str) -> Option<Proxy> {
        if let Some(rest) = spec.strip_prefix("http://") {
            let (authority, short) = split_shortname(rest);
            let (host, port) = split_host_port_default(authority, 8080);
            let short = short.unwrap_or_else(|| host.clone());
            return Some(Proxy::new(host, port, short, ProxyKind::Http));
        }
        if let Some((creds, authority)) = spec.split_once('@') {
            let (password, method) = creds.split_once('/')?;
            let (host, port) = split_host_port_default(authority, 8388);
            let proxy = Proxy::new(host.clone(), port, host, ProxyKind::Shadowsocks);
            proxy
                .set_credentials(ProxyCredentials {
                    password: Some(password.to_string()),
                    method: Some(method.to_string()),
                    sidecar_path: None,
                    sidecar_mtime: None,
                })
                .await;
            return Some(proxy);
        }
        if spec.contains(':') {
            let (authority, short) = split_shortname(spec);
            let (host, port) = split_host_port_default(authority, 1080);
            let short = short.unwrap_or_else(|| host.clone());
            return Some(Proxy::new(host, port, short, ProxyKind::Socks5));
        }
        let host = spec.to_string();
        let sidecar = PathBuf::from(format!("{}.json", host));
        let proxy = Proxy::new(host.clone(), 8388, host, ProxyKind::Shadowsocks);
        proxy
            .set_credentials(ProxyCredentials {
                password: None,
                method: None,
                sidecar_path: Some(sidecar),
                sidecar_mtime: None,
            })
            .await;
        proxy.reload_credentials_if_stale().await;
        Some(proxy)
    }
}

fn split_command(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((cmd, rest)) => (cmd, rest),
        None => (trimmed, ""),
    }
}

fn split_shortname(s: &str) -> (&str, Option<String>) {
    match s.split_once('/') {
        Some((authority, short)) => (authority, Some(short.to_string())),
        None => (s, None),
    }
}

fn split_host_port_default(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (authority.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::dns::DnsResolver;
    use crate::speed::SpeedSites;
    use std::time::Duration;

    async fn surface() -> AdminSurface {
        let stats = Arc::new(StatStore::new(100, Duration::from_secs(3600)));
        let pool = Arc::new(ProxyPool::new(stats.clone(), Thresholds::default()));
        let path = std::env::temp_dir().join(format!("tsproxy-admin-test-{:?}.yaml", std::thread::current().id()));
        std::fs::write(&path, "default: P\nrouter: []\n").unwrap();
        let router = Arc::new(Router::load(&path).await.unwrap());
        let acl = Arc::new(AclList::new(&[]));
        let dns = Arc::new(DnsResolver::new(Duration::from_secs(300)));
        let speed = Arc::new(SpeedProber::new(
            pool.clone(),
            dns,
            Thresholds::default(),
            Arc::new(RwLock::new(SpeedSites::empty())),
            Arc::new(crate::speed::DomainSpeedMap::new()),
        ));
        let state_path = std::env::temp_dir().join(format!("tsproxy-admin-test-state-{:?}.json", std::thread::current().id()));
        AdminSurface::new(pool, stats, router, acl, speed, state_path)
    }

    #[test]
    fn split_command_extracts_name_argument() {
        assert_eq!(split_command("/pause/p1"), ("pause", "p1"));
        assert_eq!(split_command("/list"), ("list", ""));
    }

    #[tokio::test]
    async fn parse_spec_recognizes_http_proxy() {
        let proxy = AdminSurface::parse_spec("http://proxy.example.com:8080").await.unwrap();
        assert_eq!(proxy.kind, ProxyKind::Http);
        assert_eq!(proxy.port, 8080);
    }

    #[tokio::test]
    async fn parse_spec_recognizes_socks5_with_shortname() {
        let proxy = AdminSurface::parse_spec("proxy.example.com:1080/p1").await.unwrap();
        assert_eq!(proxy.kind, ProxyKind::Socks5);
        assert_eq!(proxy.short_hostname, "p1");
    }

    #[tokio::test]
    async fn parse_spec_recognizes_bare_shadowsocks_host() {
        let proxy = AdminSurface::parse_spec("ss.example.com").await.unwrap();
        assert_eq!(proxy.kind, ProxyKind::Shadowsocks);
    }

    #[tokio::test]
    async fn parse_spec_attaches_shadowsocks_credentials() {
        let proxy = AdminSurface::parse_spec("hunter2/aes-256-ctr@ss.example.com:8388").await.unwrap();
        assert_eq!(proxy.kind, ProxyKind::Shadowsocks);
        let creds = proxy.credentials().await;
        assert_eq!(creds.password.as_deref(), Some("hunter2"));
        assert_eq!(creds.method.as_deref(), Some("aes-256-ctr"));
    }

    #[tokio::test]
    async fn list_reports_empty_pool() {
        let admin = surface().await;
        let (status, body) = admin.handle("/list", "GET", &HashMap::new(), "127.0.0.1:9999".parse().unwrap()).await;
        assert_eq!(status, 200);
        assert!(body.contains("no proxies configured"));
        assert!(body.contains("TSProxy v"));
    }

    #[tokio::test]
    async fn acl_add_and_list_round_trip() {
        let admin = surface().await;
        let (_, body) = admin.handle("/acl_add/10.0.0.0/24", "GET", &HashMap::new(), "127.0.0.1:9999".parse().unwrap()).await;
        assert!(body.contains("added"));
        let (_, list_body) = admin.handle("/acl", "GET", &HashMap::new(), "127.0.0.1:9999".parse().unwrap()).await;
        assert!(list_body.contains("10.0.0.0/24"));
    }
}
