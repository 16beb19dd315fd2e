//! Connection & forwarding engine: the per-connection state machine that
//! accepts a client socket, parses its request(s), decides a target via
//! the router, dials an upstream (direct or through a pooled proxy), and
//! relays bytes with the origin's idle/response-timeout discipline
//! (SPEC_FULL.md §4.4).
//!
//! Grounded on `examples/original_source/tsproxy/listener.py`
//! (`HttpListener.do_forward`/`do_https_forward`/`do_http_forward`/
//! `rewrite_request`) and `examples/original_source/tsproxy/common.py`'s
//! `forward_forever` for the relay loop's exact timing arithmetic. The
//! accept-loop/tunnel-via-select! shape follows the teacher's own
//! `src/proxy/forward.rs` (no longer in this tree — see DESIGN.md).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::acl::AclList;
use crate::admin::AdminSurface;
use crate::classify::Classifier;
use crate::codec::{http_connect, shadowsocks, socks5, Target};
use crate::config::{RouteMode, Thresholds};
use crate::dns::DnsResolver;
use crate::error::ProxyError;
use crate::health::HealthManager;
use crate::logging::{CommonLogEntry, LogManager};
use crate::pool::{Proxy, ProxyKind, ProxyPool};
use crate::router::{RequestContext, Router, DIRECT, FORBID, PROXY_ALL};
use crate::speed::{DomainSpeedMap, SpeedSites};
use crate::stat::StatStore;

/// Object-safe marker for anything that can stand in as a duplex byte
/// stream: a plain `TcpStream` or a Shadowsocks `CipherStream` wrapping
/// one.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

type BoxedStream = Pin<Box<dyn AsyncDuplex>>;

pub struct ForwardEngine {
    pub pool: Arc<ProxyPool>,
    pub stats: Arc<StatStore>,
    pub thresholds: Thresholds,
    pub router: Arc<Router>,
    pub dns: Arc<DnsResolver>,
    pub classifier: Arc<Classifier>,
    pub acl: Arc<AclList>,
    pub health: HealthManager,
    pub logs: Arc<LogManager>,
    pub admin: Arc<AdminSurface>,
    pub mode: RouteMode,
    pub speed_sites: Arc<tokio::sync::RwLock<SpeedSites>>,
    pub domain_map: Arc<DomainSpeedMap>,
}

impl ForwardEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<ProxyPool>,
        stats: Arc<StatStore>,
        thresholds: Thresholds,
        router: Arc<Router>,
        dns: Arc<DnsResolver>,
        classifier: Arc<Classifier>,
        acl: Arc<AclList>,
        health: HealthManager,
        logs: Arc<LogManager>,
        admin: Arc<AdminSurface>,
        mode: RouteMode,
        speed_sites: Arc<tokio::sync::RwLock<SpeedSites>>,
        domain_map: Arc<DomainSpeedMap>,
    ) -> Self {
        ForwardEngine {
            pool,
            stats,
            thresholds,
            router,
            dns,
            classifier,
            acl,
            health,
            logs,
            admin,
            mode,
            speed_sites,
            domain_map,
        }
    }

    /// Accept loop: spawns one task per connection until `shutdown` flips
    /// to `true`, at which point new accepts stop (in-flight connections
    /// finish on their own timeouts/EOF).
    pub async fn run(self: Arc<Self>, listener: tokio::net::TcpListener, mut shutdown: watch::Receiver<bool>) {
        let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("forwarding engine on :{} stopping accept loop", local_port);
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.handle_connection(stream, peer, local_port).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr, local_port: u16) {
        if !self.acl.is_allowed(peer.ip()) {
            debug!("acl denied {}", peer);
            return;
        }
        let _ = stream.set_nodelay(true);
        let peer_pid = lookup_owning_pid(local_port, peer.port());

        let mut upstream: Option<(BoxedStream, Arc<Proxy>, String, u16)> = None;

        loop {
            let parsed = match read_request(&mut stream, Duration::from_secs(1), Duration::from_secs(self.thresholds.default_timeout_secs)).await {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(e) => {
                    debug!("{}: request parse error: {}", peer, e);
                    break;
                }
            };

            if !parsed.headers.contains_key("host") && parsed.target_host.is_none() {
                let (status, body) = self.admin.handle(&parsed.path, &parsed.method, &parsed.headers, peer).await;
                let _ = write_plain_response(&mut stream, status, &body).await;
                break;
            }

            let (host, port) = match (&parsed.target_host, parsed.target_port) {
                (Some(h), Some(p)) => (h.clone(), p),
                _ => {
                    let host = parsed.headers.get("host").cloned().unwrap_or_default();
                    let (h, p) = split_host_port(&host, if parsed.is_connect { 443 } else { 80 });
                    (h, p)
                }
            };

            let app = peer_pid.as_ref().map(|(_, name)| name.clone());
            let ctx = RequestContext {
                full_url: parsed.request_target.clone(),
                is_connect: parsed.is_connect,
                host: host.clone(),
                port,
                path: parsed.path.clone(),
                method: parsed.method.clone(),
                app,
                headers: parsed.headers.clone(),
            };

            let (target, from_header, condition) = self.decide_target(&ctx).await;
            if target == FORBID {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let _ = write_plain_response(&mut stream, 403, "forbidden by router (TSP)").await;
                break;
            }

            let start = Instant::now();
            let reuse = upstream
                .as_ref()
                .map(|(_, _, h, p)| h == &host && *p == port)
                .unwrap_or(false);

            if !reuse {
                upstream = None;
                match self.connect_upstream(&target, from_header, condition.as_deref(), &host, port).await {
                    Ok((stream_box, proxy_opt)) => {
                        if let Some(proxy) = &proxy_opt {
                            proxy.increment_sess_count().await;
                        }
                        upstream = Some((stream_box, proxy_opt.unwrap_or_else(|| direct_marker()), host.clone(), port));
                    }
                    Err(e) => {
                        let status = e.status_code();
                        let _ = write_plain_response(&mut stream, status, &e.reason_phrase()).await;
                        self.log_connection(peer, peer_pid.as_ref(), &parsed, None, status, 0, 0, start, '.').await;
                        break;
                    }
                }
            }

            let Some((mut up_stream, proxy, up_host, up_port)) = upstream.take() else {
                break;
            };

            if parsed.is_connect {
                let _ = stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
                let outcome = relay_tunnel(&mut stream, &mut up_stream, &self.thresholds).await;
                self.finish_outcome(&proxy, &outcome, start).await;
                self.log_connection(
                    peer,
                    peer_pid.as_ref(),
                    &parsed,
                    Some(&proxy.short_hostname),
                    200,
                    outcome.upload,
                    outcome.download,
                    start,
                    '.',
                )
                .await;
                break;
            }

            let rewritten = rewrite_request(&parsed, &up_host, up_port);
            if up_stream.write_all(&rewritten).await.is_err() {
                let _ = write_plain_response(&mut stream, 502, "upstream write failed (TSP)").await;
                self.finish_outcome(&proxy, &RelayOutcome::failed(), start).await;
                break;
            }

            let response = match read_response(&mut up_stream, Duration::from_secs(self.thresholds.default_timeout_secs)).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("{}: upstream response error: {}", peer, e);
                    let _ = write_plain_response(&mut stream, 502, "bad upstream response (TSP)").await;
                    self.finish_outcome(&proxy, &RelayOutcome::failed(), start).await;
                    break;
                }
            };

            if stream.write_all(&response.raw).await.is_err() {
                break;
            }

            let download = response.raw.len() as u64;
            let upload = rewritten.len() as u64;
            self.finish_outcome(&proxy, &RelayOutcome { upload, download, failed: false }, start).await;

            let mark = if response.should_close || parsed.should_close { '.' } else { ',' };
            self.log_connection(peer, peer_pid.as_ref(), &parsed, Some(&proxy.short_hostname), response.status, upload, download, start, mark)
                .await;

            if response.should_close || parsed.should_close {
                break;
            }
            upstream = Some((up_stream, proxy, up_host, up_port));
        }
    }

    /// Resolves a request to a target string plus whether it came from an
    /// explicit `Proxy-Name` header (the two travel a different failure
    /// path in `connect_upstream`: a tight 3s timeout and an unconditional
    /// one-shot `ANY_PROXY` fallback rather than the rule-matched named
    /// proxy's normal cooldown-and-fall-through at the next request).
    /// `Proxy-Name` takes priority over the rule list entirely; a header
    /// naming a proxy the router itself just paused is still honored once
    /// more here, then paused itself if the connect fails.
    async fn decide_target(&self, ctx: &RequestContext) -> (String, bool, Option<String>) {
        if let Some(name) = ctx.headers.get("proxy-name") {
            if !name.is_empty() && !self.router.is_named_proxy_paused(name).await {
                return (name.clone(), true, None);
            }
        }
        let (target, condition) = self.router.get_target(ctx).await;
        if target != PROXY_ALL {
            return (target, false, condition);
        }
        let target = match self.mode {
            RouteMode::NoProxy => DIRECT.to_string(),
            RouteMode::ProxyAll => PROXY_ALL.to_string(),
            RouteMode::Smart => {
                if !self.pool.available() {
                    DIRECT.to_string()
                } else {
                    match self.dns.resolve_one(&ctx.host).await {
                        Ok(ip) if self.classifier.is_cn(ip).await => DIRECT.to_string(),
                        _ => PROXY_ALL.to_string(),
                    }
                }
            }
        };
        (target, false, condition)
    }

    /// Connects to `host:port`, either directly, through a named proxy, or
    /// through the pool head for `PROXY_ALL`. A named target (whether from
    /// a matched router rule or an explicit `Proxy-Name` header) gets a
    /// tight 3s budget; on failure the rule/name is paused for 5 minutes
    /// and the request is retried against `ANY_PROXY` exactly once,
    /// matching §4.3's named-proxy-unreachability contract. `ANY_PROXY`
    /// itself tries up to the pool size worth of alternates, halving the
    /// remaining time budget per attempt past the first and rotating a
    /// failed head to the tail before retrying, per `ProxyConnector.connect`.
    async fn connect_upstream(
        &self,
        target: &str,
        from_header: bool,
        condition: Option<&str>,
        host: &str,
        port: u16,
    ) -> std::result::Result<(BoxedStream, Option<Arc<Proxy>>), ProxyError> {
        if target == DIRECT {
            return self.connect_direct(host, port).await.map(|s| (s, None));
        }

        if target != PROXY_ALL {
            let named_timeout = Duration::from_secs(3);
            match self.pool.find(target).await {
                Some(proxy) => match self.connect_through_proxy(&proxy, host, port, named_timeout).await {
                    Ok(stream_box) => return Ok((stream_box, Some(proxy))),
                    Err(e) => {
                        if from_header {
                            self.router.mark_named_proxy_failed(target).await;
                        } else if let Some(condition) = condition {
                            self.router.mark_rule_failed(condition).await;
                        }
                        debug!("named proxy {} unreachable ({}), falling back to any_proxy once", target, e);
                    }
                },
                None => debug!("named proxy {} not in pool, falling back to any_proxy", target),
            }
            return self.connect_any_proxy_once(host, port).await;
        }

        self.connect_any_proxy(host, port).await
    }

    /// A single `ANY_PROXY` attempt at the full default budget, used as the
    /// named-proxy-unreachability fallback (no further retries past this).
    async fn connect_any_proxy_once(&self, host: &str, port: u16) -> std::result::Result<(BoxedStream, Option<Arc<Proxy>>), ProxyError> {
        if let Some((proxy, ip)) = self.speed_map_candidate(host).await {
            let budget = Duration::from_secs(self.thresholds.default_timeout_secs);
            if let Ok(stream_box) = self.connect_through_proxy_with_ip(&proxy, ip, host, port, budget).await {
                return Ok((stream_box, Some(proxy)));
            }
        }
        let proxy = self.pool.head().await.ok_or(ProxyError::NoProxyConfigured)?;
        let budget = Duration::from_secs(self.thresholds.default_timeout_secs);
        let stream_box = self.connect_through_proxy(&proxy, host, port, budget).await?;
        Ok((stream_box, Some(proxy)))
    }

    async fn connect_any_proxy(&self, host: &str, port: u16) -> std::result::Result<(BoxedStream, Option<Arc<Proxy>>), ProxyError> {
        if let Some((proxy, ip)) = self.speed_map_candidate(host).await {
            let budget = Duration::from_secs(self.thresholds.default_timeout_secs);
            match self.connect_through_proxy_with_ip(&proxy, ip, host, port, budget).await {
                Ok(stream_box) => return Ok((stream_box, Some(proxy))),
                Err(e) => debug!("domain-speed-map proxy {} failed for {} ({}), falling back to head", proxy.short_hostname, host, e),
            }
        }

        let attempts = self.pool.len().await.max(1);
        let mut budget = Duration::from_secs(self.thresholds.default_timeout_secs);
        let mut last_err = ProxyError::NoProxyConfigured;

        for i in 0..attempts {
            let proxy = match self.pool.head().await {
                Some(p) => p,
                None => return Err(ProxyError::NoProxyConfigured),
            };

            match self.connect_through_proxy(&proxy, host, port, budget).await {
                Ok(stream_box) => return Ok((stream_box, Some(proxy))),
                Err(e) => {
                    last_err = e;
                    self.pool.move_head_to_tail(&proxy, "connect failure").await;
                    self.health.request_check(proxy.clone(), "connect failure".to_string());
                    if i + 1 < attempts {
                        budget /= 2;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// The domain-speed map's fastest non-expired, non-paused proxy for
    /// `host`, if `host` falls under a configured speed site — §4.4's
    /// "engine may consult the domain_speed_map first" clause.
    async fn speed_map_candidate(&self, host: &str) -> Option<(Arc<Proxy>, IpAddr)> {
        let speed_host = {
            let sites = self.speed_sites.read().await;
            sites.speed_host_for(host)?.to_string()
        };
        let lifetime = Duration::from_secs(self.thresholds.speed_lifetime_secs);
        let (name, ip, _speed) = self.domain_map.fastest(&speed_host, lifetime).await?;
        let proxy = self.pool.find(&name).await?;
        if proxy.pause().await || proxy.is_auto_paused().await {
            return None;
        }
        Some((proxy, ip))
    }

    async fn connect_direct(&self, host: &str, port: u16) -> std::result::Result<BoxedStream, ProxyError> {
        let ip = self
            .dns
            .resolve_one(host)
            .await
            .map_err(|_| ProxyError::DnsFailure { host: host.to_string() })?;
        let tcp = TcpStream::connect((ip, port))
            .await
            .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;
        Ok(Box::pin(tcp))
    }

    async fn connect_through_proxy(&self, proxy: &Arc<Proxy>, host: &str, port: u16, budget: Duration) -> std::result::Result<BoxedStream, ProxyError> {
        let proxy_ip = match proxy.resolved_addr().await {
            Some(ip) => ip,
            None => {
                let ip = self
                    .dns
                    .resolve_one(&proxy.hostname)
                    .await
                    .map_err(|_| ProxyError::DnsFailure { host: proxy.hostname.clone() })?;
                proxy.set_resolved_addr(ip).await;
                ip
            }
        };
        self.connect_through_proxy_with_ip(proxy, proxy_ip, host, port, budget).await
    }

    /// Same handshake as `connect_through_proxy`, but the proxy's own
    /// address is supplied by the caller (the domain-speed map's cached
    /// IP) instead of resolved here, per §4.4's "bypassing DNS" clause.
    async fn connect_through_proxy_with_ip(&self, proxy: &Arc<Proxy>, proxy_ip: IpAddr, host: &str, port: u16, budget: Duration) -> std::result::Result<BoxedStream, ProxyError> {
        let attempt_start = Instant::now();
        proxy.set_resolved_addr(proxy_ip).await;

        let connect_fut = TcpStream::connect((proxy_ip, proxy.port));
        let mut tcp = tokio::time::timeout(budget, connect_fut)
            .await
            .map_err(|_| ProxyError::ResponseTimeout)?
            .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;

        // The target travels to the upstream by name (ATYP 0x03), not by
        // resolved IP: only `DirectConnector` resolves before connecting,
        // so the proxy can do its own DNS/geo-routing on the destination.
        let target = Target::Domain(host.to_string());

        let result: std::result::Result<BoxedStream, ProxyError> = match proxy.kind {
            ProxyKind::Direct => Ok(Box::pin(tcp)),
            ProxyKind::Socks5 => {
                tokio::time::timeout(budget, socks5::handshake(&mut tcp, &target, port))
                    .await
                    .map_err(|_| ProxyError::ResponseTimeout)?
                    .map_err(|e| ProxyError::UpstreamHandshake(e.to_string()))?;
                Ok(Box::pin(tcp))
            }
            ProxyKind::Shadowsocks => {
                proxy.reload_credentials_if_stale().await;
                let creds = proxy.credentials().await;
                let (password, method) = (
                    creds.password.context("shadowsocks proxy missing password").map_err(|e| ProxyError::UpstreamHandshake(e.to_string()))?,
                    creds.method.context("shadowsocks proxy missing method").map_err(|e| ProxyError::UpstreamHandshake(e.to_string()))?,
                );
                let cryptor = shadowsocks::Cryptor::new(&password, &method).map_err(|e| ProxyError::UpstreamHandshake(e.to_string()))?;
                let wrapped = tokio::time::timeout(budget, shadowsocks::connect(tcp, &cryptor, &target, port))
                    .await
                    .map_err(|_| ProxyError::ResponseTimeout)?
                    .map_err(|e| ProxyError::UpstreamHandshake(e.to_string()))?;
                Ok(Box::pin(wrapped))
            }
            ProxyKind::Http => {
                tokio::time::timeout(budget, http_connect::handshake(&mut tcp, host, port, &[]))
                    .await
                    .map_err(|_| ProxyError::ResponseTimeout)?
                    .map_err(|e| ProxyError::UpstreamHandshake(e.to_string()))?;
                Ok(Box::pin(tcp))
            }
        };

        if result.is_err() {
            proxy.record_outcome(&self.stats, proxy_ip, -1.0, true).await;
        } else {
            proxy.record_outcome(&self.stats, proxy_ip, attempt_start.elapsed().as_secs_f64(), false).await;
        }
        result
    }

    async fn finish_outcome(&self, proxy: &Arc<Proxy>, outcome: &RelayOutcome, start: Instant) {
        if matches!(proxy.kind, ProxyKind::Direct) && proxy.hostname == DIRECT_MARKER_HOST {
            return;
        }
        let ip = proxy.resolved_addr().await.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        if outcome.failed {
            proxy.record_outcome(&self.stats, ip, -1.0, true).await;
            self.health.request_check(proxy.clone(), "relay failure".to_string());
        } else {
            proxy.record_outcome(&self.stats, ip, start.elapsed().as_secs_f64(), false).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_connection(
        &self,
        peer: SocketAddr,
        peer_pid: Option<&(u32, String)>,
        parsed: &ParsedRequest,
        proxy_name: Option<&str>,
        status: u16,
        upload: u64,
        download: u64,
        start: Instant,
        mark: char,
    ) {
        let entry = CommonLogEntry {
            timestamp: chrono::Utc::now(),
            peer: peer.ip().to_string(),
            peer_pid: peer_pid.map(|(pid, _)| *pid),
            protocol: if parsed.is_connect { "https".to_string() } else { "http".to_string() },
            proxy_name: proxy_name.map(|s| s.to_string()),
            request_line: format!("{} {} HTTP/{}", parsed.method, parsed.request_target, parsed.version),
            upload_bytes: upload,
            download_bytes: download,
            content_length: parsed.content_length,
            ttfb_ms: None,
            total_ms: start.elapsed().as_millis() as u64,
            status,
            app_name: peer_pid.map(|(_, name)| name.clone()),
            mark,
        };
        self.logs.log(entry).await;
    }
}

const DIRECT_MARKER_HOST: &str = "__direct__";

fn direct_marker() -> Arc<Proxy> {
    Arc::new(Proxy::new(DIRECT_MARKER_HOST, 0, DIRECT_MARKER_HOST, ProxyKind::Direct))
}

struct RelayOutcome {
    upload: u64,
    download: u64,
    failed: bool,
}

impl RelayOutcome {
    fn failed() -> Self {
        RelayOutcome { upload: 0, download: 0, failed: true }
    }
}

/// The raw byte relay used for CONNECT tunnels: each side is read with a
/// 1 s deadline; `idle_time` accumulates since the last byte seen in
/// either direction. Breaks with no failure stat once idle exceeds
/// `close_on_idle_timeout`; breaks with a failure stat if no byte has
/// *ever* been seen in the upstream→client direction once idle reaches
/// `default_timeout` — the exact arithmetic of `forward_forever`, not a
/// fixed ~58s figure (SPEC_FULL.md §4.4 resolved supplement).
async fn relay_tunnel<C, U>(client: &mut C, upstream: &mut U, thresholds: &Thresholds) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut upload = 0u64;
    let mut download = 0u64;
    let mut responded = false;
    let mut idle = Duration::ZERO;
    let tick = Duration::from_secs(1);
    let mut cbuf = vec![0u8; 16 * 1024];
    let mut ubuf = vec![0u8; 16 * 1024];

    loop {
        let mut progressed = false;
        tokio::select! {
            result = tokio::time::timeout(tick, client.read(&mut cbuf)) => {
                match result {
                    Ok(Ok(0)) => return RelayOutcome { upload, download, failed: false },
                    Ok(Ok(n)) => {
                        if upstream.write_all(&cbuf[..n]).await.is_err() {
                            return RelayOutcome { upload, download, failed: true };
                        }
                        upload += n as u64;
                        progressed = true;
                    }
                    Ok(Err(_)) => return RelayOutcome { upload, download, failed: true },
                    Err(_) => {}
                }
            }
            result = tokio::time::timeout(tick, upstream.read(&mut ubuf)) => {
                match result {
                    Ok(Ok(0)) => return RelayOutcome { upload, download, failed: false },
                    Ok(Ok(n)) => {
                        if client.write_all(&ubuf[..n]).await.is_err() {
                            return RelayOutcome { upload, download, failed: true };
                        }
                        download += n as u64;
                        responded = true;
                        progressed = true;
                    }
                    Ok(Err(_)) => return RelayOutcome { upload, download, failed: true },
                    Err(_) => {}
                }
            }
        }

        if progressed {
            idle = Duration::ZERO;
            continue;
        }
        idle += tick;
        if idle > Duration::from_secs(thresholds.close_on_idle_timeout_secs) {
            return RelayOutcome { upload, download, failed: false };
        }
        if !responded && idle.as_secs() % thresholds.default_timeout_secs == 0 && idle.as_secs() > 0 {
            return RelayOutcome { upload, download, failed: true };
        }
    }
}

struct ParsedRequest {
    method: String,
    request_target: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    is_connect: bool,
    should_close: bool,
    content_length: Option<u64>,
    target_host: Option<String>,
    target_port: Option<u16>,
}

/// Reads one HTTP request off `stream`: a 1 s deadline for the first
/// byte, `overall` for the rest of the head, then any declared body.
/// Returns `Ok(None)` on a clean EOF before any bytes arrive (keep-alive
/// idle close).
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S, first_byte_deadline: Duration, overall: Duration) -> Result<Option<ParsedRequest>> {
    let head = match read_head(stream, first_byte_deadline, overall).await? {
        Some(h) => h,
        None => return Ok(None),
    };

    let mut lines = head.split("\r\n");
    let request_line = lines.next().context("empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing method")?.to_string();
    let request_target = parts.next().context("missing request target")?.to_string();
    let version = parts
        .next()
        .and_then(|v| v.strip_prefix("HTTP/"))
        .unwrap_or("1.1")
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let (target_host, target_port) = if is_connect {
        let (h, p) = split_host_port(&request_target, 443);
        (Some(h), Some(p))
    } else if let Some(rest) = request_target.strip_prefix("http://").or_else(|| request_target.strip_prefix("https://")) {
        let authority = rest.split('/').next().unwrap_or(rest);
        let (h, p) = split_host_port(authority, 80);
        (Some(h), Some(p))
    } else {
        (None, None)
    };

    let path = if is_connect {
        String::new()
    } else if target_host.is_some() {
        let idx = request_target.find("://").map(|i| i + 3).unwrap_or(0);
        let rest = &request_target[idx..];
        rest.find('/').map(|i| rest[i..].to_string()).unwrap_or_else(|| "/".to_string())
    } else {
        request_target.clone()
    };

    let content_length = headers.get("content-length").and_then(|v| v.parse::<u64>().ok());
    let chunked = headers.get("transfer-encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false);
    let should_close = headers
        .get("connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(version == "1.0");

    let body = if let Some(len) = content_length {
        read_exact_body(stream, len).await?
    } else if chunked {
        read_chunked_body(stream).await?
    } else {
        Vec::new()
    };

    Ok(Some(ParsedRequest {
        method,
        request_target,
        path,
        version,
        headers,
        body,
        is_connect,
        should_close,
        content_length,
        target_host,
        target_port,
    }))
}

struct ParsedResponse {
    raw: Vec<u8>,
    status: u16,
    should_close: bool,
}

async fn read_response<S: AsyncRead + Unpin>(stream: &mut S, overall: Duration) -> Result<ParsedResponse> {
    let head = match read_head(stream, overall, overall).await? {
        Some(h) => h,
        None => anyhow::bail!("upstream closed before sending a response"),
    };

    let mut lines = head.split("\r\n");
    let status_line = lines.next().context("empty response")?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .context("malformed status line")?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length = headers.get("content-length").and_then(|v| v.parse::<u64>().ok());
    let chunked = headers.get("transfer-encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false);
    let should_close = headers.get("connection").map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false);

    let mut raw = format!("{}\r\n\r\n", head).into_bytes();
    if let Some(len) = content_length {
        let body = read_exact_body(stream, len).await?;
        raw.extend_from_slice(&body);
    } else if chunked {
        let body = read_chunked_body(stream).await?;
        raw.extend_from_slice(&body);
    }

    Ok(ParsedResponse { raw, status, should_close })
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S, first_byte_deadline: Duration, overall: Duration) -> Result<Option<String>> {
    let mut buf = Vec::with_capacity(512);
    let mut last4 = [0u8; 4];
    let deadline = Instant::now() + overall;
    let mut byte = [0u8; 1];

    let first = tokio::time::timeout(first_byte_deadline, stream.read(&mut byte)).await;
    match first {
        Ok(Ok(0)) => return Ok(None),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Ok(None),
    }
    buf.push(byte[0]);
    last4.rotate_left(1);
    last4[3] = byte[0];

    loop {
        if &last4 == b"\r\n\r\n" {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("timed out reading request head");
        }
        let n = tokio::time::timeout(remaining, stream.read(&mut byte))
            .await
            .context("timed out reading request head")??;
        if n == 0 {
            anyhow::bail!("connection closed mid-head");
        }
        buf.push(byte[0]);
        last4.rotate_left(1);
        last4[3] = byte[0];
        if buf.len() > 64 * 1024 {
            anyhow::bail!("request head exceeded size limit");
        }
    }

    buf.truncate(buf.len() - 4);
    Ok(Some(String::from_utf8_lossy(&buf).to_string()))
}

async fn read_exact_body<S: AsyncRead + Unpin>(stream: &mut S, len: u64) -> Result<Vec<u8>> {
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.context("reading request body")?;
    Ok(body)
}

async fn read_chunked_body<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream).await?;
        let size = u64::from_str_radix(size_line.trim(), 16).context("malformed chunk size")?;
        if size == 0 {
            let _ = read_line(stream).await;
            break;
        }
        let mut chunk = vec![0u8; size as usize];
        stream.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        stream.read_exact(&mut crlf).await?;
    }
    Ok(body)
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    Ok(String::from_utf8_lossy(&line).to_string())
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = rest[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (authority.to_string(), default_port),
    }
}

/// `rewrite_request`: drops `Proxy-Connection` and `Proxy-Name`, converts
/// the request line to origin-form for a proxied upstream, and
/// re-serializes headers and body.
fn rewrite_request(parsed: &ParsedRequest, host: &str, port: u16) -> Vec<u8> {
    let _ = (host, port);
    let origin_form = format!("{} {} HTTP/{}\r\n", parsed.method, parsed.path, parsed.version);
    let mut out = origin_form.into_bytes();
    for (name, value) in &parsed.headers {
        if name.eq_ignore_ascii_case("proxy-connection") || name.eq_ignore_ascii_case("proxy-name") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&parsed.body);
    out
}

async fn write_plain_response<S: AsyncWrite + Unpin>(stream: &mut S, status: u16, body: &str) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

/// Best-effort owning-process lookup via `/proc/net/tcp`: maps the
/// client's local port to an inode, then scans `/proc/*/fd` for a socket
/// matching that inode. Returns `None` (not an error) when unsupported or
/// denied — attribution is advisory, never load-bearing.
fn lookup_owning_pid(local_port: u16, _peer_port: u16) -> Option<(u32, String)> {
    let inode = find_socket_inode(local_port)?;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let pid: u32 = entry.file_name().to_string_lossy().parse().ok()?;
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else { continue };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                let link = link.to_string_lossy();
                if link == format!("socket:[{}]", inode) {
                    let name = std::fs::read_to_string(entry.path().join("comm"))
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default();
                    return Some((pid, name));
                }
            }
        }
    }
    None
}

fn find_socket_inode(local_port: u16) -> Option<u64> {
    let text = std::fs::read_to_string("/proc/net/tcp").ok()?;
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let local = fields[1];
        let Some((_, port_hex)) = local.split_once(':') else { continue };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else { continue };
        if port == local_port {
            return fields[9].parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn parses_plain_get_request() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        drop(client);
        let parsed = read_request(&mut server, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path, "/index.html");
        assert_eq!(parsed.target_host.as_deref(), Some("example.com"));
        assert_eq!(parsed.target_port, Some(80));
    }

    #[tokio::test]
    async fn parses_connect_request() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await.unwrap();
        drop(client);
        let parsed = read_request(&mut server, Duration::from_secs(1), Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(parsed.is_connect);
        assert_eq!(parsed.target_host.as_deref(), Some("example.com"));
        assert_eq!(parsed.target_port, Some(443));
    }

    #[test]
    fn split_host_port_handles_ipv6_literal() {
        let (host, port) = split_host_port("[::1]:8080", 80);
        assert_eq!(host, "::1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn split_host_port_defaults_when_no_colon() {
        let (host, port) = split_host_port("example.com", 443);
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn rewrite_request_drops_proxy_headers() {
        let mut headers = HashMap::new();
        headers.insert("proxy-connection".to_string(), "keep-alive".to_string());
        headers.insert("proxy-name".to_string(), "upstream1".to_string());
        headers.insert("x-test".to_string(), "1".to_string());
        let parsed = ParsedRequest {
            method: "GET".to_string(),
            request_target: "http://example.com/".to_string(),
            path: "/".to_string(),
            version: "1.1".to_string(),
            headers,
            body: Vec::new(),
            is_connect: false,
            should_close: false,
            content_length: None,
            target_host: Some("example.com".to_string()),
            target_port: Some(80),
        };
        let rewritten = String::from_utf8(rewrite_request(&parsed, "example.com", 80)).unwrap();
        assert!(!rewritten.to_lowercase().contains("proxy-connection"));
        assert!(!rewritten.to_lowercase().contains("proxy-name"));
        assert!(rewritten.contains("x-test: 1"));
        assert!(rewritten.starts_with("GET / HTTP/1.1"));
    }
}
