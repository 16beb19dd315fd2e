//! Process entrypoint: config load, subsystem bootstrap, accept loop, and
//! signal-driven graceful shutdown (SPEC_FULL.md §5, §6).
//!
//! Grounded on `examples/original_source/tsproxy/shell.py` (`main`, arg
//! parsing, the `D`/`P`/`F` mode flags and upstream spec list) for the
//! startup sequence; the task-spawn/shutdown-channel shape follows the
//! teacher's own `main.rs`.

mod acl;
mod admin;
mod classify;
mod codec;
mod config;
mod dns;
mod error;
mod forward;
mod health;
mod logging;
mod persist;
mod pool;
mod router;
mod speed;
mod stat;

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use acl::AclList;
use admin::AdminSurface;
use classify::Classifier;
use config::{Config, RouteMode, Thresholds};
use dns::DnsResolver;
use forward::ForwardEngine;
use health::HealthManager;
use logging::LogManager;
use persist::PersistenceContext;
use pool::ProxyPool;
use router::Router;
use speed::{DomainSpeedMap, SpeedProber, SpeedSites};
use stat::StatStore;

/// Parsed command-line overrides, merged over `Config::load_with_fallback`.
/// Mirrors the origin's `shell.py` arg list: the core subset plus zero or
/// more upstream specs in the shared grammar (§6).
struct Cli {
    config_path: Option<String>,
    bind_addr: Option<String>,
    http_port: Option<u16>,
    mode: Option<RouteMode>,
    router_yaml: Option<String>,
    proxies: Vec<String>,
}

fn parse_cli() -> Cli {
    let mut cli = Cli {
        config_path: None,
        bind_addr: None,
        http_port: None,
        mode: None,
        router_yaml: None,
        proxies: Vec::new(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => cli.config_path = args.next(),
            "--bind" => cli.bind_addr = args.next(),
            "--port" => cli.http_port = args.next().and_then(|v| v.parse().ok()),
            "--router" => cli.router_yaml = args.next(),
            "--mode" => {
                cli.mode = args.next().and_then(|v| match v.as_str() {
                    "no-proxy" => Some(RouteMode::NoProxy),
                    "smart" => Some(RouteMode::Smart),
                    "proxy-all" => Some(RouteMode::ProxyAll),
                    _ => None,
                });
            }
            other if !other.starts_with('-') => cli.proxies.push(other.to_string()),
            _ => {}
        }
    }
    cli
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let cli = parse_cli();
    let mut config = Config::load_with_fallback(cli.config_path.as_deref()).context("loading config")?;
    if let Some(addr) = cli.bind_addr {
        config.server.bind_addr = addr;
    }
    if let Some(port) = cli.http_port {
        config.server.http_port = port;
    }
    if let Some(mode) = cli.mode {
        config.server.mode = mode;
    }
    if let Some(path) = cli.router_yaml {
        config.paths.router_yaml = path;
    }
    let mut cli_proxies = cli.proxies;

    let thresholds: Thresholds = config.thresholds;

    let stats = Arc::new(StatStore::new(thresholds.tp90_calc_count, Duration::from_secs(thresholds.tp90_expired_time_secs)));
    let pool = Arc::new(ProxyPool::new(stats.clone(), thresholds));
    let dns = Arc::new(DnsResolver::new(Duration::from_secs(300)));
    let classifier = Arc::new(Classifier::new(config.paths.apnic_file.clone()));
    let acl = Arc::new(AclList::new(&config.acl.allow));
    let speed_sites = Arc::new(RwLock::new(load_speed_sites(&config.paths.speed_sites)));
    let domain_map = Arc::new(DomainSpeedMap::new());

    let state_path = PathBuf::from(&config.paths.state_json);
    if let Some(restored) = persist::load(&state_path, &pool, &acl, &stats, &domain_map).await {
        if let Some(ts) = restored.last_speed_test {
            info!("last speed test was at {}", ts);
        }
    }

    for spec in std::mem::take(&mut config.proxies) {
        cli_proxies.push(spec);
    }
    for spec in &cli_proxies {
        match AdminSurface::parse_spec(spec).await {
            Some(proxy) => {
                if pool.find(&proxy.short_hostname).await.is_some() {
                    warn!("upstream {} already restored from state, skipping duplicate spec", proxy.short_hostname);
                    continue;
                }
                info!("configured upstream {} ({:?})", proxy.short_hostname, proxy.kind);
                pool.add(Arc::new(proxy), false).await;
            }
            None => warn!("could not parse upstream spec: {}", spec),
        }
    }
    if pool.len().await == 0 {
        anyhow::bail!("no proxies configured (config [proxies] and CLI args are both empty)");
    }

    let router = Arc::new(Router::load(&config.paths.router_yaml).await.context("loading router.yaml")?);

    let log_config = config.logging.clone().unwrap_or_default();
    let logs = Arc::new(LogManager::new(log_config).context("initializing common logger")?);

    let (health, health_queue) = HealthManager::new(pool.clone(), stats.clone(), thresholds);
    let health_runner = health.clone();
    tokio::spawn(async move {
        health_runner.run(health_queue).await;
    });

    let speed = Arc::new(SpeedProber::new(pool.clone(), dns.clone(), thresholds, speed_sites.clone(), domain_map.clone()));

    let admin = Arc::new(AdminSurface::new(pool.clone(), stats.clone(), router.clone(), acl.clone(), speed.clone(), state_path.clone()));

    let engine = Arc::new(ForwardEngine::new(
        pool.clone(),
        stats.clone(),
        thresholds,
        router.clone(),
        dns.clone(),
        classifier.clone(),
        acl.clone(),
        health.clone(),
        logs.clone(),
        admin.clone(),
        config.server.mode,
        speed_sites.clone(),
        domain_map.clone(),
    ));

    let lan_ip = detect_lan_ip();
    if let Some(ip) = lan_ip {
        info!("detected LAN address {}", ip);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind = format!("{}:{}", config.server.bind_addr, config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("binding {}", bind))?;
    info!("tsproxy listening on {}", bind);

    // Re-run the full speed sweep just before a prior result would expire
    // (`speed_lifetime_secs`, grounded in the origin's `speed_lifetime`),
    // so `down_speed` stays warm instead of lazily going stale mid-request.
    let speed_sweep_engine = speed.clone();
    let speed_sweep_thresholds = thresholds;
    let mut speed_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(speed_sweep_thresholds.speed_lifetime_secs.max(60)));
        loop {
            tokio::select! {
                _ = speed_shutdown.changed() => {
                    if *speed_shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    speed_sweep_engine.run_once().await;
                }
            }
        }
    });

    let forward_task = tokio::spawn(engine.clone().run(listener, shutdown_rx.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);
    health.shutdown();

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if tokio::time::timeout(grace, forward_task).await.is_err() {
        warn!("forwarding engine did not stop within {:?}, exiting anyway", grace);
    }

    let ctx = PersistenceContext {
        pool: &pool,
        acl: &acl,
        stats: &stats,
        domain_map: &domain_map,
        last_wan_ip: None,
        last_lan_ip: lan_ip,
        last_speed_test: admin.last_speed_test().await,
    };
    if let Err(e) = persist::save(&state_path, &ctx).await {
        warn!("failed to persist state on shutdown: {}", e);
    }

    Ok(())
}

fn load_speed_sites(path: &str) -> SpeedSites {
    match SpeedSites::load(path) {
        Ok(sites) => sites,
        Err(e) => {
            warn!("speed sites file {:?} not loaded ({}), starting with none configured", path, e);
            SpeedSites::empty()
        }
    }
}

/// LAN address via a connect-without-send UDP trick: no packet actually
/// leaves the host, the kernel just picks the route it would use and
/// `local_addr` reveals the interface address. Avoids depending on any
/// external WAN-IP echo service, which the ambient stack does not name a
/// concrete one for (see DESIGN.md).
fn detect_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(SocketAddr::from(([8, 8, 8, 8], 80))).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
