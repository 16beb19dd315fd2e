use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::logging::LogConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub thresholds: Thresholds,
    pub acl: AclConfig,
    #[serde(default)]
    pub proxies: Vec<String>,
    pub logging: Option<LogConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    NoProxy,
    Smart,
    ProxyAll,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub http_port: u16,
    pub admin_port: u16,
    pub mode: RouteMode,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    pub router_yaml: String,
    pub proxies_json: String,
    pub speed_sites: String,
    pub apnic_file: String,
    pub apnic_url: String,
    pub state_json: String,
}

/// Every tunable named across SPEC_FULL.md §4, defaulted to the origin's
/// constants so an operator only overrides what they need to change.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Thresholds {
    pub default_timeout_secs: u64,
    pub proxy_idle_secs: u64,
    pub proxys_check_timeout_secs: u64,
    pub retry_interval_on_error_secs: u64,
    pub close_on_idle_timeout_secs: u64,
    pub max_times_fail_rate: f64,
    pub tp90_inc_threshold: f64,
    pub global_tp90_threshold: f64,
    pub fail_rate_threshold: f64,
    pub auto_pause_fail_rate_threshold: f64,
    pub tp90_expired_time_secs: u64,
    pub tp90_calc_count: usize,
    pub speed_lifetime_secs: u64,
    pub speed_test_timeout_secs: u64,
    pub speed_retry_count: u32,
    pub speed_average_threshold: f64,
    pub apnic_expired_days: u64,
    /// `hundred` in the origin: the R5 session-count ceiling on the head.
    pub sess_count_ceiling: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AclConfig {
    #[serde(default)]
    pub allow: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Lookup chain matching the teacher's startup fallback: an explicit
    /// path first, then the current directory, then the system config dir.
    pub fn load_with_fallback(explicit: Option<&str>) -> Result<Self> {
        let candidates: Vec<String> = match explicit {
            Some(p) => vec![p.to_string()],
            None => vec![
                "./tsproxy.toml".to_string(),
                "/etc/tsproxy/tsproxy.toml".to_string(),
            ],
        };
        for candidate in &candidates {
            if std::path::Path::new(candidate).exists() {
                return Self::load(candidate);
            }
        }
        Ok(Self::default())
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            default_timeout_secs: 10,
            proxy_idle_secs: 5,
            proxys_check_timeout_secs: 120,
            retry_interval_on_error_secs: 120,
            close_on_idle_timeout_secs: 600,
            max_times_fail_rate: 100.0,
            tp90_inc_threshold: 0.5,
            global_tp90_threshold: 1.9,
            fail_rate_threshold: 0.2,
            auto_pause_fail_rate_threshold: 0.3,
            tp90_expired_time_secs: 10_800,
            tp90_calc_count: 100,
            speed_lifetime_secs: 43_200,
            speed_test_timeout_secs: 5,
            speed_retry_count: 2,
            speed_average_threshold: 100.0,
            apnic_expired_days: 30,
            sess_count_ceiling: 100,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind_addr: "127.0.0.1".to_string(),
                http_port: 8118,
                admin_port: 8119,
                mode: RouteMode::Smart,
                shutdown_grace_secs: 10,
            },
            paths: PathsConfig {
                router_yaml: "router.yaml".to_string(),
                proxies_json: "proxies.json".to_string(),
                speed_sites: "speed_sites.conf".to_string(),
                apnic_file: "apnic-latest".to_string(),
                apnic_url: "https://ftp.apnic.net/apnic/stats/apnic/delegated-apnic-latest"
                    .to_string(),
                state_json: "tsproxy-state.json".to_string(),
            },
            thresholds: Thresholds::default(),
            acl: AclConfig::default(),
            proxies: Vec::new(),
            logging: Some(LogConfig::default()),
        }
    }
}
