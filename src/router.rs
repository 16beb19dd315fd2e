//! YAML-driven request router: named condition blocks evaluated in order
//! against an incoming request, yielding a target proxy name or one of
//! the `D`/`P`/`F` literals (SPEC_FULL.md §3, §4.3).
//!
//! Grounded on `examples/original_source/tsproxy/connector.py`
//! (`RouterableConnector`: `load_yaml_conf`, `get_proxy_name`, `__match`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Literal targets a router rule can name instead of a proxy short name.
pub const DIRECT: &str = "D";
pub const PROXY_ALL: &str = "P";
pub const FORBID: &str = "F";

/// A request's matchable attributes, built by the forwarding engine
/// before consulting the router.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub full_url: String,
    pub is_connect: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub method: String,
    pub app: Option<String>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct RouterRule {
    condition: String,
    target: String,
}

#[derive(Debug, Clone)]
struct ConditionBlock {
    entries: Vec<(String, Value)>,
}

struct RouterState {
    default_target: Option<String>,
    conditions: HashMap<String, ConditionBlock>,
    rules: Vec<RouterRule>,
    mtime: Option<std::time::SystemTime>,
    paused: HashMap<String, Instant>,
    last_load_attempt: Instant,
    last_parse_failure: Option<Instant>,
}

pub struct Router {
    path: PathBuf,
    state: RwLock<RouterState>,
}

impl Router {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let router = Router {
            path,
            state: RwLock::new(RouterState {
                default_target: None,
                conditions: HashMap::new(),
                rules: Vec::new(),
                mtime: None,
                paused: HashMap::new(),
                last_load_attempt: Instant::now() - Duration::from_secs(3600),
                last_parse_failure: None,
            }),
        };
        router.reload_if_stale().await;
        Ok(router)
    }

    /// Re-parses the YAML file if its mtime changed, throttled to once
    /// per second and backed off for 10 minutes after a parse failure —
    /// matching `load_yaml_conf`'s polling discipline.
    pub async fn reload_if_stale(&self) {
        let mut state = self.state.write().await;
        if state.last_load_attempt.elapsed() < Duration::from_secs(1) {
            return;
        }
        state.last_load_attempt = Instant::now();

        if let Some(failed_at) = state.last_parse_failure {
            if failed_at.elapsed() < Duration::from_secs(600) {
                return;
            }
        }

        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return,
        };
        let mtime = metadata.modified().ok();
        if mtime.is_some() && mtime == state.mtime {
            return;
        }

        match Self::parse_file(&self.path) {
            Ok((default_target, conditions, rules)) => {
                state.default_target = default_target;
                state.conditions = conditions;
                state.rules = rules;
                state.mtime = mtime;
                state.last_parse_failure = None;
            }
            Err(e) => {
                warn!("router config parse failed, keeping previous rules: {}", e);
                state.last_parse_failure = Some(Instant::now());
            }
        }
    }

    fn parse_file(path: &Path) -> Result<(Option<String>, HashMap<String, ConditionBlock>, Vec<RouterRule>)> {
        let text = std::fs::read_to_string(path).context("reading router.yaml")?;
        let doc: Value = serde_yaml::from_str(&text).context("parsing router.yaml")?;
        let mapping = doc.as_mapping().context("router.yaml root must be a mapping")?;

        let mut default_target = None;
        let mut conditions = HashMap::new();
        let mut rules = Vec::new();

        for (key, value) in mapping {
            let key = key.as_str().unwrap_or_default().to_string();
            match key.as_str() {
                "default" => {
                    default_target = value.as_str().map(|s| s.to_string());
                }
                "router" => {
                    let list = value.as_sequence().context("`router` must be a list")?;
                    for item in list {
                        let entry_map = item.as_mapping().context("router entries must be maps")?;
                        if let Some((k, v)) = entry_map.iter().next() {
                            rules.push(RouterRule {
                                condition: k.as_str().unwrap_or_default().to_string(),
                                target: v.as_str().unwrap_or_default().to_string(),
                            });
                        }
                    }
                }
                _ => {
                    if let Some(block_map) = value.as_mapping() {
                        let entries = block_map
                            .iter()
                            .map(|(k, v)| (k.as_str().unwrap_or_default().to_string(), v.clone()))
                            .collect();
                        conditions.insert(key, ConditionBlock { entries });
                    }
                }
            }
        }

        Ok((default_target, conditions, rules))
    }

    /// Marks a condition's rule as paused for 5 minutes after its target
    /// proxy fails, per `get_proxy_name`'s per-rule cooldown.
    pub async fn mark_rule_failed(&self, condition_name: &str) {
        self.state
            .write()
            .await
            .paused
            .insert(condition_name.to_string(), Instant::now());
    }

    /// Same 5-minute cooldown, keyed by proxy short name rather than
    /// condition name, for a request's `Proxy-Name` header bypassing rule
    /// matching entirely.
    pub async fn mark_named_proxy_failed(&self, proxy_name: &str) {
        self.state
            .write()
            .await
            .paused
            .insert(Self::header_pause_key(proxy_name), Instant::now());
    }

    pub async fn is_named_proxy_paused(&self, proxy_name: &str) -> bool {
        let state = self.state.read().await;
        state
            .paused
            .get(&Self::header_pause_key(proxy_name))
            .map(|at| at.elapsed() < Duration::from_secs(300))
            .unwrap_or(false)
    }

    fn header_pause_key(proxy_name: &str) -> String {
        format!("#header:{}", proxy_name)
    }

    /// Resolves a request to a target: a proxy short name, or one of
    /// `DIRECT`/`PROXY_ALL`/`FORBID`. Falls back to the YAML's `default`
    /// entry, or `PROXY_ALL` if no default is configured. Also returns the
    /// name of the condition that matched, if any — the caller must pass
    /// that name back to `mark_rule_failed` on connect failure, since the
    /// pause is tracked per *condition*, not per proxy.
    pub async fn get_target(&self, req: &RequestContext) -> (String, Option<String>) {
        self.reload_if_stale().await;
        let state = self.state.read().await;

        for rule in &state.rules {
            if let Some(paused_at) = state.paused.get(&rule.condition) {
                if paused_at.elapsed() < Duration::from_secs(300) {
                    continue;
                }
            }
            let Some(block) = state.conditions.get(&rule.condition) else {
                continue;
            };
            if Self::matches(block, req) {
                debug!("router: {} matched condition {}", req.full_url, rule.condition);
                return (rule.target.clone(), Some(rule.condition.clone()));
            }
        }

        (state.default_target.clone().unwrap_or_else(|| PROXY_ALL.to_string()), None)
    }

    fn matches(block: &ConditionBlock, req: &RequestContext) -> bool {
        block.entries.iter().all(|(key, value)| Self::match_one(key, value, req))
    }

    fn match_one(key: &str, value: &Value, req: &RequestContext) -> bool {
        match value {
            Value::Sequence(items) => {
                // list value: any plain match wins; the first negated
                // entry whose condition the request does NOT meet also
                // wins (an exclusion list: "anything but these").
                for item in items {
                    if let Some(s) = item.as_str() {
                        let (negate, raw) = Self::split_negation(s);
                        let hit = Self::match_scalar(key, raw, req);
                        if negate {
                            if !hit {
                                return true;
                            }
                        } else if hit {
                            return true;
                        }
                    }
                }
                false
            }
            Value::String(s) => {
                let (negate, raw) = Self::split_negation(s);
                let hit = Self::match_scalar(key, raw, req);
                if negate {
                    !hit
                } else {
                    hit
                }
            }
            Value::Number(n) => {
                let s = n.to_string();
                Self::match_scalar(key, &s, req)
            }
            _ => false,
        }
    }

    fn split_negation(s: &str) -> (bool, &str) {
        match s.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, s),
        }
    }

    fn match_scalar(key: &str, value: &str, req: &RequestContext) -> bool {
        match key {
            "url" => req.full_url.starts_with(value),
            "protocol" => {
                if req.is_connect {
                    value.eq_ignore_ascii_case("https")
                } else {
                    req.full_url.starts_with(&format!("{}://", value.to_lowercase()))
                }
            }
            "host" => Self::match_host(value, &req.host),
            "port" => value.parse::<u16>().map(|p| p == req.port).unwrap_or(false),
            "path" => req.path.starts_with(value),
            "method" => req.method.eq_ignore_ascii_case(value),
            "app" => req.app.as_deref().map(|a| a == value).unwrap_or(false),
            header_name => req
                .headers
                .get(header_name)
                .map(|h| h.to_lowercase().contains(&value.to_lowercase()))
                .unwrap_or(false),
        }
    }

    /// `"<tag>,<value>"`: `s` = suffix (default when untagged), `p` =
    /// prefix, `k` = keyword/substring.
    fn match_host(pattern: &str, host: &str) -> bool {
        let (tag, value) = match pattern.split_once(',') {
            Some((t, v)) if t.len() == 1 && matches!(t, "s" | "p" | "k") => (t, v),
            _ => ("s", pattern),
        };
        match tag {
            "p" => host.starts_with(value),
            "k" => host.contains(value),
            _ => host.ends_with(value),
        }
    }
}

/// Validates that every rule references a proxy name the pool actually
/// holds (or a `D`/`P`/`F` literal), mirroring `check_yaml_conf`.
pub fn validate_targets(targets: &[String], known_proxies: &[String]) -> Vec<String> {
    targets
        .iter()
        .filter(|t| t.as_str() != DIRECT && t.as_str() != PROXY_ALL && t.as_str() != FORBID)
        .filter(|t| !known_proxies.contains(t))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(host: &str) -> RequestContext {
        RequestContext {
            full_url: format!("http://{}/", host),
            host: host.to_string(),
            port: 80,
            path: "/".to_string(),
            method: "GET".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn host_suffix_match_is_default() {
        assert!(Router::match_host("example.com", "www.example.com"));
        assert!(!Router::match_host("example.com", "example.org"));
    }

    #[test]
    fn host_prefix_and_keyword_tags() {
        assert!(Router::match_host("p,www.", "www.example.com"));
        assert!(Router::match_host("k,example", "www.example.com"));
        assert!(!Router::match_host("k,nomatch", "www.example.com"));
    }

    #[test]
    fn negated_scalar_inverts_match() {
        let r = req("internal.corp");
        assert!(!Router::match_one("host", &Value::String("!internal.corp".into()), &r));
        assert!(Router::match_one("host", &Value::String("!example.com".into()), &r));
    }
}
