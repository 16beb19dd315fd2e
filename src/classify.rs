//! CN-vs-foreign IP classification from an APNIC delegation file, plus
//! RFC1918/loopback "local" classification (SPEC_FULL.md §2 component A,
//! §6 smart-mode dispatch).
//!
//! Grounded on `examples/original_source/tsproxy/topendns.py`
//! (`load_cn_list`, `is_cn_ip`, `is_local`, `local_ip_list`).

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// `(network, mask, country)`, both as big-endian u32 for IPv4. IPv6
/// ranges from the APNIC file are not classified here — the origin
/// supports them, but SPEC_FULL.md's smart-routing surface is IPv4-only.
struct CnRange {
    network: u32,
    mask: u32,
    country: String,
}

/// RFC1918 + loopback ranges treated as always-local, verbatim from
/// `topendns.py`'s `local_ip_list`.
const LOCAL_RANGES: &[(Ipv4Addr, u32)] = &[
    (Ipv4Addr::new(127, 0, 0, 0), 0xff00_0000),
    (Ipv4Addr::new(10, 0, 0, 0), 0xff00_0000),
    (Ipv4Addr::new(192, 168, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 16, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 17, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 18, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 19, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 20, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 21, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 22, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 23, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 24, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 25, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 26, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 27, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 28, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 29, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 30, 0, 0), 0xffff_0000),
    (Ipv4Addr::new(172, 31, 0, 0), 0xffff_0000),
];

/// The GFW's well-known DNS-poisoning answers; an address resolving to
/// one of these is treated as foreign regardless of the APNIC table.
const POISONED_IPS: &[&str] = &["202.106.1.2", "211.94.66.147", "180.168.41.175"];

pub fn is_local(addr: IpAddr) -> bool {
    let IpAddr::V4(v4) = addr else { return false };
    let ipn = u32::from(v4);
    LOCAL_RANGES.iter().any(|(net, mask)| (ipn & mask) == (u32::from(*net) & mask))
}

pub struct Classifier {
    apnic_path: PathBuf,
    state: RwLock<ClassifierState>,
}

struct ClassifierState {
    ranges: Vec<CnRange>,
    file_mtime: Option<std::time::SystemTime>,
    last_check: Instant,
}

impl Classifier {
    pub fn new(apnic_path: impl Into<PathBuf>) -> Self {
        Classifier {
            apnic_path: apnic_path.into(),
            state: RwLock::new(ClassifierState {
                ranges: Vec::new(),
                file_mtime: None,
                last_check: Instant::now() - Duration::from_secs(120),
            }),
        }
    }

    /// Re-parses the APNIC delegation file if its mtime changed, throttled
    /// to once per 60s (`load_cn_list`'s `cn_ip_update` gate).
    pub async fn reload_if_stale(&self) {
        let mut state = self.state.write().await;
        if state.last_check.elapsed() < Duration::from_secs(60) {
            return;
        }
        state.last_check = Instant::now();

        let metadata = match std::fs::metadata(&self.apnic_path) {
            Ok(m) => m,
            Err(_) => {
                error!("apnic file not found: {:?}", self.apnic_path);
                return;
            }
        };
        let mtime = metadata.modified().ok();
        if mtime.is_some() && mtime <= state.file_mtime {
            return;
        }

        match Self::parse(&self.apnic_path) {
            Ok(ranges) => {
                info!("{:?} loaded ({} ranges)", self.apnic_path, ranges.len());
                state.ranges = ranges;
                state.file_mtime = mtime;
            }
            Err(e) => warn!("failed to parse apnic file {:?}: {}", self.apnic_path, e),
        }
    }

    fn parse(path: &Path) -> std::io::Result<Vec<CnRange>> {
        let text = std::fs::read_to_string(path)?;
        let mut ranges = Vec::new();
        for line in text.lines() {
            // apnic|cc|ipv4|start|count|date|status
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() < 7 || fields[0] != "apnic" {
                continue;
            }
            if fields[2] != "ipv4" || !fields[6].to_lowercase().starts_with('a') {
                continue;
            }
            let Ok(start) = fields[3].parse::<Ipv4Addr>() else { continue };
            let Ok(count) = fields[4].parse::<u32>() else { continue };
            if count == 0 {
                continue;
            }
            let mask = 0xffff_ffffu32 ^ (count - 1);
            ranges.push(CnRange {
                network: u32::from(start) & mask,
                mask,
                country: fields[1].to_uppercase(),
            });
        }
        Ok(ranges)
    }

    /// Classifies an already-resolved address as CN (`true`) or foreign
    /// (`false`). Local/private addresses are always CN (the origin
    /// treats LAN traffic as not needing a proxy). Unknown addresses
    /// default to foreign.
    pub async fn is_cn(&self, addr: IpAddr) -> bool {
        self.reload_if_stale().await;

        if POISONED_IPS.iter().any(|p| addr.to_string() == *p) {
            return false;
        }
        if is_local(addr) {
            return true;
        }
        let IpAddr::V4(v4) = addr else { return false };
        let ipn = u32::from(v4);
        let state = self.state.read().await;
        for range in &state.ranges {
            if (ipn & range.mask) == range.network {
                return range.country == "CN";
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_private_ranges_are_local() {
        assert!(is_local("127.0.0.1".parse().unwrap()));
        assert!(is_local("192.168.1.5".parse().unwrap()));
        assert!(is_local("10.0.0.1".parse().unwrap()));
        assert!(!is_local("8.8.8.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn unknown_address_defaults_foreign() {
        let classifier = Classifier::new("/nonexistent/apnic-latest");
        assert!(!classifier.is_cn("8.8.8.8".parse().unwrap()).await);
    }
}
