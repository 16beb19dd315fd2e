//! IP allow-list for inbound connections (SPEC_FULL.md §4.4, §6).
//!
//! Grounded on `security.rs` (teacher)'s `IpFilter`: a whitelist that,
//! when empty, allows everything. Generalized from exact-IP matching to
//! the subnet-wildcard (`a.b.c.*`) and CIDR (`a.b.c.d/n`) forms the
//! original `tsproxy` ACL config accepts.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::RwLock;

#[derive(Clone)]
enum Pattern {
    Exact(IpAddr),
    V4Subnet { network: u32, mask: u32 },
}

/// Mutable at runtime (`/acl_add`, `/acl_del`): each entry is kept
/// alongside its parsed pattern so the admin surface can list and remove
/// it by its original text.
pub struct AclList {
    entries: RwLock<Vec<(String, Pattern)>>,
}

impl AclList {
    pub fn new(entries: &[String]) -> Self {
        let parsed = entries
            .iter()
            .filter_map(|e| Self::parse(e).map(|p| (e.trim().to_string(), p)))
            .collect();
        AclList { entries: RwLock::new(parsed) }
    }

    /// Adds `entry` to the allow-list if it parses; returns whether it was
    /// accepted.
    pub fn add(&self, entry: &str) -> bool {
        match Self::parse(entry) {
            Some(pattern) => {
                self.entries.write().unwrap().push((entry.trim().to_string(), pattern));
                true
            }
            None => false,
        }
    }

    /// Removes every entry whose original text matches `entry` exactly;
    /// returns whether anything was removed.
    pub fn remove(&self, entry: &str) -> bool {
        let entry = entry.trim();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|(e, _)| e != entry);
        entries.len() != before
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.read().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    fn parse(entry: &str) -> Option<Pattern> {
        let entry = entry.trim();
        if let Some((prefix, bits)) = entry.split_once('/') {
            let base: Ipv4Addr = prefix.parse().ok()?;
            let bits: u32 = bits.parse().ok()?;
            if bits > 32 {
                return None;
            }
            let mask = if bits == 0 { 0 } else { !0u32 << (32 - bits) };
            return Some(Pattern::V4Subnet {
                network: u32::from(base) & mask,
                mask,
            });
        }
        if entry.contains('*') {
            let star_count = entry.matches('*').count();
            if star_count == 0 || star_count > 4 {
                return None;
            }
            let literal = entry.replace('*', "0");
            let base: Ipv4Addr = literal.parse().ok()?;
            let host_bits = 8 * star_count as u32;
            let mask = !0u32 << host_bits;
            return Some(Pattern::V4Subnet {
                network: u32::from(base) & mask,
                mask,
            });
        }
        entry.parse::<IpAddr>().ok().map(Pattern::Exact)
    }

    /// Empty allow-list means "allow everything", matching the teacher's
    /// `IpFilter` default-allow-when-unconfigured behavior.
    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        let entries = self.entries.read().unwrap();
        if entries.is_empty() {
            return true;
        }
        entries.iter().any(|(_, p)| Self::matches(p, addr))
    }

    fn matches(pattern: &Pattern, addr: IpAddr) -> bool {
        match (pattern, addr) {
            (Pattern::Exact(p), a) => *p == a,
            (Pattern::V4Subnet { network, mask }, IpAddr::V4(v4)) => (u32::from(v4) & mask) == *network,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everything() {
        let acl = AclList::new(&[]);
        assert!(acl.is_allowed("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn wildcard_subnet_matches() {
        let acl = AclList::new(&["10.0.0.*".to_string()]);
        assert!(acl.is_allowed("10.0.0.42".parse().unwrap()));
        assert!(!acl.is_allowed("10.0.1.42".parse().unwrap()));
    }

    #[test]
    fn cidr_matches() {
        let acl = AclList::new(&["192.168.1.0/24".to_string()]);
        assert!(acl.is_allowed("192.168.1.200".parse().unwrap()));
        assert!(!acl.is_allowed("192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn exact_match() {
        let acl = AclList::new(&["203.0.113.9".to_string()]);
        assert!(acl.is_allowed("203.0.113.9".parse().unwrap()));
        assert!(!acl.is_allowed("203.0.113.10".parse().unwrap()));
    }
}
