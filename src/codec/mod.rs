//! Upstream handshake codecs: the three ways an accepted connection gets
//! relayed to a chosen proxy (SPEC_FULL.md §4.4 component G).
//!
//! Grounded on `examples/original_source/tsproxy/proxy.py` (`Proxy`'s
//! per-kind `init_connection`, `comps_connect_request`, `ShadowsocksProxy`,
//! `HttpProxy`/`rewrite_http_request`).

pub mod http_connect;
pub mod shadowsocks;
pub mod socks5;

use std::net::IpAddr;

/// The address a connect-request header names: either an already-resolved
/// IP (the common case — the forwarding engine resolves up front) or a
/// domain name forwarded as-is (ATYP 0x03) when DNS is left to the proxy.
#[derive(Debug, Clone)]
pub enum Target {
    Ip(IpAddr),
    Domain(String),
}

impl Target {
    pub fn encode(&self, port: u16, socks5_hello: bool) -> Vec<u8> {
        match self {
            Target::Ip(addr) => connect_request(addr, port, socks5_hello),
            Target::Domain(name) => connect_request_domain(name, port, socks5_hello),
        }
    }
}

/// Encodes a target address the way both SOCKS5 and Shadowsocks share:
/// ATYP-tagged address followed by a big-endian port. `socks5_hello`
/// prefixes the fixed no-auth SOCKS5 greeting (`comps_connect_request`).
pub fn connect_request(addr: &IpAddr, port: u16, socks5_hello: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    if socks5_hello {
        buf.extend_from_slice(&[0x05, 0x01, 0x00]);
    }
    match addr {
        IpAddr::V4(v4) => {
            buf.push(0x01);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(0x04);
            buf.extend_from_slice(&v6.octets());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Same encoding, but for a domain name target (ATYP 0x03, length-prefixed).
pub fn connect_request_domain(domain: &str, port: u16, socks5_hello: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7 + domain.len());
    if socks5_hello {
        buf.extend_from_slice(&[0x05, 0x01, 0x00]);
    }
    buf.push(0x03);
    buf.push(domain.len() as u8);
    buf.extend_from_slice(domain.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_connect_request_with_socks5_hello() {
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        let req = connect_request(&addr, 443, true);
        assert_eq!(req, vec![0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x01, 0xbb]);
    }

    #[test]
    fn domain_connect_request_without_hello() {
        let req = connect_request_domain("example.com", 80, false);
        assert_eq!(req[0], 0x03);
        assert_eq!(req[1] as usize, "example.com".len());
        assert_eq!(&req[2..2 + 11], b"example.com");
        assert_eq!(&req[req.len() - 2..], &80u16.to_be_bytes());
    }
}
