//! Error taxonomy for the connection & forwarding engine (SPEC_FULL.md §7).
//!
//! Internal plumbing returns `anyhow::Result` up to the boundary where a
//! client-facing outcome must be produced; `ProxyError` is that boundary
//! type. Each variant knows its HTTP status and carries the `(TSP)`
//! reason-phrase suffix so synthesized responses are distinguishable from
//! genuine upstream replies.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed client request: {0}")]
    ClientParse(String),

    #[error("Dns({host}) fail")]
    DnsFailure { host: String },

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream handshake failed: {0}")]
    UpstreamHandshake(String),

    #[error("upstream closed without response")]
    NoResponse,

    #[error("unparsable upstream response: {0}")]
    UnparsableResponse(String),

    #[error("upstream response timeout")]
    ResponseTimeout,

    #[error("relay mid-stream EOF")]
    RelayEof,

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("no found proxy config")]
    NoProxyConfigured,

    #[error("router forbids this destination: {0}")]
    RouterForbid(String),

    #[error("ACL denied")]
    AclDenied,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status this error surfaces as, per the §6/§7 code mapping.
    /// `AclDenied` and `RouterForbid`'s pre-delay 403 are handled by the
    /// caller (ACL closes silently; FORBID sleeps 5s before responding),
    /// so they're included here only for completeness of the mapping.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::ClientParse(_) => 400,
            ProxyError::NoResponse => 500,
            ProxyError::UnparsableResponse(_) => 502,
            ProxyError::DnsFailure { .. }
            | ProxyError::UpstreamConnect(_)
            | ProxyError::UpstreamHandshake(_)
            | ProxyError::NetworkUnreachable(_)
            | ProxyError::NoProxyConfigured => 503,
            ProxyError::ResponseTimeout => 504,
            ProxyError::RouterForbid(_) => 403,
            ProxyError::AclDenied => 403,
            ProxyError::RelayEof => 500,
            ProxyError::Io(_) => 502,
        }
    }

    /// Reason phrase with the `(TSP)` suffix used on every synthesized
    /// response so it is distinguishable from an upstream-originated one.
    pub fn reason_phrase(&self) -> String {
        format!("{} (TSP)", self)
    }

    /// Whether this outcome should demote the current head proxy and bump
    /// its error_count, per the §7 pool-effect column.
    pub fn demotes_head(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamConnect(_)
                | ProxyError::UpstreamHandshake(_)
                | ProxyError::NoResponse
                | ProxyError::ResponseTimeout
                | ProxyError::RelayEof
        )
    }

    /// Network-unreachable is explicitly carved out: treated as a local
    /// network issue, not a proxy quality signal, so the pool is left
    /// untouched even though the client still sees a 503.
    pub fn rotates_pool(&self) -> bool {
        self.demotes_head() && !matches!(self, ProxyError::NetworkUnreachable(_))
    }
}
