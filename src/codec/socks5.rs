//! SOCKS5 upstream handshake (RFC 1928, no-auth only): the no-auth greeting,
//! the connect request, and the variable-length connect reply.
//!
//! Grounded on `examples/original_source/tsproxy/proxy.py`'s
//! `Socks5Proxy.init_connection`.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::Target;

/// `SOCKS5_CONN_REP` in the origin.
fn reply_reason(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "unknown",
    }
}

/// Performs the no-auth SOCKS5 handshake against an already-connected
/// upstream proxy stream, then issues a CONNECT for `target:port`.
/// On success the stream is positioned right after the reply and ready
/// to carry the tunneled payload.
pub async fn handshake<S>(stream: &mut S, target: &Target, port: u16) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(&[0x05, 0x01, 0x00]).await.context("socks5 hello")?;
    let mut hello_reply = [0u8; 2];
    stream.read_exact(&mut hello_reply).await.context("socks5 hello reply")?;

    let conn_req = target.encode(port, true);
    stream.write_all(&conn_req).await.context("socks5 connect request")?;

    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.context("socks5 connect reply header")?;
    let rep = header[1];
    if rep != 0x00 {
        bail!("socks5 connect response error: {}", reply_reason(rep));
    }

    // header[3] is ATYP, header[4] is the first byte of the bound address
    // (or, for a domain reply, its length byte). Consume the remainder of
    // the reply so the stream sits exactly at the tunnel payload.
    let remaining = match header[3] {
        0x01 => 3usize + 2, // ipv4: 3 more address bytes + port
        0x04 => 15 + 2,     // ipv6: 15 more address bytes + port
        0x03 => header[4] as usize + 2,
        atyp => bail!("socks5 connect reply: unknown ATYP={:#x}", atyp),
    };
    let mut rest = vec![0u8; remaining];
    stream.read_exact(&mut rest).await.context("socks5 connect reply body")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_reason_known_and_unknown_codes() {
        assert_eq!(reply_reason(0x00), "succeeded");
        assert_eq!(reply_reason(0x05), "Connection refused");
        assert_eq!(reply_reason(0xEE), "unknown");
    }
}
