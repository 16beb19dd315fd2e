//! HTTP-CONNECT upstream handshake: tunnel through a plain HTTP proxy by
//! issuing `CONNECT host:port HTTP/1.1` and checking for a `200` reply.
//!
//! Grounded on `examples/original_source/tsproxy/proxy.py`'s
//! `HttpProxy.init_connection` and `rewrite_http_request` (the CONNECT
//! branch — forwarding a non-CONNECT first request through an HTTP proxy
//! is handled by the forwarding engine itself, not this codec).

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Writes a `CONNECT` request for `host:port` to `stream`, carrying the
/// client's original headers minus `Proxy-Name` (the origin strips only
/// that header on this path; `Proxy-Connection` stripping belongs to the
/// client-facing `rewrite_request`, not this upstream-facing one), reads
/// the status line and headers, and bails unless the status is 200.
pub async fn handshake<S>(stream: &mut S, host: &str, port: u16, extra_headers: &[(String, String)]) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\n");
    for (name, value) in extra_headers {
        if name.eq_ignore_ascii_case("Proxy-Name") {
            continue;
        }
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .context("write CONNECT request to upstream http proxy")?;

    let status = read_status_line(stream).await?;
    if status != 200 {
        bail!("upstream http-connect proxy refused with status {}", status);
    }
    Ok(())
}

/// Reads byte-by-byte until the blank line terminating the response
/// headers, returning the parsed status code. Byte-at-a-time is correct
/// here (as in the origin) because anything read past the header
/// terminator belongs to the tunneled payload and must not be consumed.
async fn read_status_line<S>(stream: &mut S) -> Result<u16>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut last4 = [0u8; 4];
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.context("read CONNECT response")?;
        if n == 0 {
            bail!("upstream closed before completing CONNECT response");
        }
        buf.push(byte[0]);
        last4.rotate_left(1);
        last4[3] = byte[0];
        if &last4 == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 16 * 1024 {
            bail!("CONNECT response headers exceeded size limit");
        }
    }

    let status_line = buf
        .split(|&b| b == b'\n')
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty CONNECT response"))?;
    let status_line = String::from_utf8_lossy(status_line);
    let mut parts = status_line.split_whitespace();
    let _http_version = parts.next();
    let code = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("malformed CONNECT status line: {:?}", status_line))?;
    code.parse::<u16>()
        .with_context(|| format!("malformed CONNECT status code: {:?}", code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_succeeds_on_200() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("CONNECT example.com:443"));
            server.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
        });
        handshake(&mut client, "example.com", 443, &[]).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_fails_on_non_200() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
        });
        let err = handshake(&mut client, "example.com", 443, &[]).await.unwrap_err();
        assert!(err.to_string().contains("407"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn proxy_name_header_is_stripped() {
        let (mut client, mut server) = duplex(1024);
        let headers = vec![
            ("Proxy-Name".to_string(), "upstream1".to_string()),
            ("X-Test".to_string(), "keep-me".to_string()),
        ];
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(!text.contains("Proxy-Name"));
            assert!(text.contains("X-Test: keep-me"));
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });
        handshake(&mut client, "example.com", 443, &headers).await.unwrap();
        server_task.await.unwrap();
    }
}
