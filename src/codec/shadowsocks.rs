//! Shadowsocks upstream handshake: an address header sent encrypted with
//! no SOCKS5 greeting, followed by a symmetric stream cipher over every
//! subsequent byte in both directions.
//!
//! Grounded on `examples/original_source/tsproxy/proxy.py`'s
//! `ShadowsocksProxy`/`ShadowsocksEncoder`/`ShadowsocksDecoder`. The
//! origin delegates the cipher itself to a `Cryptor` class outside this
//! retrieval pack; `aes-128-ctr`/`aes-256-ctr` are the two methods this
//! port supports, keyed the way OpenSSL's legacy `EVP_BytesToKey` does.

use std::pin::Pin;
use std::task::{Context, Poll};

use aes::cipher::{KeyIvInit, StreamCipher as _};
use aes::{Aes128, Aes256};
use anyhow::{bail, Context as _, Result};
use ctr::Ctr128BE;
use md5::{Digest, Md5};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::Target;

type Aes128CtrCipher = Ctr128BE<Aes128>;
type Aes256CtrCipher = Ctr128BE<Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Ctr,
    Aes256Ctr,
}

impl Method {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "aes-128-ctr" => Ok(Method::Aes128Ctr),
            "aes-256-ctr" => Ok(Method::Aes256Ctr),
            other => bail!("unsupported shadowsocks method: {}", other),
        }
    }

    fn key_len(self) -> usize {
        match self {
            Method::Aes128Ctr => 16,
            Method::Aes256Ctr => 32,
        }
    }

    const IV_LEN: usize = 16;
}

/// OpenSSL's legacy key derivation: repeated `md5(prev || password)` until
/// enough bytes are produced.
fn derive_key(password: &str, len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(len);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        key.extend_from_slice(&digest);
        prev = digest.to_vec();
    }
    key.truncate(len);
    key
}

enum Inner {
    Aes128(Aes128CtrCipher),
    Aes256(Aes256CtrCipher),
}

/// A one-directional stream cipher instance, keyed for a single
/// connection's IV. The origin's `ShadowsocksEncoder`/`ShadowsocksDecoder`
/// each wrap one of these per direction.
pub struct DirectionalCipher {
    inner: Inner,
}

impl DirectionalCipher {
    fn new(method: Method, key: &[u8], iv: &[u8]) -> Self {
        let inner = match method {
            Method::Aes128Ctr => Inner::Aes128(Aes128CtrCipher::new(key.into(), iv.into())),
            Method::Aes256Ctr => Inner::Aes256(Aes256CtrCipher::new(key.into(), iv.into())),
        };
        DirectionalCipher { inner }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            Inner::Aes128(c) => c.apply_keystream(data),
            Inner::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// Holds the derived key for a configured proxy; mints a fresh
/// encrypt/decrypt pair (each with its own random or peer-supplied IV)
/// per connection, mirroring `new_encryptor`/`get_encryptor` being called
/// lazily once per `Connection`.
#[derive(Clone)]
pub struct Cryptor {
    method: Method,
    key: Vec<u8>,
}

impl Cryptor {
    pub fn new(password: &str, method_name: &str) -> Result<Self> {
        let method = Method::parse(method_name)?;
        let key = derive_key(password, method.key_len());
        Ok(Cryptor { method, key })
    }

    /// Generates a fresh random IV for an outgoing stream and the cipher
    /// keyed with it. The IV itself must be written to the wire first,
    /// unencrypted, ahead of any ciphertext.
    pub fn new_encoder(&self) -> (Vec<u8>, DirectionalCipher) {
        let mut iv = vec![0u8; Method::IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = DirectionalCipher::new(self.method, &self.key, &iv);
        (iv, cipher)
    }

    /// Builds the decoder once the peer's IV has been read off the wire.
    pub fn new_decoder(&self, iv: &[u8]) -> Result<DirectionalCipher> {
        if iv.len() != Method::IV_LEN {
            bail!("shadowsocks iv must be {} bytes, got {}", Method::IV_LEN, iv.len());
        }
        Ok(DirectionalCipher::new(self.method, &self.key, iv))
    }
}

/// Bytes of the peer's IV collected so far, across however many
/// `poll_read` calls it takes to see all of them.
struct IvCollector {
    buf: [u8; Method::IV_LEN],
    filled: usize,
}

/// The decoder doesn't exist until the peer's IV has arrived on the wire.
/// A Shadowsocks server sends nothing — not even its IV — until it has
/// received our request, so this can't be built eagerly at connect time.
enum DecoderState {
    Pending(IvCollector),
    Ready(DirectionalCipher),
}

/// Wraps an already-connected stream with independent send/receive stream
/// ciphers. Reads decrypt in place, lazily collecting the peer's IV out of
/// the first bytes delivered before any decryption happens; writes buffer
/// the encrypted form of the caller's slice and drain it across
/// possibly-partial underlying writes, since a CTR keystream can't be
/// "rewound" once consumed.
pub struct CipherStream<S> {
    inner: S,
    encoder: DirectionalCipher,
    decoder: DecoderState,
    cryptor: Cryptor,
    write_buf: Vec<u8>,
    write_pos: usize,
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    /// Mirrors `ShadowsocksDecoder.__call__`/`do_decrypt`: the peer IV is
    /// read lazily off the first inbound bytes, not during the handshake.
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.decoder {
                DecoderState::Ready(cipher) => {
                    let before = buf.filled().len();
                    return match Pin::new(&mut this.inner).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            cipher.apply(&mut buf.filled_mut()[before..]);
                            Poll::Ready(Ok(()))
                        }
                        other => other,
                    };
                }
                DecoderState::Pending(collector) => {
                    let need = Method::IV_LEN - collector.filled;
                    let mut tmp = [0u8; Method::IV_LEN];
                    let mut iv_buf = ReadBuf::new(&mut tmp[..need]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf) {
                        Poll::Ready(Ok(())) => {
                            let n = iv_buf.filled().len();
                            if n == 0 {
                                // Underlying EOF while still waiting on the IV.
                                return Poll::Ready(Ok(()));
                            }
                            collector.buf[collector.filled..collector.filled + n].copy_from_slice(&tmp[..n]);
                            collector.filled += n;
                            if collector.filled == Method::IV_LEN {
                                let cipher = this
                                    .cryptor
                                    .new_decoder(&collector.buf)
                                    .expect("iv length fixed by construction");
                                this.decoder = DecoderState::Ready(cipher);
                            }
                            // loop: either deliver real data now, or keep collecting
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.write_buf.is_empty() {
            this.write_buf = buf.to_vec();
            this.encoder.apply(&mut this.write_buf);
            this.write_pos = 0;
        }
        loop {
            if this.write_pos >= this.write_buf.len() {
                this.write_buf.clear();
                this.write_pos = 0;
                return Poll::Ready(Ok(buf.len()));
            }
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_buf[this.write_pos..]) {
                Poll::Ready(Ok(n)) => this.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Performs the address-header-only handshake (no SOCKS5 greeting, no
/// reply read — `ShadowsocksProxy.init_connection`) and returns the
/// stream wrapped for transparent encryption of everything after it. Does
/// not wait for the peer's IV: the server only replies after it has
/// received a request, which the caller writes through this stream after
/// `connect()` returns, so reading here would deadlock.
pub async fn connect<S>(mut stream: S, cryptor: &Cryptor, target: &Target, port: u16) -> Result<CipherStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (iv_out, mut encoder) = cryptor.new_encoder();
    stream.write_all(&iv_out).await.context("write shadowsocks iv")?;

    let mut header = target.encode(port, false);
    encoder.apply(&mut header);
    stream.write_all(&header).await.context("write shadowsocks address header")?;

    Ok(CipherStream {
        inner: stream,
        encoder,
        decoder: DecoderState::Pending(IvCollector {
            buf: [0u8; Method::IV_LEN],
            filled: 0,
        }),
        cryptor: cryptor.clone(),
        write_buf: Vec::new(),
        write_pos: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_matches_requested_length() {
        assert_eq!(derive_key("hunter2", 16).len(), 16);
        assert_eq!(derive_key("hunter2", 32).len(), 32);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cryptor = Cryptor::new("hunter2", "aes-256-ctr").unwrap();
        let (iv, mut enc) = cryptor.new_encoder();
        let mut dec = cryptor.new_decoder(&iv).unwrap();

        let mut data = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        let plain = data.clone();
        enc.apply(&mut data);
        assert_ne!(data, plain);
        dec.apply(&mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn unsupported_method_rejected() {
        assert!(Cryptor::new("x", "rc4-md5").is_err());
    }

    #[tokio::test]
    async fn handshake_writes_iv_then_encrypted_header() {
        use tokio::io::duplex;

        let cryptor = Cryptor::new("hunter2", "aes-128-ctr").unwrap();
        let (client, mut server) = duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut iv = [0u8; 16];
            server.read_exact(&mut iv).await.unwrap();
            let mut header = vec![0u8; 10];
            server.read_exact(&mut header).await.unwrap();
            let peer_cryptor = Cryptor::new("hunter2", "aes-128-ctr").unwrap();
            let mut dec = peer_cryptor.new_decoder(&iv).unwrap();
            dec.apply(&mut header);
            assert_eq!(header[0], 0x01);
            assert_eq!(&header[1..5], &[1, 2, 3, 4]);

            let (server_iv, mut enc) = peer_cryptor.new_encoder();
            server.write_all(&server_iv).await.unwrap();
            let mut payload = b"hello".to_vec();
            enc.apply(&mut payload);
            server.write_all(&payload).await.unwrap();
        });

        let target = Target::Ip("1.2.3.4".parse().unwrap());
        let mut wrapped = connect(client, &cryptor, &target, 443).await.unwrap();

        let mut response = vec![0u8; 5];
        wrapped.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"hello");

        server_task.await.unwrap();
    }
}
