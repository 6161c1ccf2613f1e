//! Encrypted tunnel parent connector
//!
//! Client side of a shadowsocks-style AEAD tunnel. Each direction
//! derives its own session subkey from the pre-shared password via a
//! random salt, then carries length-prefixed sealed frames:
//!
//! ```text
//! [salt][len ciphertext + tag][payload ciphertext + tag]...
//! ```
//!
//! The master key comes from the classic EVP_BytesToKey MD5 stretch of
//! the password; session subkeys from HKDF-SHA1 with info `ss-subkey`.
//! Nonces start at zero and increment little-endian per sealed chunk.
//! The `plain` method is an identity marker for relays that expect the
//! target address header without encryption.

use anyhow::{bail, Context, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::Established;

const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
/// Largest payload per frame, per the AEAD framing convention.
const MAX_PAYLOAD: usize = 0x3FFF;
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Cipher selection for a shadow-tunnel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMethod {
    Aes128Gcm,
    Aes256Gcm,
    /// Identity marker: the address header and payload pass unencrypted.
    Plain,
}

impl CipherMethod {
    /// Parse a configured method name. The empty string is the explicit
    /// identity marker for an entry with no method configured.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "aes-128-gcm" => Ok(CipherMethod::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherMethod::Aes256Gcm),
            "" | "plain" => Ok(CipherMethod::Plain),
            other => bail!("unknown shadow cipher method: {}", other),
        }
    }

    /// Key length, which doubles as the salt length.
    pub fn key_len(self) -> usize {
        match self {
            CipherMethod::Aes128Gcm => 16,
            CipherMethod::Aes256Gcm => 32,
            CipherMethod::Plain => 0,
        }
    }
}

enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl AeadCipher {
    fn new(method: CipherMethod, subkey: &[u8]) -> io::Result<Self> {
        match method {
            CipherMethod::Aes128Gcm => Aes128Gcm::new_from_slice(subkey)
                .map(|c| AeadCipher::Aes128(Box::new(c)))
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad key length")),
            CipherMethod::Aes256Gcm => Aes256Gcm::new_from_slice(subkey)
                .map(|c| AeadCipher::Aes256(Box::new(c)))
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad key length")),
            CipherMethod::Plain => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "plain method has no cipher",
            )),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plain: &[u8]) -> Vec<u8> {
        let nonce = Nonce::from_slice(nonce);
        let sealed = match self {
            AeadCipher::Aes128(c) => c.encrypt(nonce, plain),
            AeadCipher::Aes256(c) => c.encrypt(nonce, plain),
        };
        // Encryption with a valid key and in-memory buffers cannot fail
        sealed.expect("aead seal")
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], sealed: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            AeadCipher::Aes128(c) => c.decrypt(nonce, sealed),
            AeadCipher::Aes256(c) => c.decrypt(nonce, sealed),
        }
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "tunnel frame failed to open"))
    }
}

/// One direction's cipher state: subkey plus incrementing nonce.
struct DirectionKey {
    cipher: AeadCipher,
    nonce: [u8; NONCE_LEN],
}

impl DirectionKey {
    fn derive(method: CipherMethod, master_key: &[u8], salt: &[u8]) -> io::Result<Self> {
        let mut subkey = vec![0u8; method.key_len()];
        let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
        hk.expand(SUBKEY_INFO, &mut subkey)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "subkey derivation failed"))?;
        Ok(Self {
            cipher: AeadCipher::new(method, &subkey)?,
            nonce: [0u8; NONCE_LEN],
        })
    }

    fn seal_next(&mut self, plain: &[u8]) -> Vec<u8> {
        let out = self.cipher.seal(&self.nonce, plain);
        increment_nonce(&mut self.nonce);
        out
    }

    fn open_next(&mut self, sealed: &[u8]) -> io::Result<Vec<u8>> {
        let out = self.cipher.open(&self.nonce, sealed)?;
        increment_nonce(&mut self.nonce);
        Ok(out)
    }
}

fn increment_nonce(nonce: &mut [u8; NONCE_LEN]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

/// EVP_BytesToKey(MD5) password stretch, the classic shadowsocks master
/// key derivation.
pub(crate) fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut h = Md5::new();
        h.update(&prev);
        h.update(password);
        prev = h.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// An AEAD-framed duplex stream over `S`.
///
/// The sending salt is queued at construction and goes out with the
/// first write; the receiving subkey is derived lazily from the remote
/// salt at the head of the inbound stream.
pub struct ShadowStream<S> {
    inner: S,
    method: CipherMethod,
    master_key: Vec<u8>,
    send: DirectionKey,
    recv: Option<DirectionKey>,
    // inbound: raw ciphertext, current frame length, decrypted bytes
    raw: Vec<u8>,
    pending_len: Option<usize>,
    plain: Vec<u8>,
    plain_off: usize,
    // outbound ciphertext not yet written to `inner`
    wbuf: Vec<u8>,
    woff: usize,
}

impl<S> ShadowStream<S> {
    /// Wrap `inner` with a fresh random send salt. Fails only on a
    /// method/key mismatch, which configuration validation rules out.
    pub fn new(inner: S, method: CipherMethod, master_key: Vec<u8>) -> io::Result<Self> {
        let mut salt = vec![0u8; method.key_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        let send = DirectionKey::derive(method, &master_key, &salt)?;
        Ok(Self {
            inner,
            method,
            master_key,
            send,
            recv: None,
            raw: Vec::new(),
            pending_len: None,
            plain: Vec::new(),
            plain_off: 0,
            wbuf: salt,
            woff: 0,
        })
    }

    /// Seal one plaintext chunk (length frame + payload frame) into the
    /// outbound buffer.
    fn seal_chunk(&mut self, plain: &[u8]) {
        debug_assert!(plain.len() <= MAX_PAYLOAD);
        let len_bytes = (plain.len() as u16).to_be_bytes();
        let sealed_len = self.send.seal_next(&len_bytes);
        self.wbuf.extend_from_slice(&sealed_len);
        let sealed_payload = self.send.seal_next(plain);
        self.wbuf.extend_from_slice(&sealed_payload);
    }

    /// Try to make inbound progress without touching the socket.
    /// Returns true when a state transition happened.
    fn advance_recv(&mut self) -> io::Result<bool> {
        if self.recv.is_none() {
            let salt_len = self.method.key_len();
            if self.raw.len() < salt_len {
                return Ok(false);
            }
            let salt: Vec<u8> = self.raw.drain(..salt_len).collect();
            self.recv = Some(DirectionKey::derive(self.method, &self.master_key, &salt)?);
            return Ok(true);
        }
        match self.pending_len {
            None => {
                if self.raw.len() < 2 + TAG_LEN {
                    return Ok(false);
                }
                let frame: Vec<u8> = self.raw.drain(..2 + TAG_LEN).collect();
                let len_bytes = self.recv.as_mut().unwrap().open_next(&frame)?;
                let n = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize & MAX_PAYLOAD;
                self.pending_len = Some(n);
                Ok(true)
            }
            Some(n) => {
                if self.raw.len() < n + TAG_LEN {
                    return Ok(false);
                }
                let frame: Vec<u8> = self.raw.drain(..n + TAG_LEN).collect();
                let payload = self.recv.as_mut().unwrap().open_next(&frame)?;
                self.pending_len = None;
                self.plain = payload;
                self.plain_off = 0;
                Ok(true)
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShadowStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if me.plain_off < me.plain.len() {
                let n = buf.remaining().min(me.plain.len() - me.plain_off);
                buf.put_slice(&me.plain[me.plain_off..me.plain_off + n]);
                me.plain_off += n;
                return Poll::Ready(Ok(()));
            }
            match me.advance_recv() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => return Poll::Ready(Err(e)),
            }
            let mut tmp = [0u8; 4096];
            let mut rb = ReadBuf::new(&mut tmp);
            match Pin::new(&mut me.inner).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    if rb.filled().is_empty() {
                        if me.raw.is_empty() && me.pending_len.is_none() {
                            // Clean EOF on a frame boundary
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "tunnel closed mid-frame",
                        )));
                    }
                    me.raw.extend_from_slice(rb.filled());
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShadowStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        // Ciphertext already queued must drain before new plaintext is
        // accepted, otherwise a Pending here would re-encrypt `buf`.
        while me.woff < me.wbuf.len() {
            match Pin::new(&mut me.inner).poll_write(cx, &me.wbuf[me.woff..]) {
                Poll::Ready(Ok(n)) => me.woff += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        me.wbuf.clear();
        me.woff = 0;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let take = buf.len().min(MAX_PAYLOAD);
        me.seal_chunk(&buf[..take]);

        // Opportunistic drain; leftovers flush on the next call.
        while me.woff < me.wbuf.len() {
            match Pin::new(&mut me.inner).poll_write(cx, &me.wbuf[me.woff..]) {
                Poll::Ready(Ok(n)) => me.woff += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }
        if me.woff == me.wbuf.len() {
            me.wbuf.clear();
            me.woff = 0;
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        while me.woff < me.wbuf.len() {
            match Pin::new(&mut me.inner).poll_write(cx, &me.wbuf[me.woff..]) {
                Poll::Ready(Ok(n)) => me.woff += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        me.wbuf.clear();
        me.woff = 0;
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        while me.woff < me.wbuf.len() {
            match Pin::new(&mut me.inner).poll_write(cx, &me.wbuf[me.woff..]) {
                Poll::Ready(Ok(n)) => me.woff += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        me.wbuf.clear();
        me.woff = 0;
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}

/// Establish a tunnel to `host:port` through the shadow parent at
/// `addr`. The target address goes out in SOCKS address form, through
/// the cipher for AEAD methods and in the clear for `plain`.
pub async fn connect(
    addr: &str,
    password: &str,
    method: CipherMethod,
    host: &str,
    port: u16,
    dial_timeout: Duration,
    read_timeout: Duration,
) -> Result<Established> {
    let mut raw = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("dial timeout connecting to shadow parent {}", addr))?
        .with_context(|| format!("failed to connect to shadow parent {}", addr))?;

    let mut header = Vec::new();
    super::encode_target_addr(host, port, &mut header)?;

    match method {
        CipherMethod::Plain => {
            timeout(read_timeout, async {
                raw.write_all(&header).await?;
                raw.flush().await
            })
            .await
            .context("timeout writing tunnel header")?
            .context("failed to write tunnel header")?;
            debug!(parent = addr, method = "plain", "shadow tunnel established");
            Ok(Established::Tcp(raw))
        }
        _ => {
            let master_key = evp_bytes_to_key(password.as_bytes(), method.key_len());
            let mut stream = ShadowStream::new(raw, method, master_key)
                .context("failed to initialize tunnel cipher")?;
            timeout(read_timeout, async {
                stream.write_all(&header).await?;
                stream.flush().await
            })
            .await
            .context("timeout writing tunnel header")?
            .context("failed to write tunnel header")?;
            debug!(parent = addr, method = ?method, "shadow tunnel established");
            Ok(Established::Shadow(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_method_names() {
        assert_eq!(
            CipherMethod::parse("aes-128-gcm").unwrap(),
            CipherMethod::Aes128Gcm
        );
        assert_eq!(
            CipherMethod::parse("aes-256-gcm").unwrap(),
            CipherMethod::Aes256Gcm
        );
        assert_eq!(CipherMethod::parse("").unwrap(), CipherMethod::Plain);
        assert!(CipherMethod::parse("rc4").is_err());
    }

    #[test]
    fn test_evp_bytes_to_key_known_value() {
        // First block is plain MD5 of the password
        let key = evp_bytes_to_key(b"foobar", 16);
        assert_eq!(
            key,
            [
                0x38, 0x58, 0xf6, 0x22, 0x30, 0xac, 0x3c, 0x91, 0x5f, 0x30, 0x0c, 0x66, 0x43,
                0x12, 0xc6, 0x3f
            ]
        );
        // Longer keys are deterministic extensions
        let key32 = evp_bytes_to_key(b"foobar", 32);
        assert_eq!(&key32[..16], &key[..]);
        assert_eq!(evp_bytes_to_key(b"foobar", 32), key32);
    }

    #[test]
    fn test_nonce_increment_carries() {
        let mut n = [0u8; NONCE_LEN];
        increment_nonce(&mut n);
        assert_eq!(n[0], 1);
        let mut n = [0xffu8; NONCE_LEN];
        n[1] = 0;
        increment_nonce(&mut n);
        assert_eq!(n[0], 0);
        assert_eq!(n[1], 1);
    }

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let master = evp_bytes_to_key(b"secret", 32);
        let mut alice = ShadowStream::new(a, CipherMethod::Aes256Gcm, master.clone()).unwrap();
        let mut bob = ShadowStream::new(b, CipherMethod::Aes256Gcm, master).unwrap();

        alice.write_all(b"hello tunnel").await.unwrap();
        alice.flush().await.unwrap();
        let mut buf = [0u8; 12];
        bob.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello tunnel");

        bob.write_all(b"and back").await.unwrap();
        bob.flush().await.unwrap();
        let mut buf = [0u8; 8];
        alice.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");
    }

    #[tokio::test]
    async fn test_large_payload_spans_frames() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let master = evp_bytes_to_key(b"secret", 16);
        let mut alice = ShadowStream::new(a, CipherMethod::Aes128Gcm, master.clone()).unwrap();
        let mut bob = ShadowStream::new(b, CipherMethod::Aes128Gcm, master).unwrap();

        let payload: Vec<u8> = (0..MAX_PAYLOAD * 2 + 17).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            alice.write_all(&payload).await.unwrap();
            alice.flush().await.unwrap();
            alice
        });
        let mut got = vec![0u8; expected.len()];
        bob.read_exact(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_wrong_password_fails_to_open() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut alice = ShadowStream::new(
            a,
            CipherMethod::Aes256Gcm,
            evp_bytes_to_key(b"right", 32),
        )
        .unwrap();
        let mut bob = ShadowStream::new(
            b,
            CipherMethod::Aes256Gcm,
            evp_bytes_to_key(b"wrong", 32),
        )
        .unwrap();

        alice.write_all(b"hello").await.unwrap();
        alice.flush().await.unwrap();
        let mut buf = [0u8; 5];
        assert!(bob.read_exact(&mut buf).await.is_err());
    }
}
