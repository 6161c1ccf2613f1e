//! Parent proxy pool
//!
//! Holds the fixed, ordered set of upstream backends and the per-backend
//! health counters, and picks which backend a session should try next
//! under the configured load-balancing policy. Backends are never
//! removed; an unhealthy one is only deprioritized until it succeeds
//! again.

pub mod http;
pub mod shadow;
pub mod socks;

use crate::config::Config;
use anyhow::{bail, Result};
use self::shadow::{CipherMethod, ShadowStream};
use std::collections::HashSet;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// One configured upstream backend. Immutable after startup.
#[derive(Debug, Clone)]
pub enum ProxyBackend {
    /// SOCKS5 parent, no-auth method.
    Socks { addr: String },
    /// HTTP CONNECT parent with an optional precomputed Basic auth header.
    HttpConnect {
        addr: String,
        auth_header: Option<String>,
    },
    /// Encrypted tunnel parent.
    ShadowTunnel {
        addr: String,
        password: String,
        method: CipherMethod,
        slot: usize,
    },
}

impl ProxyBackend {
    /// Short protocol name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyBackend::Socks { .. } => "socks",
            ProxyBackend::HttpConnect { .. } => "http-connect",
            ProxyBackend::ShadowTunnel { .. } => "shadow",
        }
    }

    pub fn addr(&self) -> &str {
        match self {
            ProxyBackend::Socks { addr }
            | ProxyBackend::HttpConnect { addr, .. }
            | ProxyBackend::ShadowTunnel { addr, .. } => addr,
        }
    }
}

/// Backend selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalanceMode {
    /// Strict declared-priority order, fail over only on failure.
    Backup,
    /// Deterministic key-derived selection for session affinity.
    Hash,
}

/// An established, possibly tunnelled, connection handed back to the
/// caller. The caller only ever copies bytes through it.
pub enum Established {
    Tcp(TcpStream),
    Shadow(ShadowStream<TcpStream>),
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Established::Tcp(s) => f.debug_tuple("Tcp").field(s).finish(),
            Established::Shadow(_) => f.write_str("Shadow(..)"),
        }
    }
}

impl AsyncRead for Established {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Established::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Established::Shadow(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Established {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Established::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Established::Shadow(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Established::Tcp(s) => Pin::new(s).poll_flush(cx),
            Established::Shadow(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Established::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Established::Shadow(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Pool of parent backends plus their mutable health state.
pub struct ParentPool {
    backends: Vec<ProxyBackend>,
    /// Consecutive failures per backend, reset on success.
    failures: Vec<AtomicU32>,
    mode: LoadBalanceMode,
    fail_threshold: u32,
    dial_timeout: Duration,
    read_timeout: Duration,
}

impl ParentPool {
    /// Resolve the configured backend descriptors into a pool. Invalid
    /// combinations (mismatched shadow lists, unknown cipher names) are
    /// fatal here, before any connection can be attempted.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut backends = Vec::new();

        if let Some(addr) = &config.parents.socks {
            backends.push(ProxyBackend::Socks { addr: addr.clone() });
        }
        if let Some(addr) = &config.parents.http {
            backends.push(ProxyBackend::HttpConnect {
                addr: addr.clone(),
                auth_header: config.parents.http_auth_header()?,
            });
        }
        if config.parents.shadow_passwd.len() != config.parents.shadow.len() {
            bail!(
                "number of shadow servers ({}) and passwords ({}) does not match",
                config.parents.shadow.len(),
                config.parents.shadow_passwd.len()
            );
        }
        for (slot, addr) in config.parents.shadow.iter().enumerate() {
            // A missing method entry is an explicit identity marker,
            // never a dropped backend.
            let method_name = config
                .parents
                .shadow_method
                .get(slot)
                .map(String::as_str)
                .unwrap_or("");
            backends.push(ProxyBackend::ShadowTunnel {
                addr: addr.clone(),
                password: config.parents.shadow_passwd[slot].clone(),
                method: CipherMethod::parse(method_name)?,
                slot,
            });
        }

        // A single backend has no load to balance.
        let mode = if backends.len() <= 1 {
            LoadBalanceMode::Backup
        } else {
            config.routing.load_balance.into()
        };

        let failures = backends.iter().map(|_| AtomicU32::new(0)).collect();
        Ok(Self {
            backends,
            failures,
            mode,
            fail_threshold: config.routing.fail_threshold.max(1),
            dial_timeout: config.timeouts.dial(),
            read_timeout: config.timeouts.read(),
        })
    }

    #[cfg(test)]
    pub fn for_tests(
        backends: Vec<ProxyBackend>,
        mode: LoadBalanceMode,
        fail_threshold: u32,
        dial_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let failures = backends.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            backends,
            failures,
            mode,
            fail_threshold,
            dial_timeout,
            read_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn mode(&self) -> LoadBalanceMode {
        self.mode
    }

    pub fn backend(&self, index: usize) -> &ProxyBackend {
        &self.backends[index]
    }

    /// Read-only health snapshot for diagnostics.
    pub fn health(&self) -> Vec<u32> {
        self.failures
            .iter()
            .map(|f| f.load(Ordering::Relaxed))
            .collect()
    }

    /// Pick the next backend for `key`, skipping indices in `attempted`.
    ///
    /// Backends at or over the failure threshold are skipped while any
    /// healthy candidate remains; when none does, every non-attempted
    /// backend becomes eligible again, so a sick pool still serves.
    /// Returns `None` once every backend has been attempted.
    pub fn select_backend(&self, key: &str, attempted: &HashSet<usize>) -> Option<usize> {
        let not_attempted: Vec<usize> = (0..self.backends.len())
            .filter(|i| !attempted.contains(i))
            .collect();
        let healthy: Vec<usize> = not_attempted
            .iter()
            .copied()
            .filter(|&i| self.failures[i].load(Ordering::Relaxed) < self.fail_threshold)
            .collect();
        let eligible = if healthy.is_empty() {
            not_attempted
        } else {
            healthy
        };
        if eligible.is_empty() {
            return None;
        }
        match self.mode {
            LoadBalanceMode::Backup => Some(eligible[0]),
            LoadBalanceMode::Hash => {
                let idx = (string_hash(key) % eligible.len() as u64) as usize;
                Some(eligible[idx])
            }
        }
    }

    /// Report the outcome of an attempt through `index`. Success resets
    /// the consecutive-failure counter, failure increments it.
    pub fn record_result(&self, index: usize, success: bool) {
        if success {
            self.failures[index].store(0, Ordering::Relaxed);
        } else {
            self.failures[index].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Establish a tunnel to `host:port` through the backend at `index`.
    pub async fn connect(&self, index: usize, host: &str, port: u16) -> Result<Established> {
        match &self.backends[index] {
            ProxyBackend::Socks { addr } => {
                socks::connect(addr, host, port, self.dial_timeout, self.read_timeout)
                    .await
                    .map(Established::Tcp)
            }
            ProxyBackend::HttpConnect { addr, auth_header } => http::connect(
                addr,
                auth_header.as_deref(),
                host,
                port,
                self.dial_timeout,
                self.read_timeout,
            )
            .await
            .map(Established::Tcp),
            ProxyBackend::ShadowTunnel {
                addr,
                password,
                method,
                ..
            } => {
                shadow::connect(
                    addr,
                    password,
                    *method,
                    host,
                    port,
                    self.dial_timeout,
                    self.read_timeout,
                )
                .await
            }
        }
    }
}

/// djb2-style accumulator hash used for hash-mode selection. Stable and
/// non-cryptographic; the only requirement is determinism per key.
pub fn string_hash(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for b in s.bytes() {
        hash = (hash << 5).wrapping_add(1).wrapping_add(b as u64);
    }
    hash
}

/// Encode `host:port` in SOCKS5 address form (ATYP + address + port),
/// shared by the SOCKS request body and the shadow tunnel header.
pub(crate) fn encode_target_addr(host: &str, port: u16, out: &mut Vec<u8>) -> Result<()> {
    match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            out.push(0x01);
            out.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            out.push(0x04);
            out.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                bail!("hostname too long: {}", host);
            }
            out.push(0x03);
            out.push(host.len() as u8);
            out.extend_from_slice(host.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    Ok(())
}
