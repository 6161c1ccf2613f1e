//! Routing decision engine
//!
//! Orchestrates the classifier, the site ledger and the parent pool for
//! one connection request: classify the destination, decide direct vs.
//! proxied, attempt connections with failover, and feed the outcome
//! back into the learned state.

use crate::classify::{effective_domain, split_host_port};
use crate::parents::{Established, ParentPool};
use crate::sites::SiteLedger;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Why a connection request could not be served. A caller sees one
/// aggregated failure; which intermediate backends failed is visible
/// only in the logs.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid destination address: {0}")]
    BadAddress(String),
    #[error("direct connection to {host} failed")]
    DirectFailed {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("all {attempts} parent proxies failed for {host}")]
    Exhausted { host: String, attempts: usize },
}

/// Per-process router shared by all client sessions.
pub struct Router {
    ledger: Arc<SiteLedger>,
    pool: Arc<ParentPool>,
    dial_timeout: Duration,
    detect_ssl_err: bool,
}

impl Router {
    pub fn new(
        ledger: Arc<SiteLedger>,
        pool: Arc<ParentPool>,
        dial_timeout: Duration,
        detect_ssl_err: bool,
    ) -> Self {
        Self {
            ledger,
            pool,
            dial_timeout,
            detect_ssl_err,
        }
    }

    pub fn ledger(&self) -> &Arc<SiteLedger> {
        &self.ledger
    }

    pub fn pool(&self) -> &Arc<ParentPool> {
        &self.pool
    }

    /// Establish a connection to `host_port`, directly or through a
    /// parent backend, per the ledger's decision. Each backend is
    /// attempted at most once; the ledger learns from interference-
    /// indicative direct failures.
    pub async fn connect(&self, host_port: &str) -> Result<Established, RouteError> {
        let (host, port) = parse_target(host_port)?;
        let domain = effective_domain(host_port);
        // Hash-mode affinity key: the domain, or the raw host when the
        // destination has no domain semantics
        let key = if domain.is_empty() { host } else { domain.as_str() };

        self.ledger.record_visit(&domain);
        let need_proxy = self.ledger.decision(&domain);

        if !need_proxy || self.pool.is_empty() {
            match self.dial_direct(host, port).await {
                Ok(stream) => {
                    debug!(dest = host_port, "connected directly");
                    return Ok(Established::Tcp(stream));
                }
                Err(e) => {
                    if self.is_interference(&e, port) {
                        // One detected interference event is worth an
                        // immediate retry through the pool, and feeds
                        // the learned classification either way
                        warn!(dest = host_port, error = %e, "interference-indicative direct failure");
                        self.ledger.record_connect_failure(&domain);
                    } else {
                        debug!(dest = host_port, error = %e, "direct connection failed");
                    }
                    if self.pool.is_empty() {
                        return Err(RouteError::DirectFailed {
                            host: host_port.to_string(),
                            source: e,
                        });
                    }
                    // Fall through: unreachable-by-direct may still be
                    // reachable through a parent
                }
            }
        }

        let mut attempted: HashSet<usize> = HashSet::new();
        while let Some(index) = self.pool.select_backend(key, &attempted) {
            let backend = self.pool.backend(index);
            match self.pool.connect(index, host, port).await {
                Ok(established) => {
                    self.pool.record_result(index, true);
                    debug!(
                        dest = host_port,
                        parent = backend.addr(),
                        kind = backend.kind(),
                        "connected through parent"
                    );
                    return Ok(established);
                }
                Err(e) => {
                    warn!(
                        dest = host_port,
                        parent = backend.addr(),
                        kind = backend.kind(),
                        error = %format!("{:#}", e),
                        "parent attempt failed"
                    );
                    self.pool.record_result(index, false);
                    attempted.insert(index);
                }
            }
        }

        Err(RouteError::Exhausted {
            host: host_port.to_string(),
            attempts: attempted.len(),
        })
    }

    async fn dial_direct(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let host = host.trim_matches(|c| c == '[' || c == ']');
        match timeout(self.dial_timeout, TcpStream::connect((host, port))).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "direct dial timed out",
            )),
        }
    }

    /// A reset or abort while opening an encrypted-port connection is
    /// characteristic of interference rather than plain unreachability.
    fn is_interference(&self, e: &io::Error, port: u16) -> bool {
        self.detect_ssl_err
            && port == 443
            && matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            )
    }
}

fn parse_target(host_port: &str) -> Result<(&str, u16), RouteError> {
    let (host, port) = split_host_port(host_port);
    if host.is_empty() {
        return Err(RouteError::BadAddress(host_port.to_string()));
    }
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| RouteError::BadAddress(host_port.to_string()))?,
        None => 80,
    };
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("example.com:443").unwrap(), ("example.com", 443));
        assert_eq!(parse_target("example.com").unwrap(), ("example.com", 80));
        assert!(parse_target(":443").is_err());
        assert!(parse_target("example.com:notaport").is_err());
    }
}
