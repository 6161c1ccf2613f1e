//! HTTP CONNECT parent connector
//!
//! Opens a tunnel through an HTTP proxy with the CONNECT method,
//! attaching a precomputed `Proxy-Authorization` header when the parent
//! requires credentials. The response head is read byte-wise so no
//! tunnel payload is ever consumed into a throwaway buffer.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on a CONNECT response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Establish a tunnel to `host:port` through the HTTP parent at `addr`.
pub async fn connect(
    addr: &str,
    auth_header: Option<&str>,
    host: &str,
    port: u16,
    dial_timeout: Duration,
    read_timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("dial timeout connecting to http parent {}", addr))?
        .with_context(|| format!("failed to connect to http parent {}", addr))?;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n"
    );
    if let Some(auth) = auth_header {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .context("failed to send CONNECT request")?;

    let head = timeout(read_timeout, read_response_head(&mut stream))
        .await
        .with_context(|| format!("timeout reading CONNECT response from {}", addr))??;

    let status_line = head
        .split("\r\n")
        .next()
        .unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .with_context(|| format!("malformed CONNECT response: {:?}", status_line))?;

    match code {
        200 => {
            debug!(parent = addr, dest = %format!("{}:{}", host, port), "CONNECT tunnel established");
            Ok(stream)
        }
        407 => bail!("http parent {} requires authentication (407)", addr),
        _ => bail!(
            "http parent {} refused connect to {}:{}: {}",
            addr,
            host,
            port,
            status_line
        ),
    }
}

/// Read up to and including the blank line ending the response head,
/// one byte at a time. Handshake-sized, so the per-byte reads are fine
/// and nothing past the head is consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            bail!("CONNECT response head too large");
        }
        let n = stream
            .read(&mut byte)
            .await
            .context("failed to read CONNECT response")?;
        if n == 0 {
            bail!("parent closed connection during CONNECT handshake");
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).context("CONNECT response is not valid UTF-8")
}
