//! Proxy front end
//!
//! Accept loops for the configured listen addresses and the minimal
//! HTTP proxy surface: CONNECT tunnels, absolute-form plain HTTP, and
//! the generated PAC file. Parses just far enough to hand the router a
//! host:port, then splices bytes both ways.

use crate::config::Config;
use crate::pac;
use crate::route::Router;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Upper bound on a request head.
const MAX_REQUEST_HEAD: usize = 32 * 1024;

/// Bind every listen address and serve until a listener fails.
pub async fn run(config: &Config, router: Arc<Router>) -> Result<()> {
    let pac_proxy = config
        .pac_proxy
        .clone()
        .unwrap_or_else(|| config.listen[0].clone());

    let mut handles = Vec::new();
    for addr in &config.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listen address {}", addr))?;
        info!("listening on {}", addr);
        let router = Arc::clone(&router);
        let pac_proxy = pac_proxy.clone();
        handles.push(tokio::spawn(accept_loop(listener, router, pac_proxy)));
    }

    for handle in handles {
        handle.await??;
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, router: Arc<Router>, pac_proxy: String) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let router = Arc::clone(&router);
        let pac_proxy = pac_proxy.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_session(stream, router, pac_proxy).await {
                debug!(client = %peer, "session ended: {:#}", e);
            }
        });
    }
}

async fn handle_session(
    mut client: TcpStream,
    router: Arc<Router>,
    pac_proxy: String,
) -> Result<()> {
    let (head, leftover) = read_request_head(&mut client).await?;
    let head_text = String::from_utf8_lossy(&head).into_owned();
    let request_line = head_text.split("\r\n").next().unwrap_or_default();
    let mut fields = request_line.split_whitespace();
    let (method, target, version) = match (fields.next(), fields.next(), fields.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => {
            respond(&mut client, "400 Bad Request").await?;
            bail!("malformed request line: {:?}", request_line);
        }
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        return handle_connect(client, &router, target, &leftover).await;
    }
    if target.starts_with('/') {
        return handle_local(client, &router, method, target, &pac_proxy).await;
    }
    handle_plain_http(client, &router, method, target, version, &head_text, &leftover).await
}

/// CONNECT tunnel: acknowledge, then splice.
async fn handle_connect(
    mut client: TcpStream,
    router: &Router,
    target: &str,
    leftover: &[u8],
) -> Result<()> {
    let mut upstream = match router.connect(target).await {
        Ok(established) => established,
        Err(e) => {
            warn!(dest = target, "connect failed: {}", e);
            respond(&mut client, "502 Bad Gateway").await?;
            return Ok(());
        }
    };
    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Requests addressed to the proxy itself; only the PAC file exists.
async fn handle_local(
    mut client: TcpStream,
    router: &Router,
    method: &str,
    target: &str,
    pac_proxy: &str,
) -> Result<()> {
    if method.eq_ignore_ascii_case("GET") && (target == "/proxy.pac" || target == "/pac") {
        let body = pac::generate(pac_proxy, &router.ledger().export_direct());
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/x-ns-proxy-autoconfig\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        client.write_all(head.as_bytes()).await?;
        client.write_all(body.as_bytes()).await?;
    } else {
        respond(&mut client, "404 Not Found").await?;
    }
    Ok(())
}

/// Absolute-form plain HTTP: rewrite the request line to origin form
/// and forward the head, then splice.
async fn handle_plain_http(
    mut client: TcpStream,
    router: &Router,
    method: &str,
    target: &str,
    version: &str,
    head_text: &str,
    leftover: &[u8],
) -> Result<()> {
    let (host_port, origin_target) = match split_absolute_uri(target) {
        Some(parts) => parts,
        None => {
            respond(&mut client, "400 Bad Request").await?;
            bail!("unsupported request target: {:?}", target);
        }
    };

    let mut upstream = match router.connect(&host_port).await {
        Ok(established) => established,
        Err(e) => {
            warn!(dest = %host_port, "connect failed: {}", e);
            respond(&mut client, "502 Bad Gateway").await?;
            return Ok(());
        }
    };

    let mut rebuilt = format!("{} {} {}\r\n", method, origin_target, version);
    for line in head_text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        // Hop-by-hop proxy headers stay on this hop
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("proxy-connection:") || lower.starts_with("proxy-authorization:") {
            continue;
        }
        rebuilt.push_str(line);
        rebuilt.push_str("\r\n");
    }
    rebuilt.push_str("\r\n");

    upstream.write_all(rebuilt.as_bytes()).await?;
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Split `http://host[:port]/path` into `host:port` and the origin-form
/// target. Returns `None` for non-http schemes.
fn split_absolute_uri(target: &str) -> Option<(String, String)> {
    let rest = target.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return None;
    }
    let host_port = if crate::classify::split_host_port(authority).1.is_some() {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    };
    Some((host_port, path.to_string()))
}

async fn respond(client: &mut TcpStream, status: &str) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {status}\r\nProxy-Agent: overpass\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    client.write_all(head.as_bytes()).await?;
    Ok(())
}

/// Read until the blank line ending the request head. Returns the head
/// (including the terminator) and any bytes read past it, which belong
/// to the request body or tunnel.
async fn read_request_head(client: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() >= MAX_REQUEST_HEAD {
            bail!("request head too large");
        }
        let n = client
            .read(&mut chunk)
            .await
            .context("failed to read request head")?;
        if n == 0 {
            bail!("client closed connection before request head completed");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
