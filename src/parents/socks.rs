//! SOCKS5 parent connector
//!
//! Speaks the client side of RFC 1928 with the no-auth method: greeting,
//! CONNECT request in SOCKS address form, reply with bind address. The
//! dial is bounded by the dial timeout and every handshake read by the
//! read timeout.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const REP_SUCCESS: u8 = 0x00;

/// Establish a tunnel to `host:port` through the SOCKS5 parent at `addr`.
pub async fn connect(
    addr: &str,
    host: &str,
    port: u16,
    dial_timeout: Duration,
    read_timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("dial timeout connecting to socks parent {}", addr))?
        .with_context(|| format!("failed to connect to socks parent {}", addr))?;

    // Greeting: we offer no-auth only
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
        .await
        .context("failed to send socks greeting")?;

    let mut reply = [0u8; 2];
    timeout(read_timeout, stream.read_exact(&mut reply))
        .await
        .context("timeout reading socks method selection")?
        .context("failed to read socks method selection")?;
    if reply[0] != SOCKS5_VERSION {
        bail!("socks parent {} replied with version {:#04x}", addr, reply[0]);
    }
    if reply[1] != AUTH_NO_AUTH {
        bail!(
            "socks parent {} requires unsupported auth method {:#04x}",
            addr,
            reply[1]
        );
    }

    // CONNECT request: VER CMD RSV ATYP ADDR PORT
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    super::encode_target_addr(host, port, &mut request)?;
    stream
        .write_all(&request)
        .await
        .context("failed to send socks connect request")?;

    let mut header = [0u8; 4];
    timeout(read_timeout, stream.read_exact(&mut header))
        .await
        .context("timeout reading socks connect reply")?
        .context("failed to read socks connect reply")?;
    if header[0] != SOCKS5_VERSION {
        bail!("bad version in socks reply: {:#04x}", header[0]);
    }
    if header[1] != REP_SUCCESS {
        bail!(
            "socks parent {} refused connect to {}:{}: {}",
            addr,
            host,
            port,
            reply_message(header[1])
        );
    }

    // Drain the bind address; its content is unused
    let bind_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            timeout(read_timeout, stream.read_exact(&mut len))
                .await
                .context("timeout reading socks bind domain length")?
                .context("failed to read socks bind domain length")?;
            len[0] as usize
        }
        other => bail!("unknown address type in socks reply: {:#04x}", other),
    };
    let mut bind = vec![0u8; bind_len + 2];
    timeout(read_timeout, stream.read_exact(&mut bind))
        .await
        .context("timeout reading socks bind address")?
        .context("failed to read socks bind address")?;

    debug!(parent = addr, dest = %format!("{}:{}", host, port), "socks tunnel established");
    Ok(stream)
}

fn reply_message(rep: u8) -> &'static str {
    match rep {
        0x01 => "general server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
