//! Routing scenarios against fake parents on loopback
//!
//! Every server here is spawned on 127.0.0.1 by the test itself; no
//! external services are required.

use overpass::config::load_str;
use overpass::parents::ParentPool;
use overpass::route::{RouteError, Router};
use overpass::sites::{SiteLedger, SiteLists};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn empty_lists() -> SiteLists {
    SiteLists {
        direct: HashSet::new(),
        blocked: HashSet::new(),
        learned: HashSet::new(),
    }
}

fn ledger(always_proxy: bool) -> Arc<SiteLedger> {
    Arc::new(SiteLedger::new(empty_lists(), always_proxy, 3))
}

fn router(config_toml: &str, always_proxy: bool) -> Router {
    let config = load_str(config_toml).unwrap();
    let pool = Arc::new(ParentPool::from_config(&config).unwrap());
    Router::new(
        ledger(always_proxy),
        pool,
        Duration::from_secs(2),
        config.routing.detect_ssl_err,
    )
}

/// Reserve a loopback port that nothing is listening on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// TCP echo server; returns its address.
async fn spawn_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Fake HTTP CONNECT parent: accepts any target, then echoes.
async fn spawn_connect_parent() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                if stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Fake SOCKS5 parent: no-auth handshake, accepts any target, echoes.
async fn spawn_socks_parent() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                // Greeting
                let mut greeting = [0u8; 3];
                if stream.read_exact(&mut greeting).await.is_err() {
                    return;
                }
                assert_eq!(greeting[0], 0x05);
                if stream.write_all(&[0x05, 0x00]).await.is_err() {
                    return;
                }
                // Connect request header
                let mut header = [0u8; 4];
                if stream.read_exact(&mut header).await.is_err() {
                    return;
                }
                let addr_len = match header[3] {
                    0x01 => 4,
                    0x04 => 16,
                    0x03 => {
                        let mut len = [0u8; 1];
                        if stream.read_exact(&mut len).await.is_err() {
                            return;
                        }
                        len[0] as usize
                    }
                    _ => return,
                };
                let mut rest = vec![0u8; addr_len + 2];
                if stream.read_exact(&mut rest).await.is_err() {
                    return;
                }
                // Success reply with a zero bind address
                if stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .is_err()
                {
                    return;
                }
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_direct_connection_without_parents() {
    let echo = spawn_echo().await;
    let router = router("", false);

    let mut conn = router.connect(&echo).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_tunnel_through_http_parent() {
    let parent = spawn_connect_parent().await;
    let config = format!("[parents]\nhttp = \"{}\"\n", parent);
    let router = router(&config, true);

    // The fake parent accepts any target, so the destination itself
    // needs no listener
    let mut conn = router.connect("unreachable.example.com:80").await.unwrap();
    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_tunnel_through_socks_parent() {
    let parent = spawn_socks_parent().await;
    let config = format!("[parents]\nsocks = \"{}\"\n", parent);
    let router = router(&config, true);

    let mut conn = router.connect("unreachable.example.com:443").await.unwrap();
    conn.write_all(b"through socks").await.unwrap();
    let mut buf = [0u8; 13];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through socks");
}

#[tokio::test]
async fn test_direct_failure_falls_through_to_parent() {
    let parent = spawn_connect_parent().await;
    let config = format!("[parents]\nhttp = \"{}\"\n", parent);
    // No always_proxy: the router tries direct first, fails, then
    // reaches the parent
    let router = router(&config, false);

    let dead = format!("127.0.0.1:{}", closed_port().await);
    let mut conn = router.connect(&dead).await.unwrap();
    conn.write_all(b"rescued").await.unwrap();
    let mut buf = [0u8; 7];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"rescued");
}

#[tokio::test]
async fn test_exhaustion_counts_each_backend_once() {
    let dead_socks = format!("127.0.0.1:{}", closed_port().await);
    let dead_http = format!("127.0.0.1:{}", closed_port().await);
    let config = format!(
        "[parents]\nsocks = \"{}\"\nhttp = \"{}\"\n",
        dead_socks, dead_http
    );
    let router = router(&config, true);

    let err = router.connect("example.com:80").await.unwrap_err();
    match err {
        RouteError::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected Exhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failover_skips_dead_backend() {
    let dead = format!("127.0.0.1:{}", closed_port().await);
    let parent = spawn_connect_parent().await;
    // Dead socks parent declared first, live http parent second: backup
    // mode must fail over in declared order
    let config = format!("[parents]\nsocks = \"{}\"\nhttp = \"{}\"\n", dead, parent);
    let router = router(&config, true);

    let mut conn = router.connect("example.com:80").await.unwrap();
    conn.write_all(b"failover").await.unwrap();
    let mut buf = [0u8; 8];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"failover");

    // The dead backend's failure was recorded; the live one is clean
    let health = router.pool().health();
    assert_eq!(health[0], 1);
    assert_eq!(health[1], 0);
}

#[tokio::test]
async fn test_no_parents_and_dead_target_reports_direct_failure() {
    let router = router("", false);
    let dead = format!("127.0.0.1:{}", closed_port().await);
    let err = router.connect(&dead).await.unwrap_err();
    assert!(matches!(err, RouteError::DirectFailed { .. }));
}
