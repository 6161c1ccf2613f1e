//! Configuration loading and validation
//!
//! TOML configuration parsed with strict validation. No runtime
//! mutation - the configuration is immutable after load and handed by
//! reference into the components that need it.

#![allow(unused_imports)] // Re-exports for public API

pub mod file;
mod validation;

pub use file::{load_from_path, load_str};
pub use validation::validate;

use crate::parents::LoadBalanceMode;
use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Proxy listen addresses
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Directory holding the site list files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Proxy address advertised in generated PAC text; defaults to the
    /// first listen address
    #[serde(default)]
    pub pac_proxy: Option<String>,
    #[serde(default)]
    pub parents: ParentsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub persist: PersistConfig,
}

fn default_listen() -> Vec<String> {
    vec!["127.0.0.1:7777".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/overpass")
}

/// Upstream parent proxy declarations. The declared order is the pool
/// order: socks parent, http parent, then the shadow tunnels.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ParentsConfig {
    /// SOCKS5 parent address (host:port)
    #[serde(default)]
    pub socks: Option<String>,
    /// HTTP CONNECT parent address (host:port)
    #[serde(default)]
    pub http: Option<String>,
    /// `user:passwd` credentials for the HTTP parent
    #[serde(default)]
    pub http_user_passwd: Option<String>,
    /// Shadow tunnel addresses (host:port each)
    #[serde(default)]
    pub shadow: Vec<String>,
    /// One password per shadow address
    #[serde(default)]
    pub shadow_passwd: Vec<String>,
    /// Cipher method per shadow address; missing entries mean the
    /// identity marker, never a dropped backend
    #[serde(default)]
    pub shadow_method: Vec<String>,
}

impl ParentsConfig {
    /// Precomputed `Proxy-Authorization` value for the HTTP parent,
    /// built once at startup so the request path never re-encodes it.
    pub fn http_auth_header(&self) -> Result<Option<String>> {
        let Some(creds) = &self.http_user_passwd else {
            return Ok(None);
        };
        let mut parts = creds.splitn(2, ':');
        let user = parts.next().unwrap_or_default();
        let passwd = parts.next().unwrap_or_default();
        if user.is_empty() || passwd.is_empty() {
            bail!("http_user_passwd must be in the form user:passwd");
        }
        Ok(Some(format!("Basic {}", BASE64.encode(creds.as_bytes()))))
    }
}

/// Load-balancing policy as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalanceSetting {
    #[default]
    Backup,
    Hash,
}

impl From<LoadBalanceSetting> for LoadBalanceMode {
    fn from(setting: LoadBalanceSetting) -> Self {
        match setting {
            LoadBalanceSetting::Backup => LoadBalanceMode::Backup,
            LoadBalanceSetting::Hash => LoadBalanceMode::Hash,
        }
    }
}

/// Routing policy knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    #[serde(default)]
    pub load_balance: LoadBalanceSetting,
    /// Route everything through a parent, skipping classification
    #[serde(default)]
    pub always_proxy: bool,
    /// Learn blocked domains from interference-indicative failures
    #[serde(default)]
    pub detect_ssl_err: bool,
    /// Interference failures before a domain is learned as blocked
    #[serde(default = "default_block_after")]
    pub block_after_failures: u32,
    /// Consecutive failures before a backend is deprioritized
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            load_balance: LoadBalanceSetting::default(),
            always_proxy: false,
            detect_ssl_err: false,
            block_after_failures: default_block_after(),
            fail_threshold: default_fail_threshold(),
        }
    }
}

fn default_block_after() -> u32 {
    3
}

fn default_fail_threshold() -> u32 {
    3
}

/// Connection establishment timeouts
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// TCP dial timeout in seconds
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
    /// Handshake read timeout in seconds
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_secs: default_dial_secs(),
            read_secs: default_read_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }
}

fn default_dial_secs() -> u64 {
    15
}

fn default_read_secs() -> u64 {
    15
}

/// Learned-state persistence settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistConfig {
    /// Seconds between snapshot flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
        }
    }
}

fn default_flush_interval() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listen, vec!["127.0.0.1:7777".to_string()]);
        assert_eq!(config.routing.block_after_failures, 3);
        assert_eq!(config.timeouts.dial(), Duration::from_secs(15));
        assert!(!config.routing.always_proxy);
    }

    #[test]
    fn test_auth_header_construction() {
        let parents = ParentsConfig {
            http_user_passwd: Some("user:passwd".to_string()),
            ..Default::default()
        };
        let header = parents.http_auth_header().unwrap().unwrap();
        // base64("user:passwd")
        assert_eq!(header, "Basic dXNlcjpwYXNzd2Q=");
    }

    #[test]
    fn test_auth_header_rejects_bad_form() {
        for bad in ["nopasswd", ":passwd", "user:"] {
            let parents = ParentsConfig {
                http_user_passwd: Some(bad.to_string()),
                ..Default::default()
            };
            assert!(parents.http_auth_header().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_load_balance_parse() {
        let config: Config = toml::from_str("[routing]\nload_balance = \"hash\"\n").unwrap();
        assert_eq!(config.routing.load_balance, LoadBalanceSetting::Hash);
        assert!(toml::from_str::<Config>("[routing]\nload_balance = \"roundrobin\"\n").is_err());
    }
}
