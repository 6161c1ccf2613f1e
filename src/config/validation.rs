//! Configuration validation
//!
//! Fail-fast validation of configuration invariants. The router and
//! the parent pool are never constructed from a config that fails here.

use super::Config;
use crate::classify::split_host_port;
use crate::parents::shadow::CipherMethod;
use anyhow::{bail, Result};

/// Validate configuration invariants
pub fn validate(config: &Config) -> Result<()> {
    validate_listen(config)?;
    validate_parents(config)?;
    validate_timing(config)?;
    Ok(())
}

fn validate_listen(config: &Config) -> Result<()> {
    if config.listen.is_empty() {
        bail!("at least one listen address is required");
    }
    for addr in &config.listen {
        let (host, port) = split_host_port(addr);
        if port.is_none() {
            bail!("listen address {} has no port", addr);
        }
        if (host.is_empty() || host == "0.0.0.0") && config.listen.len() > 1 {
            bail!(
                "listen address {} represents all interfaces and cannot be combined with others",
                addr
            );
        }
    }
    if let Some(pac) = &config.pac_proxy {
        if split_host_port(pac).1.is_none() {
            bail!("pac_proxy address {} has no port", pac);
        }
    }
    Ok(())
}

fn validate_parents(config: &Config) -> Result<()> {
    let parents = &config.parents;
    if let Some(addr) = &parents.socks {
        if split_host_port(addr).1.is_none() {
            bail!("socks parent {} must have a port", addr);
        }
    }
    if let Some(addr) = &parents.http {
        if split_host_port(addr).1.is_none() {
            bail!("http parent {} must have a port", addr);
        }
    }
    // Surfaces the user:passwd syntax error before startup completes
    parents.http_auth_header()?;

    if parents.shadow.len() != parents.shadow_passwd.len() {
        bail!(
            "number of shadow servers ({}) and passwords ({}) does not match",
            parents.shadow.len(),
            parents.shadow_passwd.len()
        );
    }
    if parents.shadow_method.len() > parents.shadow.len() {
        bail!(
            "more shadow methods ({}) than shadow servers ({})",
            parents.shadow_method.len(),
            parents.shadow.len()
        );
    }
    for addr in &parents.shadow {
        if split_host_port(addr).1.is_none() {
            bail!("shadow server {} must have a port", addr);
        }
    }
    for method in &parents.shadow_method {
        CipherMethod::parse(method)?;
    }
    Ok(())
}

fn validate_timing(config: &Config) -> Result<()> {
    if config.timeouts.dial_secs == 0 {
        bail!("timeouts.dial_secs cannot be 0");
    }
    if config.timeouts.read_secs == 0 {
        bail!("timeouts.read_secs cannot be 0");
    }
    if config.routing.block_after_failures == 0 {
        bail!("routing.block_after_failures cannot be 0");
    }
    if config.routing.fail_threshold == 0 {
        bail!("routing.fail_threshold cannot be 0");
    }
    if config.persist.flush_interval_secs == 0 {
        bail!("persist.flush_interval_secs cannot be 0");
    }
    Ok(())
}
