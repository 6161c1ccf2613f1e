//! overpass library crate
//!
//! Core components of an adaptive circumvention forward proxy.
//!
//! # Modules
//!
//! - [`classify`] - Effective-domain extraction for requested hosts
//! - [`config`] - Configuration loading and validation
//! - [`sites`] - Learned site ledger and its persistence
//! - [`parents`] - Parent proxy pool, health and wire connectors
//! - [`route`] - Per-connection routing decision engine
//! - [`server`] - Accept loops and the minimal HTTP proxy surface
//! - [`pac`] - Proxy auto-config text generation

// Allow common stylistic patterns during development.
// These can be tightened as the codebase matures.
#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::missing_const_for_fn)] // Const fn optimization is low priority
#![allow(clippy::module_name_repetitions)] // Qualified names read better
#![allow(clippy::unwrap_used)] // Lock poisoning is fatal by design
#![allow(clippy::must_use_candidate)] // Pure getters don't need must_use
#![allow(clippy::doc_markdown)] // Doc formatting is secondary
#![allow(clippy::cast_possible_truncation)] // Bounded casts in wire encoding
#![allow(clippy::len_without_is_empty)] // Pool exposes both already
#![allow(clippy::too_many_arguments)] // Session handlers thread request parts through

pub mod classify;
pub mod config;
pub mod logging;
pub mod pac;
pub mod parents;
pub mod route;
pub mod server;
pub mod sites;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
