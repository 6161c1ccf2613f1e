//! overpass - adaptive circumvention forward proxy
//!
//! Accepts client connections and decides, per destination, whether to
//! connect directly or through one of several parent proxies, learning
//! over time which destinations need a parent:
//! - Effective-domain classification with manual direct/blocked lists
//! - Runtime-learned blocked domains from interference signals
//! - Parent pool with backup or hash load balancing and failover
//!
//! # Usage
//!
//! ```bash
//! # Run the proxy
//! overpass run --config /etc/overpass/config.toml
//!
//! # Validate a configuration and exit
//! overpass check --config /etc/overpass/config.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use overpass::config;
use overpass::logging;
use overpass::parents::ParentPool;
use overpass::route::Router;
use overpass::server;
use overpass::sites::{list, persist, SiteLedger};

/// overpass - adaptive circumvention forward proxy
#[derive(Parser, Debug)]
#[command(name = "overpass")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/overpass/config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy daemon (the default)
    Run,

    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        logging::init_with_level(Level::DEBUG);
    } else {
        logging::init();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(&cli.config).await,
        Commands::Check => {
            config::load_from_path(&cli.config)?;
            println!("configuration ok");
            Ok(())
        }
    }
}

/// Run the overpass daemon
async fn run_daemon(config_path: &Path) -> Result<()> {
    info!("overpass v{} starting", overpass::VERSION);

    let config = config::load_from_path(config_path)?;

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;

    // Site lists and ledger; an overlap between the manual lists is a
    // configuration error and stops startup here
    let lists = list::load_site_lists(&config.data_dir)?;
    let ledger = Arc::new(SiteLedger::new(
        lists,
        config.routing.always_proxy,
        config.routing.block_after_failures,
    ));

    // Parent pool; invalid backend combinations are fatal before any
    // connection can be attempted
    let pool = Arc::new(ParentPool::from_config(&config)?);
    info!(
        parents = pool.len(),
        mode = ?pool.mode(),
        "parent pool ready"
    );

    let router = Arc::new(Router::new(
        Arc::clone(&ledger),
        pool,
        config.timeouts.dial(),
        config.routing.detect_ssl_err,
    ));

    // Learned-state flushing runs off the request path
    let flush_handle = tokio::spawn(persist::flush_loop(
        Arc::clone(&ledger),
        config.data_dir.clone(),
        config.persist.flush_interval_secs,
    ));

    tokio::select! {
        result = server::run(&config, router) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    flush_handle.abort();
    if let Err(e) = persist::write_snapshot(&ledger, &config.data_dir).await {
        warn!("final snapshot failed: {:#}", e);
    }

    Ok(())
}
