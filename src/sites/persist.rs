//! Learned-state persistence
//!
//! Writes the learned-blocked list and the visit statistics to the data
//! directory, off the request path. In-memory state is authoritative;
//! a failed write is logged and retried on the next tick.

use super::list::{render_domain_list, LEARNED_FNAME, STAT_FNAME};
use super::SiteLedger;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

/// Write the learned list (when dirty) and the stat file.
pub async fn write_snapshot(ledger: &SiteLedger, data_dir: &Path) -> Result<()> {
    if ledger.take_dirty() {
        let learned = ledger.export_learned();
        let path = data_dir.join(LEARNED_FNAME);
        tokio::fs::write(&path, render_domain_list(&learned))
            .await
            .with_context(|| format!("failed to write learned list {}", path.display()))?;
        debug!(domains = learned.len(), "flushed learned list");
    }

    let stats = ledger.export_stats();
    if !stats.is_empty() {
        let mut out = String::from("# domain visits failures\n");
        for s in &stats {
            out.push_str(&format!("{} {} {}\n", s.domain, s.visits, s.failures));
        }
        let path = data_dir.join(STAT_FNAME);
        tokio::fs::write(&path, out)
            .await
            .with_context(|| format!("failed to write stat file {}", path.display()))?;
    }
    Ok(())
}

/// Periodic flush loop. Runs until the task is aborted; the caller does
/// a final `write_snapshot` on shutdown.
pub async fn flush_loop(ledger: Arc<SiteLedger>, data_dir: std::path::PathBuf, every_secs: u64) {
    let mut ticker = interval(Duration::from_secs(every_secs.max(1)));
    // The first tick fires immediately; skip it so startup does not
    // rewrite files that were just read.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = write_snapshot(&ledger, &data_dir).await {
            warn!("site snapshot flush failed: {}", e);
        }
    }
}
