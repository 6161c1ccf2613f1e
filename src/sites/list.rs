//! Domain list files
//!
//! Newline-delimited domain lists: one lower-case domain per line,
//! `#` starts a comment, blank lines ignored. The ledger itself never
//! touches the filesystem; it consumes the strings loaded here.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// File names under the data directory.
pub const DIRECT_FNAME: &str = "direct";
pub const BLOCKED_FNAME: &str = "blocked";
pub const LEARNED_FNAME: &str = "learned";
pub const STAT_FNAME: &str = "stat";

/// Parse a domain list blob into a set. Entries are lower-cased.
pub fn parse_domain_list(text: &str) -> HashSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_ascii_lowercase())
        .collect()
}

/// Render a learned-domain snapshot back to list-file form.
pub fn render_domain_list(domains: &[String]) -> String {
    let mut out = String::from("# domains learned to require a parent proxy\n");
    for d in domains {
        out.push_str(d);
        out.push('\n');
    }
    out
}

/// The three site lists, loaded from the data directory.
pub struct SiteLists {
    pub direct: HashSet<String>,
    pub blocked: HashSet<String>,
    pub learned: HashSet<String>,
}

/// Load the manual-direct, manual-blocked and learned lists. Missing
/// files are treated as empty lists; a domain present in both manual
/// lists is a configuration error and rejected here, before the ledger
/// can be constructed.
pub fn load_site_lists(data_dir: &Path) -> Result<SiteLists> {
    let direct = read_list(&data_dir.join(DIRECT_FNAME))?;
    let blocked = read_list(&data_dir.join(BLOCKED_FNAME))?;
    let learned = read_list(&data_dir.join(LEARNED_FNAME))?;

    if let Some(dup) = direct.intersection(&blocked).next() {
        bail!(
            "domain {} appears in both the direct and blocked lists",
            dup
        );
    }

    Ok(SiteLists {
        direct,
        blocked,
        learned,
    })
}

fn read_list(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read site list {}", path.display()))?;
    Ok(parse_domain_list(&text))
}
