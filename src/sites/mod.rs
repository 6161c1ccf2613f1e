//! Site ledger
//!
//! Owns the three domain classifications (manually direct, manually
//! blocked, learned blocked) plus the failure and visit counters, and
//! answers the one question the router asks: should this domain go
//! through a parent proxy?
//!
//! Reads vastly outnumber writes, so the interior state sits behind a
//! single `RwLock`; every write is whole-record, so concurrent sessions
//! never observe a half-applied update. Durability is handled off the
//! request path by [`persist`].

pub mod list;
pub mod persist;

pub use list::SiteLists;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::info;

/// Per-domain visit/failure counters, exported for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStat {
    pub domain: String,
    pub visits: u64,
    pub failures: u32,
}

struct LedgerInner {
    manual_direct: HashSet<String>,
    manual_blocked: HashSet<String>,
    learned: HashSet<String>,
    /// Interference failures per candidate domain; drives promotion.
    failures: HashMap<String, u32>,
    /// Diagnostics only, never consulted by `decision`.
    visits: HashMap<String, u64>,
}

/// Learned site classification shared by all sessions.
pub struct SiteLedger {
    always_proxy: bool,
    block_after: u32,
    inner: RwLock<LedgerInner>,
    /// Set when the learned set changed since the last flush.
    dirty: AtomicBool,
}

impl SiteLedger {
    /// Build the ledger from loaded lists. The manual sets are read-only
    /// from here on; only the learned set grows at runtime.
    pub fn new(lists: SiteLists, always_proxy: bool, block_after: u32) -> Self {
        Self {
            always_proxy,
            block_after: block_after.max(1),
            inner: RwLock::new(LedgerInner {
                manual_direct: lists.direct,
                manual_blocked: lists.blocked,
                learned: lists.learned,
                failures: HashMap::new(),
                visits: HashMap::new(),
            }),
            dirty: AtomicBool::new(false),
        }
    }

    /// Should this domain be routed through a parent proxy?
    ///
    /// An empty domain (IP literal or single-label host) is always
    /// unknown and defaults to a direct attempt unless `always_proxy`
    /// forces proxying.
    pub fn decision(&self, domain: &str) -> bool {
        if self.always_proxy {
            return true;
        }
        if domain.is_empty() {
            return false;
        }
        let inner = self.inner.read().unwrap();
        if inner.manual_direct.contains(domain) {
            return false;
        }
        inner.manual_blocked.contains(domain) || inner.learned.contains(domain)
    }

    /// Record an interference-indicative connection failure. Once the
    /// counter reaches the configured threshold the domain joins the
    /// learned-blocked set, visible to `decision` immediately; the
    /// durable write happens on the next flush tick.
    pub fn record_connect_failure(&self, domain: &str) {
        if domain.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.manual_direct.contains(domain)
            || inner.manual_blocked.contains(domain)
            || inner.learned.contains(domain)
        {
            return;
        }
        let count = inner.failures.entry(domain.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.block_after {
            info!(domain, failures = *count, "learned blocked domain");
            inner.learned.insert(domain.to_string());
            inner.failures.remove(domain);
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Bump the visit counter. Diagnostics only.
    pub fn record_visit(&self, domain: &str) {
        if domain.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        *inner.visits.entry(domain.to_string()).or_insert(0) += 1;
    }

    /// Sorted snapshot of the learned-blocked set, for persistence.
    pub fn export_learned(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<String> = inner.learned.iter().cloned().collect();
        out.sort();
        out
    }

    /// Sorted snapshot of the manually-direct set, for PAC generation.
    pub fn export_direct(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<String> = inner.manual_direct.iter().cloned().collect();
        out.sort();
        out
    }

    /// Visit/failure counters for the status surface.
    pub fn export_stats(&self) -> Vec<SiteStat> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<SiteStat> = inner
            .visits
            .iter()
            .map(|(domain, &visits)| SiteStat {
                domain: domain.clone(),
                visits,
                failures: inner.failures.get(domain).copied().unwrap_or(0),
            })
            .collect();
        out.sort_by(|a, b| a.domain.cmp(&b.domain));
        out
    }

    /// Take the dirty flag, clearing it. Test-and-set so concurrent
    /// flushers cannot both observe the same change.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists(direct: &[&str], blocked: &[&str], learned: &[&str]) -> SiteLists {
        let to_set = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        SiteLists {
            direct: to_set(direct),
            blocked: to_set(blocked),
            learned: to_set(learned),
        }
    }

    #[test]
    fn test_decision_table() {
        let ledger = SiteLedger::new(
            lists(&["open.com"], &["walled.com"], &["seen.com"]),
            false,
            3,
        );
        assert!(!ledger.decision("open.com"));
        assert!(ledger.decision("walled.com"));
        assert!(ledger.decision("seen.com"));
        // Unknown defaults to a direct attempt
        assert!(!ledger.decision("unknown.com"));
        assert!(!ledger.decision(""));
    }

    #[test]
    fn test_always_proxy_wins() {
        let ledger = SiteLedger::new(lists(&["open.com"], &[], &[]), true, 3);
        assert!(ledger.decision("open.com"));
        assert!(ledger.decision("unknown.com"));
        assert!(ledger.decision(""));
    }

    #[test]
    fn test_failure_threshold_promotes_and_never_reverts() {
        let ledger = SiteLedger::new(lists(&[], &[], &[]), false, 3);
        assert!(!ledger.decision("flaky.com"));
        ledger.record_connect_failure("flaky.com");
        ledger.record_connect_failure("flaky.com");
        assert!(!ledger.decision("flaky.com"));
        ledger.record_connect_failure("flaky.com");
        assert!(ledger.decision("flaky.com"));
        // Further failures keep it blocked
        ledger.record_connect_failure("flaky.com");
        assert!(ledger.decision("flaky.com"));
        assert_eq!(ledger.export_learned(), vec!["flaky.com".to_string()]);
    }

    #[test]
    fn test_manual_direct_is_never_learned() {
        let ledger = SiteLedger::new(lists(&["open.com"], &[], &[]), false, 1);
        ledger.record_connect_failure("open.com");
        assert!(!ledger.decision("open.com"));
        assert!(ledger.export_learned().is_empty());
    }

    #[test]
    fn test_visits_do_not_affect_decision() {
        let ledger = SiteLedger::new(lists(&[], &[], &[]), false, 3);
        for _ in 0..100 {
            ledger.record_visit("busy.com");
        }
        assert!(!ledger.decision("busy.com"));
        let stats = ledger.export_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].visits, 100);
    }

    #[test]
    fn test_dirty_flag_is_one_shot() {
        let ledger = SiteLedger::new(lists(&[], &[], &[]), false, 1);
        assert!(!ledger.take_dirty());
        ledger.record_connect_failure("x.com");
        assert!(ledger.take_dirty());
        assert!(!ledger.take_dirty());
    }
}
