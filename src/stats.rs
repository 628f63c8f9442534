//! Verdict counters for the monitor.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic pipeline totals. Relaxed ordering is fine: these are
/// observability counters, not synchronization.
#[derive(Debug, Default)]
pub struct PipelineStats {
    seen: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,

    invalid_flags: AtomicU64,
    banned: AtomicU64,
    syn_flood: AtomicU64,
    ban_on_syn_rate: AtomicU64,
    rst_flood: AtomicU64,
    early_data: AtomicU64,
    no_state: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one verdict by its reason token.
    pub fn record(&self, accept: bool, reason: &str) {
        self.seen.fetch_add(1, Ordering::Relaxed);
        if accept {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let counter = match reason {
            "invalid-flags" => &self.invalid_flags,
            "banned" => &self.banned,
            "syn-flood" => &self.syn_flood,
            "ban-on-syn-rate" => &self.ban_on_syn_rate,
            "rst-flood" => &self.rst_flood,
            "early-data" => &self.early_data,
            _ => &self.no_state,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            seen: self.seen.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            invalid_flags: self.invalid_flags.load(Ordering::Relaxed),
            banned: self.banned.load(Ordering::Relaxed),
            syn_flood: self.syn_flood.load(Ordering::Relaxed),
            ban_on_syn_rate: self.ban_on_syn_rate.load(Ordering::Relaxed),
            rst_flood: self.rst_flood.load(Ordering::Relaxed),
            early_data: self.early_data.load(Ordering::Relaxed),
            no_state: self.no_state.load(Ordering::Relaxed),
        }
    }
}

/// Owned copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub seen: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub invalid_flags: u64,
    pub banned: u64,
    pub syn_flood: u64,
    pub ban_on_syn_rate: u64,
    pub rst_flood: u64,
    pub early_data: u64,
    pub no_state: u64,
}
