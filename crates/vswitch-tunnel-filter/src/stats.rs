//! Filter statistics
//!
//! Lock-free counters recorded from the classify path and the control path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tunnel filter counters (atomic, lock-free)
#[derive(Debug, Default)]
pub struct FilterStats {
    /// Packets recognized as tunnel traffic and classified
    pub classified: AtomicU64,
    /// Packets cheaply rejected as non-tunnel traffic
    pub passed_through: AtomicU64,
    /// Classified packets permitted on the normal path
    pub permitted: AtomicU64,
    /// Classified packets blocked
    pub blocked: AtomicU64,
    /// Classified packets redirected into the datapath
    pub redirected: AtomicU64,
    /// Tunnel contexts created
    pub context_creates: AtomicU64,
    /// Tunnel contexts invalidated
    pub context_invalidations: AtomicU64,
    /// Packets passed unclassified because the context table was full
    pub table_full_drops: AtomicU64,
    /// Provisioning cycles attempted
    pub provision_cycles: AtomicU64,
    /// Provisioning cycles that failed and were unwound
    pub provision_failures: AtomicU64,
}

impl FilterStats {
    #[inline(always)]
    pub(crate) fn record_classified(&self) {
        self.classified.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_pass_through(&self) {
        self.passed_through.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_permit(&self) {
        self.permitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_block(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_redirect(&self) {
        self.redirected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_context_create(&self) {
        self.context_creates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_context_invalidations(&self, n: u64) {
        self.context_invalidations.fetch_add(n, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_table_full(&self) {
        self.table_full_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_provision_cycle(&self) {
        self.provision_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_provision_failure(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot for reporting
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            classified: self.classified.load(Ordering::Relaxed),
            passed_through: self.passed_through.load(Ordering::Relaxed),
            permitted: self.permitted.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            redirected: self.redirected.load(Ordering::Relaxed),
            context_creates: self.context_creates.load(Ordering::Relaxed),
            context_invalidations: self.context_invalidations.load(Ordering::Relaxed),
            table_full_drops: self.table_full_drops.load(Ordering::Relaxed),
            provision_cycles: self.provision_cycles.load(Ordering::Relaxed),
            provision_failures: self.provision_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FilterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub classified: u64,
    pub passed_through: u64,
    pub permitted: u64,
    pub blocked: u64,
    pub redirected: u64,
    pub context_creates: u64,
    pub context_invalidations: u64,
    pub table_full_drops: u64,
    pub provision_cycles: u64,
    pub provision_failures: u64,
}
