//! Lock-free staging accounting shared by system-memory mappers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tracing::info;

/// Staging counters.  One instance may be shared by many mappers.
#[derive(Debug, Default)]
pub struct StagingStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    releases: AtomicU64,
    copies: AtomicU64,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

/// Point-in-time copy of [`StagingStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StagingSnapshot {
    pub allocations: u64,
    pub reuses: u64,
    pub releases: u64,
    pub copies: u64,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

impl StagingStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn on_alloc(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let prev = self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.peak_bytes.fetch_max(prev + bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_release(&self, bytes: usize) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_copy(&self) {
        self.copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StagingSnapshot {
        StagingSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }

    /// Reuse rate as a percentage (0.0–100.0) of staging acquisitions.
    pub fn reuse_rate(&self) -> f64 {
        let s = self.snapshot();
        let total = (s.allocations + s.reuses) as f64;
        if total == 0.0 {
            0.0
        } else {
            (s.reuses as f64 / total) * 100.0
        }
    }

    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            allocations = s.allocations,
            reuses = s.reuses,
            releases = s.releases,
            copies = s.copies,
            live_kb = s.live_bytes / 1024,
            peak_kb = s.peak_bytes / 1024,
            reuse_rate = format!("{:.1}%", self.reuse_rate()),
            "Staging stats"
        );
    }
}
