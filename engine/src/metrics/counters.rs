use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub ticks_total: Arc<AtomicU64>,
    pub ticks_skipped: Arc<AtomicU64>,
    pub master_reads_failed: Arc<AtomicU64>,

    pub opens_ok: Arc<AtomicU64>,
    pub opens_failed: Arc<AtomicU64>,
    pub closes_ok: Arc<AtomicU64>,
    pub closes_failed: Arc<AtomicU64>,
    pub modifies_ok: Arc<AtomicU64>,
    pub modifies_failed: Arc<AtomicU64>,
}
