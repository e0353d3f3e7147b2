//! Core data structures shared across detector sub-modules.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

// ── Signal service cadence ───────────────────────────────────────────────────

/// Packets processed between checks of the pending signal intents.
///
/// Both capture backends call [`crate::supervisor::service_signals`] once per
/// this many packets, in addition to every idle wakeup of their read loop.
pub const SIGNAL_CHECK_INTERVAL: u32 = 1000;

// ── Per-source tracking record ────────────────────────────────────────────────

/// Per-source-address SYN accounting and block state.
///
/// One record exists per observed non-whitelisted source. Records are created
/// on SYN observation only, so `syn_count >= 1` holds for any record visible
/// outside the tracker's write lock.
#[derive(Debug, Clone)]
pub struct TrackerRecord {
    /// Source address this record tracks.
    pub addr: Ipv4Addr,
    /// SYN packets attributed to the current window.
    pub syn_count: u32,
    /// Monotonic-ns timestamp of the first SYN in the current window.
    pub window_start_ns: u64,
    /// Monotonic-ns timestamp of the most recent SYN; drives LRU eviction.
    pub last_seen_ns: u64,
    /// Whether this source is currently in the kernel block set.
    pub blocked: bool,
    /// Monotonic-ns timestamp at which the block may be released.
    /// Meaningful only while `blocked` is true.
    pub block_expiry_ns: u64,
}

impl TrackerRecord {
    pub(crate) fn new(addr: Ipv4Addr, now_ns: u64) -> Self {
        Self {
            addr,
            syn_count: 0,
            window_start_ns: now_ns,
            last_seen_ns: now_ns,
            blocked: false,
            block_expiry_ns: 0,
        }
    }
}

// ── Daemon counters ───────────────────────────────────────────────────────────

/// Atomically-updated daemon counters, shared by the capture loop, the
/// detection pipeline, the sweeper, and the metrics endpoint.
///
/// Individual counters are lock-free; no ordering is asserted across them.
pub struct Metrics {
    /// Raw packets received by the capture backend, malformed ones included.
    pub packets_total: AtomicU64,
    /// Non-whitelisted SYN packets run through the pipeline.
    pub syn_packets_total: AtomicU64,
    /// Confirmed attacks (one per block installed).
    pub detections_total: AtomicU64,
    /// Threshold crossings the kernel state did not confirm.
    pub false_positives_total: AtomicU64,
    /// SYNs dropped from consideration by the whitelist.
    pub whitelist_hits_total: AtomicU64,
    /// Gauge: entries currently in the kernel block set.
    pub blocked_ips_current: AtomicU64,
}

impl Metrics {
    /// Constructs a new counter block with everything at zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packets_total:         AtomicU64::new(0),
            syn_packets_total:     AtomicU64::new(0),
            detections_total:      AtomicU64::new(0),
            false_positives_total: AtomicU64::new(0),
            whitelist_hits_total:  AtomicU64::new(0),
            blocked_ips_current:   AtomicU64::new(0),
        })
    }
}

/// Shared type alias used throughout the crate.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_new_record_fields() {
        let rec = TrackerRecord::new(Ipv4Addr::new(10, 0, 0, 1), 42);
        assert_eq!(rec.syn_count, 0);
        assert_eq!(rec.window_start_ns, 42);
        assert_eq!(rec.last_seen_ns, 42);
        assert!(!rec.blocked);
        assert_eq!(rec.block_expiry_ns, 0);
    }

    #[test]
    fn test_metrics_start_at_zero() {
        let m = Metrics::new();
        assert_eq!(m.packets_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.detections_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.blocked_ips_current.load(Ordering::Relaxed), 0);
    }
}
