//! Monotonic clock for window and expiry arithmetic.
//!
//! Every duration and timestamp in the detector lives in nanoseconds on a
//! single monotonic timeline, so wall-clock steps (NTP corrections, manual
//! changes) can never shrink or stretch a detection window or a block TTL.

use std::sync::OnceLock;
use std::time::Instant;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Nanoseconds per millisecond.
pub const NSEC_PER_MSEC: u64 = 1_000_000;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Returns monotonic nanoseconds since an arbitrary process-local epoch.
///
/// Non-decreasing across all callers and threads; the epoch is pinned on
/// first use.
pub fn now() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Converts milliseconds to nanoseconds.
pub fn ms_to_ns(ms: u32) -> u64 {
    ms as u64 * NSEC_PER_MSEC
}

/// Converts seconds to nanoseconds.
pub fn sec_to_ns(sec: u32) -> u64 {
    sec as u64 * NSEC_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let mut prev = now();
        for _ in 0..1000 {
            let t = now();
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(ms_to_ns(1), NSEC_PER_MSEC);
        assert_eq!(ms_to_ns(1000), NSEC_PER_SEC);
        assert_eq!(sec_to_ns(300), 300 * NSEC_PER_SEC);
        assert_eq!(sec_to_ns(0), 0);
    }
}
