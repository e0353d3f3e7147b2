//! Background sweep of expired blocks.
//!
//! The kernel deletes set entries on its own when their TTL elapses; the
//! sweeper mirrors that in the tracker so a released source can be blocked
//! again, and removes set entries explicitly so the unblock is prompt and
//! observable. It runs on its own thread, sleeping in 1-second steps so
//! shutdown latency stays bounded, and holds the tracker lock per record
//! rather than across a batch.

use crate::detector::{clock, Engine};
use crate::logger::Event;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on addresses drained per scan. The sweep loops while scans
/// come back full, so a storm of simultaneous expirations still drains in
/// one sweep.
pub const EXPIRY_BATCH: usize = 1024;

/// Spawns the sweeper thread.
///
/// Wakes every `interval_s` seconds, checking the engine's running flag once
/// per second in between. Exits without a final sweep: releasing blocks early
/// on shutdown would unblock attackers that the kernel TTL is still holding.
pub fn spawn_sweeper(engine: Arc<Engine>, interval_s: u32) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("sweeper".to_string())
        .spawn(move || {
            loop {
                let mut slept = 0;
                while slept < interval_s {
                    if !engine.is_running() {
                        return;
                    }
                    thread::sleep(Duration::from_secs(1));
                    slept += 1;
                }

                sweep_once(&engine, clock::now());
            }
        })
}

/// Performs one sweep at `now_ns`: drains every expired block, removing it
/// from the kernel set and clearing the tracker state, then refreshes the
/// blocked-count gauge. Returns the number of blocks released.
pub fn sweep_once(engine: &Engine, now_ns: u64) -> usize {
    let mut released = 0;

    loop {
        let expired = engine.tracker.expired_blocks(now_ns, EXPIRY_BATCH);
        let full_batch = expired.len() == EXPIRY_BATCH;
        let mut released_this_pass = 0;

        for addr in expired {
            match engine.blockset.remove(addr) {
                Ok(()) => {
                    // Per-record exclusive access; a record missing here means
                    // a concurrent clear or eviction won, which is fine.
                    let mut guard = engine.tracker.write();
                    if let Some(rec) = guard.get(addr) {
                        rec.blocked = false;
                        rec.block_expiry_ns = 0;
                    }
                    drop(guard);

                    engine.logger.log(&Event::Unblocked { addr });
                    released_this_pass += 1;
                }
                Err(e) => {
                    engine.logger.log(&Event::Warn {
                        message: &format!("failed to unblock {}: {}", addr, e),
                    });
                }
            }
        }

        released += released_this_pass;

        // Re-scan only while batches come back full AND progress is being
        // made; a driver outage must not spin this loop.
        if !full_batch || released_this_pass == 0 {
            break;
        }
    }

    engine
        .metrics
        .blocked_ips_current
        .store(engine.blockset.count() as u64, Ordering::Relaxed);

    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::config::Config;
    use crate::detector::types::Metrics;
    use crate::detector::whitelist::Whitelist;
    use crate::detector::{BlockList, DetectorError};
    use crate::logger::{Level, Logger};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    struct FakeBlockSet {
        entries:      Mutex<HashSet<Ipv4Addr>>,
        fail_removes: AtomicBool,
    }

    impl BlockList for FakeBlockSet {
        fn add(&self, addr: Ipv4Addr, _ttl_s: u32) -> Result<(), DetectorError> {
            self.entries.lock().insert(addr);
            Ok(())
        }
        fn remove(&self, addr: Ipv4Addr) -> Result<(), DetectorError> {
            if self.fail_removes.load(Ordering::Relaxed) {
                return Err(DetectorError::BlockSet("injected failure".to_string()));
            }
            self.entries.lock().remove(&addr);
            Ok(())
        }
        fn count(&self) -> u32 {
            self.entries.lock().len() as u32
        }
    }

    struct ZeroProbe;
    impl crate::detector::HalfOpenProbe for ZeroProbe {
        fn count_half_open(&self, _filter: Option<Ipv4Addr>) -> u32 {
            0
        }
    }

    fn build_engine(blockset: Arc<FakeBlockSet>) -> Engine {
        let logger = Arc::new(Logger::new(Level::Error, false, None).expect("logger"));
        Engine::new(
            Config::default(),
            Whitelist::default(),
            blockset,
            Arc::new(ZeroProbe),
            Metrics::new(),
            logger,
            PathBuf::from("/dev/null"),
        )
        .expect("engine")
    }

    fn block(engine: &Engine, addr: Ipv4Addr, expiry_ns: u64) {
        engine
            .blockset
            .add(addr, 300)
            .expect("fake add cannot fail here");
        let mut guard = engine.tracker.write();
        let rec = guard.get_or_create(addr, 1);
        rec.syn_count = 1;
        rec.blocked = true;
        rec.block_expiry_ns = expiry_ns;
    }

    #[test]
    fn test_sweep_releases_expired_blocks_only() {
        let blockset = Arc::new(FakeBlockSet {
            entries:      Mutex::new(HashSet::new()),
            fail_removes: AtomicBool::new(false),
        });
        let engine = build_engine(blockset.clone());

        let expired = Ipv4Addr::new(10, 0, 0, 1);
        let live = Ipv4Addr::new(10, 0, 0, 2);
        block(&engine, expired, 5_000);
        block(&engine, live, 50_000);

        let released = sweep_once(&engine, 10_000);

        assert_eq!(released, 1);
        assert!(!blockset.entries.lock().contains(&expired));
        assert!(blockset.entries.lock().contains(&live));

        let mut guard = engine.tracker.write();
        let rec = guard.get(expired).expect("record survives unblock");
        assert!(!rec.blocked);
        assert_eq!(rec.block_expiry_ns, 0);
        assert!(guard.get(live).expect("record").blocked);
        drop(guard);

        assert_eq!(engine.metrics.blocked_ips_current.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_sweep_with_nothing_expired_is_a_noop() {
        let blockset = Arc::new(FakeBlockSet {
            entries:      Mutex::new(HashSet::new()),
            fail_removes: AtomicBool::new(false),
        });
        let engine = build_engine(blockset);
        block(&engine, Ipv4Addr::new(10, 0, 0, 1), 50_000);

        assert_eq!(sweep_once(&engine, 10_000), 0);
        assert!(engine.tracker.write().get(Ipv4Addr::new(10, 0, 0, 1)).expect("record").blocked);
    }

    #[test]
    fn test_sweep_drains_more_than_one_batch() {
        let blockset = Arc::new(FakeBlockSet {
            entries:      Mutex::new(HashSet::new()),
            fail_removes: AtomicBool::new(false),
        });
        let engine = build_engine(blockset.clone());

        // More expired blocks than one batch holds.
        for i in 0..(EXPIRY_BATCH + 100) {
            let addr = Ipv4Addr::from((0x0a00_0000u32) + i as u32 + 1);
            block(&engine, addr, 1_000);
        }

        let released = sweep_once(&engine, 2_000);

        assert_eq!(released, EXPIRY_BATCH + 100);
        assert_eq!(blockset.count(), 0);
        assert_eq!(engine.tracker.stats().blocked, 0);
    }

    #[test]
    fn test_sweep_does_not_spin_when_removals_fail() {
        let blockset = Arc::new(FakeBlockSet {
            entries:      Mutex::new(HashSet::new()),
            fail_removes: AtomicBool::new(true),
        });
        let engine = build_engine(blockset);

        for i in 0..(EXPIRY_BATCH + 10) {
            let addr = Ipv4Addr::from((0x0a00_0000u32) + i as u32 + 1);
            block(&engine, addr, 1_000);
        }

        // Every removal fails; the sweep must terminate with nothing released
        // and the records still blocked for the next attempt.
        assert_eq!(sweep_once(&engine, 2_000), 0);
        assert_eq!(engine.tracker.stats().blocked, EXPIRY_BATCH + 10);
    }

    #[test]
    fn test_reblock_after_expiry_is_possible() {
        let blockset = Arc::new(FakeBlockSet {
            entries:      Mutex::new(HashSet::new()),
            fail_removes: AtomicBool::new(false),
        });
        let engine = build_engine(blockset);
        let addr = Ipv4Addr::new(10, 0, 0, 1);

        block(&engine, addr, 5_000);
        sweep_once(&engine, 10_000);

        // The record survived and can be blocked again.
        let mut guard = engine.tracker.write();
        let rec = guard.get(addr).expect("record");
        assert!(!rec.blocked);
        rec.blocked = true;
        rec.block_expiry_ns = 20_000;
        drop(guard);

        assert_eq!(sweep_once(&engine, 30_000), 1);
    }
}
