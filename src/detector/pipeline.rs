//! Per-SYN detection pipeline.
//!
//! One entry point, [`on_syn`], called by the capture backend for every SYN
//! it extracts. The decision sequence is fixed: whitelist filter, tracker
//! touch, window arithmetic, threshold test, kernel-state confirmation,
//! block. The packet itself is always accepted; dropping is the kernel's
//! job once the source is in the block set.
//!
//! Nothing in this module panics or propagates errors upward: a failed set
//! add leaves the record unblocked so the next qualifying SYN retries, and a
//! failed probe reads as zero half-open connections, which lands in the
//! not-confirmed branch.

use crate::detector::{clock, Engine};
use crate::logger::Event;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;

/// Processes one SYN from `addr` observed at `now_ns`.
///
/// The tracker write lock is held from the record touch through a possible
/// block installation, so no other thread can observe a record whose set
/// entry exists but whose `blocked` flag is still false.
pub fn on_syn(engine: &Engine, addr: Ipv4Addr, now_ns: u64) {
    let rt = engine.runtime();

    // Whitelisted sources never enter the tracker.
    if rt.whitelist.contains(addr) {
        engine.metrics.whitelist_hits_total.fetch_add(1, Ordering::Relaxed);
        engine.logger.log(&Event::Whitelisted { addr });
        return;
    }

    let cfg = &rt.config;
    let window_ns = clock::ms_to_ns(cfg.window_ms);

    let mut tracker = engine.tracker.write();
    let rec = tracker.get_or_create(addr, now_ns);

    // Window arithmetic: reset on strict overrun, otherwise accumulate.
    // A reset attributes the current SYN to the fresh window, hence 1 not 0.
    if now_ns - rec.window_start_ns > window_ns {
        rec.syn_count = 1;
        rec.window_start_ns = now_ns;
    } else {
        rec.syn_count += 1;
    }

    // Threshold is strict. A record that is already blocked keeps counting
    // but is not re-evaluated until the sweeper releases it.
    if rec.syn_count > cfg.syn_threshold && !rec.blocked {
        let half_open = engine.probe.count_half_open(Some(addr));

        if half_open > cfg.syn_threshold / 2 {
            // Confirmed: the kernel is actually holding half-open state for
            // this source.
            match engine.blockset.add(addr, cfg.block_duration_s) {
                Ok(()) => {
                    rec.blocked = true;
                    rec.block_expiry_ns = now_ns + clock::sec_to_ns(cfg.block_duration_s);

                    engine.logger.log(&Event::Blocked {
                        addr,
                        syn_count: rec.syn_count,
                        half_open,
                    });
                    engine.metrics.detections_total.fetch_add(1, Ordering::Relaxed);
                    engine
                        .metrics
                        .blocked_ips_current
                        .store(engine.blockset.count() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    // Not marked blocked: the next qualifying SYN retries.
                    engine.logger.log(&Event::Warn {
                        message: &format!("failed to block {}: {}", addr, e),
                    });
                }
            }
        } else {
            engine.logger.log(&Event::Suspicious {
                addr,
                syn_count: rec.syn_count,
                half_open,
            });
            engine
                .metrics
                .false_positives_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    drop(tracker);

    engine.metrics.syn_packets_total.fetch_add(1, Ordering::Relaxed);
}
