//! Signal intent handling and configuration reload.
//!
//! Signal handlers do exactly one thing: store an atomic intent flag. The
//! capture loop services those intents from ordinary thread context, every
//! [`crate::detector::types::SIGNAL_CHECK_INTERVAL`] packets and on every
//! idle wakeup, so no allocation, locking, or logging ever happens inside a
//! handler.
//!
//! A reload re-parses the configuration file and rebuilds the whitelist; the
//! pair is published with a single pointer swap, so a concurrent pipeline
//! call sees either the old pair or the new pair, never a mix. A failed
//! parse keeps the current pair untouched.

use crate::detector::config::Config;
use crate::detector::whitelist::Whitelist;
use crate::detector::{Engine, Runtime};
use crate::logger::Event;
use std::sync::atomic::{AtomicBool, Ordering};

// ── Signal intents ───────────────────────────────────────────────────────────

static SHUTDOWN_INTENT: AtomicBool = AtomicBool::new(false);
static RELOAD_INTENT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
    SHUTDOWN_INTENT.store(true, Ordering::Relaxed);
}

extern "C" fn on_reload_signal(_sig: libc::c_int) {
    RELOAD_INTENT.store(true, Ordering::Relaxed);
}

/// Installs the signal handlers: SIGTERM/SIGINT request shutdown, SIGHUP
/// requests a configuration reload, SIGPIPE is ignored.
pub fn install_handlers() {
    // SAFETY: the handlers only store to static atomics, which is
    // async-signal-safe.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            on_shutdown_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            on_shutdown_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGHUP,
            on_reload_signal as *const () as libc::sighandler_t,
        );
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Checks and clears pending signal intents. Called periodically from the
/// capture loop.
pub fn service_signals(engine: &Engine) {
    if SHUTDOWN_INTENT.swap(false, Ordering::Relaxed) {
        engine.logger.log(&Event::Info {
            message: "shutdown signal received, stopping gracefully",
        });
        engine.stop();
    }

    if RELOAD_INTENT.swap(false, Ordering::Relaxed) {
        reload(engine);
    }
}

// ── Reload ───────────────────────────────────────────────────────────────────

/// Re-reads the configuration file and publishes a new runtime pair.
///
/// On parse or validation failure nothing is applied. A whitelist file that
/// cannot be read keeps the previous whitelist alongside the new
/// configuration. Tracker geometry (buckets, capacity) is fixed at startup;
/// attempts to change it are reported and ignored.
pub fn reload(engine: &Engine) {
    let path = engine.config_path.clone();
    engine.logger.log(&Event::Info {
        message: &format!("reloading configuration from {}", path.display()),
    });

    let new_config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            engine.logger.log(&Event::Error {
                message: &format!("reload failed, keeping current configuration: {}", e),
            });
            return;
        }
    };

    let current = engine.runtime();

    if new_config.hash_buckets != current.config.hash_buckets
        || new_config.max_tracked_ips != current.config.max_tracked_ips
    {
        engine.logger.log(&Event::Warn {
            message: &format!(
                "tracker geometry changes require a restart; keeping hash_buckets={} max_tracked_ips={}",
                current.config.hash_buckets, current.config.max_tracked_ips
            ),
        });
    }

    let whitelist = match Whitelist::load(&new_config.whitelist_file) {
        Ok((whitelist, skipped)) => {
            if skipped > 0 {
                engine.logger.log(&Event::Warn {
                    message: &format!(
                        "skipped {} malformed whitelist entries in {}",
                        skipped,
                        new_config.whitelist_file.display()
                    ),
                });
            }
            engine.logger.log(&Event::Info {
                message: &format!("loaded {} whitelist entries", whitelist.len()),
            });
            whitelist
        }
        Err(e) => {
            engine.logger.log(&Event::Warn {
                message: &format!(
                    "cannot read whitelist {}: {}; keeping previous entries",
                    new_config.whitelist_file.display(),
                    e
                ),
            });
            current.whitelist.clone()
        }
    };

    engine.publish_runtime(Runtime {
        config: new_config,
        whitelist,
    });

    purge_whitelisted(engine);

    engine.logger.log(&Event::Info {
        message: "configuration reloaded",
    });
}

/// Drops tracker records whose source the (new) whitelist now covers, and
/// releases any block the set still holds for them. Keeps the invariant that
/// a whitelisted address is never tracked and never blocked.
fn purge_whitelisted(engine: &Engine) {
    let rt = engine.runtime();
    let removed = engine.tracker.remove_where(|addr| rt.whitelist.contains(addr));
    if removed.is_empty() {
        return;
    }

    let mut unblocked = 0;
    for (addr, was_blocked) in &removed {
        if *was_blocked {
            match engine.blockset.remove(*addr) {
                Ok(()) => unblocked += 1,
                Err(e) => {
                    engine.logger.log(&Event::Warn {
                        message: &format!("failed to unblock whitelisted {}: {}", addr, e),
                    });
                }
            }
        }
    }

    if unblocked > 0 {
        engine
            .metrics
            .blocked_ips_current
            .store(engine.blockset.count() as u64, Ordering::Relaxed);
    }

    engine.logger.log(&Event::Info {
        message: &format!(
            "removed {} tracked addresses now covered by the whitelist ({} unblocked)",
            removed.len(),
            unblocked
        ),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::types::Metrics;
    use crate::detector::{BlockList, DetectorError, HalfOpenProbe};
    use crate::logger::{Level, Logger};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct FakeBlockSet {
        entries: Mutex<HashSet<Ipv4Addr>>,
    }

    impl BlockList for FakeBlockSet {
        fn add(&self, addr: Ipv4Addr, _ttl_s: u32) -> Result<(), DetectorError> {
            self.entries.lock().insert(addr);
            Ok(())
        }
        fn remove(&self, addr: Ipv4Addr) -> Result<(), DetectorError> {
            self.entries.lock().remove(&addr);
            Ok(())
        }
        fn count(&self) -> u32 {
            self.entries.lock().len() as u32
        }
    }

    struct ZeroProbe;
    impl HalfOpenProbe for ZeroProbe {
        fn count_half_open(&self, _filter: Option<Ipv4Addr>) -> u32 {
            0
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).expect("create");
        write!(f, "{}", contents).expect("write");
        path
    }

    fn build_engine(
        config: Config,
        whitelist: Whitelist,
        blockset: Arc<FakeBlockSet>,
        config_path: PathBuf,
    ) -> Engine {
        let logger = Arc::new(Logger::new(Level::Error, false, None).expect("logger"));
        Engine::new(
            config,
            whitelist,
            blockset,
            Arc::new(ZeroProbe),
            Metrics::new(),
            logger,
            config_path,
        )
        .expect("engine")
    }

    #[test]
    fn test_reload_applies_new_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let whitelist_path = write_file(&dir, "whitelist.conf", "");
        let config_path = write_file(
            &dir,
            "synwarden.conf",
            &format!(
                r#"{{ "syn_threshold": 42, "whitelist_file": "{}" }}"#,
                whitelist_path.display()
            ),
        );

        let blockset = Arc::new(FakeBlockSet { entries: Mutex::new(HashSet::new()) });
        let engine = build_engine(
            Config::default(),
            Whitelist::default(),
            blockset,
            config_path,
        );

        reload(&engine);
        assert_eq!(engine.runtime().config.syn_threshold, 42);
    }

    #[test]
    fn test_failed_reload_keeps_current_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = write_file(&dir, "synwarden.conf", "{ not json !");

        let (whitelist, _) = Whitelist::parse(["10.0.0.0/8"]);
        let blockset = Arc::new(FakeBlockSet { entries: Mutex::new(HashSet::new()) });
        let engine = build_engine(Config::default(), whitelist, blockset, config_path);

        reload(&engine);

        let rt = engine.runtime();
        assert_eq!(rt.config.syn_threshold, Config::default().syn_threshold);
        assert!(rt.whitelist.contains(Ipv4Addr::new(10, 1, 1, 1)));
    }

    #[test]
    fn test_unreadable_whitelist_keeps_previous_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = write_file(
            &dir,
            "synwarden.conf",
            r#"{ "whitelist_file": "/nonexistent/whitelist.conf" }"#,
        );

        let (whitelist, _) = Whitelist::parse(["172.16.0.0/12"]);
        let blockset = Arc::new(FakeBlockSet { entries: Mutex::new(HashSet::new()) });
        let engine = build_engine(Config::default(), whitelist, blockset, config_path);

        reload(&engine);
        assert!(engine.runtime().whitelist.contains(Ipv4Addr::new(172, 16, 1, 1)));
    }

    #[test]
    fn test_reload_purges_newly_whitelisted_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let whitelist_path = write_file(&dir, "whitelist.conf", "203.0.113.0/24\n");
        let config_path = write_file(
            &dir,
            "synwarden.conf",
            &format!(
                r#"{{ "whitelist_file": "{}" }}"#,
                whitelist_path.display()
            ),
        );

        let blockset = Arc::new(FakeBlockSet { entries: Mutex::new(HashSet::new()) });
        let engine = build_engine(
            Config::default(),
            Whitelist::default(),
            blockset.clone(),
            config_path,
        );

        // One blocked and one merely tracked source inside the new prefix,
        // plus an unrelated source outside it.
        let blocked = Ipv4Addr::new(203, 0, 113, 100);
        let tracked = Ipv4Addr::new(203, 0, 113, 101);
        let other = Ipv4Addr::new(198, 51, 100, 7);
        {
            let mut guard = engine.tracker.write();
            let rec = guard.get_or_create(blocked, 1);
            rec.syn_count = 5;
            rec.blocked = true;
            rec.block_expiry_ns = 1_000_000;
            guard.get_or_create(tracked, 2).syn_count = 3;
            guard.get_or_create(other, 3).syn_count = 1;
        }
        blockset.entries.lock().insert(blocked);

        reload(&engine);

        let mut guard = engine.tracker.write();
        assert!(guard.get(blocked).is_none());
        assert!(guard.get(tracked).is_none());
        assert!(guard.get(other).is_some());
        drop(guard);
        assert!(!blockset.entries.lock().contains(&blocked));
    }
}
