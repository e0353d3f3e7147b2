//! Metrics endpoint: a Unix stream socket serving the daemon's counters in
//! Prometheus text exposition format.
//!
//! One response per connection; the client connects, reads until EOF, and is
//! done. The listener is non-blocking so the serving thread notices shutdown
//! within one poll interval, and the socket file is unlinked on the way out.

use crate::detector::Engine;
use crate::logger::Event;
use std::fs;
use std::io::{self, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_WAIT: Duration = Duration::from_millis(200);

/// Binds the metrics socket and spawns the serving thread.
///
/// # Errors
/// Fails when the socket cannot be bound (bad path, permissions) or the
/// thread cannot be spawned. Callers treat this as non-fatal: the daemon
/// detects and blocks just fine without the endpoint.
pub fn spawn_metrics_server(
    engine: Arc<Engine>,
    socket_path: PathBuf,
) -> io::Result<thread::JoinHandle<()>> {
    // A previous run may have left its socket file behind.
    let _ = fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;

    engine.logger.log(&Event::Info {
        message: &format!("metrics endpoint listening on {}", socket_path.display()),
    });

    thread::Builder::new().name("metrics".to_string()).spawn(move || {
        while engine.is_running() {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let body = render_metrics(&engine);
                    let _ = stream.write_all(body.as_bytes());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_WAIT);
                }
                Err(_) => break,
            }
        }

        let _ = fs::remove_file(&socket_path);
    })
}

/// Renders all counters in Prometheus text exposition format.
pub fn render_metrics(engine: &Engine) -> String {
    let m = &engine.metrics;
    let tracker = engine.tracker.stats();

    format!(
        "# HELP synwarden_packets_total Total packets processed\n\
         # TYPE synwarden_packets_total counter\n\
         synwarden_packets_total {}\n\
         \n\
         # HELP synwarden_syn_packets_total Total SYN packets run through the pipeline\n\
         # TYPE synwarden_syn_packets_total counter\n\
         synwarden_syn_packets_total {}\n\
         \n\
         # HELP synwarden_blocked_ips_current Entries currently in the block set\n\
         # TYPE synwarden_blocked_ips_current gauge\n\
         synwarden_blocked_ips_current {}\n\
         \n\
         # HELP synwarden_detections_total Confirmed attack detections\n\
         # TYPE synwarden_detections_total counter\n\
         synwarden_detections_total {}\n\
         \n\
         # HELP synwarden_false_positives_total Threshold crossings not confirmed by kernel state\n\
         # TYPE synwarden_false_positives_total counter\n\
         synwarden_false_positives_total {}\n\
         \n\
         # HELP synwarden_whitelist_hits_total SYNs from whitelisted sources\n\
         # TYPE synwarden_whitelist_hits_total counter\n\
         synwarden_whitelist_hits_total {}\n\
         \n\
         # HELP synwarden_tracker_entries Current tracker table entries\n\
         # TYPE synwarden_tracker_entries gauge\n\
         synwarden_tracker_entries {}\n\
         \n\
         # HELP synwarden_tracker_blocked Blocked entries in the tracker\n\
         # TYPE synwarden_tracker_blocked gauge\n\
         synwarden_tracker_blocked {}\n",
        m.packets_total.load(Ordering::Relaxed),
        m.syn_packets_total.load(Ordering::Relaxed),
        m.blocked_ips_current.load(Ordering::Relaxed),
        m.detections_total.load(Ordering::Relaxed),
        m.false_positives_total.load(Ordering::Relaxed),
        m.whitelist_hits_total.load(Ordering::Relaxed),
        tracker.total,
        tracker.blocked,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::config::Config;
    use crate::detector::types::Metrics;
    use crate::detector::whitelist::Whitelist;
    use crate::detector::{BlockList, DetectorError, HalfOpenProbe};
    use crate::logger::{Level, Logger};
    use std::net::Ipv4Addr;

    struct NullBlockSet;
    impl BlockList for NullBlockSet {
        fn add(&self, _addr: Ipv4Addr, _ttl_s: u32) -> Result<(), DetectorError> {
            Ok(())
        }
        fn remove(&self, _addr: Ipv4Addr) -> Result<(), DetectorError> {
            Ok(())
        }
        fn count(&self) -> u32 {
            0
        }
    }

    struct NullProbe;
    impl HalfOpenProbe for NullProbe {
        fn count_half_open(&self, _filter: Option<Ipv4Addr>) -> u32 {
            0
        }
    }

    fn build_engine() -> Engine {
        let logger = Arc::new(Logger::new(Level::Error, false, None).expect("logger"));
        Engine::new(
            Config::default(),
            Whitelist::default(),
            Arc::new(NullBlockSet),
            Arc::new(NullProbe),
            Metrics::new(),
            logger,
            PathBuf::from("/dev/null"),
        )
        .expect("engine")
    }

    #[test]
    fn test_render_contains_every_series() {
        let engine = build_engine();
        let body = render_metrics(&engine);

        for series in [
            "synwarden_packets_total",
            "synwarden_syn_packets_total",
            "synwarden_blocked_ips_current",
            "synwarden_detections_total",
            "synwarden_false_positives_total",
            "synwarden_whitelist_hits_total",
            "synwarden_tracker_entries",
            "synwarden_tracker_blocked",
        ] {
            assert!(body.contains(series), "missing series {}", series);
        }
    }

    #[test]
    fn test_render_reflects_counters_and_tracker() {
        let engine = build_engine();
        engine.metrics.packets_total.store(1234, Ordering::Relaxed);
        engine.metrics.detections_total.store(7, Ordering::Relaxed);
        {
            let mut guard = engine.tracker.write();
            guard.get_or_create(Ipv4Addr::new(10, 0, 0, 1), 1);
            let rec = guard.get_or_create(Ipv4Addr::new(10, 0, 0, 2), 2);
            rec.blocked = true;
        }

        let body = render_metrics(&engine);
        assert!(body.contains("synwarden_packets_total 1234"));
        assert!(body.contains("synwarden_detections_total 7"));
        assert!(body.contains("synwarden_tracker_entries 2"));
        assert!(body.contains("synwarden_tracker_blocked 1"));
    }

    #[test]
    fn test_server_serves_one_response_per_connection() {
        use std::io::Read;
        use std::os::unix::net::UnixStream;

        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("metrics.sock");
        let engine = Arc::new(build_engine());
        engine.metrics.packets_total.store(42, Ordering::Relaxed);

        let handle =
            spawn_metrics_server(engine.clone(), socket_path.clone()).expect("server");

        let mut body = String::new();
        UnixStream::connect(&socket_path)
            .expect("connect")
            .read_to_string(&mut body)
            .expect("read");
        assert!(body.contains("synwarden_packets_total 42"));

        engine.stop();
        handle.join().expect("join");
        assert!(!socket_path.exists());
    }
}
