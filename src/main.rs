//! synwarden daemon entry point: the supervisor.
//!
//! Initialization order is leaves-first (logger, whitelist, block set,
//! probe, tracker-bearing engine, background threads, capture) and cleanup
//! runs in reverse. Fatal errors exist only here: once the capture loop is
//! running, every error is absorbed on the packet path and reported through
//! events and counters.

use clap::Parser;
use std::sync::Arc;
use std::time::Instant;

use synwarden::cli::Cli;
use synwarden::detector::blockset::BlockSet;
use synwarden::detector::config::Config;
use synwarden::detector::nfqueue::NfqueueCapture;
use synwarden::detector::procscan::ProcScan;
use synwarden::detector::rawsock::RawSocketCapture;
use synwarden::detector::types::Metrics;
use synwarden::detector::whitelist::Whitelist;
use synwarden::detector::{expiry, BlockList, CaptureBackend, DetectorError, Engine, HalfOpenProbe};
use synwarden::logger::{Event, Logger};
use synwarden::metrics::spawn_metrics_server;
use synwarden::supervisor;

use std::sync::atomic::Ordering;

fn main() {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("synwarden: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<(), DetectorError> {
    let session_start = Instant::now();

    // Configuration first: a bad file must fail before anything is touched.
    let config = Config::load(&cli.config)?;

    let logger = Arc::new(
        Logger::new(config.log_level, cli.json, cli.log_file.as_deref())
            .map_err(DetectorError::Io)?,
    );

    logger.log(&Event::Info {
        message: &format!("synwarden v{} starting", env!("CARGO_PKG_VERSION")),
    });
    config.log_summary(&logger);

    supervisor::install_handlers();

    // Whitelist: a missing file is a warning, not a refusal to start.
    let whitelist = match Whitelist::load(&config.whitelist_file) {
        Ok((whitelist, skipped)) => {
            if skipped > 0 {
                logger.log(&Event::Warn {
                    message: &format!(
                        "skipped {} malformed whitelist entries in {}",
                        skipped,
                        config.whitelist_file.display()
                    ),
                });
            }
            logger.log(&Event::Info {
                message: &format!("loaded {} whitelist entries", whitelist.len()),
            });
            whitelist
        }
        Err(e) => {
            logger.log(&Event::Warn {
                message: &format!(
                    "no whitelist loaded ({}: {})",
                    config.whitelist_file.display(),
                    e
                ),
            });
            Whitelist::default()
        }
    };

    // The block set must exist before the first detection can fire.
    let blockset = Arc::new(BlockSet::init(
        &config.set_name,
        config.block_duration_s,
        config.max_tracked_ips,
        Arc::clone(&logger),
    )?);

    let probe: Arc<dyn HalfOpenProbe> = Arc::new(ProcScan::new(Arc::clone(&logger)));
    let metrics = Metrics::new();

    // Copied out before the config moves into the engine.
    let use_raw_socket = cli.raw_socket || config.use_raw_socket;
    let queue_num = config.queue_num;
    let sweep_interval_s = config.sweep_interval_s;
    let metrics_socket = config.metrics_socket.clone();

    let engine = Arc::new(Engine::new(
        config,
        whitelist,
        Arc::clone(&blockset) as Arc<dyn BlockList>,
        probe,
        Arc::clone(&metrics),
        Arc::clone(&logger),
        cli.config.clone(),
    )?);

    // Background threads: metrics endpoint (optional) and the sweeper.
    let metrics_handle = match spawn_metrics_server(Arc::clone(&engine), metrics_socket) {
        Ok(handle) => Some(handle),
        Err(e) => {
            logger.log(&Event::Warn {
                message: &format!("metrics endpoint disabled: {}", e),
            });
            None
        }
    };

    let sweeper_handle = expiry::spawn_sweeper(Arc::clone(&engine), sweep_interval_s)?;
    logger.log(&Event::Info {
        message: &format!("expiration sweeper started (interval={}s)", sweep_interval_s),
    });

    // Capture blocks this thread until shutdown or a fatal capture error.
    let capture_result = if use_raw_socket {
        RawSocketCapture::open(Arc::clone(&engine)).and_then(|mut capture| capture.run())
    } else {
        NfqueueCapture::open(Arc::clone(&engine), queue_num).and_then(|mut capture| capture.run())
    };

    // Cleanup in reverse dependency order. The block set itself is
    // preserved: installed blocks must survive a daemon restart.
    engine.stop();
    let _ = sweeper_handle.join();
    if let Some(handle) = metrics_handle {
        let _ = handle.join();
    }
    blockset.shutdown();
    engine.tracker.clear();

    logger.log(&Event::Summary {
        duration_secs:     session_start.elapsed().as_secs(),
        packets_total:     metrics.packets_total.load(Ordering::Relaxed),
        syn_packets_total: metrics.syn_packets_total.load(Ordering::Relaxed),
        detections:        metrics.detections_total.load(Ordering::Relaxed),
        blocked_current:   metrics.blocked_ips_current.load(Ordering::Relaxed),
    });
    logger.log(&Event::Info {
        message: "synwarden stopped",
    });

    capture_result
}
