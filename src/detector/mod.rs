//! SYN flood detection engine.
//!
//! The engine is a leaves-first assembly: the clock, whitelist, tracker,
//! kernel-state probe, and block-set driver know nothing of each other; the
//! per-packet pipeline orchestrates them, the sweeper unwinds expired blocks,
//! and two interchangeable capture backends feed the pipeline. Everything
//! hangs off an explicit [`Engine`] context handle; there is no process-wide
//! mutable state outside the supervisor's signal intent flags.

pub mod blockset;
pub mod clock;
pub mod config;
pub mod expiry;
pub mod nfqueue;
pub mod pipeline;
pub mod procscan;
pub mod rawsock;
pub mod tracker;
pub mod types;
pub mod whitelist;

use crate::logger::SharedLogger;
use config::Config;
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracker::TrackerTable;
use types::SharedMetrics;
use whitelist::Whitelist;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Error surface of the detector.
///
/// Only `main` treats these as fatal (at init); on the packet path every
/// error is absorbed at its call site and reported through events and
/// counters.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("block set error: {0}")]
    BlockSet(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Seams ────────────────────────────────────────────────────────────────────

/// The block-enforcement operations the pipeline and sweeper depend on.
///
/// Production wires [`blockset::BlockSet`]; the scenario tests substitute a
/// recording mock.
pub trait BlockList: Send + Sync {
    /// Adds `addr` with the given TTL; idempotent, refreshes TTL on re-add.
    fn add(&self, addr: Ipv4Addr, ttl_s: u32) -> Result<(), DetectorError>;
    /// Removes `addr`; removing an absent entry succeeds.
    fn remove(&self, addr: Ipv4Addr) -> Result<(), DetectorError>;
    /// Current number of entries in the set.
    fn count(&self) -> u32;
}

/// Source of the half-open connection count used to confirm an attack.
pub trait HalfOpenProbe: Send + Sync {
    /// Counts kernel sockets in the half-open state, restricted to the given
    /// peer when `filter` is `Some`. Probe failures read as 0.
    fn count_half_open(&self, filter: Option<Ipv4Addr>) -> u32;
}

/// Common contract of the two capture backends. The variant is chosen once
/// at startup by configuration; stopping happens through the engine's running
/// flag and the backend's bounded reads.
pub trait CaptureBackend {
    /// Runs the capture loop until shutdown or a fatal capture error.
    fn run(&mut self) -> Result<(), DetectorError>;
}

// ── Runtime pair ─────────────────────────────────────────────────────────────

/// Configuration and whitelist, published together.
///
/// Reload swaps one `Arc<Runtime>`, so a pipeline call observes either the
/// old pair or the new pair, never a mix. The retired pair is freed when the
/// last in-flight reader drops its clone.
pub struct Runtime {
    pub config:    Config,
    pub whitelist: Whitelist,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Shared context threaded through the supervisor, capture backends,
/// pipeline, and sweeper.
pub struct Engine {
    runtime:         RwLock<Arc<Runtime>>,
    pub tracker:     TrackerTable,
    pub blockset:    Arc<dyn BlockList>,
    pub probe:       Arc<dyn HalfOpenProbe>,
    pub metrics:     SharedMetrics,
    pub logger:      SharedLogger,
    /// Path the supervisor re-reads on a reload intent.
    pub config_path: PathBuf,
    running:         AtomicBool,
}

impl Engine {
    /// Assembles the engine. The tracker is sized from the initial
    /// configuration and keeps that geometry for the process lifetime.
    pub fn new(
        config: Config,
        whitelist: Whitelist,
        blockset: Arc<dyn BlockList>,
        probe: Arc<dyn HalfOpenProbe>,
        metrics: SharedMetrics,
        logger: SharedLogger,
        config_path: PathBuf,
    ) -> Result<Self, DetectorError> {
        let tracker = TrackerTable::new(
            config.hash_buckets as usize,
            config.max_tracked_ips as usize,
        )?;

        Ok(Self {
            runtime: RwLock::new(Arc::new(Runtime { config, whitelist })),
            tracker,
            blockset,
            probe,
            metrics,
            logger,
            config_path,
            running: AtomicBool::new(true),
        })
    }

    /// Returns the current (configuration, whitelist) pair.
    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.read().clone()
    }

    /// Atomically publishes a new (configuration, whitelist) pair.
    pub fn publish_runtime(&self, runtime: Runtime) {
        *self.runtime.write() = Arc::new(runtime);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Requests shutdown; capture loops and the sweeper observe this on their
    /// next wakeup.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
