//! Structured logging for synwarden.
//!
//! Provides a [`Logger`] that writes events to stdout and optionally to a log
//! file. Output can be formatted as human-readable plain text or as
//! newline-delimited JSON (NDJSON), making it easy to ingest into log
//! shippers and SIEM platforms.
//!
//! Warning-and-above output is rate-capped per level: at most
//! [`RATE_MAX_PER_WINDOW`] events per minute. When a window rolls over with
//! suppressed events, one summary line reports how many were dropped. Without
//! the cap, an attack that keeps the block-set driver failing would emit one
//! warning per SYN.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ── Severity levels ──────────────────────────────────────────────────────────

/// Minimum-severity filter levels, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct event kinds that synwarden can emit.
///
/// Each variant carries exactly the fields needed to describe that event.
/// The `#[serde(tag = "event")]` attribute ensures JSON output includes an
/// `"event"` key so consumers can filter by type without inspecting structure.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    /// Informational startup / status message.
    Info { message: &'a str },

    /// Recoverable problem; the daemon continues.
    Warn { message: &'a str },

    /// Serious problem; typically followed by refusal to start.
    Error { message: &'a str },

    /// A SYN arrived from a whitelisted source and was dropped from
    /// consideration.
    Whitelisted { addr: Ipv4Addr },

    /// A source crossed the SYN threshold but the kernel socket state did not
    /// confirm an attack. No block was installed.
    Suspicious {
        addr:      Ipv4Addr,
        syn_count: u32,
        half_open: u32,
    },

    /// A confirmed attack: the source was added to the kernel block set.
    Blocked {
        addr:      Ipv4Addr,
        syn_count: u32,
        half_open: u32,
    },

    /// A block expired and the source was removed from the kernel block set.
    Unblocked { addr: Ipv4Addr },

    /// Emitted when a rate-cap window rolls over with suppressed events.
    LogsSuppressed { level: &'static str, suppressed: u64 },

    /// Session summary emitted on graceful shutdown.
    Summary {
        duration_secs:     u64,
        packets_total:     u64,
        syn_packets_total: u64,
        detections:        u64,
        blocked_current:   u64,
    },
}

impl Event<'_> {
    /// Severity of this event: blocks are warnings, whitelist hits are debug
    /// chatter, the rest is informational.
    fn level(&self) -> Level {
        match self {
            Event::Whitelisted { .. } => Level::Debug,
            Event::Info { .. }
            | Event::Suspicious { .. }
            | Event::Unblocked { .. }
            | Event::Summary { .. } => Level::Info,
            Event::Warn { .. } | Event::Blocked { .. } | Event::LogsSuppressed { .. } => {
                Level::Warn
            }
            Event::Error { .. } => Level::Error,
        }
    }
}

// ── Rate cap ─────────────────────────────────────────────────────────────────

/// Length of one rate-cap accounting window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Maximum warn-level (respectively error-level) events per window.
pub const RATE_MAX_PER_WINDOW: u32 = 100;

/// Per-window accounting for the two capped levels: index 0 = warn, 1 = error.
struct RateState {
    window_start: Instant,
    emitted:      [u32; 2],
    suppressed:   [u64; 2],
}

const CAPPED_LEVEL_NAMES: [&str; 2] = ["warn", "error"];

// ── Logger ───────────────────────────────────────────────────────────────────

/// Shared, thread-safe structured logger.
///
/// Constructed once in `main` and passed as an `Arc<Logger>` to every module
/// that needs to emit events. Internal mutexes serialise writes so that
/// output lines are never interleaved across threads.
pub struct Logger {
    /// Minimum severity to emit.
    level: Level,
    /// Whether to format events as NDJSON instead of plain text.
    json:  bool,
    /// Optional buffered file writer. `None` when no log file was given.
    file:  Option<Mutex<BufWriter<std::fs::File>>>,
    /// Rate-cap accounting for warn and error levels.
    rate:  Mutex<RateState>,
}

/// Type alias used throughout the codebase for convenience.
pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Creates a new logger.
    ///
    /// # Arguments
    /// * `level`    - Minimum severity to emit.
    /// * `json`     - Emit NDJSON instead of plain text when `true`.
    /// * `log_path` - If `Some`, open (or create) this file for appended writes.
    ///
    /// # Errors
    /// Returns an `io::Error` if the log file cannot be opened or created.
    pub fn new(level: Level, json: bool, log_path: Option<&str>) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };

        Ok(Self {
            level,
            json,
            file,
            rate: Mutex::new(RateState {
                window_start: Instant::now(),
                emitted:      [0; 2],
                suppressed:   [0; 2],
            }),
        })
    }

    /// Logs a single [`Event`], writing to stdout and optionally to the log
    /// file. Events below the configured level are dropped; warn-and-above
    /// events pass through the per-level rate cap first.
    pub fn log(&self, event: &Event) {
        let level = event.level();
        if level < self.level {
            return;
        }

        if level >= Level::Warn {
            let (allowed, rolled) = self.admit(level);
            for (idx, suppressed) in rolled.into_iter().enumerate() {
                if suppressed > 0 {
                    self.write(&Event::LogsSuppressed {
                        level: CAPPED_LEVEL_NAMES[idx],
                        suppressed,
                    });
                }
            }
            if !allowed {
                return;
            }
        }

        self.write(event);
    }

    /// Consults the rate cap for one warn-or-error event.
    ///
    /// Returns whether the event may be emitted, plus the suppression counts
    /// of a window that just rolled over (all zero otherwise).
    fn admit(&self, level: Level) -> (bool, [u64; 2]) {
        let idx = usize::from(level == Level::Error);
        let mut rate = match self.rate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let mut rolled = [0u64; 2];
        if now.duration_since(rate.window_start) >= RATE_WINDOW {
            rolled = rate.suppressed;
            rate.window_start = now;
            rate.emitted = [0; 2];
            rate.suppressed = [0; 2];
        }

        if rate.emitted[idx] < RATE_MAX_PER_WINDOW {
            rate.emitted[idx] += 1;
            (true, rolled)
        } else {
            rate.suppressed[idx] += 1;
            (false, rolled)
        }
    }

    /// Formats and writes one event, bypassing level filter and rate cap.
    fn write(&self, event: &Event) {
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

        let line = if self.json {
            // Serialise the event to a JSON Value so we can inject the timestamp.
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert(
                    "timestamp".to_string(),
                    serde_json::Value::String(timestamp.clone()),
                );
            }
            serde_json::to_string(&val).unwrap_or_default()
        } else {
            format!("[{}] {}", timestamp, plain_text(event))
        };

        // Always write to stdout.
        println!("{}", line);

        // If a log file was configured, also write there.
        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }
}

/// Formats an [`Event`] as a human-readable plain-text string (no timestamp).
fn plain_text(event: &Event) -> String {
    match event {
        Event::Info { message } => format!("[INFO] {}", message),

        Event::Warn { message } => format!("[WARN] {}", message),

        Event::Error { message } => format!("[ERROR] {}", message),

        Event::Whitelisted { addr } => format!("[WHITELISTED] {}", addr),

        Event::Suspicious { addr, syn_count, half_open } => format!(
            "[SUSPICIOUS] {} syn_count={} half_open={}",
            addr, syn_count, half_open
        ),

        Event::Blocked { addr, syn_count, half_open } => format!(
            "[BLOCKED] {} syn_count={} half_open={}",
            addr, syn_count, half_open
        ),

        Event::Unblocked { addr } => format!("[UNBLOCKED] {}", addr),

        Event::LogsSuppressed { level, suppressed } => format!(
            "[RATE LIMIT] {} {}-level events suppressed in the last minute",
            suppressed, level
        ),

        Event::Summary {
            duration_secs,
            packets_total,
            syn_packets_total,
            detections,
            blocked_current,
        } => format!(
            "[SUMMARY] duration={}s packets={} syn={} detections={} blocked={}",
            duration_secs, packets_total, syn_packets_total, detections, blocked_current
        ),
    }
}
