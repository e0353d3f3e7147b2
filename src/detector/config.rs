//! Daemon configuration: typed snapshot, file loading, validation.
//!
//! The configuration file is a single JSON object; every field is optional
//! and falls back to the defaults below. The parsed snapshot is immutable;
//! a reload produces a fresh snapshot that the supervisor publishes together
//! with the rebuilt whitelist (see [`crate::detector::Runtime`]).

use crate::detector::DetectorError;
use crate::logger::{Event, Level, Logger};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

// ── Defaults ─────────────────────────────────────────────────────────────────

/// Configuration file consulted when `-c/--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/synwarden/synwarden.conf";

const DEFAULT_SYN_THRESHOLD: u32 = 100;
const DEFAULT_WINDOW_MS: u32 = 1000;
const DEFAULT_BLOCK_DURATION_S: u32 = 300;
const DEFAULT_SWEEP_INTERVAL_S: u32 = 5;
const DEFAULT_MAX_TRACKED_IPS: u32 = 10_000;
const DEFAULT_HASH_BUCKETS: u32 = 4096;
const DEFAULT_SET_NAME: &str = "synwarden_blocklist";
const DEFAULT_WHITELIST_PATH: &str = "/etc/synwarden/whitelist.conf";
const DEFAULT_METRICS_SOCKET: &str = "/var/run/synwarden.sock";

// ── Configuration snapshot ───────────────────────────────────────────────────

/// The typed configuration snapshot consumed by the detector core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SYNs per window above which (strictly) a source is suspected.
    pub syn_threshold: u32,
    /// Length of the per-source counting window, in milliseconds.
    pub window_ms: u32,
    /// TTL applied to each block, both kernel-side and in the tracker.
    pub block_duration_s: u32,
    /// Period of the expiration sweeper, in seconds.
    pub sweep_interval_s: u32,
    /// Capacity of the tracker table; LRU eviction beyond this.
    pub max_tracked_ips: u32,
    /// Tracker bucket count; must be a power of two.
    pub hash_buckets: u32,
    /// NFQUEUE number the primary capture backend binds to.
    pub queue_num: u16,
    /// Capture with the raw-socket fallback instead of NFQUEUE.
    pub use_raw_socket: bool,
    /// Name of the kernel block set.
    pub set_name: String,
    /// Path of the CIDR whitelist file.
    pub whitelist_file: PathBuf,
    /// Path of the Unix socket the metrics endpoint listens on.
    pub metrics_socket: PathBuf,
    /// Minimum log severity.
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            syn_threshold:    DEFAULT_SYN_THRESHOLD,
            window_ms:        DEFAULT_WINDOW_MS,
            block_duration_s: DEFAULT_BLOCK_DURATION_S,
            sweep_interval_s: DEFAULT_SWEEP_INTERVAL_S,
            max_tracked_ips:  DEFAULT_MAX_TRACKED_IPS,
            hash_buckets:     DEFAULT_HASH_BUCKETS,
            queue_num:        0,
            use_raw_socket:   false,
            set_name:         DEFAULT_SET_NAME.to_string(),
            whitelist_file:   PathBuf::from(DEFAULT_WHITELIST_PATH),
            metrics_socket:   PathBuf::from(DEFAULT_METRICS_SOCKET),
            log_level:        Level::Info,
        }
    }
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    ///
    /// # Errors
    /// Returns [`DetectorError::Config`] when the file cannot be read, is not
    /// valid JSON, contains unknown keys, or fails validation.
    pub fn load(path: &Path) -> Result<Config, DetectorError> {
        let data = fs::read_to_string(path).map_err(|e| {
            DetectorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config: Config = serde_json::from_str(&data)
            .map_err(|e| DetectorError::Config(format!("{}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks every field against its permitted range.
    ///
    /// All counts and durations must be strictly positive; `hash_buckets`
    /// must be a power of two; the set name must be non-empty. Upper bounds
    /// guard against typos that would allocate absurd tables or make blocks
    /// effectively permanent.
    pub fn validate(&self) -> Result<(), DetectorError> {
        fn check(name: &str, value: u32, max: u32) -> Result<(), DetectorError> {
            if value == 0 || value > max {
                return Err(DetectorError::Config(format!(
                    "invalid {}: {} (must be 1-{})",
                    name, value, max
                )));
            }
            Ok(())
        }

        check("syn_threshold", self.syn_threshold, 1_000_000)?;
        check("window_ms", self.window_ms, 60_000)?;
        check("block_duration_s", self.block_duration_s, 86_400)?;
        check("sweep_interval_s", self.sweep_interval_s, 3_600)?;
        check("max_tracked_ips", self.max_tracked_ips, 10_000_000)?;

        if self.hash_buckets == 0 || !self.hash_buckets.is_power_of_two() {
            return Err(DetectorError::Config(format!(
                "invalid hash_buckets: {} (must be a power of 2)",
                self.hash_buckets
            )));
        }

        if self.set_name.is_empty() {
            return Err(DetectorError::Config(
                "invalid set_name: cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Logs the effective configuration at startup.
    pub fn log_summary(&self, logger: &Logger) {
        let capture = if self.use_raw_socket {
            "raw socket".to_string()
        } else {
            format!("nfqueue {}", self.queue_num)
        };
        logger.log(&Event::Info {
            message: &format!(
                "config: syn_threshold={} window_ms={} block_duration_s={} \
                 sweep_interval_s={} max_tracked_ips={} hash_buckets={} \
                 capture={} set={} whitelist={} log_level={}",
                self.syn_threshold,
                self.window_ms,
                self.block_duration_s,
                self.sweep_interval_s,
                self.max_tracked_ips,
                self.hash_buckets,
                capture,
                self.set_name,
                self.whitelist_file.display(),
                self.log_level.as_str(),
            ),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let cfg = Config {
            syn_threshold: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_oversized_window_rejected() {
        let cfg = Config {
            window_ms: 60_001,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_non_power_of_two_buckets_rejected() {
        let cfg = Config {
            hash_buckets: 1000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_single_bucket_is_legal() {
        let cfg = Config {
            hash_buckets: 1,
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_set_name_rejected() {
        let cfg = Config {
            set_name: String::new(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("synwarden.conf");
        let mut f = fs::File::create(&path).expect("create");
        writeln!(f, r#"{{ "syn_threshold": 50, "log_level": "warn" }}"#).expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.syn_threshold, 50);
        assert_eq!(cfg.log_level, Level::Warn);
        assert_eq!(cfg.window_ms, DEFAULT_WINDOW_MS);
        assert_eq!(cfg.set_name, DEFAULT_SET_NAME);
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("synwarden.conf");
        let mut f = fs::File::create(&path).expect("create");
        writeln!(f, r#"{{ "sin_threshold": 50 }}"#).expect("write");

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load(Path::new("/nonexistent/synwarden.conf")).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("synwarden.conf");
        let mut f = fs::File::create(&path).expect("create");
        writeln!(f, r#"{{ "hash_buckets": 3 }}"#).expect("write");

        assert!(Config::load(&path).is_err());
    }
}
