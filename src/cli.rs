use crate::detector::config::DEFAULT_CONFIG_PATH;
use clap::Parser;
use std::path::PathBuf;

/// synwarden, a TCP SYN flood detection and mitigation daemon.
///
/// Consumes inbound SYN packets from a netfilter queue (or a filtered raw
/// socket), tracks per-source rates over a sliding window, confirms
/// suspected floods against the kernel's half-open socket state, and blocks
/// confirmed attackers through a TTL-capable kernel address set.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "synwarden",
    version,
    about   = "TCP SYN flood detection and mitigation daemon",
    long_about = None,
)]
pub struct Cli {
    // ── Configuration ────────────────────────────────────────────────────────

    /// Configuration file path.
    ///
    /// A JSON object; every key is optional and falls back to a built-in
    /// default. SIGHUP re-reads this file at runtime.
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Write log output to this file in addition to stdout.
    ///
    /// The file is created if it does not exist and appended to if it does.
    /// JSON mode (--json) affects the format written to this file as well.
    #[arg(short = 'o', long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,

    /// Emit log entries as newline-delimited JSON (NDJSON).
    ///
    /// Each event is a self-contained JSON object on its own line, suitable
    /// for ingestion by log shippers (Logstash, Fluentd, Vector) or SIEM
    /// platforms (Splunk, Elastic, Loki).
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    // ── Capture ──────────────────────────────────────────────────────────────

    /// Capture with the raw-socket fallback instead of NFQUEUE.
    ///
    /// Overrides `use_raw_socket` from the configuration file. Useful where
    /// no netfilter queue rule is installed; blocking still works through
    /// the address set, but no verdicts are issued.
    #[arg(long = "raw-socket")]
    pub raw_socket: bool,
}
