//! Half-open connection probe over the kernel's TCP socket table.
//!
//! `/proc/net/tcp` enumerates every IPv4 TCP socket with its peer address and
//! state. A socket in `SYN_RECV` (state 0x03) has answered a SYN with a
//! SYN-ACK and is waiting for the final ACK, which is the state a SYN flood
//! inflates. The pipeline consults this count to confirm that a source which
//! crossed the rate threshold is actually holding half-open connections.
//!
//! Row format (header line first):
//!
//! ```text
//! sl  local_address rem_address   st ...
//!  0: 0100007F:0035 C0A80101:D2F0 03 ...
//! ```
//!
//! The kernel prints the raw big-endian address word through `%X`, so on the
//! usual little-endian hosts the hex arrives byte-swapped relative to dotted
//! order. One translation (parse, then re-read the bytes little-endian)
//! yields the canonical `Ipv4Addr` for every row, and filter comparison
//! happens in that same domain.

use crate::detector::HalfOpenProbe;
use crate::logger::{Event, SharedLogger};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Kernel state value for received-SYN-awaiting-ACK sockets.
pub const TCP_STATE_SYN_RECV: u8 = 0x03;

const PROC_NET_TCP: &str = "/proc/net/tcp";

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Parses one socket row into `(peer_address, state)`.
///
/// Returns `None` for the header line and for malformed rows.
fn parse_socket_line(line: &str) -> Option<(Ipv4Addr, u8)> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let _local = fields.next()?;
    let remote = fields.next()?;
    let state = fields.next()?;

    let (addr_hex, _port_hex) = remote.split_once(':')?;
    if addr_hex.len() != 8 {
        return None;
    }

    let raw = u32::from_str_radix(addr_hex, 16).ok()?;
    let state = u8::from_str_radix(state, 16).ok()?;

    Some((Ipv4Addr::from(raw.to_le_bytes()), state))
}

/// Counts SYN_RECV sockets in a socket-table dump, optionally restricted to
/// one peer address. Malformed rows are skipped; empty input counts zero.
fn count_half_open_in(table: &str, filter: Option<Ipv4Addr>) -> u32 {
    table
        .lines()
        .skip(1) // header
        .filter_map(parse_socket_line)
        .filter(|(_, state)| *state == TCP_STATE_SYN_RECV)
        .filter(|(peer, _)| filter.map_or(true, |f| f == *peer))
        .count() as u32
}

// ── Probe ────────────────────────────────────────────────────────────────────

/// Reads the kernel TCP socket table and counts half-open entries.
pub struct ProcScan {
    path:   PathBuf,
    logger: SharedLogger,
}

impl ProcScan {
    /// Probe over the real `/proc/net/tcp`.
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            path: PathBuf::from(PROC_NET_TCP),
            logger,
        }
    }

    /// Probe over an alternative socket-table file. Used by tests and usable
    /// in containers that mount proc elsewhere.
    pub fn with_path(path: PathBuf, logger: SharedLogger) -> Self {
        Self { path, logger }
    }
}

impl HalfOpenProbe for ProcScan {
    /// Counts sockets currently in SYN_RECV, restricted to peers equal to
    /// `filter` when given. A table that cannot be read counts as zero, which
    /// the pipeline treats as "not confirmed".
    fn count_half_open(&self, filter: Option<Ipv4Addr>) -> u32 {
        match fs::read_to_string(&self.path) {
            Ok(table) => count_half_open_in(&table, filter),
            Err(e) => {
                self.logger.log(&Event::Warn {
                    message: &format!("cannot read {}: {}", self.path.display(), e),
                });
                0
            }
        }
    }
}
