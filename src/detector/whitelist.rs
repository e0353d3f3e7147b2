//! CIDR whitelist of trusted source networks.
//!
//! Whitelisted sources never enter the tracker and never reach the block set.
//! The match is a disjunction over all stored prefixes; overlapping entries
//! are fine and most-specific-match is deliberately not implemented. With the
//! bounded whitelist sizes this daemon sees, a flat scan beats maintaining a
//! prefix trie and its lookup cost is dominated by the parse cost anyway.

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

// ── Entries ──────────────────────────────────────────────────────────────────

/// One parsed CIDR prefix. `prefix` is already masked, so membership is a
/// single AND-and-compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CidrEntry {
    prefix:     u32,
    mask:       u32,
    prefix_len: u8,
}

/// Parses one CIDR entry: dotted IPv4 with an optional `/length`; a missing
/// length means `/32` (single host).
fn parse_cidr(text: &str) -> Option<CidrEntry> {
    let (addr_part, prefix_len) = match text.split_once('/') {
        Some((addr, len)) => (addr, len.trim().parse::<u8>().ok()?),
        None => (text, 32),
    };

    if prefix_len > 32 {
        return None;
    }

    let addr: Ipv4Addr = addr_part.trim().parse().ok()?;

    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };

    Some(CidrEntry {
        prefix: u32::from(addr) & mask,
        mask,
        prefix_len,
    })
}

// ── Whitelist ────────────────────────────────────────────────────────────────

/// An immutable set of trusted IPv4 prefixes.
///
/// Built once at startup and atomically replaced on reload; lookups are
/// side-effect free and safe from any number of concurrent readers.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<CidrEntry>,
}

impl Whitelist {
    /// Builds a whitelist from an iterator of text lines.
    ///
    /// Blank lines and lines whose first non-space character is `#` are
    /// ignored. Malformed lines are skipped and counted in the second tuple
    /// element; they never abort construction or affect neighbouring entries.
    pub fn parse<'a, I>(lines: I) -> (Self, usize)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = Vec::new();
        let mut skipped = 0;

        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_cidr(line) {
                Some(entry) => entries.push(entry),
                None => skipped += 1,
            }
        }

        (Self { entries }, skipped)
    }

    /// Reads `path` and builds a whitelist from its lines.
    ///
    /// # Errors
    /// Returns the underlying `io::Error` when the file cannot be read; parse
    /// problems inside the file are reported through the skipped count, not
    /// as errors.
    pub fn load(path: &Path) -> io::Result<(Self, usize)> {
        let data = fs::read_to_string(path)?;
        Ok(Self::parse(data.lines()))
    }

    /// Returns whether any stored prefix covers `addr`.
    ///
    /// An empty whitelist answers `false` for every address.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let ip = u32::from(addr);
        self.entries.iter().any(|e| ip & e.mask == e.prefix)
    }

    /// Number of stored prefixes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
