//! Driver for the kernel-resident block set.
//!
//! The set is a named, timeout-capable `hash:ip` ipset; the operator's
//! firewall rules drop inbound packets whose source matches it, so blocking
//! costs the daemon one set mutation rather than one decision per packet.
//! The kernel expires entries on its own when their TTL elapses; the sweeper
//! also removes them explicitly to keep tracker state and observability in
//! step.
//!
//! Mutations go through the `ipset` utility: one fork-exec per call with all
//! stdio closed and the exit status checked, never a shell. An internal mutex
//! serialises every invocation so concurrent adds cannot interleave with a
//! flush. The `-exist` flag makes create/add/del idempotent, and a re-add
//! refreshes the entry's TTL.

use crate::detector::{BlockList, DetectorError};
use crate::logger::{Event, SharedLogger};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};

/// Manages one named kernel address set.
pub struct BlockSet {
    name:          String,
    default_ttl_s: u32,
    logger:        SharedLogger,
    /// Serialises every `ipset` invocation.
    cmd_lock:      Mutex<()>,
}

impl BlockSet {
    /// Creates the set if it does not exist and returns the driver.
    ///
    /// Idempotent: an existing set of the same name is reused as-is.
    ///
    /// # Errors
    /// Fails when the set name is empty or the create command cannot run or
    /// exits non-zero (missing binary, missing privileges, bad parameters).
    pub fn init(
        name: &str,
        default_ttl_s: u32,
        max_elements: u32,
        logger: SharedLogger,
    ) -> Result<Self, DetectorError> {
        if name.is_empty() {
            return Err(DetectorError::BlockSet(
                "block set name cannot be empty".to_string(),
            ));
        }

        let set = Self {
            name: name.to_string(),
            default_ttl_s,
            logger,
            cmd_lock: Mutex::new(()),
        };

        set.run(&[
            "create",
            "-exist",
            name,
            "hash:ip",
            "timeout",
            &default_ttl_s.to_string(),
            "maxelem",
            &max_elements.to_string(),
        ])?;

        set.logger.log(&Event::Info {
            message: &format!(
                "block set ready: name={} timeout={}s maxelem={}",
                name, default_ttl_s, max_elements
            ),
        });

        Ok(set)
    }

    /// Runs one serialized `ipset` invocation, mapping a non-zero exit to an
    /// error.
    fn run(&self, args: &[&str]) -> Result<(), DetectorError> {
        let _guard = self.cmd_lock.lock();

        let status = Command::new("ipset")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| DetectorError::BlockSet(format!("cannot run ipset: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(DetectorError::BlockSet(format!(
                "ipset {} {} failed ({})",
                args.first().copied().unwrap_or(""),
                self.name,
                status
            )))
        }
    }

    /// Membership test. Absent entries and driver failures both read as
    /// "not present".
    pub fn test(&self, addr: Ipv4Addr) -> bool {
        let _guard = self.cmd_lock.lock();

        Command::new("ipset")
            .args(["test", &self.name, &addr.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Empties the set without destroying it.
    pub fn flush(&self) -> Result<(), DetectorError> {
        self.run(&["flush", &self.name])
    }

    /// Releases the driver. Deliberately does NOT destroy the set: installed
    /// blocks must survive a daemon restart.
    pub fn shutdown(&self) {
        self.logger.log(&Event::Info {
            message: &format!("block set driver stopped; set {} preserved", self.name),
        });
    }
}

impl BlockList for BlockSet {
    /// Adds `addr` with the given TTL (`0` means the set's default). Re-adding
    /// a present entry refreshes its TTL.
    fn add(&self, addr: Ipv4Addr, ttl_s: u32) -> Result<(), DetectorError> {
        let ttl = if ttl_s == 0 { self.default_ttl_s } else { ttl_s };
        self.run(&[
            "add",
            "-exist",
            &self.name,
            &addr.to_string(),
            "timeout",
            &ttl.to_string(),
        ])
    }

    /// Removes `addr`; removing an absent entry is a successful no-op.
    fn remove(&self, addr: Ipv4Addr) -> Result<(), DetectorError> {
        self.run(&["del", "-exist", &self.name, &addr.to_string()])
    }

    /// Reports the number of entries currently in the set, 0 when the set
    /// cannot be listed.
    fn count(&self) -> u32 {
        let _guard = self.cmd_lock.lock();

        let output = Command::new("ipset")
            .args(["list", &self.name, "-t"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        match output {
            Ok(out) if out.status.success() => {
                parse_entry_count(&String::from_utf8_lossy(&out.stdout))
            }
            _ => 0,
        }
    }
}

/// Extracts the entry count from `ipset list -t` terse output.
fn parse_entry_count(listing: &str) -> u32 {
    listing
        .lines()
        .find_map(|line| line.strip_prefix("Number of entries:"))
        .and_then(|count| count.trim().parse().ok())
        .unwrap_or(0)
}
