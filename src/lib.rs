//! synwarden: TCP SYN flood detection and mitigation daemon.
//!
//! A privileged userspace daemon for a single IPv4 host. Inbound SYN packets
//! arrive through a netfilter queue (or a BPF-filtered raw socket as a
//! fallback), a per-source sliding-window tracker counts them, a suspected
//! flood is confirmed against the kernel's half-open socket table, and
//! confirmed attackers are blocked through a TTL-capable kernel address set.
//! A background sweeper releases expired blocks; a Unix-socket endpoint
//! exports counters in Prometheus text format.
//!
//! The library crate exists so integration tests can drive the engine with
//! mock enforcement; the `synwarden` binary in `main.rs` is the supervisor.

pub mod cli;
pub mod detector;
pub mod logger;
pub mod metrics;
pub mod supervisor;
