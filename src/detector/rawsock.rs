//! Raw-socket capture backend (fallback).
//!
//! An `AF_PACKET` datagram source for deployments where NFQUEUE is
//! unavailable. A classic BPF program attached to the socket passes only
//! IPv4 TCP frames with SYN set and ACK clear, so almost nothing is copied
//! to userspace; the frames that do arrive are re-checked anyway because a
//! misconfigured or bypassed filter must not poison the tracker. There is no
//! verdict channel here; enforcement is entirely the address set's job.
//!
//! The BPF offsets assume the common 20-byte IPv4 header; frames carrying IP
//! options are invisible to this backend, which matches the filter the
//! operator would install by hand.

use crate::detector::types::SIGNAL_CHECK_INTERVAL;
use crate::detector::{clock, pipeline, CaptureBackend, DetectorError, Engine};
use crate::logger::Event;
use crate::supervisor;
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Receive timeout; bounds how long shutdown waits on a silent wire.
const RECV_TIMEOUT_US: libc::suseconds_t = 500_000;

/// Classic BPF: pass IPv4 TCP frames whose SYN bit is set and ACK bit clear.
///
/// Offsets are from the start of the Ethernet frame: byte 23 is the IP
/// protocol (14-byte Ethernet header + IP header byte 9), byte 47 the TCP
/// flags (14 + 20-byte IP header with IHL = 5 + TCP header byte 13).
const SYN_FILTER: [libc::sock_filter; 7] = [
    // ldb [23]             ; IP protocol
    libc::sock_filter { code: 0x30, jt: 0, jf: 0, k: 23 },
    // jeq #6, L2, reject   ; TCP?
    libc::sock_filter { code: 0x15, jt: 0, jf: 4, k: 6 },
    // ldb [47]             ; TCP flags
    libc::sock_filter { code: 0x30, jt: 0, jf: 0, k: 47 },
    // jset #0x02, L4, reject ; SYN set?
    libc::sock_filter { code: 0x45, jt: 0, jf: 2, k: 0x02 },
    // jset #0x10, reject, L5 ; ACK clear?
    libc::sock_filter { code: 0x45, jt: 1, jf: 0, k: 0x10 },
    // ret #-1              ; accept
    libc::sock_filter { code: 0x06, jt: 0, jf: 0, k: 0xffff_ffff },
    // ret #0               ; reject
    libc::sock_filter { code: 0x06, jt: 0, jf: 0, k: 0 },
];

/// Capture backend reading link-layer frames from a filtered raw socket.
pub struct RawSocketCapture {
    fd:     RawFd,
    engine: Arc<Engine>,
}

impl RawSocketCapture {
    /// Creates the raw socket, attaches the SYN filter, and arms the receive
    /// timeout.
    ///
    /// # Errors
    /// Fails without CAP_NET_RAW, or when the filter or timeout cannot be
    /// installed.
    pub fn open(engine: Arc<Engine>) -> Result<Self, DetectorError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_IP as u16).to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(DetectorError::Capture(format!(
                "cannot create raw socket (CAP_NET_RAW required): {}",
                io::Error::last_os_error()
            )));
        }

        let prog = libc::sock_fprog {
            len:    SYN_FILTER.len() as libc::c_ushort,
            filter: SYN_FILTER.as_ptr() as *mut libc::sock_filter,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const libc::sock_fprog as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(DetectorError::Capture(format!(
                "cannot attach SYN filter: {}",
                err
            )));
        }

        let timeout = libc::timeval {
            tv_sec:  0,
            tv_usec: RECV_TIMEOUT_US,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(DetectorError::Capture(format!(
                "cannot set receive timeout: {}",
                err
            )));
        }

        engine.logger.log(&Event::Info {
            message: &format!("raw socket capture initialized: fd={} (SYN filter attached)", fd),
        });

        Ok(Self { fd, engine })
    }
}

impl CaptureBackend for RawSocketCapture {
    fn run(&mut self) -> Result<(), DetectorError> {
        self.engine.logger.log(&Event::Info {
            message: "starting raw socket packet loop",
        });

        let mut buf = [0u8; 65536];
        let mut packets_since_check: u32 = 0;

        while self.engine.is_running() {
            let n = unsafe {
                libc::recv(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    // Timeout expired or a signal landed: re-check flags.
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => {
                        supervisor::service_signals(&self.engine);
                        continue;
                    }
                    _ => {
                        if self.engine.is_running() {
                            return Err(DetectorError::Capture(format!(
                                "raw socket receive failed: {}",
                                err
                            )));
                        }
                        break;
                    }
                }
            }

            self.engine
                .metrics
                .packets_total
                .fetch_add(1, Ordering::Relaxed);

            // Userspace re-check: malformed frames, IPv6, and non-SYN leaks
            // through the kernel filter are skipped silently.
            if let Some(addr) = syn_source_ethernet(&buf[..n as usize]) {
                pipeline::on_syn(&self.engine, addr, clock::now());
            }

            packets_since_check += 1;
            if packets_since_check >= SIGNAL_CHECK_INTERVAL {
                supervisor::service_signals(&self.engine);
                packets_since_check = 0;
            }
        }

        self.engine.logger.log(&Event::Info {
            message: "raw socket packet loop stopped",
        });

        Ok(())
    }
}

impl Drop for RawSocketCapture {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

/// Extracts the IPv4 source of a TCP segment with SYN set and ACK clear from
/// a link-layer frame. Returns `None` for everything else.
fn syn_source_ethernet(frame: &[u8]) -> Option<Ipv4Addr> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;

    let ip = match sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => header,
        _ => return None,
    };

    let tcp = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };

    if tcp.syn() && !tcp.ack() {
        Some(ip.source_addr())
    } else {
        None
    }
}
