//! Ping probe implementation with native ICMP and command fallback.
//!
//! Uses blocking sockets in spawn_blocking so the round trip is timed on a
//! dedicated thread.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{Checker, ProbeError, ProbeResult};
use crate::db::Target;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// ICMP reachability checker for the `ping` type.
pub struct PingChecker;

#[async_trait]
impl Checker for PingChecker {
    async fn check(&self, target: &Target, timeout: Duration) -> ProbeResult {
        match run_ping_probe(target.address.trim(), timeout).await {
            Ok(rtt_ms) => ProbeResult::up(
                rtt_ms.round() as u64,
                format!("Reply from {} time={:.3} ms", target.address, rtt_ms),
            ),
            Err(e) => ProbeResult::down(0, e.to_string()),
        }
    }
}

/// Identifier/sequence pair so concurrent pings to one host can be told apart.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Unprivileged on Linux with ping_group_range set, or macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Ping `address` once. Returns the round-trip time in milliseconds.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
            }
            other => return other,
        }
    }

    run_ping_command(address, timeout).await
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Send one echo request and wait for the matching reply.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, true),
        Err(_) => (
            Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?,
            false,
        ),
    };

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    // DGRAM sockets get their identifier rewritten by the kernel.
    let expected_id = raw.then_some(identifier);
    let packet = build_echo_request(request_type, identifier, sequence);

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    await_reply(
        |buf, wait| {
            socket.set_read_timeout(Some(wait))?;
            (&socket).read(buf)
        },
        start,
        timeout,
        |packet| is_matching_reply(packet, reply_type, expected_id, sequence),
    )
}

/// Time left before `timeout` runs out, `None` once it has.
fn remaining(start: Instant, timeout: Duration) -> Option<Duration> {
    timeout
        .checked_sub(start.elapsed())
        .filter(|left| !left.is_zero())
}

/// Read packets until one matches. Every read is bounded by the time left, so
/// unrelated ICMP traffic cannot stretch the wait past `timeout`.
fn await_reply<R, M>(mut recv: R, start: Instant, timeout: Duration, matches: M) -> Result<f64, ProbeError>
where
    R: FnMut(&mut [u8], Duration) -> std::io::Result<usize>,
    M: Fn(&[u8]) -> bool,
{
    let mut buf = [0u8; 1500];
    loop {
        let wait = remaining(start, timeout).ok_or(ProbeError::Timeout(timeout))?;

        let len = recv(&mut buf, wait).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if matches(&buf[..len]) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
        // Someone else's packet, keep waiting
    }
}

/// RAW IPv4 sockets deliver the IP header too; DGRAM and IPv6 sockets do not.
fn is_matching_reply(
    buf: &[u8],
    reply_type: u8,
    identifier: Option<u16>,
    sequence: u16,
) -> bool {
    let offset = if reply_type == 0 && !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };

    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == reply_type && identifier.map_or(true, |id| id == reply_id) && reply_seq == sequence
}

/// Build an ICMP echo request. The checksum is left to the kernel for ICMPv6.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = request_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if request_type == 8 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via the system command.
async fn run_ping_command(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_millis().div_ceil(1000).max(1);

    let mut command = Command::new("ping");
    command
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout + Duration::from_millis(500), command.output())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}{}", stdout, stderr)));
    }

    parse_ping_output(&stdout)
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    // Per-packet "time=X.XXX ms" (Linux, some macOS)
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet =
        PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    // "round-trip min/avg/max/stddev = ..." (macOS) or "rtt min/avg/max/mdev = ..." (Linux)
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .unwrap()
    });

    let parsed = per_packet
        .captures(output)
        .and_then(|caps| caps.name("val"))
        .or_else(|| summary.captures(output).and_then(|caps| caps.get(2)))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    parsed.ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
