//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native mode uses blocking sockets inside `spawn_blocking` so the RTT
//! measurement is not skewed by runtime scheduling. On Windows the probe
//! prefers privileged RAW sockets; elsewhere it prefers unprivileged DGRAM
//! sockets. When neither can be created (or sending is denied) the probe
//! falls back to the system `ping` binary.

use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use crate::models::CheckResult;

/// Sequence counter so concurrent echoes to the same host stay distinguishable.
static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

enum PingFailure {
    TimedOut,
    Permission(String),
    Socket(String),
}

/// Send a single ICMP echo request and classify the reply.
///
/// A reply yields `{success, success}` with the measured RTT; no reply
/// within the deadline yields `{timeout, timeout}`; socket or resolution
/// failures yield `{error, error}`.
pub async fn run_icmp_check(host: &str, timeout: Duration) -> CheckResult {
    let start = Instant::now();

    let ip = match resolve_host(host).await {
        Ok(ip) => ip,
        Err(e) => {
            return CheckResult::error(
                format!("failed to resolve {host}: {e}"),
                start.elapsed().as_millis() as u64,
            )
        }
    };

    let blocking = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout)).await;

    let outcome = match blocking {
        Ok(outcome) => outcome,
        Err(e) => {
            return CheckResult::error(
                format!("ping failed: {e}"),
                start.elapsed().as_millis() as u64,
            )
        }
    };

    match outcome {
        Ok(rtt) => CheckResult::success(rtt.as_millis() as u64),
        Err(PingFailure::TimedOut) => CheckResult::timeout(
            "no response received".to_string(),
            start.elapsed().as_millis() as u64,
        ),
        Err(PingFailure::Permission(msg)) => {
            tracing::warn!(host, error = %msg, "native ICMP denied, falling back to ping command");
            run_ping_command(host, timeout, start).await
        }
        Err(PingFailure::Socket(msg)) => CheckResult::error(
            format!("ping failed: {msg}"),
            start.elapsed().as_millis() as u64,
        ),
    }
}

async fn resolve_host(host: &str) -> Result<IpAddr, std::io::Error> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host(format!("{host}:0")).await?;
    addrs.next().map(|sa| sa.ip()).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found")
    })
}

fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, PingFailure> {
    match ip {
        IpAddr::V4(v4) => run_blocking_ping_v4(v4, timeout),
        IpAddr::V6(v6) => run_blocking_ping_v6(v6, timeout),
    }
}

/// Create an ICMP socket with the platform-appropriate privilege preference.
fn open_icmp_socket(domain: Domain, protocol: Protocol) -> Result<Socket, std::io::Error> {
    if cfg!(windows) {
        Socket::new(domain, Type::RAW, Some(protocol))
            .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
    } else {
        Socket::new(domain, Type::DGRAM, Some(protocol))
            .or_else(|_| Socket::new(domain, Type::RAW, Some(protocol)))
    }
}

fn socket_failure(e: std::io::Error, what: &str) -> PingFailure {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        PingFailure::Permission(format!("{what}: {e}"))
    } else {
        PingFailure::Socket(format!("{what}: {e}"))
    }
}

fn run_blocking_ping_v4(ip: Ipv4Addr, timeout: Duration) -> Result<Duration, PingFailure> {
    let socket = open_icmp_socket(Domain::IPV4, Protocol::ICMPV4)
        .map_err(|e| socket_failure(e, "failed to create ICMP socket"))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| PingFailure::Socket(format!("failed to set read timeout: {e}")))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| PingFailure::Socket(format!("failed to set write timeout: {e}")))?;

    let dest = SocketAddr::new(IpAddr::V4(ip), 0);
    socket
        .connect(&dest.into())
        .map_err(|e| socket_failure(e, "failed to connect"))?;

    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_icmp_echo_request(identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| socket_failure(e, "failed to send"))?;

    // Read until our reply shows up or the deadline passes; other traffic
    // on the socket (e.g. replies to concurrent probes) is skipped.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                PingFailure::TimedOut
            } else {
                PingFailure::Socket(format!("failed to receive: {e}"))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PingFailure::TimedOut);
        }

        // RAW sockets deliver the IP header before the ICMP payload,
        // DGRAM sockets deliver the ICMP header directly.
        if len >= 8 {
            let icmp_offset = if buf[0] >> 4 == 4 { 20 } else { 0 };
            if len > icmp_offset + 7 {
                let reply_type = buf[icmp_offset];
                let reply_id = u16::from_be_bytes([buf[icmp_offset + 4], buf[icmp_offset + 5]]);
                let reply_seq = u16::from_be_bytes([buf[icmp_offset + 6], buf[icmp_offset + 7]]);
                // Type 0 = Echo Reply
                if reply_type == 0 && reply_id == identifier && reply_seq == sequence {
                    return Ok(elapsed);
                }
            }
        }
    }
}

fn run_blocking_ping_v6(ip: Ipv6Addr, timeout: Duration) -> Result<Duration, PingFailure> {
    let socket = open_icmp_socket(Domain::IPV6, Protocol::ICMPV6)
        .map_err(|e| socket_failure(e, "failed to create ICMPv6 socket"))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| PingFailure::Socket(format!("failed to set read timeout: {e}")))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| PingFailure::Socket(format!("failed to set write timeout: {e}")))?;

    let dest = SocketAddr::new(IpAddr::V6(ip), 0);
    socket
        .connect(&dest.into())
        .map_err(|e| socket_failure(e, "failed to connect"))?;

    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_icmpv6_echo_request(identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| socket_failure(e, "failed to send"))?;

    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                PingFailure::TimedOut
            } else {
                PingFailure::Socket(format!("failed to receive: {e}"))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PingFailure::TimedOut);
        }

        // ICMPv6 type 129 = Echo Reply
        if len >= 8 {
            let reply_type = buf[0];
            let reply_id = u16::from_be_bytes([buf[4], buf[5]]);
            let reply_seq = u16::from_be_bytes([buf[6], buf[7]]);
            if reply_type == 129 && reply_id == identifier && reply_seq == sequence {
                return Ok(elapsed);
            }
        }
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
/// The checksum is left to the kernel.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() - 1 {
        sum += u32::from(u16::from_be_bytes([data[i], data[i + 1]]));
        i += 2;
    }
    if i < data.len() {
        sum += u32::from(data[i]) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Probe via the system `ping` binary when native sockets are unavailable.
async fn run_ping_command(host: &str, timeout: Duration, start: Instant) -> CheckResult {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let output = match output {
        Ok(o) => o,
        Err(e) => {
            return CheckResult::error(
                format!("failed to execute ping: {e}"),
                start.elapsed().as_millis() as u64,
            )
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return CheckResult::timeout(
                "no response received".to_string(),
                start.elapsed().as_millis() as u64,
            );
        }
        return CheckResult::error(
            format!("ping failed: {stdout}"),
            start.elapsed().as_millis() as u64,
        );
    }

    match parse_ping_output(&stdout) {
        Some(rtt_ms) => CheckResult::success(rtt_ms as u64),
        None => CheckResult::error(
            format!("failed to parse ping output: {stdout}"),
            start.elapsed().as_millis() as u64,
        ),
    }
}

/// Extract the RTT in milliseconds from ping output, trying the per-packet
/// line first and the min/avg/max summary formats after.
fn parse_ping_output(output: &str) -> Option<f64> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet =
        PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());
    if let Some(caps) = per_packet.captures(output) {
        if let Ok(ms) = caps["val"].parse::<f64>() {
            return Some(ms);
        }
    }

    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max[^=]*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .unwrap()
    });
    if let Some(caps) = summary.captures(output) {
        // Average RTT; falls back to min when the average parses to zero.
        let avg = caps.get(2)?.as_str().parse::<f64>().ok()?;
        if avg > 0.0 {
            return Some(avg);
        }
        return caps.get(1)?.as_str().parse::<f64>().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_nonzero() {
        let mut packet = vec![0u8; 8];
        packet[0] = 8;
        packet[4] = 0x12;
        packet[5] = 0x34;
        packet[7] = 0x01;
        assert_ne!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_echo_request_layout() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
    }

    #[test]
    fn test_parse_per_packet_time() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        assert!((parse_ping_output(output).unwrap() - 12.345).abs() < 1e-9);
    }

    #[test]
    fn test_parse_summary_line() {
        let output = "\
--- example.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/18.102/18.400/0.000 ms";
        assert!((parse_ping_output(output).unwrap() - 18.102).abs() < 1e-9);
    }

    #[test]
    fn test_parse_failure() {
        assert!(parse_ping_output("garbage").is_none());
    }
}
