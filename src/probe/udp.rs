//! UDP send/recv probe.
//!
//! UDP silence is not a failure: a probe that sends a datagram and hears
//! nothing back within the deadline reports `{success, no_response}`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::models::{CheckResult, CheckStatus, Outcome};

/// Send one datagram to `host:port` and attempt a single read.
pub async fn run_udp_check(
    host: &str,
    port: u16,
    payload: &str,
    timeout: Duration,
) -> CheckResult {
    let start = Instant::now();

    let target = match resolve_target(host, port).await {
        Ok(addr) => addr,
        Err(e) => {
            return CheckResult::error(
                format!("UDP connection failed: {e}"),
                start.elapsed().as_millis() as u64,
            )
        }
    };

    let bind_addr: SocketAddr = if target.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            return CheckResult::error(
                format!("UDP connection failed: {e}"),
                start.elapsed().as_millis() as u64,
            )
        }
    };
    if let Err(e) = socket.connect(target).await {
        return CheckResult::error(
            format!("UDP connection failed: {e}"),
            start.elapsed().as_millis() as u64,
        );
    }

    let data = if payload.is_empty() {
        b"ping".as_slice()
    } else {
        payload.as_bytes()
    };
    if let Err(e) = socket.send(data).await {
        return CheckResult::error(
            format!("failed to send UDP packet: {e}"),
            start.elapsed().as_millis() as u64,
        );
    }

    let mut buf = [0u8; 1024];
    let read = tokio::time::timeout(timeout, socket.recv(&mut buf)).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match read {
        Ok(Ok(_)) => CheckResult::success(duration_ms),
        Ok(Err(e)) => CheckResult::error(format!("UDP read error: {e}"), duration_ms),
        Err(_) => CheckResult {
            status: CheckStatus::Success,
            status_code: None,
            duration_ms,
            outcome: Outcome::NoResponse,
            error_message: "UDP packet sent but no response received (expected for UDP)"
                .to_string(),
            headers: None,
        },
    }
}

async fn resolve_target(host: &str, port: u16) -> Result<SocketAddr, std::io::Error> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found")
    })
}
