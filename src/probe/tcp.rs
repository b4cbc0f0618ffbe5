//! TCP connect probe.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::models::CheckResult;

/// Dial `host:port` within `timeout` and optionally write a payload.
///
/// `duration_ms` measures start-to-connect only; the payload write is not
/// included. A write failure downgrades the result to `{error, error}`.
pub async fn run_tcp_check(
    host: &str,
    port: u16,
    payload: &str,
    timeout: Duration,
) -> CheckResult {
    let start = Instant::now();

    let connect = tokio::time::timeout(timeout, TcpStream::connect((host, port))).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return CheckResult::error(format!("TCP connection failed: {e}"), duration_ms)
        }
        Err(_) => {
            return CheckResult::timeout(
                "TCP connection failed: connection timed out".to_string(),
                duration_ms,
            )
        }
    };

    if !payload.is_empty() {
        if let Err(e) = stream.write_all(payload.as_bytes()).await {
            return CheckResult::error(format!("TCP write failed: {e}"), duration_ms);
        }
    }

    CheckResult::success(duration_ms)
}
