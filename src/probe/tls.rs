//! TLS handshake probe and the persistent-session loop.
//!
//! Certificate validation is intentionally skipped: these probes measure
//! reachability and handshake latency, not trust. SNI is sent only when the
//! target host is a DNS name; IP literals negotiate without it.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

use crate::models::{CheckResult, CheckStatus, Outcome};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const CONNECT_FAILURE_BACKOFF: Duration = Duration::from_secs(10);
const MAX_READ_DEADLINE: Duration = Duration::from_secs(300);

/// Accepts any certificate chain; reachability probes do not validate trust.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        Arc::new(
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(config.clone())
}

/// ServerName for the handshake. DNS names carry SNI; IP literals parse to
/// an address name, for which rustls sends no SNI extension.
fn server_name(host: &str) -> Result<ServerName<'static>, String> {
    ServerName::try_from(host.to_string()).map_err(|e| format!("invalid server name: {e}"))
}

async fn dial_tls(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(tokio_rustls::client::TlsStream<TcpStream>, Duration), CheckResult> {
    let name = match server_name(host) {
        Ok(name) => name,
        Err(e) => return Err(CheckResult::error(format!("TLS connection failed: {e}"), 0)),
    };

    let start = Instant::now();
    let handshake = async {
        let stream = TcpStream::connect((host, port)).await?;
        connector().connect(name, stream).await
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(stream)) => Ok((stream, start.elapsed())),
        Ok(Err(e)) => Err(CheckResult::error(
            format!("TLS connection failed: {e}"),
            start.elapsed().as_millis() as u64,
        )),
        Err(_) => Err(CheckResult::timeout(
            "TLS connection failed: handshake timed out".to_string(),
            start.elapsed().as_millis() as u64,
        )),
    }
}

/// One-shot TLS probe: dial, handshake, close.
pub async fn run_tls_check(host: &str, port: u16, timeout: Duration) -> CheckResult {
    match dial_tls(host, port, timeout).await {
        Ok((_stream, elapsed)) => CheckResult::success(elapsed.as_millis() as u64),
        Err(result) => result,
    }
}

/// Hold a TLS session open and report connection lifecycle events.
///
/// Emits `{success, connected}` after each successful handshake (duration =
/// handshake time) and `{error, disconnected}` on any read error, EOF or
/// read-deadline expiry (duration = time since connect). Reconnects after a
/// 5s backoff; connection failures emit their classification and back off
/// 10s. The stop channel is honoured at every suspension point.
pub async fn run_tls_persistent_loop<F>(
    host: String,
    port: u16,
    timeout: Duration,
    on_event: F,
    mut stop: broadcast::Receiver<()>,
) where
    F: Fn(CheckResult),
{
    let read_deadline = timeout.min(MAX_READ_DEADLINE);

    loop {
        let dial = dial_tls(&host, port, timeout);
        let (mut stream, handshake_time) = tokio::select! {
            _ = stop.recv() => return,
            dialed = dial => match dialed {
                Ok(ok) => ok,
                Err(failure) => {
                    on_event(failure);
                    tokio::select! {
                        _ = stop.recv() => return,
                        _ = tokio::time::sleep(CONNECT_FAILURE_BACKOFF) => {}
                    }
                    continue;
                }
            },
        };

        on_event(CheckResult {
            status: CheckStatus::Success,
            status_code: None,
            duration_ms: handshake_time.as_millis() as u64,
            outcome: Outcome::Connected,
            error_message: String::new(),
            headers: None,
        });

        let connected_at = Instant::now();
        let mut buf = [0u8; 1];
        let disconnect_message = loop {
            tokio::select! {
                _ = stop.recv() => return,
                read = tokio::time::timeout(read_deadline, stream.read(&mut buf)) => {
                    match read {
                        Ok(Ok(n)) if n > 0 => continue,
                        Ok(Ok(_)) => break "connection closed: EOF".to_string(),
                        Ok(Err(e)) => break format!("connection closed: {e}"),
                        Err(_) => break "connection closed: read deadline exceeded".to_string(),
                    }
                }
            }
        };
        drop(stream);

        on_event(CheckResult {
            status: CheckStatus::Error,
            status_code: None,
            duration_ms: connected_at.elapsed().as_millis() as u64,
            outcome: Outcome::Disconnected,
            error_message: disconnect_message,
            headers: None,
        });

        tokio::select! {
            _ = stop.recv() => return,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_server_name_accepts_dns_and_ip() {
        assert!(matches!(
            server_name("example.com").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(matches!(
            server_name("192.0.2.7").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(server_name("not a hostname").is_err());
    }

    #[tokio::test]
    async fn test_closed_port_is_error() {
        let result = run_tls_check("127.0.0.1", 1, Duration::from_millis(500)).await;
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.outcome, Outcome::Error);
        assert!(result.error_message.contains("TLS connection failed"));
    }

    #[tokio::test]
    async fn test_non_tls_peer_is_error() {
        // A TCP listener that closes without a handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let result = run_tls_check("127.0.0.1", port, Duration::from_secs(1)).await;
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.outcome, Outcome::Error);
    }

    #[tokio::test]
    async fn test_persistent_loop_reports_failures_and_stops() {
        let events: Arc<Mutex<Vec<CheckResult>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let handle = tokio::spawn(run_tls_persistent_loop(
            "127.0.0.1".to_string(),
            1,
            Duration::from_millis(300),
            move |result| sink.lock().unwrap().push(result),
            stop_rx,
        ));

        // Give the loop time to fail at least once, then stop it.
        tokio::time::sleep(Duration::from_millis(600)).await;
        drop(stop_tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop must exit after stop")
            .unwrap();

        let events = events.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events
            .iter()
            .all(|e| matches!(e.outcome, Outcome::Error | Outcome::Timeout)));
    }
}
