//! HTTP(S) probe implementation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::{CheckParams, CheckResult, CheckStatus, Outcome};

use super::is_timeout_message;

/// Build the probe URL `scheme://host[path]`, bracketing IPv6 literals.
pub fn build_http_url(domain_name: &str, params: &CheckParams) -> String {
    let host = match domain_name.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{domain_name}]"),
        _ => domain_name.to_string(),
    };
    format!("{}://{}{}", params.scheme(), host, params.path())
}

fn has_request_body(method: &str, body: &str) -> bool {
    !body.is_empty() && matches!(method, "POST" | "PUT" | "PATCH")
}

/// Issue one HTTP request and classify the response.
///
/// Codes below 400 are `{success, 2xx}`, 400-499 `{failure, 4xx}`,
/// 500+ `{failure, 5xx}`. Expected-header violations downgrade the result
/// to `{error, header_mismatch}` (value mismatch, takes precedence) or
/// `{error, missing_headers}`.
pub async fn run_http_check(
    url: &str,
    method: &str,
    body: &str,
    expected_headers: &HashMap<String, String>,
    timeout: Duration,
) -> CheckResult {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return CheckResult::error(e.to_string(), 0),
    };

    let method = if method.is_empty() { "GET" } else { method };
    let parsed_method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(e) => return CheckResult::error(e.to_string(), 0),
    };

    let mut request = client.request(parsed_method, url);
    if has_request_body(method, body) {
        request = request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
    }

    let start = Instant::now();
    let response = request.send().await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match response {
        Ok(resp) => classify_response(resp, duration_ms, expected_headers),
        Err(e) => {
            let message = format!("{e:#}");
            if e.is_timeout() || is_timeout_message(&message) {
                CheckResult::timeout(message, duration_ms)
            } else {
                CheckResult::error(message, duration_ms)
            }
        }
    }
}

fn classify_response(
    resp: reqwest::Response,
    duration_ms: u64,
    expected_headers: &HashMap<String, String>,
) -> CheckResult {
    let status_code = resp.status().as_u16();
    let (mut status, mut outcome) = classify_status_code(status_code);
    let mut error_message = String::new();

    if !expected_headers.is_empty() {
        let mut missing = Vec::new();
        for (key, expected) in expected_headers {
            let actual = resp
                .headers()
                .get(key)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if actual.is_empty() {
                missing.push(format!("{key} (missing)"));
            } else if !expected.is_empty() && actual != expected {
                error_message =
                    format!("Header {key} mismatch: expected '{expected}', got '{actual}'");
                status = CheckStatus::Error;
                outcome = Outcome::HeaderMismatch;
                break;
            }
        }
        if !missing.is_empty() && error_message.is_empty() {
            missing.sort();
            error_message = format!("Missing headers: {}", missing.join(", "));
            status = CheckStatus::Error;
            outcome = Outcome::MissingHeaders;
        }
    }

    // First value per key, as delivered.
    let mut headers = HashMap::new();
    for (key, value) in resp.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    CheckResult {
        status,
        status_code: Some(status_code),
        duration_ms,
        outcome,
        error_message,
        headers: Some(headers),
    }
}

fn classify_status_code(code: u16) -> (CheckStatus, Outcome) {
    match code {
        500.. => (CheckStatus::Failure, Outcome::Http5xx),
        400..=499 => (CheckStatus::Failure, Outcome::Http4xx),
        _ => (CheckStatus::Success, Outcome::Http2xx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_build_url_defaults() {
        let params = CheckParams::default();
        assert_eq!(build_http_url("example.com", &params), "https://example.com/");
    }

    #[test]
    fn test_build_url_brackets_ipv6() {
        let params = CheckParams {
            scheme: Some("http".to_string()),
            path: Some("/health".to_string()),
            ..Default::default()
        };
        assert_eq!(build_http_url("::1", &params), "http://[::1]/health");
        assert_eq!(build_http_url("127.0.0.1", &params), "http://127.0.0.1/health");
    }

    #[tokio::test]
    async fn test_2xx_is_success() {
        let addr = serve(Router::new().route("/", get(|| async { "ok" }))).await;
        let result = run_http_check(
            &format!("http://{addr}/"),
            "GET",
            "",
            &HashMap::new(),
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(result.status, CheckStatus::Success);
        assert_eq!(result.outcome, Outcome::Http2xx);
        assert_eq!(result.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_4xx_and_5xx_are_failures() {
        let app = Router::new()
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let addr = serve(app).await;

        let not_found = run_http_check(
            &format!("http://{addr}/missing"),
            "GET",
            "",
            &HashMap::new(),
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(not_found.status, CheckStatus::Failure);
        assert_eq!(not_found.outcome, Outcome::Http4xx);
        assert_eq!(not_found.status_code, Some(404));

        let broken = run_http_check(
            &format!("http://{addr}/broken"),
            "GET",
            "",
            &HashMap::new(),
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(broken.status, CheckStatus::Failure);
        assert_eq!(broken.outcome, Outcome::Http5xx);
    }

    #[tokio::test]
    async fn test_missing_expected_header() {
        let addr = serve(Router::new().route("/", get(|| async { "ok" }))).await;
        let expected = HashMap::from([("X-Build".to_string(), String::new())]);
        let result = run_http_check(
            &format!("http://{addr}/"),
            "GET",
            "",
            &expected,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.outcome, Outcome::MissingHeaders);
        assert!(result.error_message.contains("X-Build"));
    }

    #[tokio::test]
    async fn test_header_mismatch_takes_precedence_over_missing() {
        let app = Router::new().route(
            "/",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert("X-Env", "staging".parse().unwrap());
                (headers, "ok")
            }),
        );
        let addr = serve(app).await;
        let expected = HashMap::from([
            ("X-Env".to_string(), "production".to_string()),
            ("X-Absent".to_string(), String::new()),
        ]);
        let result = run_http_check(
            &format!("http://{addr}/"),
            "GET",
            "",
            &expected,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.outcome, Outcome::HeaderMismatch);
        assert!(result.error_message.contains("X-Env"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_error() {
        let result = run_http_check(
            "http://127.0.0.1:1/",
            "GET",
            "",
            &HashMap::new(),
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.outcome, Outcome::Error);
        assert!(!result.error_message.is_empty());
    }
}
