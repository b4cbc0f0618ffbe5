//! Core model types shared between the engine, storage and notifications.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-probe deadline when a check does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A monitored endpoint: a DNS name or a literal IPv4/IPv6 address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: i64,
    pub name: String,
}

/// Probe family of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Icmp,
    Tcp,
    Udp,
    Tls,
}

impl CheckType {
    /// Whether this probe family needs a target port.
    pub fn requires_port(&self) -> bool {
        matches!(self, CheckType::Tcp | CheckType::Udp | CheckType::Tls)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Http => "http",
            CheckType::Icmp => "icmp",
            CheckType::Tcp => "tcp",
            CheckType::Udp => "udp",
            CheckType::Tls => "tls",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(CheckType::Http),
            "icmp" => Ok(CheckType::Icmp),
            "tcp" => Ok(CheckType::Tcp),
            "udp" => Ok(CheckType::Udp),
            "tls" => Ok(CheckType::Tls),
            other => Err(format!("unsupported check type: {other}")),
        }
    }
}

/// Optional per-probe configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckParams {
    /// HTTP URI path (default "/").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// HTTP scheme (default "https").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// HTTP method (default "GET").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request body, sent only for POST/PUT/PATCH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Expected response headers. A present key must exist in the response;
    /// a non-empty value must match exactly.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Target port, required for tcp/udp/tls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Payload to send for tcp/udp probes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Per-probe deadline in milliseconds; 0 or absent means 10s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CheckParams {
    /// Effective probe deadline.
    pub fn timeout(&self) -> Duration {
        match self.timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// HTTP path, normalised to begin with `/`.
    pub fn path(&self) -> String {
        match self.path.as_deref() {
            None | Some("") => "/".to_string(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{p}"),
        }
    }

    /// HTTP scheme, defaulting to https.
    pub fn scheme(&self) -> &str {
        match self.scheme.as_deref() {
            None | Some("") => "https",
            Some(s) => s,
        }
    }

    /// HTTP method, defaulting to GET.
    pub fn method(&self) -> &str {
        match self.method.as_deref() {
            None | Some("") => "GET",
            Some(m) => m,
        }
    }

    pub fn payload(&self) -> &str {
        self.payload.as_deref().unwrap_or("")
    }
}

/// A declarative probe specification bound to one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: i64,
    pub domain_id: i64,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// Probe period in seconds; ignored for realtime and tls checks.
    pub interval_seconds: u64,
    #[serde(default)]
    pub params: CheckParams,
    pub enabled: bool,
    /// Run back-to-back instead of on a fixed interval.
    #[serde(default)]
    pub realtime_mode: bool,
    /// Per-check probe cap per minute; 0 means unbounded.
    #[serde(default)]
    pub rate_limit_per_minute: u32,
}

impl Check {
    /// Enforce model invariants: positive interval, normalised path.
    pub fn normalize(&mut self) {
        if self.interval_seconds == 0 {
            self.interval_seconds = 1;
        }
        if let Some(path) = &self.params.path {
            if !path.is_empty() && !path.starts_with('/') {
                self.params.path = Some(format!("/{path}"));
            }
        }
    }
}

/// Coarse classification of one probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Failure,
    Timeout,
    Error,
}

impl CheckStatus {
    /// Timeouts and errors count as failures for notification purposes.
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckStatus::Timeout | CheckStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Success => "success",
            CheckStatus::Failure => "failure",
            CheckStatus::Timeout => "timeout",
            CheckStatus::Error => "error",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained classification tag, complementary to [`CheckStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "2xx")]
    Http2xx,
    #[serde(rename = "4xx")]
    Http4xx,
    #[serde(rename = "5xx")]
    Http5xx,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "no_response")]
    NoResponse,
    #[serde(rename = "header_mismatch")]
    HeaderMismatch,
    #[serde(rename = "missing_headers")]
    MissingHeaders,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Http2xx => "2xx",
            Outcome::Http4xx => "4xx",
            Outcome::Http5xx => "5xx",
            Outcome::Success => "success",
            Outcome::Timeout => "timeout",
            Outcome::Error => "error",
            Outcome::Connected => "connected",
            Outcome::Disconnected => "disconnected",
            Outcome::NoResponse => "no_response",
            Outcome::HeaderMismatch => "header_mismatch",
            Outcome::MissingHeaders => "missing_headers",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2xx" => Ok(Outcome::Http2xx),
            "4xx" => Ok(Outcome::Http4xx),
            "5xx" => Ok(Outcome::Http5xx),
            "success" => Ok(Outcome::Success),
            "timeout" => Ok(Outcome::Timeout),
            "error" => Ok(Outcome::Error),
            "connected" => Ok(Outcome::Connected),
            "disconnected" => Ok(Outcome::Disconnected),
            "no_response" => Ok(Outcome::NoResponse),
            "header_mismatch" => Ok(Outcome::HeaderMismatch),
            "missing_headers" => Ok(Outcome::MissingHeaders),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// The outcome of one probe, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub status: CheckStatus,
    /// HTTP response code, when applicable.
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub error_message: String,
    /// Response headers observed by the HTTP probe (first value per key).
    pub headers: Option<HashMap<String, String>>,
}

impl CheckResult {
    pub fn error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: CheckStatus::Error,
            status_code: None,
            duration_ms,
            outcome: Outcome::Error,
            error_message: message.into(),
            headers: None,
        }
    }

    pub fn timeout(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: CheckStatus::Timeout,
            status_code: None,
            duration_ms,
            outcome: Outcome::Timeout,
            error_message: message.into(),
            headers: None,
        }
    }

    pub fn success(duration_ms: u64) -> Self {
        Self {
            status: CheckStatus::Success,
            status_code: None,
            duration_ms,
            outcome: Outcome::Success,
            error_message: String::new(),
            headers: None,
        }
    }
}

/// Persisted form of a [`CheckResult`]. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub id: i64,
    pub check_id: i64,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    #[serde(default)]
    pub error_message: String,
    /// RFC 3339 creation timestamp; source of truth for result ordering.
    pub created_at: String,
}

/// Supported notification channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
    Telegram,
    Slack,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationChannel::Telegram => f.write_str("telegram"),
            NotificationChannel::Slack => f.write_str("slack"),
        }
    }
}

impl FromStr for NotificationChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telegram" => Ok(NotificationChannel::Telegram),
            "slack" => Ok(NotificationChannel::Slack),
            other => Err(format!("unsupported notification type: {other}")),
        }
    }
}

/// One channel subscription with its dispatch predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub id: i64,
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
    pub enabled: bool,
    /// Telegram bot token.
    #[serde(default)]
    pub token: String,
    /// Telegram chat id.
    #[serde(default)]
    pub chat_id: String,
    /// Slack incoming webhook URL.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default)]
    pub notify_on_slow_response: bool,
    #[serde(default)]
    pub slow_response_threshold_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_type_parse_is_case_insensitive() {
        assert_eq!("HTTP".parse::<CheckType>().unwrap(), CheckType::Http);
        assert_eq!("Tls".parse::<CheckType>().unwrap(), CheckType::Tls);
        assert!("smtp".parse::<CheckType>().is_err());
    }

    #[test]
    fn test_params_defaults() {
        let params = CheckParams::default();
        assert_eq!(params.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(params.path(), "/");
        assert_eq!(params.scheme(), "https");
        assert_eq!(params.method(), "GET");
    }

    #[test]
    fn test_zero_timeout_falls_back_to_default() {
        let params = CheckParams {
            timeout_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(params.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_normalize_path_and_interval() {
        let mut check = Check {
            id: 1,
            domain_id: 1,
            check_type: CheckType::Http,
            interval_seconds: 0,
            params: CheckParams {
                path: Some("health".to_string()),
                ..Default::default()
            },
            enabled: true,
            realtime_mode: false,
            rate_limit_per_minute: 0,
        };
        check.normalize();
        assert_eq!(check.interval_seconds, 1);
        assert_eq!(check.params.path.as_deref(), Some("/health"));
    }

    #[test]
    fn test_outcome_wire_form() {
        assert_eq!(Outcome::Http2xx.to_string(), "2xx");
        assert_eq!("no_response".parse::<Outcome>().unwrap(), Outcome::NoResponse);
        assert_eq!(
            serde_json::to_string(&Outcome::HeaderMismatch).unwrap(),
            "\"header_mismatch\""
        );
    }

    #[test]
    fn test_status_failure_predicate() {
        assert!(CheckStatus::Timeout.is_failure());
        assert!(CheckStatus::Error.is_failure());
        assert!(!CheckStatus::Success.is_failure());
        assert!(!CheckStatus::Failure.is_failure());
    }

    #[test]
    fn test_params_json_round_trip() {
        let params = CheckParams {
            path: Some("/status".to_string()),
            port: Some(8443),
            timeout_ms: Some(2500),
            ..Default::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: CheckParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
