//! Notification dispatch: message shape, sender contract and the HTTP
//! sender for Telegram and Slack.

mod sender;

pub use sender::HttpNotifier;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::NotificationSettings;

/// Notification error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("{0} is not configured: {1}")]
    Misconfigured(&'static str, &'static str),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0} API returned status {1}")]
    BadStatus(&'static str, u16),
}

/// What the engine hands to a channel for one dispatch.
///
/// For slow-response notifications the worker overrides `status` with
/// `"slow_response"` and replaces `error_message` with the threshold
/// diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub check_id: i64,
    pub domain_name: String,
    pub check_type: String,
    pub status: String,
    pub error_message: String,
    pub duration_ms: u64,
    pub created_at: String,
}

/// Formats and transmits one message to one channel. The engine decides
/// whether to call; implementations decide how to deliver.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        settings: &NotificationSettings,
        message: &NotificationMessage,
    ) -> Result<(), NotifyError>;
}
