//! HTTP notification sender for Telegram and Slack.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::models::{NotificationChannel, NotificationSettings};

use super::{Notifier, NotificationMessage, NotifyError};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends notifications over the Telegram Bot API and Slack incoming
/// webhooks.
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DISPATCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn send_telegram(
        &self,
        settings: &NotificationSettings,
        message: &NotificationMessage,
    ) -> Result<(), NotifyError> {
        if settings.token.is_empty() || settings.chat_id.is_empty() {
            return Err(NotifyError::Misconfigured(
                "telegram",
                "token and chat_id are required",
            ));
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", settings.token);
        let payload = json!({
            "chat_id": settings.chat_id,
            "text": format_telegram_message(message),
            "parse_mode": "HTML",
        });

        let response = self.client.post(&url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::BadStatus("telegram", response.status().as_u16()));
        }
        Ok(())
    }

    async fn send_slack(
        &self,
        settings: &NotificationSettings,
        message: &NotificationMessage,
    ) -> Result<(), NotifyError> {
        if settings.webhook_url.is_empty() {
            return Err(NotifyError::Misconfigured("slack", "webhook_url is required"));
        }

        let payload = json!({ "text": format_slack_message(message) });
        let response = self
            .client
            .post(&settings.webhook_url)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::BadStatus("slack", response.status().as_u16()));
        }
        Ok(())
    }
}

impl Default for HttpNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(
        &self,
        settings: &NotificationSettings,
        message: &NotificationMessage,
    ) -> Result<(), NotifyError> {
        if !settings.enabled {
            return Ok(());
        }
        match settings.channel {
            NotificationChannel::Telegram => self.send_telegram(settings, message).await,
            NotificationChannel::Slack => self.send_slack(settings, message).await,
        }
    }
}

fn status_emoji(status: &str) -> &'static str {
    match status {
        "error" | "timeout" => "\u{274C}",
        "slow_response" => "\u{26A0}\u{FE0F}",
        _ => "\u{2705}",
    }
}

fn format_telegram_message(msg: &NotificationMessage) -> String {
    let mut text = format!("<b>{} Domain Check</b>\n\n", status_emoji(&msg.status));
    text.push_str(&format!("<b>Domain:</b> {}\n", msg.domain_name));
    text.push_str(&format!("<b>Type:</b> {}\n", msg.check_type));
    text.push_str(&format!("<b>Status:</b> {}\n", msg.status));
    text.push_str(&format!("<b>Duration:</b> {} ms\n", msg.duration_ms));
    if !msg.error_message.is_empty() {
        text.push_str(&format!("<b>Error:</b> {}\n", msg.error_message));
    }
    text.push_str(&format!("<b>Time:</b> {}", msg.created_at));
    text
}

fn format_slack_message(msg: &NotificationMessage) -> String {
    let mut text = format!("{} *Domain Check Report*\n\n", status_emoji(&msg.status));
    text.push_str(&format!("*Domain:* {}\n", msg.domain_name));
    text.push_str(&format!("*Type:* {}\n", msg.check_type));
    text.push_str(&format!("*Status:* {}\n", msg.status));
    text.push_str(&format!("*Duration:* {} ms\n", msg.duration_ms));
    if !msg.error_message.is_empty() {
        text.push_str(&format!("*Error:* {}\n", msg.error_message));
    }
    text.push_str(&format!("*Time:* {}", msg.created_at));
    text
}
