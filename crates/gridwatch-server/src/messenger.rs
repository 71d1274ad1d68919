//! Outbound messenger capability.
//!
//! The core only knows this trait; delivery details live behind it. Errors
//! are classified so the notifier can retry what may heal and deactivate
//! subscribers that are genuinely unreachable.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessengerError {
    /// Network trouble, 5xx, or rate limiting: worth a retry.
    #[error("transient messenger error: {0}")]
    Transient(String),

    /// The recipient is unreachable (blocked the bot, chat gone). The
    /// subscriber should be marked inactive.
    #[error("permanent messenger error: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), MessengerError>;
}

/// Telegram Bot API client.
pub struct TelegramMessenger {
    http: reqwest::Client,
    token: String,
}

impl TelegramMessenger {
    pub fn new(token: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, token })
    }
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    disable_web_page_preview: bool,
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), MessengerError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = SendMessageBody {
            chat_id,
            text,
            parse_mode,
            disable_web_page_preview: true,
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MessengerError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let description = response.text().await.unwrap_or_default();
        Err(classify_api_error(status.as_u16(), &description))
    }
}

/// Map a Bot API failure to transient/permanent.
///
/// Only replies that clearly say the recipient is unreachable are permanent;
/// anything else stays transient so a retry (and then giving up on this
/// message alone) never deactivates a reachable subscriber.
pub fn classify_api_error(status: u16, description: &str) -> MessengerError {
    let description_lc = description.to_lowercase();
    let unreachable = status == 403
        || description_lc.contains("bot was blocked")
        || description_lc.contains("chat not found")
        || description_lc.contains("user is deactivated");

    if unreachable {
        MessengerError::Permanent(format!("{status}: {description}"))
    } else {
        MessengerError::Transient(format!("{status}: {description}"))
    }
}

/// Log-only messenger used when no bot token is configured.
pub struct NoopMessenger;

#[async_trait]
impl Messenger for NoopMessenger {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        _parse_mode: Option<&str>,
    ) -> Result<(), MessengerError> {
        tracing::debug!(chat_id, text, "messenger disabled, dropping message");
        Ok(())
    }
}
