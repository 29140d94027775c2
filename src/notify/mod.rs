/// Notification sink
///
/// Jobs hand `(recipient, text)` pairs to a `Notifier`. `Ok` means the
/// message was accepted for delivery; callers only run follow-up cleanup
/// (snapshot purge, warning log write) after that.
use crate::{
    config::TelegramConfig,
    error::{BotError, BotResult},
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Telegram caps a message at 4096 characters
const MAX_MESSAGE_CHARS: usize = 4096;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: i64, text: &str) -> BotResult<()>;
}

/// Telegram Bot API `sendMessage`
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, bot_token: &str) -> BotResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BotError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), bot_token),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, recipient: i64, text: &str) -> BotResult<()> {
        let text: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "chat_id": recipient,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|e| BotError::Notification(format!("sendMessage to {} failed: {}", recipient, e)))?;

        let status = response.status();
        let body: ApiResponse = response.json().await.map_err(|e| {
            BotError::Notification(format!("sendMessage to {}: unreadable reply ({}): {}", recipient, status, e))
        })?;

        if !body.ok {
            return Err(BotError::Notification(format!(
                "sendMessage to {} rejected: {}",
                recipient,
                body.description.unwrap_or_else(|| status.to_string())
            )));
        }

        tracing::debug!("Delivered message to {}", recipient);
        Ok(())
    }
}

/// Fallback when no bot token is configured: messages only go to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: i64, text: &str) -> BotResult<()> {
        tracing::info!("Telegram not configured; message for {}:\n{}", recipient, text);
        Ok(())
    }
}

/// Pick the sink for the configuration
pub fn from_config(config: &TelegramConfig) -> BotResult<Arc<dyn Notifier>> {
    match config.bot_token.as_deref() {
        Some(token) => Ok(Arc::new(TelegramNotifier::new(&config.api_base, token)?)),
        None => {
            tracing::warn!("TELEGRAM_BOT_TOKEN not set, notifications will only be logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}
