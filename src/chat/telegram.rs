//! Telegram Bot API sender.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::chat::{ChatSender, OutgoingMessage, SendError};
use crate::error::{CourierError, Result};

/// Public Bot API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

/// Environment variable consulted when no token is configured.
const TOKEN_ENV_VAR: &str = "TELEGRAM_BOT_TOKEN";

/// Resolve a configured bot token.
///
/// `${NAME}` reads the named environment variable; an empty value falls back
/// to `TELEGRAM_BOT_TOKEN`.
pub fn resolve_bot_token(configured: &str) -> Result<String> {
    let configured = configured.trim();
    let token = if let Some(rest) = configured.strip_prefix("${") {
        let name = rest
            .strip_suffix('}')
            .ok_or_else(|| CourierError::Config(format!("malformed env var reference: {}", configured)))?;
        std::env::var(name).map_err(|_| CourierError::Config(format!("environment variable {} is not set", name)))?
    } else if configured.is_empty() {
        std::env::var(TOKEN_ENV_VAR).unwrap_or_default()
    } else {
        configured.to_string()
    };

    if token.trim().is_empty() {
        return Err(CourierError::Config("telegram bot token is not configured".to_string()));
    }
    Ok(token.trim().to_string())
}

/// Classify a `sendMessage` response.
///
/// Rate limits are recognised by HTTP 429 or by `error_code: 429` in the
/// body, with the delay taken from `parameters.retry_after` (seconds).
pub fn classify_response(status: u16, body: &str) -> std::result::Result<(), SendError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    let Some(json) = parsed else {
        if (200..300).contains(&status) {
            return Ok(());
        }
        if status == 429 {
            return Err(SendError::RateLimited { retry_after: None });
        }
        return Err(SendError::Rejected {
            status,
            description: body.chars().take(200).collect(),
        });
    };

    if json.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }

    let error_code = json.get("error_code").and_then(Value::as_u64);
    if status == 429 || error_code == Some(429) {
        let retry_after = json
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        return Err(SendError::RateLimited { retry_after });
    }

    if (200..300).contains(&status) && json.get("ok").is_none() {
        return Ok(());
    }

    let description = json
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown Telegram API error")
        .to_string();
    Err(SendError::Rejected {
        status: error_code.and_then(|c| u16::try_from(c).ok()).unwrap_or(status),
        description,
    })
}

/// Sends messages through `POST {base}/bot{token}/sendMessage`.
pub struct TelegramClient {
    client: Client,
    bot_token: String,
    api_base_url: String,
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>, api_base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CourierError::Chat(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            bot_token: bot_token.into(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base_url, self.bot_token)
    }
}

#[async_trait]
impl ChatSender for TelegramClient {
    async fn send(&self, message: &OutgoingMessage) -> std::result::Result<(), SendError> {
        let response = self
            .client
            .post(self.send_message_url())
            .json(message)
            .send()
            .await
            // Drop the URL: it carries the token.
            .map_err(|e| SendError::Transport(e.without_url().to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SendError::Transport(e.without_url().to_string()))?;

        let result = classify_response(status, &body);
        if let Err(ref error) = result {
            tracing::debug!(chat_id = %message.chat_id, status, error = %error, "Telegram send failed");
        }
        result
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}
