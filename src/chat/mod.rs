//! Chat provider seam.
//!
//! Workers hand each message to a [`ChatSender`]. The provider's answer is
//! classified into [`SendError`] so the worker can tell a rate limit (retry
//! later) from a rejection or a transport failure (drop).

mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::queue::QueuedMessage;

pub use telegram::{DEFAULT_API_BASE_URL, TelegramClient, classify_response, resolve_bot_token};

/// Body of a single `sendMessage` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<serde_json::Value>,
}

impl From<&QueuedMessage> for OutgoingMessage {
    fn from(message: &QueuedMessage) -> Self {
        Self {
            chat_id: message.chat_id.clone(),
            text: message.text.clone(),
            reply_markup: message.keyboard.clone(),
        }
    }
}

/// Why a send did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Provider asked us to slow down. `None` when it gave no delay.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider refused the message; retrying will not help.
    #[error("rejected by provider ({status}): {description}")]
    Rejected { status: u16, description: String },

    /// Request never got a usable answer.
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> std::result::Result<(), SendError>;
}
