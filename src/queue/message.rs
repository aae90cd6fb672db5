//! Queued message payload and priority tiers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CourierError;
use crate::id::generate_message_id;

/// Backlog tier. Workers drain `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Tiers in pop order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(CourierError::Config(format!("unknown priority: {}", other))),
        }
    }
}

/// A notification waiting in a backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub chat_id: String,
    pub text: String,
    /// Opaque reply markup, passed through to the chat provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<serde_json::Value>,
    pub priority: Priority,
    #[serde(default)]
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_not_before: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: generate_message_id(),
            chat_id: chat_id.into(),
            text: text.into(),
            keyboard: None,
            priority,
            attempt_count: 0,
            created_at: Utc::now(),
            retry_not_before: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: serde_json::Value) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    /// Time spent since the message was first produced.
    pub fn age_at(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.created_at
    }

    /// Older than `max_age`; requeues do not reset the clock.
    pub fn is_stale_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        self.age_at(now) > max_age
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}
