use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::queue::QueuedMessage;
use crate::store::SharedStore;

/// Lengths of the three backlogs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogDepth {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl BacklogDepth {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

impl fmt::Display for BacklogDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "high={} normal={} low={}", self.high, self.normal, self.low)
    }
}

/// Appends messages to the backlog named by their priority.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn SharedStore>,
}

impl Producer {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Serialize and push to the tail of `message.priority`'s backlog.
    ///
    /// A store error means the message was not queued.
    pub async fn enqueue(&self, message: &QueuedMessage) -> Result<()> {
        let payload = message.to_json()?;
        self.store.push_back(message.priority, payload).await?;
        tracing::debug!(
            message_id = %message.id,
            chat_id = %message.chat_id,
            priority = %message.priority,
            "Message enqueued"
        );
        Ok(())
    }

    pub async fn depth(&self) -> Result<BacklogDepth> {
        self.store.depth().await
    }
}
