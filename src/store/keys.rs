use crate::queue::Priority;

/// Redis key layout, optionally namespaced by a prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim().trim_end_matches(':').to_string(),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.prefix, name)
        }
    }

    /// `queue:high`, `queue:normal`, `queue:low`
    pub fn queue(&self, priority: Priority) -> String {
        self.key(&format!("queue:{}", priority.as_str()))
    }

    /// All backlog keys in pop order.
    pub fn queues(&self) -> Vec<String> {
        Priority::ALL.iter().map(|p| self.queue(*p)).collect()
    }

    pub fn rate_limit(&self) -> String {
        self.key("rate_limit:global")
    }

    pub fn throttle(&self, recipient: &str) -> String {
        self.key(&format!("throttle:recipient:{}", recipient))
    }

    /// Map a popped list key back to its tier.
    pub fn priority_of(&self, key: &str) -> Option<Priority> {
        Priority::ALL.into_iter().find(|p| self.queue(*p) == key)
    }
}
