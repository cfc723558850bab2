//! Queue naming shared by clients, workers and the promoter.

use serde::{Deserialize, Serialize};

/// Default base queue name.
pub const DEFAULT_QUEUE: &str = "tasks";

/// The three topics derived from one base queue name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTopics {
    /// Tasks ready to run.
    pub active: String,
    /// Tasks waiting for a due time (delayed enqueues and retries).
    pub delayed: String,
    /// Terminal failures.
    pub dead_letter: String,
}

impl QueueTopics {
    pub fn new(base: impl AsRef<str>) -> Self {
        let base = base.as_ref();
        Self {
            active: base.to_string(),
            delayed: format!("{base}.delayed"),
            dead_letter: format!("{base}.dlq"),
        }
    }
}

impl Default for QueueTopics {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_derive_from_base_name() {
        let topics = QueueTopics::new("emails");
        assert_eq!(topics.active, "emails");
        assert_eq!(topics.delayed, "emails.delayed");
        assert_eq!(topics.dead_letter, "emails.dlq");
        assert_eq!(QueueTopics::default().active, DEFAULT_QUEUE);
    }
}
