//! In-process failure diagnostics, keyed by transport position.

use std::collections::HashMap;

use tokio::sync::RwLock;

use taskforge_core::TaskMetadata;

/// Holds [`TaskMetadata`] for messages that failed and are not yet resolved.
///
/// Entries are removed when the message is acknowledged, requeued or
/// dead-lettered. Nothing here survives a restart.
#[derive(Debug, Default)]
pub struct RetryMetadataStore {
    entries: RwLock<HashMap<String, TaskMetadata>>,
}

impl RetryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `key`; returns a copy of what was stored.
    pub async fn put(&self, key: impl Into<String>, metadata: TaskMetadata) -> TaskMetadata {
        self.entries
            .write()
            .await
            .insert(key.into(), metadata.clone());
        metadata
    }

    pub async fn remove(&self, key: &str) -> Option<TaskMetadata> {
        self.entries.write().await.remove(key)
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
