//! The storage contract the queue engine depends on, per spec.md §4.6.
//!
//! Kept as a narrow `async_trait` so the queue never depends on a concrete
//! backend, mirroring how `submit::EnvelopeSubmitter` decouples the SMTP
//! session from the queue itself.

pub mod filesystem;
pub mod memory;

use async_trait::async_trait;

use crate::envelope::Envelope;

/// Per-record state the queue mutates: retry count and the absolute time
/// of the next scheduled delivery attempt.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct QueueMetadata {
    pub attempts: u32,
    /// Unix timestamp (seconds) of the next scheduled attempt.
    pub scheduled_at: i64,
}

impl QueueMetadata {
    pub fn fresh(now: i64) -> Self {
        QueueMetadata {
            attempts: 0,
            scheduled_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no record found for id {0:?}")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable persistence for queued envelopes, per spec.md §4.6. `write`
/// must be durable by the time it returns; `remove` is idempotent.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn write(&self, envelope: Envelope, metadata: QueueMetadata) -> Result<String, StorageError>;

    /// Narrows the stored envelope's recipient list to `remaining`, used
    /// when a relay attempt partially succeeds (spec.md §4.7 scenario 4).
    async fn set_recipients_delivered(
        &self,
        id: &str,
        remaining: Vec<crate::envelope::Mailbox>,
    ) -> Result<(), StorageError>;

    async fn load_all(&self) -> Result<Vec<(String, QueueMetadata)>, StorageError>;

    async fn get(&self, id: &str) -> Result<(Envelope, QueueMetadata), StorageError>;

    async fn write_metadata(&self, id: &str, metadata: QueueMetadata) -> Result<(), StorageError>;

    async fn remove(&self, id: &str) -> Result<(), StorageError>;
}
