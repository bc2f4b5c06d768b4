//! An in-process `Storage` backed by a `Mutex<HashMap>`, useful for tests
//! and for embedders who don't need crash recovery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::envelope::{Envelope, Mailbox};

use super::{QueueMetadata, Storage, StorageError};

#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, (Envelope, QueueMetadata)>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, envelope: Envelope, metadata: QueueMetadata) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        self.records.lock().await.insert(id.clone(), (envelope, metadata));
        Ok(id)
    }

    async fn set_recipients_delivered(
        &self,
        id: &str,
        remaining: Vec<Mailbox>,
    ) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        let (envelope, _) = records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        envelope.recipients = remaining;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(String, QueueMetadata)>, StorageError> {
        let records = self.records.lock().await;
        Ok(records.iter().map(|(id, (_, meta))| (id.clone(), *meta)).collect())
    }

    async fn get(&self, id: &str) -> Result<(Envelope, QueueMetadata), StorageError> {
        let records = self.records.lock().await;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn write_metadata(&self, id: &str, metadata: QueueMetadata) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        let entry = records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        entry.1 = metadata;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.records.lock().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::envelope::{Envelope, Protocol, SessionMetadata};

    fn sample_envelope() -> Envelope {
        let metadata = SessionMetadata::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Protocol::Esmtp);
        let mut envelope = Envelope::new(metadata);
        envelope.sender = Some(Mailbox::parse("a@b.example").unwrap());
        envelope.recipients.push(Mailbox::parse("c@d.example").unwrap());
        envelope.body = bytes::Bytes::from_static(b"body");
        envelope
    }

    #[tokio::test]
    async fn write_then_get_round_trips() {
        let storage = MemoryStorage::new();
        let id = storage
            .write(sample_envelope(), QueueMetadata::fresh(0))
            .await
            .unwrap();
        let (envelope, meta) = storage.get(&id).await.unwrap();
        assert_eq!(envelope.recipients.len(), 1);
        assert_eq!(meta.attempts, 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let storage = MemoryStorage::new();
        let id = storage
            .write(sample_envelope(), QueueMetadata::fresh(0))
            .await
            .unwrap();
        storage.remove(&id).await.unwrap();
        storage.remove(&id).await.unwrap();
        assert!(storage.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn set_recipients_delivered_narrows_recipient_list() {
        let storage = MemoryStorage::new();
        let mut envelope = sample_envelope();
        envelope.recipients.push(Mailbox::parse("e@f.example").unwrap());
        let id = storage.write(envelope, QueueMetadata::fresh(0)).await.unwrap();

        let remaining = vec![Mailbox::parse("e@f.example").unwrap()];
        storage.set_recipients_delivered(&id, remaining).await.unwrap();

        let (envelope, _) = storage.get(&id).await.unwrap();
        assert_eq!(envelope.recipients.len(), 1);
        assert_eq!(envelope.recipients[0].to_string(), "e@f.example");
    }
}
