//! A crash-safe `Storage` backed by a directory of `<id>.env`/`<id>.meta`
//! file pairs, per spec.md §6: records are written first into a scratch
//! subdirectory and atomically renamed into their final directory, which
//! requires the scratch directory to live on the same filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use crate::envelope::{Envelope, Mailbox};

use super::{QueueMetadata, Storage, StorageError};

pub struct FilesystemStorage {
    root: PathBuf,
    scratch: PathBuf,
}

impl FilesystemStorage {
    /// `root` holds the final `<id>.env`/`<id>.meta` pairs; a `scratch`
    /// subdirectory of `root` is created for in-progress writes so the
    /// final rename is always same-filesystem.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let scratch = root.join("scratch");
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::Backend(e.into()))?;
        fs::create_dir_all(&scratch)
            .await
            .map_err(|e| StorageError::Backend(e.into()))?;
        Ok(FilesystemStorage { root, scratch })
    }

    fn env_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.env"))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.meta"))
    }

    async fn write_atomically(&self, final_path: &Path, scratch_name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let scratch_path = self.scratch.join(scratch_name);
        fs::write(&scratch_path, bytes)
            .await
            .map_err(|e| StorageError::Backend(e.into()))?;
        fs::rename(&scratch_path, final_path)
            .await
            .map_err(|e| StorageError::Backend(e.into()))?;
        Ok(())
    }
}

fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    #[derive(serde::Serialize)]
    struct OnDisk<'a> {
        sender: &'a Option<Mailbox>,
        recipients: &'a [Mailbox],
        headers: &'a [(String, String)],
        body: &'a [u8],
        client_ip: String,
        reverse_dns: &'a Option<String>,
        ehlo: &'a Option<String>,
        security_tls: bool,
        authenticated_as: &'a Option<String>,
        protocol: String,
    }
    let record = OnDisk {
        sender: &envelope.sender,
        recipients: &envelope.recipients,
        headers: &envelope.headers,
        body: &envelope.body,
        client_ip: envelope.metadata.client_ip.to_string(),
        reverse_dns: &envelope.metadata.reverse_dns,
        ehlo: &envelope.metadata.ehlo,
        security_tls: envelope.metadata.security == crate::envelope::Security::Tls,
        authenticated_as: &envelope.metadata.authenticated_as,
        protocol: envelope.metadata.protocol.to_string(),
    };
    serde_json::to_vec(&record).expect("envelope on-disk record is always serializable")
}

fn decode_envelope(bytes: &[u8]) -> Result<Envelope, StorageError> {
    use crate::envelope::{Protocol, Security, SessionMetadata};

    #[derive(serde::Deserialize)]
    struct OnDisk {
        sender: Option<Mailbox>,
        recipients: Vec<Mailbox>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        client_ip: String,
        reverse_dns: Option<String>,
        ehlo: Option<String>,
        security_tls: bool,
        authenticated_as: Option<String>,
        protocol: String,
    }
    let record: OnDisk = serde_json::from_slice(bytes).map_err(|e| StorageError::Backend(e.into()))?;
    let client_ip = record
        .client_ip
        .parse()
        .map_err(|_| StorageError::Backend(anyhow::anyhow!("corrupt client_ip in stored envelope")))?;
    let protocol = match record.protocol.as_str() {
        "SMTP" => Protocol::Smtp,
        "ESMTP" => Protocol::Esmtp,
        "ESMTPS" => Protocol::Esmtps,
        "HTTP" => Protocol::Http,
        other => return Err(StorageError::Backend(anyhow::anyhow!("unknown protocol tag {other:?}"))),
    };
    let metadata = SessionMetadata {
        client_ip,
        reverse_dns: record.reverse_dns,
        ehlo: record.ehlo,
        security: if record.security_tls { Security::Tls } else { Security::None },
        authenticated_as: record.authenticated_as,
        protocol,
    };
    Ok(Envelope {
        sender: record.sender,
        recipients: record.recipients,
        headers: record.headers,
        body: record.body.into(),
        metadata,
    })
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn write(&self, envelope: Envelope, metadata: QueueMetadata) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let env_bytes = encode_envelope(&envelope);
        let meta_bytes = serde_json::to_vec(&metadata).map_err(|e| StorageError::Backend(e.into()))?;

        self.write_atomically(&self.env_path(&id), &format!("{id}.env.tmp"), &env_bytes)
            .await?;
        self.write_atomically(&self.meta_path(&id), &format!("{id}.meta.tmp"), &meta_bytes)
            .await?;
        Ok(id)
    }

    async fn set_recipients_delivered(&self, id: &str, remaining: Vec<Mailbox>) -> Result<(), StorageError> {
        let (mut envelope, _) = self.get(id).await?;
        envelope.recipients = remaining;
        let env_bytes = encode_envelope(&envelope);
        self.write_atomically(&self.env_path(id), &format!("{id}.env.tmp"), &env_bytes)
            .await
    }

    async fn load_all(&self) -> Result<Vec<(String, QueueMetadata)>, StorageError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::Backend(e.into()))?;
        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StorageError::Backend(e.into()))? {
            let path = entry.path();
            let Some(ext) = path.extension() else { continue };
            if ext != "meta" {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let meta_bytes = fs::read(&path).await.map_err(|e| StorageError::Backend(e.into()))?;
            let metadata: QueueMetadata =
                serde_json::from_slice(&meta_bytes).map_err(|e| StorageError::Backend(e.into()))?;
            result.push((stem.to_string(), metadata));
        }
        Ok(result)
    }

    async fn get(&self, id: &str) -> Result<(Envelope, QueueMetadata), StorageError> {
        let env_bytes = fs::read(self.env_path(id))
            .await
            .map_err(|_| StorageError::NotFound(id.to_string()))?;
        let meta_bytes = fs::read(self.meta_path(id))
            .await
            .map_err(|_| StorageError::NotFound(id.to_string()))?;
        let envelope = decode_envelope(&env_bytes)?;
        let metadata: QueueMetadata = serde_json::from_slice(&meta_bytes).map_err(|e| StorageError::Backend(e.into()))?;
        Ok((envelope, metadata))
    }

    async fn write_metadata(&self, id: &str, metadata: QueueMetadata) -> Result<(), StorageError> {
        let meta_bytes = serde_json::to_vec(&metadata).map_err(|e| StorageError::Backend(e.into()))?;
        self.write_atomically(&self.meta_path(id), &format!("{id}.meta.tmp"), &meta_bytes)
            .await
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        let _ = fs::remove_file(self.env_path(id)).await;
        let _ = fs::remove_file(self.meta_path(id)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::envelope::{Protocol, SessionMetadata};

    fn sample_envelope() -> Envelope {
        let metadata = SessionMetadata::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Protocol::Esmtp);
        let mut envelope = Envelope::new(metadata);
        envelope.sender = Some(Mailbox::parse("a@b.example").unwrap());
        envelope.recipients.push(Mailbox::parse("c@d.example").unwrap());
        envelope.headers.push(("Subject".into(), "hi".into()));
        envelope.body = bytes::Bytes::from_static(b"hello");
        envelope
    }

    #[tokio::test]
    async fn write_then_get_round_trips_through_disk() {
        let dir = tempdir();
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        let id = storage
            .write(sample_envelope(), QueueMetadata::fresh(1000))
            .await
            .unwrap();
        let (envelope, meta) = storage.get(&id).await.unwrap();
        assert_eq!(envelope.recipients[0].to_string(), "c@d.example");
        assert_eq!(envelope.header("Subject"), Some("hi"));
        assert_eq!(meta.scheduled_at, 1000);
    }

    #[tokio::test]
    async fn load_all_finds_records_written_in_a_prior_process() {
        let dir = tempdir();
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        storage.write(sample_envelope(), QueueMetadata::fresh(5)).await.unwrap();
        storage.write(sample_envelope(), QueueMetadata::fresh(6)).await.unwrap();

        let reopened = FilesystemStorage::open(dir.path()).await.unwrap();
        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_get_then_fails() {
        let dir = tempdir();
        let storage = FilesystemStorage::open(dir.path()).await.unwrap();
        let id = storage
            .write(sample_envelope(), QueueMetadata::fresh(0))
            .await
            .unwrap();
        storage.remove(&id).await.unwrap();
        storage.remove(&id).await.unwrap();
        assert!(storage.get(&id).await.is_err());
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("mailcrucible-test-{}", Uuid::new_v4()));
            TempDir { path }
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
