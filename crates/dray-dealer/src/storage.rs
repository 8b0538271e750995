//! File-backed message store for the persistent cache variant.
//!
//! One blob per message, keyed by uuid, under one directory per service.
//! Each blob is the msgpack encoding of [`StoredMessage`]. Writes go
//! through a temporary file and a rename so a crash never leaves a
//! half-written blob behind; a configurable sync interval bounds how many
//! commits may be lost to the page cache.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DealerError;
use crate::message::{Message, MessagePath, MessagePolicy};

const BLOB_EXT: &str = "blob";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPolicy {
    pub send_to_all_hosts: bool,
    pub urgent: bool,
    pub mailboxed: bool,
    pub timeout: f64,
    pub deadline: f64,
    pub max_timeout_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub uuid: String,
    pub service: String,
    pub handle: String,
    pub policy: StoredPolicy,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub enqueued_epoch: f64,
}

impl StoredMessage {
    pub fn from_message(message: &Message) -> Self {
        let policy = message.policy();
        StoredMessage {
            uuid: message.uuid().to_owned(),
            service: message.path().service().to_owned(),
            handle: message.path().handle().to_owned(),
            policy: StoredPolicy {
                send_to_all_hosts: policy.send_to_all_hosts,
                urgent: policy.urgent,
                mailboxed: policy.mailboxed,
                timeout: policy.timeout.as_secs_f64(),
                deadline: policy.deadline.as_secs_f64(),
                max_timeout_retries: policy.max_timeout_retries,
            },
            payload: message.payload().to_vec(),
            enqueued_epoch: message
                .enqueued_at()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    pub fn into_message(self) -> Message {
        let policy = MessagePolicy {
            send_to_all_hosts: self.policy.send_to_all_hosts,
            urgent: self.policy.urgent,
            mailboxed: self.policy.mailboxed,
            timeout: Duration::from_secs_f64(self.policy.timeout),
            deadline: Duration::from_secs_f64(self.policy.deadline),
            max_timeout_retries: self.policy.max_timeout_retries,
        };
        let enqueued_at = UNIX_EPOCH + Duration::from_secs_f64(self.enqueued_epoch);
        Message::restored(
            self.uuid,
            MessagePath::new(self.service, self.handle),
            policy,
            Bytes::from(self.payload),
            enqueued_at,
        )
    }
}

/// A content-addressed blob store keyed by message uuid.
pub struct BlobStore {
    root: PathBuf,
    sync_interval: u32,
    commits: AtomicU32,
}

impl BlobStore {
    pub fn open(root: impl Into<PathBuf>, sync_interval: u32) -> Result<Self, DealerError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(BlobStore {
            root,
            sync_interval,
            commits: AtomicU32::new(0),
        })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn blob_path(&self, uuid: &str) -> PathBuf {
        self.root.join(format!("{}.{}", uuid, BLOB_EXT))
    }

    /// Persist one message. Overwrites any previous blob for the uuid, so
    /// re-commits are harmless.
    pub fn commit(&self, message: &Message) -> Result<(), DealerError> {
        let stored = StoredMessage::from_message(message);
        let bytes = rmp_serde::to_vec(&stored)
            .map_err(|e| DealerError::Internal(format!("blob encode failed: {}", e)))?;

        let tmp = self.root.join(format!("{}.tmp", message.uuid()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;

        let count = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        if self.sync_interval > 0 && count % self.sync_interval == 0 {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp, self.blob_path(message.uuid()))?;
        Ok(())
    }

    /// Delete the blob for a terminated message. Missing blobs are fine.
    pub fn remove(&self, uuid: &str) -> Result<(), DealerError> {
        match fs::remove_file(self.blob_path(uuid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.blob_path(uuid).exists()
    }

    /// Read every stored message back. Corrupt blobs are skipped with a
    /// warning rather than failing the whole restore.
    pub fn iterate(&self) -> Result<Vec<StoredMessage>, DealerError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT) {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable blob skipped");
                    continue;
                }
            };
            match rmp_serde::from_slice::<StoredMessage>(&bytes) {
                Ok(stored) => out.push(stored),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt blob skipped");
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn message(payload: &[u8]) -> Message {
        Message::new(
            MessagePath::new("svc", "h"),
            MessagePolicy {
                deadline: Duration::from_secs(60),
                ..Default::default()
            },
            Bytes::copy_from_slice(payload),
        )
        .unwrap()
    }

    #[test]
    fn commit_reopen_iterate_yields_the_same_uuids() {
        let dir = tempfile::tempdir().unwrap();

        let mut uuids = BTreeSet::new();
        {
            let store = BlobStore::open(dir.path(), 1).unwrap();
            for i in 0..3 {
                let msg = message(format!("payload-{}", i).as_bytes());
                uuids.insert(msg.uuid().to_owned());
                store.commit(&msg).unwrap();
            }
        }

        let store = BlobStore::open(dir.path(), 1).unwrap();
        let restored: BTreeSet<String> =
            store.iterate().unwrap().into_iter().map(|s| s.uuid).collect();
        assert_eq!(restored, uuids);
    }

    #[test]
    fn restored_messages_carry_payload_and_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), 1).unwrap();

        let msg = message(b"hello");
        store.commit(&msg).unwrap();

        let stored = store.iterate().unwrap().pop().unwrap();
        let back = stored.into_message();
        assert_eq!(back.uuid(), msg.uuid());
        assert_eq!(back.payload().as_ref(), b"hello");
        assert_eq!(back.policy().deadline, Duration::from_secs(60));
        assert_eq!(back.path().service(), "svc");
    }

    #[test]
    fn remove_deletes_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), 1).unwrap();

        let msg = message(b"x");
        store.commit(&msg).unwrap();
        assert!(store.contains(msg.uuid()));

        store.remove(msg.uuid()).unwrap();
        assert!(!store.contains(msg.uuid()));
        store.remove(msg.uuid()).unwrap();
    }

    #[test]
    fn corrupt_blobs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), 1).unwrap();

        let msg = message(b"ok");
        store.commit(&msg).unwrap();
        fs::write(dir.path().join("broken.blob"), b"\xc1\xc1\xc1").unwrap();

        let restored = store.iterate().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].uuid, msg.uuid());
    }

    #[test]
    fn recommit_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), 1).unwrap();

        let msg = message(b"x");
        store.commit(&msg).unwrap();
        store.commit(&msg).unwrap();
        assert_eq!(store.iterate().unwrap().len(), 1);
    }
}
