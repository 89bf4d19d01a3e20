use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("queue file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("no queue entry with id {0}")]
    UnknownEntry(Uuid),
}

/// Ordered, durable sequence of codable entries. One file per
/// `(queue identifier, group directory)` pair; every mutation rewrites the
/// file (temp sibling + rename) before returning, so the on-disk state after
/// a successful call always reflects the call.
pub struct PersistentQueueStore<T> {
    path: PathBuf,
    entries: Vec<T>,
}

impl<T: Serialize + DeserializeOwned + Clone> PersistentQueueStore<T> {
    /// Open the queue `queue_id` inside `group_dir`, creating an empty one if
    /// no file exists yet.
    pub fn open(group_dir: &Path, queue_id: &str) -> Result<Self, QueueError> {
        fs::create_dir_all(group_dir)?;
        let path = group_dir.join(format!("{queue_id}.queue.json"));
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: T) -> Result<(), QueueError> {
        self.entries.push(entry);
        self.persist()
    }

    pub fn remove_at(&mut self, index: usize) -> Result<T, QueueError> {
        let removed = self.entries.remove(index);
        self.persist()?;
        Ok(removed)
    }

    pub fn replace_at(&mut self, index: usize, entry: T) -> Result<(), QueueError> {
        self.entries[index] = entry;
        self.persist()
    }

    /// Empties the queue but keeps the store on disk.
    pub fn clear(&mut self) -> Result<(), QueueError> {
        self.entries.clear();
        self.persist()
    }

    /// Removes the persisted store entirely.
    pub fn delete(self) -> Result<(), QueueError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self) -> Result<(), QueueError> {
        let tmp = self.path.with_extension("json.partial");
        let bytes = serde_json::to_vec(&self.entries)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    PendingUpload,
    Uploading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLocation {
    Repository,
    LocalFiles,
}

/// Remote destination of a queued upload; absent for purely local saves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub repository_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: Uuid,
    pub account_identifier: String,
    pub repository_node: Option<NodeRef>,
    pub file_url: PathBuf,
    pub status: UploadStatus,
    pub source_location: SourceLocation,
    pub queued_at: i64,
}

impl FileMetadata {
    pub fn new(
        account_identifier: impl Into<String>,
        repository_node: Option<NodeRef>,
        file_url: PathBuf,
        source_location: SourceLocation,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_identifier: account_identifier.into(),
            repository_node,
            file_url,
            status: UploadStatus::PendingUpload,
            source_location,
            queued_at: super::store::now_unix(),
        }
    }
}

/// Durable FIFO of pending local-file-to-remote-node transfers. Entries stay
/// in the persisted store from `enqueue` until `complete`; a crash between
/// the two replays the upload (at-least-once).
pub struct UploadQueue {
    store: PersistentQueueStore<FileMetadata>,
}

impl UploadQueue {
    pub const QUEUE_ID: &'static str = "uploads";

    pub fn open(group_dir: &Path) -> Result<Self, QueueError> {
        let mut store: PersistentQueueStore<FileMetadata> =
            PersistentQueueStore::open(group_dir, Self::QUEUE_ID)?;
        // Entries caught mid-dispatch by a crash go back to pending.
        let stale: Vec<usize> = store
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == UploadStatus::Uploading)
            .map(|(i, _)| i)
            .collect();
        for index in stale {
            let mut entry = store.entries()[index].clone();
            entry.status = UploadStatus::PendingUpload;
            store.replace_at(index, entry)?;
        }
        Ok(Self { store })
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn entries(&self) -> &[FileMetadata] {
        self.store.entries()
    }

    /// Queue a file for upload. A pending entry for the same
    /// `(account, file url)` pair is replaced in place rather than duplicated.
    pub fn enqueue(&mut self, metadata: FileMetadata) -> Result<(), QueueError> {
        let existing = self.store.entries().iter().position(|e| {
            e.account_identifier == metadata.account_identifier && e.file_url == metadata.file_url
        });
        match existing {
            Some(index) => self.store.replace_at(index, metadata),
            None => self.store.append(metadata),
        }
    }

    /// Oldest pending entry, marked `Uploading` in the persisted store. The
    /// entry is not removed; removal happens through [`UploadQueue::complete`].
    pub fn dequeue_next(&mut self) -> Result<Option<FileMetadata>, QueueError> {
        let Some(index) = self
            .store
            .entries()
            .iter()
            .position(|e| e.status == UploadStatus::PendingUpload)
        else {
            return Ok(None);
        };
        let mut entry = self.store.entries()[index].clone();
        entry.status = UploadStatus::Uploading;
        self.store.replace_at(index, entry.clone())?;
        Ok(Some(entry))
    }

    pub fn complete(&mut self, id: Uuid) -> Result<(), QueueError> {
        let index = self
            .store
            .entries()
            .iter()
            .position(|e| e.id == id)
            .ok_or(QueueError::UnknownEntry(id))?;
        self.store.remove_at(index)?;
        Ok(())
    }

    /// Reset a failed dispatch to pending and move it behind the other
    /// entries. Retry budgeting is the caller's job.
    pub fn fail_and_requeue(&mut self, id: Uuid) -> Result<(), QueueError> {
        let index = self
            .store
            .entries()
            .iter()
            .position(|e| e.id == id)
            .ok_or(QueueError::UnknownEntry(id))?;
        let mut entry = self.store.remove_at(index)?;
        entry.status = UploadStatus::PendingUpload;
        self.store.append(entry)
    }
}
