//! Durable local journal backing the offline vote queue.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::dao::{
    models::VoteEntity,
    storage::{StorageError, StorageResult},
};

/// A vote that could not reach the remote store, persisted for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVote {
    /// Local identity of the journal entry.
    pub entry_id: Uuid,
    #[serde(flatten)]
    pub vote: VoteEntity,
}

impl PendingVote {
    /// Wrap a vote into a fresh journal entry.
    pub fn new(vote: VoteEntity) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            vote,
        }
    }
}

/// Append-only journal with whole-content replacement. `append` is durable once it returns.
pub trait VoteJournal: Send + Sync {
    fn append(&self, entry: PendingVote) -> BoxFuture<'static, StorageResult<()>>;
    fn read_all(&self) -> BoxFuture<'static, StorageResult<Vec<PendingVote>>>;
    fn replace_all(&self, entries: Vec<PendingVote>) -> BoxFuture<'static, StorageResult<()>>;
}

/// Journal stored as a JSON array on disk, rewritten atomically through a temp file.
#[derive(Clone)]
pub struct FileJournal {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileJournal {
    /// Journal at `path`. The file and its parent directory are created lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Location of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StorageResult<Vec<PendingVote>> {
        match fs::read(self.path.as_path()).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StorageError::journal(format!("corrupt journal {}", self.path.display()), source)
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StorageError::journal(
                format!("failed to read {}", self.path.display()),
                err,
            )),
        }
    }

    async fn store(&self, entries: &[PendingVote]) -> StorageResult<()> {
        let path = self.path.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| {
                StorageError::journal(format!("failed to create {}", parent.display()), source)
            })?;
        }

        let payload = serde_json::to_vec_pretty(entries)
            .map_err(|source| StorageError::journal("failed to encode journal", source))?;
        let tmp = path.with_extension("tmp");

        let mut file = fs::File::create(&tmp).await.map_err(|source| {
            StorageError::journal(format!("failed to create {}", tmp.display()), source)
        })?;
        file.write_all(&payload).await.map_err(|source| {
            StorageError::journal(format!("failed to write {}", tmp.display()), source)
        })?;
        file.sync_all().await.map_err(|source| {
            StorageError::journal(format!("failed to sync {}", tmp.display()), source)
        })?;
        drop(file);

        fs::rename(&tmp, path).await.map_err(|source| {
            StorageError::journal(format!("failed to replace {}", path.display()), source)
        })?;
        debug!(path = %path.display(), entries = entries.len(), "journal written");
        Ok(())
    }
}

impl VoteJournal for FileJournal {
    fn append(&self, entry: PendingVote) -> BoxFuture<'static, StorageResult<()>> {
        let journal = self.clone();
        Box::pin(async move {
            let _guard = journal.lock.lock().await;
            let mut entries = journal.load().await?;
            entries.push(entry);
            journal.store(&entries).await
        })
    }

    fn read_all(&self) -> BoxFuture<'static, StorageResult<Vec<PendingVote>>> {
        let journal = self.clone();
        Box::pin(async move {
            let _guard = journal.lock.lock().await;
            journal.load().await
        })
    }

    fn replace_all(&self, entries: Vec<PendingVote>) -> BoxFuture<'static, StorageResult<()>> {
        let journal = self.clone();
        Box::pin(async move {
            let _guard = journal.lock.lock().await;
            journal.store(&entries).await
        })
    }
}

/// Volatile journal, for tests and for clients without writable storage.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    entries: Arc<Mutex<Vec<PendingVote>>>,
}

impl MemoryJournal {
    /// Empty journal.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VoteJournal for MemoryJournal {
    fn append(&self, entry: PendingVote) -> BoxFuture<'static, StorageResult<()>> {
        let entries = self.entries.clone();
        Box::pin(async move {
            entries.lock().await.push(entry);
            Ok(())
        })
    }

    fn read_all(&self) -> BoxFuture<'static, StorageResult<Vec<PendingVote>>> {
        let entries = self.entries.clone();
        Box::pin(async move { Ok(entries.lock().await.clone()) })
    }

    fn replace_all(&self, replacement: Vec<PendingVote>) -> BoxFuture<'static, StorageResult<()>> {
        let entries = self.entries.clone();
        Box::pin(async move {
            *entries.lock().await = replacement;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn vote(player: &str) -> VoteEntity {
        VoteEntity {
            activation_id: "act".into(),
            player_id: player.into(),
            option_id: Some("opt-a".into()),
            option_text: "A".into(),
            created_at: datetime!(2026-03-01 12:00:00 UTC),
        }
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(dir.path().join("nested").join("votes.json"));

        assert!(journal.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn appended_entries_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("votes.json");

        let journal = FileJournal::new(&path);
        journal.append(PendingVote::new(vote("p1"))).await.unwrap();
        journal.append(PendingVote::new(vote("p2"))).await.unwrap();

        let reopened = FileJournal::new(&path);
        let entries = reopened.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].vote.player_id, "p2");
    }

    #[tokio::test]
    async fn replace_all_overwrites_content() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(dir.path().join("votes.json"));
        journal.append(PendingVote::new(vote("p1"))).await.unwrap();

        journal.replace_all(Vec::new()).await.unwrap();

        assert!(journal.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_journal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("votes.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileJournal::new(&path).read_all().await.unwrap_err();
        assert!(matches!(err, StorageError::Journal { .. }));
    }
}
