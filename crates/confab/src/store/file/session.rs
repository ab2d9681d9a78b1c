//! File-based conversation state storage.
//!
//! Directory structure:
//! ```text
//! {sessions_dir}/
//!   {conversation_id}.state    # Serialized engine state
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::store::error::{StorageError, StorageResult};
use crate::store::is_safe_key;
use crate::store::session::SessionStateStore;

use super::{read_optional, write_atomic};

const STATE_EXTENSION: &str = "state";

/// File-based implementation of `SessionStateStore`.
#[derive(Debug, Clone)]
pub struct FileSessionStateStore {
    sessions_dir: PathBuf,
}

impl FileSessionStateStore {
    /// Create a new store. The directory is created on first save.
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    fn state_path(&self, conversation_id: &str) -> StorageResult<PathBuf> {
        if !is_safe_key(conversation_id) {
            return Err(StorageError::invalid_key("conversation", conversation_id));
        }
        Ok(self
            .sessions_dir
            .join(format!("{conversation_id}.{STATE_EXTENSION}")))
    }
}

#[async_trait]
impl SessionStateStore for FileSessionStateStore {
    async fn load(&self, conversation_id: &str) -> StorageResult<Option<Vec<u8>>> {
        read_optional(&self.state_path(conversation_id)?).await
    }

    async fn save(&self, conversation_id: &str, state: &[u8]) -> StorageResult<()> {
        write_atomic(&self.state_path(conversation_id)?, state).await
    }

    async fn delete(&self, conversation_id: &str) -> StorageResult<()> {
        let path = self.state_path(conversation_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::file_io(&self.sessions_dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::file_io(&self.sessions_dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == STATE_EXTENSION)
                && let Some(stem) = path.file_stem()
            {
                ids.push(stem.to_string_lossy().to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_missing_returns_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStateStore::new(tmp.path());
        assert!(store.load("123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_same_blob() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStateStore::new(tmp.path().join("sessions"));

        store.save("123", b"\x00\x01engine").await.unwrap();
        assert_eq!(
            store.load("123").await.unwrap().as_deref(),
            Some(&b"\x00\x01engine"[..])
        );
        // No temp file left behind
        assert!(!tmp.path().join("sessions/123.state.tmp").exists());
    }

    #[tokio::test]
    async fn save_replaces_previous_state() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStateStore::new(tmp.path());

        store.save("c", b"old").await.unwrap();
        store.save("c", b"new").await.unwrap();
        assert_eq!(store.load("c").await.unwrap().unwrap(), b"new");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStateStore::new(tmp.path());

        store.save("c", b"x").await.unwrap();
        store.delete("c").await.unwrap();
        store.delete("c").await.unwrap();
        assert!(store.load("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_only_state_files() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStateStore::new(tmp.path());

        store.save("b", b"x").await.unwrap();
        store.save("a", b"x").await.unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let tmp = TempDir::new().unwrap();
        let store = FileSessionStateStore::new(tmp.path());

        let err = store.save("../escape", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }));
    }
}
