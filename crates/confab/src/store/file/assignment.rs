//! File-based assignment table.
//!
//! The whole table lives in one YAML document keyed by conversation id. It is
//! read once, cached in memory, and rewritten atomically on every change.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::assignment::{AssignmentStore, ChannelAssignment};
use crate::store::error::{StorageError, StorageResult};

use super::{read_optional, write_atomic};

type Table = BTreeMap<String, ChannelAssignment>;

/// File-based implementation of `AssignmentStore`.
#[derive(Debug)]
pub struct FileAssignmentStore {
    path: PathBuf,
    table: RwLock<Option<Table>>,
}

impl FileAssignmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: RwLock::new(None),
        }
    }

    async fn read_table(&self) -> StorageResult<Table> {
        let Some(bytes) = read_optional(&self.path).await? else {
            return Ok(Table::new());
        };
        let contents = String::from_utf8(bytes)
            .map_err(|e| StorageError::file_deserialization(&self.path, e.to_string()))?;
        if contents.trim().is_empty() {
            return Ok(Table::new());
        }
        serde_saphyr::from_str(&contents)
            .map_err(|e| StorageError::file_deserialization(&self.path, e.to_string()))
    }

    async fn write_table(&self, table: &Table) -> StorageResult<()> {
        let yaml =
            serde_saphyr::to_string(table).map_err(|e| StorageError::serialization(e.to_string()))?;
        write_atomic(&self.path, yaml.as_bytes()).await
    }

    /// Run `f` against the loaded table while holding the write lock.
    async fn with_table_mut<T>(&self, f: impl FnOnce(&mut Table) -> T) -> StorageResult<T> {
        let mut guard = self.table.write().await;
        if guard.is_none() {
            *guard = Some(self.read_table().await?);
        }
        let table = guard.get_or_insert_with(Table::new);
        let mut updated = table.clone();
        let result = f(&mut updated);
        self.write_table(&updated).await?;
        *table = updated;
        Ok(result)
    }
}

#[async_trait]
impl AssignmentStore for FileAssignmentStore {
    async fn get(&self, conversation_id: &str) -> StorageResult<Option<ChannelAssignment>> {
        {
            let guard = self.table.read().await;
            if let Some(table) = guard.as_ref() {
                return Ok(table.get(conversation_id).cloned());
            }
        }

        let mut guard = self.table.write().await;
        if guard.is_none() {
            *guard = Some(self.read_table().await?);
        }
        Ok(guard
            .as_ref()
            .and_then(|table| table.get(conversation_id).cloned()))
    }

    async fn put(
        &self,
        conversation_id: &str,
        assignment: ChannelAssignment,
    ) -> StorageResult<()> {
        let id = conversation_id.to_string();
        self.with_table_mut(move |table| {
            table.insert(id, assignment);
        })
        .await
    }

    async fn remove(&self, conversation_id: &str) -> StorageResult<bool> {
        self.with_table_mut(|table| table.remove(conversation_id).is_some())
            .await
    }
}
