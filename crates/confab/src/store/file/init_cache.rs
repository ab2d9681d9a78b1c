//! File-based init cache storage.
//!
//! Directory structure:
//! ```text
//! {cache_dir}/
//!   {model}_init_cache             # Freeform-mode preamble state
//!   {model}_instruct_init_cache    # Instruct-mode preamble state
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::store::error::{StorageError, StorageResult};
use crate::store::init_cache::{InitCacheKey, InitCacheStore};
use crate::store::is_safe_key;

use super::{read_optional, write_atomic};

/// File-based implementation of `InitCacheStore`.
#[derive(Debug, Clone)]
pub struct FileInitCacheStore {
    cache_dir: PathBuf,
}

impl FileInitCacheStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    fn cache_path(&self, key: &InitCacheKey) -> StorageResult<PathBuf> {
        if !is_safe_key(&key.model) {
            return Err(StorageError::invalid_key("model", &key.model));
        }
        Ok(self.cache_dir.join(key.file_name()))
    }
}

#[async_trait]
impl InitCacheStore for FileInitCacheStore {
    async fn load(&self, key: &InitCacheKey) -> StorageResult<Option<Vec<u8>>> {
        read_optional(&self.cache_path(key)?).await
    }

    async fn save(&self, key: &InitCacheKey, state: &[u8]) -> StorageResult<()> {
        write_atomic(&self.cache_path(key)?, state).await
    }

    async fn exists(&self, key: &InitCacheKey) -> StorageResult<bool> {
        let path = self.cache_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::file_io(&path, e))
    }
}
