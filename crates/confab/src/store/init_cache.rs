//! Init caches: engine state right after the preamble was replayed.

use std::fmt;

use async_trait::async_trait;

use super::error::StorageResult;

/// Identifies one init cache: a model in one prompting mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitCacheKey {
    pub model: String,
    pub instruct_mode: bool,
}

impl InitCacheKey {
    pub fn new(model: impl Into<String>, instruct_mode: bool) -> Self {
        Self {
            model: model.into(),
            instruct_mode,
        }
    }

    /// Blob name: `{model}_init_cache` or `{model}_instruct_init_cache`.
    pub fn file_name(&self) -> String {
        if self.instruct_mode {
            format!("{}_instruct_init_cache", self.model)
        } else {
            format!("{}_init_cache", self.model)
        }
    }
}

impl fmt::Display for InitCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Storage interface for init caches.
#[async_trait]
pub trait InitCacheStore: Send + Sync {
    /// Load a cache blob. Returns `Ok(None)` if it was never built.
    async fn load(&self, key: &InitCacheKey) -> StorageResult<Option<Vec<u8>>>;

    /// Save a cache blob atomically.
    async fn save(&self, key: &InitCacheKey, state: &[u8]) -> StorageResult<()>;

    /// Whether a cache blob exists.
    async fn exists(&self, key: &InitCacheKey) -> StorageResult<bool>;
}
