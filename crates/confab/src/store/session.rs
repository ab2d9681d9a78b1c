//! Persisted conversation state.
//!
//! Engine state is an opaque blob owned by the engine implementation; the store
//! only tracks presence per conversation id.

use async_trait::async_trait;

use super::error::StorageResult;

/// Storage interface for serialized engine state, keyed by conversation id.
#[async_trait]
pub trait SessionStateStore: Send + Sync {
    /// Load the state for a conversation.
    ///
    /// Returns `Ok(None)` if nothing was persisted.
    async fn load(&self, conversation_id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the state for a conversation, replacing any previous one.
    ///
    /// Must be atomic - either fully succeeds or has no effect.
    async fn save(&self, conversation_id: &str, state: &[u8]) -> StorageResult<()>;

    /// Delete persisted state. Missing state is not an error.
    async fn delete(&self, conversation_id: &str) -> StorageResult<()>;

    /// List conversation ids with persisted state.
    async fn list(&self) -> StorageResult<Vec<String>>;
}
