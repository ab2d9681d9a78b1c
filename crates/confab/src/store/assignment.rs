//! Conversation assignment table.
//!
//! Maps a conversation (usually a thread the bot created) to the model and mode
//! it talks in. Written once when the thread is created, read on every message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StorageResult;

/// Assignment of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAssignment {
    /// Catalog name of the model.
    pub model: String,
    #[serde(default)]
    pub instruct_mode: bool,
    /// Shard that created the conversation and therefore owns it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_shard: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Key-value interface for the assignment table.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Look up a conversation. Returns `Ok(None)` for unassigned conversations.
    async fn get(&self, conversation_id: &str) -> StorageResult<Option<ChannelAssignment>>;

    /// Insert or replace an assignment.
    async fn put(&self, conversation_id: &str, assignment: ChannelAssignment)
    -> StorageResult<()>;

    /// Remove an assignment. Returns true if one existed.
    async fn remove(&self, conversation_id: &str) -> StorageResult<bool>;
}
