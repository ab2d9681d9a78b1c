//! Chat transport boundary.
//!
//! The transport delivers messages to the chat platform. confab only needs to
//! post, edit, and optionally open threads; everything else (rate limits,
//! command registration, reconnects) stays on the platform side.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport does not support {0}")]
    Unsupported(&'static str),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("transport failed: {0}")]
    Failed(String),
}

/// Outbound side of a chat platform.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post a message. Returns the platform message id.
    async fn send_message(&self, conversation_id: &str, text: &str)
    -> Result<String, TransportError>;

    /// Replace the text of a message the bot posted earlier.
    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), TransportError>;

    /// Open a thread on `message_id`. Returns the new conversation id.
    async fn create_thread(
        &self,
        _conversation_id: &str,
        _message_id: &str,
        _title: &str,
    ) -> Result<String, TransportError> {
        Err(TransportError::Unsupported("threads"))
    }
}

// ============================================================================
// Bot message cache
// ============================================================================

/// Bounded set of message ids the bot posted, used to recognize replies to it.
pub struct BotMessageCache {
    // std::sync::Mutex is correct here: never held across .await points
    ids: Mutex<LruCache<String, ()>>,
}

impl BotMessageCache {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn insert(&self, message_id: impl Into<String>) {
        self.ids
            .lock()
            .expect("mutex poisoned")
            .put(message_id.into(), ());
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.lock().expect("mutex poisoned").contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BotMessageCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
