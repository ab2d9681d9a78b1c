//! Session actor types and protocol.
//!
//! This module defines the command protocol for communicating with session actors,
//! along with configuration and error types.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::{AppendOutcome, Engine, EngineError, EngineFactory, EngineResult, Generation};
use crate::model::ModelDescriptor;
use crate::store::{InitCacheKey, InitCacheStore};

// ============================================================================
// Session Command
// ============================================================================

/// Commands that can be sent to a session actor.
pub enum SessionCommand {
    // Engine operations
    Append {
        text: String,
        /// The context ends with an open user turn once this text is in.
        opens_user_turn: bool,
        progress: mpsc::UnboundedSender<f32>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<AppendOutcome, SessionError>>,
    },
    Generate {
        stop: String,
        tokens: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Generation, SessionError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Serialize {
        reply: oneshot::Sender<Result<Vec<u8>, SessionError>>,
    },

    // Read operations
    GetInfo {
        reply: oneshot::Sender<SessionInfo>,
    },

    // Lifecycle
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The actor has shut down.
    #[error("session actor has shut down")]
    ActorShutdown,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SessionError {
    pub fn is_context_length_exceeded(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_context_length_exceeded())
    }
}

// ============================================================================
// Info
// ============================================================================

/// Snapshot of a session's state (returned by `GetInfo`).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub model: String,
    pub instruct_mode: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Zero when the engine is gone (failed rebuild after reset).
    pub context_fill: usize,
    pub context_size: usize,
    pub user_turn_open: bool,
}

impl SessionInfo {
    /// Context fill as a percentage of the capacity.
    pub fn fill_percent(&self) -> f32 {
        if self.context_size == 0 {
            return 0.0;
        }
        self.context_fill as f32 * 100.0 / self.context_size as f32
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Where a session's starting context came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoredFrom {
    /// State persisted when the conversation was last evicted or stored.
    Persisted,
    InitCache,
    Empty,
}

/// Everything needed to build, or rebuild, the engine of a session.
#[derive(Clone)]
pub struct EngineSeed {
    pub factory: Arc<dyn EngineFactory>,
    pub model: Arc<ModelDescriptor>,
    pub instruct_mode: bool,
    pub init_caches: Option<Arc<dyn InitCacheStore>>,
}

impl EngineSeed {
    pub fn cache_key(&self) -> InitCacheKey {
        InitCacheKey::new(&self.model.name, self.instruct_mode)
    }

    /// Load a fresh, empty engine for the model.
    pub async fn create_engine(&self) -> EngineResult<Box<dyn Engine>> {
        self.factory.create(&self.model).await
    }

    /// Restore the init cache of this model and mode into `engine`.
    ///
    /// Missing or unreadable caches are warnings; the engine keeps whatever
    /// context it had. Returns whether the cache was applied.
    pub async fn restore_init_cache(&self, engine: &mut dyn Engine) -> bool {
        let Some(store) = &self.init_caches else {
            return false;
        };
        let key = self.cache_key();

        let blob = match store.load(&key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                warn!(cache = %key, "Init cache not found, starting with empty context");
                return false;
            }
            Err(e) => {
                warn!(cache = %key, error = %e, "Failed to read init cache");
                return false;
            }
        };

        match engine.deserialize(&blob).await {
            Ok(()) => true,
            Err(e) => {
                warn!(cache = %key, error = %e, "Corrupt init cache, starting with empty context");
                false
            }
        }
    }
}

/// Configuration for spawning a new actor around an already constructed engine.
pub struct ActorConfig {
    pub id: String,
    pub seed: EngineSeed,
    pub engine: Box<dyn Engine>,
    pub restored_from: RestoredFrom,
}

// ============================================================================
// Constants
// ============================================================================

/// Channel capacity for commands.
///
/// Only the task holding the conversation's fairness gate sends engine
/// commands, so the queue stays short.
pub const CHANNEL_CAPACITY: usize = 32;
