//! Session handle for communicating with a session actor.
//!
//! `SessionHandle` is a thin wrapper around an `mpsc::Sender<SessionCommand>`.
//! It provides async methods for all session operations and is cheap to clone.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::engine::{AppendOutcome, Generation};
use crate::model::ModelDescriptor;

use super::actor_types::{SessionCommand, SessionError, SessionInfo};

/// Handle for interacting with a session actor.
///
/// Every method is a suspension point: the caller waits while the actor runs
/// the engine call.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    id: String,
    model: Arc<ModelDescriptor>,
    instruct_mode: bool,
}

impl SessionHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<SessionCommand>,
        id: String,
        model: Arc<ModelDescriptor>,
        instruct_mode: bool,
    ) -> Self {
        Self {
            tx,
            id,
            model,
            instruct_mode,
        }
    }

    /// Conversation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &Arc<ModelDescriptor> {
        &self.model
    }

    pub fn instruct_mode(&self) -> bool {
        self.instruct_mode
    }

    /// Whether both handles talk to the same actor.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Whether the actor is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    // ------------------------------------------------------------------------
    // Engine Operations
    // ------------------------------------------------------------------------

    /// Evaluate `text` into the context.
    ///
    /// Progress percentages are sent to `progress` while the engine works.
    /// `opens_user_turn` records that the text ends with the user prompt.
    pub async fn append(
        &self,
        text: String,
        opens_user_turn: bool,
        progress: mpsc::UnboundedSender<f32>,
        cancel: CancellationToken,
    ) -> Result<AppendOutcome, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Append {
                text,
                opens_user_turn,
                progress,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ActorShutdown)?;

        reply_rx.await.map_err(|_| SessionError::ActorShutdown)?
    }

    /// Generate until `stop`, sending each token to `tokens`.
    pub async fn generate(
        &self,
        stop: String,
        tokens: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<Generation, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Generate {
                stop,
                tokens,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ActorShutdown)?;

        reply_rx.await.map_err(|_| SessionError::ActorShutdown)?
    }

    /// Drop the accumulated context and start over from the init cache.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Reset { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ActorShutdown)?;

        reply_rx.await.map_err(|_| SessionError::ActorShutdown)?
    }

    /// Serialize the engine state into an opaque blob.
    pub async fn serialize(&self) -> Result<Vec<u8>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Serialize { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ActorShutdown)?;

        reply_rx.await.map_err(|_| SessionError::ActorShutdown)?
    }

    // ------------------------------------------------------------------------
    // Read Operations
    // ------------------------------------------------------------------------

    pub async fn info(&self) -> Result<SessionInfo, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::GetInfo { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ActorShutdown)?;

        reply_rx.await.map_err(|_| SessionError::ActorShutdown)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Release the engine and stop the actor. Closing twice is a no-op.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::Close { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("model", &self.model.name)
            .field("instruct_mode", &self.instruct_mode)
            .finish()
    }
}
