//! Per-session actor that exclusively owns one engine.
//!
//! Every engine call goes through the actor's mailbox, so two callers can never
//! touch the same engine at once. The actor also tracks the bits of session
//! state the pipeline needs between turns (open user turn, activity time).

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{AppendOutcome, Engine, EngineError, Generation};

use super::actor_types::{
    ActorConfig, CHANNEL_CAPACITY, EngineSeed, RestoredFrom, SessionCommand, SessionError,
    SessionInfo,
};

// ============================================================================
// Session Actor
// ============================================================================

pub struct SessionActor {
    // Identity
    id: String,
    seed: EngineSeed,

    // State
    /// `None` after a reset failed to build a new engine.
    engine: Option<Box<dyn Engine>>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    user_turn_open: bool,

    // Communication
    command_rx: mpsc::Receiver<SessionCommand>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionActor {
    /// Spawn an actor around an engine whose starting context is already in place.
    ///
    /// Returns the command sender and a JoinHandle for the actor task.
    pub fn spawn(
        config: ActorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (mpsc::Sender<SessionCommand>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let now = Utc::now();

        // A stored instruct-mode conversation rests on an open user turn
        let user_turn_open =
            config.restored_from == RestoredFrom::Persisted && config.seed.instruct_mode;

        let actor = Self {
            id: config.id,
            seed: config.seed,
            engine: Some(config.engine),
            created_at: now,
            last_activity: now,
            user_turn_open,
            command_rx: rx,
            shutdown_rx,
        };

        let handle = tokio::spawn(actor.run());
        (tx, handle)
    }

    async fn run(mut self) {
        debug!(conversation = %self.id, model = %self.seed.model.name, "Session actor started");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!(conversation = %self.id, "Session actor received shutdown signal");
                        break;
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Close { reply }) => {
                            self.release_engine().await;
                            let _ = reply.send(());
                            debug!(conversation = %self.id, "Session actor closed");
                            return;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!(conversation = %self.id, "All handles dropped, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.release_engine().await;
        debug!(conversation = %self.id, "Session actor stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Append {
                text,
                opens_user_turn,
                progress,
                cancel,
                reply,
            } => {
                let result = self.append(&text, opens_user_turn, progress, &cancel).await;
                let _ = reply.send(result);
            }
            SessionCommand::Generate {
                stop,
                tokens,
                cancel,
                reply,
            } => {
                let result = self.generate(&stop, tokens, &cancel).await;
                let _ = reply.send(result);
            }
            SessionCommand::Reset { reply } => {
                let result = self.reset().await;
                let _ = reply.send(result);
            }
            SessionCommand::Serialize { reply } => {
                let result = self.serialize().await;
                let _ = reply.send(result);
            }
            SessionCommand::GetInfo { reply } => {
                let _ = reply.send(self.info());
            }
            SessionCommand::Close { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn engine_mut(&mut self) -> Result<&mut Box<dyn Engine>, SessionError> {
        self.engine
            .as_mut()
            .ok_or_else(|| EngineError::unavailable("engine was released").into())
    }

    async fn append(
        &mut self,
        text: &str,
        opens_user_turn: bool,
        progress: mpsc::UnboundedSender<f32>,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome, SessionError> {
        self.last_activity = Utc::now();
        let engine = self.engine_mut()?;
        let outcome = engine
            .append(text, cancel, &mut |percent: f32| {
                let _ = progress.send(percent);
            })
            .await?;
        self.user_turn_open = opens_user_turn && !outcome.interrupted;
        Ok(outcome)
    }

    async fn generate(
        &mut self,
        stop: &str,
        tokens: mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<Generation, SessionError> {
        self.last_activity = Utc::now();
        let engine = self.engine_mut()?;
        let generation = engine
            .run(stop, cancel, &mut |token: &str| {
                let _ = tokens.send(token.to_string());
            })
            .await?;
        // Instruct generations stop on the user prompt, leaving that turn open
        self.user_turn_open = generation.hit_stop && self.seed.instruct_mode;
        Ok(generation)
    }

    /// Bring the context back to the model's starting point.
    ///
    /// Prefers replaying the init cache into the current engine. Without a
    /// usable cache the engine is released before a replacement is built, so
    /// the conversation never holds two engines.
    async fn reset(&mut self) -> Result<(), SessionError> {
        self.last_activity = Utc::now();
        self.user_turn_open = false;

        if let Some(engine) = self.engine.as_mut()
            && self.seed.restore_init_cache(&mut **engine).await
        {
            info!(conversation = %self.id, "Session reset from init cache");
            return Ok(());
        }

        self.release_engine().await;
        let engine = self.seed.create_engine().await?;
        self.engine = Some(engine);
        info!(conversation = %self.id, "Session reset with a fresh engine");
        Ok(())
    }

    async fn serialize(&mut self) -> Result<Vec<u8>, SessionError> {
        Ok(self.engine_mut()?.serialize().await?)
    }

    fn info(&self) -> SessionInfo {
        let (context_fill, context_size) = self
            .engine
            .as_ref()
            .map(|e| (e.context_fill(), e.context_size()))
            .unwrap_or((0, 0));

        SessionInfo {
            id: self.id.clone(),
            model: self.seed.model.name.clone(),
            instruct_mode: self.seed.instruct_mode,
            created_at: self.created_at,
            last_activity: self.last_activity,
            context_fill,
            context_size,
            user_turn_open: self.user_turn_open,
        }
    }

    async fn release_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.shutdown().await;
        }
    }
}
