//! Engine backed by a worker process.
//!
//! Each engine spawns one worker that loads the model and speaks the
//! `confab-engine-protocol` JSON Lines protocol over stdio. The worker is
//! killed when the engine is dropped, and on Linux also when confab dies.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use confab_engine_protocol::{EngineCommand, EngineEvent, error_codes};

use crate::config::EngineConfig;
use crate::model::ModelDescriptor;

use super::{
    AppendOutcome, Engine, EngineError, EngineFactory, EngineResult, Generation, ProgressFn,
    TokenFn,
};

/// How long a worker gets to exit after `shutdown` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Factory
// ============================================================================

/// Spawns one worker process per engine.
#[derive(Debug, Clone)]
pub struct SubprocessEngineFactory {
    config: EngineConfig,
}

impl SubprocessEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineFactory for SubprocessEngineFactory {
    async fn create(&self, model: &ModelDescriptor) -> EngineResult<Box<dyn Engine>> {
        let engine = SubprocessEngine::spawn(&self.config, model).await?;
        Ok(Box::new(engine))
    }
}

// ============================================================================
// Engine
// ============================================================================

/// One worker process holding one model context.
pub struct SubprocessEngine {
    model: String,
    child: Child,
    stdin: ChildStdin,
    events: Lines<BufReader<ChildStdout>>,
    context_size: usize,
    context_fill: usize,
}

impl SubprocessEngine {
    /// Spawn a worker for `model` and wait until it reports ready.
    pub async fn spawn(config: &EngineConfig, model: &ModelDescriptor) -> EngineResult<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .arg("--model")
            .arg(&model.weights_path)
            .arg("--context-size")
            .arg(config.context_size.to_string())
            .arg("--threads")
            .arg(config.threads.to_string())
            .arg("--scroll-keep")
            .arg(config.scroll_keep.to_string())
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if config.mlock {
            cmd.arg("--mlock");
        }

        // On Linux, set PR_SET_PDEATHSIG so the worker dies with us
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::unavailable(format!("failed to spawn '{}': {e}", config.command))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EngineError::unavailable("worker stdio was not piped"));
        };

        let mut engine = Self {
            model: model.name.clone(),
            child,
            stdin,
            events: BufReader::new(stdout).lines(),
            context_size: config.context_size as usize,
            context_fill: 0,
        };

        let startup = Duration::from_secs(config.startup_timeout_seconds);
        match tokio::time::timeout(startup, engine.next_event()).await {
            Ok(Ok(EngineEvent::Ready {
                version,
                context_size,
            })) => {
                engine.context_size = context_size as usize;
                info!(
                    model = %engine.model,
                    version = %version,
                    context_size,
                    "Engine worker ready"
                );
                Ok(engine)
            }
            Ok(Ok(EngineEvent::Error { code, message })) => Err(EngineError::unavailable(
                format!("worker failed to load model ({code}): {message}"),
            )),
            Ok(Ok(other)) => Err(EngineError::unavailable(format!(
                "worker sent {other:?} before ready"
            ))),
            Ok(Err(e)) => Err(EngineError::unavailable(e.to_string())),
            Err(_) => Err(EngineError::unavailable(format!(
                "worker not ready after {}s",
                startup.as_secs()
            ))),
        }
    }

    async fn send(&mut self, command: &EngineCommand) -> EngineResult<()> {
        let json = serde_json::to_string(command)
            .map_err(|e| EngineError::protocol(format!("failed to encode command: {e}")))?;
        let line = format!("{json}\n");
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read the next well-formed event, skipping lines that do not parse.
    async fn next_event(&mut self) -> EngineResult<EngineEvent> {
        loop {
            let Some(line) = self.events.next_line().await? else {
                return Err(EngineError::unavailable("worker closed its output"));
            };
            match serde_json::from_str::<EngineEvent>(&line) {
                Ok(event) => return Ok(event),
                Err(e) => {
                    warn!(model = %self.model, line = %line, error = %e, "Failed to parse engine event");
                }
            }
        }
    }

    /// Wait for the next event, sending `interrupt` once if `cancel` fires first.
    async fn next_event_or_interrupt(
        &mut self,
        cancel: &CancellationToken,
        interrupted: &mut bool,
    ) -> EngineResult<EngineEvent> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !*interrupted => {
                    debug!(model = %self.model, "Interrupting engine worker");
                    *interrupted = true;
                    self.send(&EngineCommand::Interrupt).await?;
                }
                event = self.next_event() => return event,
            }
        }
    }

    fn error_from_event(&self, code: &str, message: String) -> EngineError {
        match code {
            error_codes::CONTEXT_LENGTH_EXCEEDED => EngineError::ContextLengthExceeded {
                fill: self.context_fill,
                capacity: self.context_size,
            },
            error_codes::INVALID_STATE => EngineError::Serialization(message),
            _ => EngineError::protocol(format!("{code}: {message}")),
        }
    }
}

#[async_trait]
impl Engine for SubprocessEngine {
    async fn append(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> EngineResult<AppendOutcome> {
        self.send(&EngineCommand::Append {
            text: text.to_string(),
        })
        .await?;

        let mut interrupted = false;
        loop {
            match self.next_event_or_interrupt(cancel, &mut interrupted).await? {
                EngineEvent::Progress { percent } => on_progress(percent),
                EngineEvent::Done {
                    context_fill,
                    interrupted: worker_interrupted,
                    ..
                } => {
                    self.context_fill = context_fill as usize;
                    return Ok(AppendOutcome {
                        interrupted: interrupted || worker_interrupted,
                    });
                }
                EngineEvent::Error { code, message } => {
                    return Err(self.error_from_event(&code, message));
                }
                other => {
                    return Err(EngineError::protocol(format!(
                        "unexpected {other:?} during append"
                    )));
                }
            }
        }
    }

    async fn run(
        &mut self,
        stop: &str,
        cancel: &CancellationToken,
        on_token: TokenFn<'_>,
    ) -> EngineResult<Generation> {
        self.send(&EngineCommand::Run {
            stop: stop.to_string(),
        })
        .await?;

        let mut generation = Generation::default();
        let mut interrupted = false;
        loop {
            match self.next_event_or_interrupt(cancel, &mut interrupted).await? {
                EngineEvent::Token { text } => {
                    on_token(&text);
                    generation.text.push_str(&text);
                }
                EngineEvent::Done {
                    context_fill,
                    interrupted: worker_interrupted,
                    hit_stop,
                } => {
                    self.context_fill = context_fill as usize;
                    generation.hit_stop = hit_stop;
                    generation.interrupted = interrupted || worker_interrupted;
                    return Ok(generation);
                }
                EngineEvent::Error { code, message } => {
                    return Err(self.error_from_event(&code, message));
                }
                EngineEvent::Progress { .. } => {}
                other => {
                    return Err(EngineError::protocol(format!(
                        "unexpected {other:?} during run"
                    )));
                }
            }
        }
    }

    async fn serialize(&mut self) -> EngineResult<Vec<u8>> {
        self.send(&EngineCommand::Serialize).await?;
        match self.next_event().await? {
            EngineEvent::State { data } => BASE64
                .decode(data.as_bytes())
                .map_err(|e| EngineError::serialization(format!("invalid base64 state: {e}"))),
            EngineEvent::Error { code, message } => Err(self.error_from_event(&code, message)),
            other => Err(EngineError::protocol(format!(
                "unexpected {other:?} during serialize"
            ))),
        }
    }

    async fn deserialize(&mut self, state: &[u8]) -> EngineResult<()> {
        self.send(&EngineCommand::Deserialize {
            state: BASE64.encode(state),
        })
        .await?;
        match self.next_event().await? {
            EngineEvent::Done { context_fill, .. } => {
                self.context_fill = context_fill as usize;
                Ok(())
            }
            EngineEvent::Error { code, message } => {
                let err = self.error_from_event(&code, message);
                // Any restore failure means the blob was unusable
                Err(match err {
                    EngineError::Protocol(m) => EngineError::Serialization(m),
                    other => other,
                })
            }
            other => Err(EngineError::protocol(format!(
                "unexpected {other:?} during deserialize"
            ))),
        }
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn context_fill(&self) -> usize {
        self.context_fill
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.send(&EngineCommand::Shutdown).await {
            debug!(model = %self.model, error = %e, "Worker already gone");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(model = %self.model, %status, "Engine worker exited"),
            Ok(Err(e)) => warn!(model = %self.model, error = %e, "Failed to wait for engine worker"),
            Err(_) => {
                warn!(model = %self.model, "Engine worker ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}
