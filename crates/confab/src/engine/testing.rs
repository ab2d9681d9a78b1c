//! Scripted in-memory engine for tests.
//!
//! Every character counts as one token. Replies are taken from a shared queue
//! so tests decide exactly what the "model" says. Delays and failures can be
//! injected to exercise timeouts, overflow handling and construction errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::ModelDescriptor;

use super::{
    AppendOutcome, Engine, EngineError, EngineFactory, EngineResult, Generation, ProgressFn,
    TokenFn,
};

const STATE_MAGIC: &[u8] = b"SCRIPTED1\n";
const PROGRESS_STEPS: u32 = 4;

#[derive(Debug)]
struct Shared {
    capacity: usize,
    replies: Mutex<VecDeque<String>>,
    appends: Mutex<Vec<String>>,
    append_delay: Mutex<Duration>,
    token_delay: Mutex<Duration>,
    pending_overflows: AtomicUsize,
    fail_create: AtomicBool,
    created: AtomicUsize,
    live: AtomicUsize,
}

/// Factory handing out [`ScriptedEngine`]s that share one script.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    shared: Arc<Shared>,
}

impl ScriptedFactory {
    /// Engines with room for `capacity` characters.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                replies: Mutex::new(VecDeque::new()),
                appends: Mutex::new(Vec::new()),
                append_delay: Mutex::new(Duration::ZERO),
                token_delay: Mutex::new(Duration::ZERO),
                pending_overflows: AtomicUsize::new(0),
                fail_create: AtomicBool::new(false),
                created: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue the text the next `run` call generates (stop string included if wanted).
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.shared
            .replies
            .lock()
            .expect("script lock")
            .push_back(reply.into());
    }

    /// Delay before each of the progress ticks of an append.
    pub fn set_append_delay(&self, delay: Duration) {
        *self.shared.append_delay.lock().expect("script lock") = delay;
    }

    /// Delay before each generated token.
    pub fn set_token_delay(&self, delay: Duration) {
        *self.shared.token_delay.lock().expect("script lock") = delay;
    }

    /// Make the next `count` appends fail with `ContextLengthExceeded`.
    pub fn overflow_next_appends(&self, count: usize) {
        self.shared.pending_overflows.store(count, Ordering::SeqCst);
    }

    /// Make `create` fail with `Unavailable`.
    pub fn fail_creates(&self, fail: bool) {
        self.shared.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Engines constructed so far.
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Engines constructed and not yet dropped.
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Every successfully appended text, across all engines, in order.
    pub fn appends(&self) -> Vec<String> {
        self.shared.appends.lock().expect("script lock").clone()
    }

    /// A standalone engine sharing this factory's script.
    pub fn engine(&self) -> ScriptedEngine {
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        ScriptedEngine {
            shared: self.shared.clone(),
            context: String::new(),
        }
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn create(&self, model: &ModelDescriptor) -> EngineResult<Box<dyn Engine>> {
        if self.shared.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::unavailable(format!(
                "cannot load {}",
                model.weights_path.display()
            )));
        }
        Ok(Box::new(self.engine()))
    }
}

/// In-memory engine whose context is plain text.
#[derive(Debug)]
pub struct ScriptedEngine {
    shared: Arc<Shared>,
    context: String,
}

impl ScriptedEngine {
    /// Everything evaluated or generated so far.
    pub fn context(&self) -> &str {
        &self.context
    }

    fn fill(&self) -> usize {
        self.context.chars().count()
    }

    fn delay(slot: &Mutex<Duration>) -> Duration {
        *slot.lock().expect("script lock")
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn append(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> EngineResult<AppendOutcome> {
        let overflow = self
            .shared
            .pending_overflows
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let needed = self.fill() + text.chars().count();
        if overflow || needed > self.shared.capacity {
            return Err(EngineError::ContextLengthExceeded {
                fill: self.fill(),
                capacity: self.shared.capacity,
            });
        }

        let delay = Self::delay(&self.shared.append_delay);
        for step in 1..=PROGRESS_STEPS {
            if cancel.is_cancelled() {
                return Ok(AppendOutcome { interrupted: true });
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            on_progress(step as f32 * 100.0 / PROGRESS_STEPS as f32);
        }

        self.context.push_str(text);
        self.shared
            .appends
            .lock()
            .expect("script lock")
            .push(text.to_string());
        Ok(AppendOutcome { interrupted: false })
    }

    async fn run(
        &mut self,
        stop: &str,
        cancel: &CancellationToken,
        on_token: TokenFn<'_>,
    ) -> EngineResult<Generation> {
        let reply = self
            .shared
            .replies
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_default();
        let delay = Self::delay(&self.shared.token_delay);

        let mut generation = Generation::default();
        for token in reply.split_inclusive(' ') {
            if cancel.is_cancelled() {
                generation.interrupted = true;
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            if self.fill() + token.chars().count() > self.shared.capacity {
                break;
            }
            self.context.push_str(token);
            generation.text.push_str(token);
            on_token(token);
            if !stop.is_empty() && generation.text.ends_with(stop) {
                generation.hit_stop = true;
                break;
            }
        }

        Ok(generation)
    }

    async fn serialize(&mut self) -> EngineResult<Vec<u8>> {
        let mut state = STATE_MAGIC.to_vec();
        state.extend_from_slice(self.context.as_bytes());
        Ok(state)
    }

    async fn deserialize(&mut self, state: &[u8]) -> EngineResult<()> {
        let body = state
            .strip_prefix(STATE_MAGIC)
            .ok_or_else(|| EngineError::serialization("not a scripted engine state"))?;
        let context = std::str::from_utf8(body)
            .map_err(|e| EngineError::serialization(e.to_string()))?;
        self.context = context.to_string();
        Ok(())
    }

    fn context_size(&self) -> usize {
        self.shared.capacity
    }

    fn context_fill(&self) -> usize {
        self.fill()
    }
}
