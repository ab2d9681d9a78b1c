//! Model engine abstraction.
//!
//! An engine is one loaded model context. It is stateful and not shareable:
//! exactly one session actor owns each engine. Token math lives behind this
//! trait; confab only appends text, asks for generations, and moves opaque
//! state blobs around.
//!
//! Long-running calls report progress through callbacks and stop early when
//! their `CancellationToken` fires.

mod error;
mod subprocess;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::ModelDescriptor;

pub use error::{EngineError, EngineResult};
pub use subprocess::{SubprocessEngine, SubprocessEngineFactory};

/// Progress callback for `append`, called with a percentage.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(f32) + Send);

/// Token callback for `run`, called with each generated piece of text.
pub type TokenFn<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Result of an `append` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The append stopped early because the token was cancelled.
    pub interrupted: bool,
}

/// Result of a `run` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// Everything generated, including the stop string if it was produced.
    pub text: String,
    /// Generation ended because the stop string was produced.
    pub hit_stop: bool,
    /// Generation stopped early because the token was cancelled.
    pub interrupted: bool,
}

/// One loaded model context.
#[async_trait]
pub trait Engine: Send {
    /// Evaluate `text` into the context.
    ///
    /// Fails with [`EngineError::ContextLengthExceeded`] when the text does not
    /// fit; the context is left unchanged in that case.
    async fn append(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> EngineResult<AppendOutcome>;

    /// Generate until `stop` is produced or `cancel` fires.
    ///
    /// Generated text becomes part of the context.
    async fn run(
        &mut self,
        stop: &str,
        cancel: &CancellationToken,
        on_token: TokenFn<'_>,
    ) -> EngineResult<Generation>;

    /// Serialize the whole context into an opaque blob.
    async fn serialize(&mut self) -> EngineResult<Vec<u8>>;

    /// Replace the context with a blob produced by `serialize`.
    async fn deserialize(&mut self, state: &[u8]) -> EngineResult<()>;

    /// Context capacity in tokens.
    fn context_size(&self) -> usize;

    /// Tokens currently in the context.
    fn context_fill(&self) -> usize;

    /// Release the model. The engine must not be used afterwards.
    async fn shutdown(&mut self) {}
}

/// Constructs engines for a model.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Load `model` into a fresh, empty engine.
    ///
    /// Fails with [`EngineError::Unavailable`] when the model cannot be loaded.
    async fn create(&self, model: &ModelDescriptor) -> EngineResult<Box<dyn Engine>>;
}
