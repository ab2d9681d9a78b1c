use thiserror::Error;

/// Errors reported by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be constructed or has gone away.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// Appending would overflow the context window.
    #[error("context length exceeded ({fill}/{capacity} tokens)")]
    ContextLengthExceeded { fill: usize, capacity: usize },

    /// A state blob could not be produced or restored.
    #[error("engine state error: {0}")]
    Serialization(String),

    /// The worker answered with something unexpected.
    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn is_context_length_exceeded(&self) -> bool {
        matches!(self, Self::ContextLengthExceeded { .. })
    }
}

/// Convenience type alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
