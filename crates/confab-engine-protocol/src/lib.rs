//! Engine protocol types for communication between confab and model engine workers.
//!
//! A worker owns exactly one loaded model context. confab spawns one worker per
//! live conversation and drives it over stdio with JSON Lines (newline-delimited JSON):
//!
//! - **Commands** (confab → worker): append text, generate, snapshot/restore state
//! - **Events** (worker → confab): progress, tokens, completion, errors
//!
//! Every command except `interrupt` is answered by exactly one terminal event
//! (`done`, `state` or `error`), optionally preceded by `progress` or `token`
//! events. `interrupt` may be sent at any time while an `append` or `run` is in
//! flight; the worker stops at the next evaluation boundary and still answers the
//! interrupted command with `done`.
//!
//! # Example: Minimal Worker
//!
//! ```ignore
//! use confab_engine_protocol::{EngineCommand, EngineEvent};
//!
//! println!("{}", serde_json::to_string(&EngineEvent::Ready {
//!     version: "1.0.0".to_string(),
//!     context_size: 2048,
//! })?);
//!
//! let line = read_line_from_stdin();
//! match serde_json::from_str::<EngineCommand>(&line)? {
//!     EngineCommand::Append { text } => { /* evaluate, emit progress, then done */ }
//!     _ => {}
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Revision of the command and event formats below. Bumped on any
/// incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Commands (confab → worker)
// ============================================================================

/// Commands sent from confab to an engine worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineCommand {
    /// Evaluate text and add it to the context.
    Append { text: String },

    /// Generate tokens until `stop` is produced or the worker is interrupted.
    Run { stop: String },

    /// Stop the in-flight `append` or `run` as soon as possible.
    Interrupt,

    /// Serialize the current context. Answered with `state`.
    Serialize,

    /// Replace the current context with a previously serialized one.
    Deserialize {
        /// Base64-encoded state blob.
        state: String,
    },

    /// Release the model and exit.
    Shutdown,
}

// ============================================================================
// Events (worker → confab)
// ============================================================================

/// Events sent from an engine worker to confab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Model is loaded and the worker accepts commands.
    Ready {
        version: String,
        /// Context capacity in tokens.
        context_size: u32,
    },

    /// Evaluation progress of an `append`, in percent.
    Progress { percent: f32 },

    /// A generated piece of text during `run`.
    Token { text: String },

    /// The current command finished.
    Done {
        /// Tokens currently held in the context.
        context_fill: u32,
        /// Whether the command stopped early because of `interrupt`.
        #[serde(default)]
        interrupted: bool,
        /// For `run`: whether generation ended on the stop string.
        #[serde(default)]
        hit_stop: bool,
    },

    /// Answer to `serialize`.
    State {
        /// Base64-encoded state blob.
        data: String,
    },

    /// The current command failed.
    Error { code: String, message: String },
}

impl EngineEvent {
    /// Whether this event ends the command it answers.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Done { .. } | EngineEvent::State { .. } | EngineEvent::Error { .. }
        )
    }
}

// ============================================================================
// Error Codes
// ============================================================================

/// Well-known error codes for `error` events.
pub mod error_codes {
    /// Appending would overflow the context window.
    pub const CONTEXT_LENGTH_EXCEEDED: &str = "context_length_exceeded";
    /// A state blob could not be restored.
    pub const INVALID_STATE: &str = "invalid_state";
    /// Command not understood by the worker.
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// Model weights could not be loaded.
    pub const MODEL_LOAD_FAILED: &str = "model_load_failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let cmd = EngineCommand::Run {
            stop: "\n".to_string(),
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"run""#));

        let parsed: EngineCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_unit_command_has_only_type_tag() {
        let json = serde_json::to_string(&EngineCommand::Interrupt).unwrap();
        assert_eq!(json, r#"{"type":"interrupt"}"#);
    }

    #[test]
    fn test_done_event_defaults_flags() {
        let parsed: EngineEvent =
            serde_json::from_str(r#"{"type":"done","context_fill":42}"#).unwrap();
        match parsed {
            EngineEvent::Done {
                context_fill,
                interrupted,
                hit_stop,
            } => {
                assert_eq!(context_fill, 42);
                assert!(!interrupted);
                assert!(!hit_stop);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_terminal_events() {
        assert!(
            EngineEvent::Error {
                code: error_codes::CONTEXT_LENGTH_EXCEEDED.to_string(),
                message: "full".to_string(),
            }
            .is_terminal()
        );
        assert!(
            EngineEvent::State {
                data: String::new()
            }
            .is_terminal()
        );
        assert!(!EngineEvent::Progress { percent: 50.0 }.is_terminal());
        assert!(
            !EngineEvent::Token {
                text: "hi".to_string()
            }
            .is_terminal()
        );
    }
}
