//! Model descriptors and the catalog they are loaded into.
//!
//! A descriptor is immutable after load and shared by every session that uses
//! the model (`Arc<ModelDescriptor>`).

mod catalog;

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub use catalog::{ModelCatalog, ModelScanReport, ModelScanWarning, log_scan_warnings};

// ============================================================================
// ModelDescriptor
// ============================================================================

/// Everything the pipeline needs to know about one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Catalog name (lowercase, `.` replaced by `_`).
    pub name: String,
    pub weights_path: PathBuf,
    pub instruct_mode_policy: InstructModePolicy,
    /// Template opening a user turn in instruct mode.
    pub user_prompt: String,
    /// Template opening a bot turn in instruct mode.
    pub bot_prompt: String,
    /// The model ends its turns with end-of-sequence instead of the user prompt.
    pub emits_eos: bool,
    pub no_translate: bool,
    pub layout: PromptLayout,
}

impl ModelDescriptor {
    pub fn is_instruct_mode_allowed(&self) -> bool {
        self.instruct_mode_policy.allows_instruct()
    }

    pub fn is_freeform_mode_allowed(&self) -> bool {
        self.instruct_mode_policy.allows_freeform()
    }

    /// Apply the policy to a requested mode.
    pub fn resolve_mode(&self, requested_instruct: bool) -> bool {
        match self.instruct_mode_policy {
            InstructModePolicy::Allow => requested_instruct,
            InstructModePolicy::Force => true,
            InstructModePolicy::Forbid => false,
        }
    }

    /// Separator placed between a turn template and the text that follows it.
    pub fn prompt_separator(&self) -> &'static str {
        if self.layout.newline_after_prompt {
            "\n"
        } else {
            " "
        }
    }

    /// What generation stops on for the given mode.
    ///
    /// Instruct mode stops once the model opens the next user turn; freeform
    /// mode replies with a single line.
    pub fn stop_string(&self, instruct_mode: bool) -> &str {
        if instruct_mode {
            &self.user_prompt
        } else {
            "\n"
        }
    }
}

/// Which prompting modes a model may be used in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructModePolicy {
    #[default]
    Allow,
    Force,
    Forbid,
}

impl InstructModePolicy {
    pub fn allows_instruct(self) -> bool {
        matches!(self, Self::Allow | Self::Force)
    }

    pub fn allows_freeform(self) -> bool {
        matches!(self, Self::Allow | Self::Forbid)
    }
}

/// Spacing flags for instruct-mode prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PromptLayout {
    /// Put turn text on the line after the turn template instead of after a space.
    pub newline_after_prompt: bool,
}

impl Default for PromptLayout {
    fn default() -> Self {
        Self {
            newline_after_prompt: true,
        }
    }
}

/// Normalize a model file stem into a catalog name.
pub fn clean_model_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '.' { '_' } else { c.to_ascii_lowercase() })
        .collect()
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse model file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("weights file not found: {}", .0.display())]
    MissingWeights(PathBuf),

    #[error("instruct mode allowed but user_prompt and bot_prompt not given")]
    MissingPrompts,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Descriptor with prompts set and every mode allowed.
    pub fn descriptor(name: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            weights_path: PathBuf::from(format!("/models/{name}.bin")),
            instruct_mode_policy: InstructModePolicy::Allow,
            user_prompt: "### Human:".to_string(),
            bot_prompt: "### Assistant:".to_string(),
            emits_eos: false,
            no_translate: false,
            layout: PromptLayout::default(),
        }
    }
}
