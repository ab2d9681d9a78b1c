use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::fs;
use tracing::warn;

use super::{
    InstructModePolicy, ModelDescriptor, ModelLoadError, PromptLayout, clean_model_name,
};

// ============================================================================
// Public Types
// ============================================================================

/// Loaded model descriptors, shared across the pool and the gateway.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Arc<HashMap<String, Arc<ModelDescriptor>>>,
}

/// Result of scanning the models directory.
#[derive(Debug)]
pub struct ModelScanReport {
    pub catalog: ModelCatalog,
    pub warnings: Vec<ModelScanWarning>,
}

/// Non-fatal issues encountered while loading models.
#[derive(Debug)]
pub enum ModelScanWarning {
    /// The models directory doesn't exist.
    ModelsDirMissing { path: PathBuf },
    /// The directory itself could not be listed.
    ScanFailed { path: PathBuf, error: String },
    /// A model file failed to load and was skipped.
    InvalidModel { name: String, error: ModelLoadError },
}

/// On-disk model descriptor (`{models_dir}/{name}.yaml`).
#[derive(Debug, Deserialize)]
struct ModelFile {
    /// Weights file, relative to the models directory.
    filename: PathBuf,
    #[serde(default)]
    user_prompt: String,
    #[serde(default)]
    bot_prompt: String,
    #[serde(default)]
    instruct_mode_policy: InstructModePolicy,
    #[serde(default)]
    emits_eos: bool,
    #[serde(default)]
    no_translate: bool,
    #[serde(default)]
    layout: PromptLayout,
}

// ============================================================================
// ModelCatalog Implementation
// ============================================================================

impl ModelCatalog {
    /// Build a catalog from already-constructed descriptors.
    pub fn from_models(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let models = models
            .into_iter()
            .map(|m| (m.name.clone(), Arc::new(m)))
            .collect();
        Self {
            models: Arc::new(models),
        }
    }

    /// Load every `*.yaml` descriptor in `dir`.
    ///
    /// Invalid descriptors are skipped and reported as warnings.
    pub async fn scan(dir: &Path) -> ModelScanReport {
        let mut warnings = Vec::new();
        let mut models = Vec::new();

        let mut entries = match fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warnings.push(ModelScanWarning::ModelsDirMissing {
                    path: dir.to_path_buf(),
                });
                return ModelScanReport {
                    catalog: Self::default(),
                    warnings,
                };
            }
            Err(e) => {
                warnings.push(ModelScanWarning::ScanFailed {
                    path: dir.to_path_buf(),
                    error: e.to_string(),
                });
                return ModelScanReport {
                    catalog: Self::default(),
                    warnings,
                };
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warnings.push(ModelScanWarning::ScanFailed {
                        path: dir.to_path_buf(),
                        error: e.to_string(),
                    });
                    break;
                }
            };
            let path = entry.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if !is_yaml {
                continue;
            }

            let name = clean_model_name(&stem);
            match load_model(dir, &path, &name).await {
                Ok(model) => models.push(model),
                Err(error) => warnings.push(ModelScanWarning::InvalidModel { name, error }),
            }
        }

        ModelScanReport {
            catalog: Self::from_models(models),
            warnings,
        }
    }

    /// Get a model by catalog name.
    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.models.get(&clean_model_name(name)).cloned()
    }

    /// Iterate over all models.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.values()
    }

    /// Whether any model may be used in instruct mode.
    pub fn allows_instruct(&self) -> bool {
        self.iter().any(|m| m.is_instruct_mode_allowed())
    }

    /// Whether any model may be used in freeform mode.
    pub fn allows_freeform(&self) -> bool {
        self.iter().any(|m| m.is_freeform_mode_allowed())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

async fn load_model(
    models_dir: &Path,
    path: &Path,
    name: &str,
) -> Result<ModelDescriptor, ModelLoadError> {
    let contents = fs::read_to_string(path).await?;
    let file: ModelFile = serde_saphyr::from_str(&contents)?;

    let weights_path = if file.filename.is_absolute() {
        file.filename
    } else {
        models_dir.join(file.filename)
    };
    if !fs::try_exists(&weights_path).await.unwrap_or(false) {
        return Err(ModelLoadError::MissingWeights(weights_path));
    }
    if file.instruct_mode_policy.allows_instruct()
        && (file.user_prompt.is_empty() || file.bot_prompt.is_empty())
    {
        return Err(ModelLoadError::MissingPrompts);
    }

    Ok(ModelDescriptor {
        name: name.to_string(),
        weights_path,
        instruct_mode_policy: file.instruct_mode_policy,
        user_prompt: file.user_prompt,
        bot_prompt: file.bot_prompt,
        emits_eos: file.emits_eos,
        no_translate: file.no_translate,
        layout: file.layout,
    })
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Log non-fatal warnings produced by model loading.
pub fn log_scan_warnings(warnings: &[ModelScanWarning]) {
    for w in warnings {
        match w {
            ModelScanWarning::ModelsDirMissing { path } => {
                warn!(path = %path.display(), "Models directory does not exist");
            }
            ModelScanWarning::ScanFailed { path, error } => {
                warn!(path = %path.display(), error = %error, "Failed to scan models directory");
            }
            ModelScanWarning::InvalidModel { name, error } => {
                warn!(model = %name, error = %error, "Skipping invalid model");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn scan_loads_valid_models_and_cleans_names() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "vicuna.bin", "");
        write(
            tmp.path(),
            "Vicuna-1.1.yaml",
            "filename: vicuna.bin\nuser_prompt: \"USER:\"\nbot_prompt: \"ASSISTANT:\"\nemits_eos: true\n",
        );

        let report = ModelCatalog::scan(tmp.path()).await;
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);

        let model = report.catalog.get("vicuna-1_1").unwrap();
        assert_eq!(model.weights_path, tmp.path().join("vicuna.bin"));
        assert!(model.emits_eos);
        assert_eq!(model.instruct_mode_policy, InstructModePolicy::Allow);
        // Lookups go through the same normalization
        assert!(report.catalog.get("Vicuna-1.1").is_some());
    }

    #[tokio::test]
    async fn scan_skips_model_with_missing_weights() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "ghost.yaml",
            "filename: ghost.bin\ninstruct_mode_policy: forbid\n",
        );

        let report = ModelCatalog::scan(tmp.path()).await;
        assert!(report.catalog.is_empty());
        assert!(matches!(
            report.warnings.as_slice(),
            [ModelScanWarning::InvalidModel {
                error: ModelLoadError::MissingWeights(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn scan_rejects_instruct_model_without_prompts() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "w.bin", "");
        write(
            tmp.path(),
            "chat.yaml",
            "filename: w.bin\ninstruct_mode_policy: force\n",
        );

        let report = ModelCatalog::scan(tmp.path()).await;
        assert!(report.catalog.is_empty());
        assert!(matches!(
            report.warnings.as_slice(),
            [ModelScanWarning::InvalidModel {
                error: ModelLoadError::MissingPrompts,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn scan_reports_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let report = ModelCatalog::scan(&tmp.path().join("nope")).await;
        assert!(report.catalog.is_empty());
        assert!(matches!(
            report.warnings.as_slice(),
            [ModelScanWarning::ModelsDirMissing { .. }]
        ));
    }

    #[tokio::test]
    async fn catalog_reports_allowed_modes() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "w.bin", "");
        write(
            tmp.path(),
            "plain.yaml",
            "filename: w.bin\ninstruct_mode_policy: forbid\n",
        );

        let catalog = ModelCatalog::scan(tmp.path()).await.catalog;
        assert!(catalog.allows_freeform());
        assert!(!catalog.allows_instruct());
        assert_eq!(catalog.len(), 1);
    }
}
