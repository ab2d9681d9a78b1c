//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;

use confab::config::{Config, ResolvedPaths};
use confab::model::{ModelCatalog, log_scan_warnings};

pub mod chat;
pub mod check;
pub mod warm;

/// Config, resolved paths, and model catalog shared by every command.
pub struct Loaded {
    pub config: Config,
    pub paths: ResolvedPaths,
    pub catalog: ModelCatalog,
}

/// Load and validate the config and scan the models directory.
pub async fn load(config_path: &str) -> Result<Loaded> {
    let config = Config::load(config_path)
        .await
        .with_context(|| format!("loading {config_path}"))?;
    config.validate()?;

    let paths = config.paths(Path::new(config_path));
    let report = ModelCatalog::scan(&paths.models_dir).await;
    log_scan_warnings(&report.warnings);
    config.validate_models(&report.catalog)?;

    Ok(Loaded {
        config,
        paths,
        catalog: report.catalog,
    })
}

/// Read a preamble file, if one is configured.
pub async fn read_preamble(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading preamble {}", path.display()))?;
    Ok(Some(text))
}
