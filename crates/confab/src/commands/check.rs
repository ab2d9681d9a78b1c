//! `confab check`: load and validate the configuration and model catalog.

use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;

use confab::build_info::BuildInfo;
use confab::config::Config;
use confab::model::{ModelCatalog, ModelScanWarning};
use confab::store::file::FileInitCacheStore;
use confab::store::{InitCacheKey, InitCacheStore};

// ============================================================================
// Report Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warn,
    Error,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    status: CheckStatus,
    message: String,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Ok,
            message: message.into(),
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    build: BuildInfo,
    checks: Vec<CheckResult>,
}

impl Report {
    fn has_errors(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Error)
    }

    fn render(&self, format: &str) -> Result<()> {
        if format == "json" {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }

        println!("confab {}", confab::build_info::version_string());
        println!("{}", "=".repeat(50));
        for check in &self.checks {
            let label = match check.status {
                CheckStatus::Ok => "  OK   ",
                CheckStatus::Warn => "  WARN ",
                CheckStatus::Error => "  ERROR",
            };
            println!("{label} {}", check.message);
        }
        Ok(())
    }
}

// ============================================================================
// Command
// ============================================================================

pub async fn run(config_path: &str, format: &str) -> Result<()> {
    let mut checks = Vec::new();

    let config = match Config::load(config_path).await {
        Ok(config) => {
            checks.push(CheckResult::ok(format!("config loaded from {config_path}")));
            Some(config)
        }
        Err(e) => {
            checks.push(CheckResult::error(format!("config: {e}")));
            None
        }
    };

    if let Some(config) = &config {
        check_config(config, Path::new(config_path), &mut checks).await;
    }

    let report = Report {
        build: BuildInfo::new(),
        checks,
    };
    report.render(format)?;
    if report.has_errors() {
        bail!("configuration check failed");
    }
    Ok(())
}

async fn check_config(config: &Config, config_path: &Path, checks: &mut Vec<CheckResult>) {
    match config.validate() {
        Ok(()) => checks.push(CheckResult::ok("settings are consistent")),
        Err(e) => checks.push(CheckResult::error(e.to_string())),
    }

    let paths = config.paths(config_path);
    let scan = ModelCatalog::scan(&paths.models_dir).await;
    for warning in &scan.warnings {
        checks.push(CheckResult::warn(describe_warning(warning)));
    }
    if scan.catalog.is_empty() {
        checks.push(CheckResult::error(format!(
            "no models found in {}",
            paths.models_dir.display()
        )));
        return;
    }

    let mut names: Vec<_> = scan.catalog.iter().map(|m| m.name.clone()).collect();
    names.sort();
    checks.push(CheckResult::ok(format!(
        "{} model(s): {}",
        names.len(),
        names.join(", ")
    )));

    match config.validate_models(&scan.catalog) {
        Ok(()) => checks.push(CheckResult::ok("models match the configuration")),
        Err(e) => checks.push(CheckResult::error(e.to_string())),
    }

    let caches = FileInitCacheStore::new(&paths.cache_dir);
    for model in scan.catalog.iter() {
        let modes = [
            (false, model.is_freeform_mode_allowed()),
            (true, model.is_instruct_mode_allowed()),
        ];
        for (instruct_mode, allowed) in modes {
            if !allowed {
                continue;
            }
            let key = InitCacheKey::new(&model.name, instruct_mode);
            match caches.exists(&key).await {
                Ok(true) => {}
                Ok(false) => checks.push(CheckResult::warn(format!(
                    "init cache {key} is missing, run `confab warm`"
                ))),
                Err(e) => checks.push(CheckResult::warn(format!("init cache {key}: {e}"))),
            }
        }
    }
}

fn describe_warning(warning: &ModelScanWarning) -> String {
    match warning {
        ModelScanWarning::ModelsDirMissing { path } => {
            format!("models directory {} does not exist", path.display())
        }
        ModelScanWarning::ScanFailed { path, error } => {
            format!("could not list {}: {error}", path.display())
        }
        ModelScanWarning::InvalidModel { name, error } => {
            format!("model {name} skipped: {error}")
        }
    }
}
