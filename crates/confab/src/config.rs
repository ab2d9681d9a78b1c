//! Configuration file loading and validation.
//!
//! The config is a single YAML file (default `confab.yaml`). Values may reference
//! environment variables with `${VAR}` or `${VAR:-default}`. Relative paths are
//! resolved against the directory holding the config file.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::model::{InstructModePolicy, ModelCatalog};

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// Preamble replayed into freeform-mode init caches.
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
    /// Preamble replayed into instruct-mode init caches.
    #[serde(default)]
    pub instruct_prompt_file: Option<PathBuf>,
    /// Optional YAML file overriding `texts`.
    #[serde(default)]
    pub texts_file: Option<PathBuf>,
    /// Model used in conversations without an assignment.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Only talk in assigned threads, ignore everything else.
    #[serde(default = "default_true")]
    pub threads_only: bool,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub shard: ShardConfig,
    #[serde(default)]
    pub texts: Texts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            models_dir: None,
            prompt_file: None,
            instruct_prompt_file: None,
            texts_file: None,
            default_model: None,
            threads_only: true,
            bot: BotConfig::default(),
            engine: EngineConfig::default(),
            pool: PoolConfig::default(),
            reply: ReplyConfig::default(),
            priority: PriorityConfig::default(),
            shard: ShardConfig::default(),
            texts: Texts::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

impl Config {
    /// Load the config file, falling back to defaults when it does not exist.
    ///
    /// A configured `texts_file` is read right away and replaces `texts`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        let mut config: Config = serde_saphyr::from_str(&expanded)?;

        if let Some(texts_file) = &config.texts_file {
            let texts_path = resolve_path(path, texts_file);
            let raw = fs::read_to_string(&texts_path).await?;
            config.texts = serde_saphyr::from_str(&expand_env_vars(&raw)?)?;
        }

        Ok(config)
    }

    /// Check settings that do not depend on the model catalog.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.scroll_keep >= 99 {
            return Err(ConfigError::invalid(
                "engine.scroll_keep must be a percentage in the range 0-98",
            ));
        }
        if self.shard.count == 0 {
            return Err(ConfigError::invalid("shard.count must be above zero"));
        }
        if self.shard.id >= self.shard.count {
            return Err(ConfigError::invalid(format!(
                "shard.id {} does not exist with shard.count {}",
                self.shard.id, self.shard.count
            )));
        }
        if self.pool.size == 0 {
            return Err(ConfigError::invalid("pool.size must be above zero"));
        }
        if self.priority.step == 0 {
            return Err(ConfigError::invalid("priority.step must be above zero"));
        }
        if self.priority.floor >= self.priority.initial {
            return Err(ConfigError::invalid(
                "priority.floor must be below priority.initial",
            ));
        }
        if self.reply.max_length <= self.texts.longest_notice().len() + 1 {
            return Err(ConfigError::invalid(
                "reply.max_length leaves no room for replies after the truncation notice",
            ));
        }
        if self.reply.idle_reply_after().is_some() && self.reply.idle_check_interval_seconds == 0
        {
            return Err(ConfigError::invalid(
                "reply.idle_check_interval_seconds must be above zero when idle replies are on",
            ));
        }
        Ok(())
    }

    /// Check settings against the loaded model catalog.
    pub fn validate_models(&self, catalog: &ModelCatalog) -> Result<(), ConfigError> {
        if catalog.allows_freeform() && self.prompt_file.is_none() {
            return Err(ConfigError::invalid(
                "prompt_file is required when a model allows non-instruct mode",
            ));
        }
        if catalog.allows_instruct() && self.instruct_prompt_file.is_none() {
            return Err(ConfigError::invalid(
                "instruct_prompt_file is required when a model allows instruct mode",
            ));
        }
        if !self.threads_only {
            let name = self.default_model.as_deref().ok_or_else(|| {
                ConfigError::invalid("default_model is required when threads_only is false")
            })?;
            let model = catalog.get(name).ok_or_else(|| {
                ConfigError::invalid(format!("default_model '{name}' is not in the catalog"))
            })?;
            if model.instruct_mode_policy == InstructModePolicy::Force {
                return Err(ConfigError::invalid(
                    "default_model must not force instruct mode when threads_only is false",
                ));
            }
        }
        Ok(())
    }

    /// Resolve every on-disk location relative to the config file.
    pub fn paths(&self, config_path: &Path) -> ResolvedPaths {
        let workspace = resolve_path(
            config_path,
            self.workspace
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_WORKSPACE)),
        );
        let models_dir = resolve_path(
            config_path,
            self.models_dir
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_MODELS_DIR)),
        );
        ResolvedPaths {
            sessions_dir: workspace.join(DEFAULT_SESSIONS_DIR),
            cache_dir: workspace.join(DEFAULT_CACHE_DIR),
            assignments_file: workspace.join(DEFAULT_ASSIGNMENTS_FILE),
            prompt_file: self
                .prompt_file
                .as_deref()
                .map(|p| resolve_path(config_path, p)),
            instruct_prompt_file: self
                .instruct_prompt_file
                .as_deref()
                .map(|p| resolve_path(config_path, p)),
            workspace,
            models_dir,
        }
    }
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

/// On-disk locations derived from a [`Config`].
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub workspace: PathBuf,
    pub models_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub assignments_file: PathBuf,
    pub prompt_file: Option<PathBuf>,
    pub instruct_prompt_file: Option<PathBuf>,
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default workspace directory (relative to config file).
pub const DEFAULT_WORKSPACE: &str = ".confab";
/// Default model descriptor directory (relative to config file).
pub const DEFAULT_MODELS_DIR: &str = "models";
/// Persisted conversation state (relative to workspace).
pub const DEFAULT_SESSIONS_DIR: &str = "sessions";
/// Init caches (relative to workspace).
pub const DEFAULT_CACHE_DIR: &str = "cache";
/// Conversation assignment table (relative to workspace).
pub const DEFAULT_ASSIGNMENTS_FILE: &str = "assignments.yaml";

// ============================================================================
// BotConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Display name the bot speaks as in freeform mode.
    #[serde(default = "default_bot_name")]
    pub name: String,
    /// Platform user id, used to detect `<@id>` mentions.
    #[serde(default)]
    pub id: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            id: None,
        }
    }
}

// ============================================================================
// EngineConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Engine worker executable.
    #[serde(default = "default_engine_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Worker threads per engine invocation.
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Context window in tokens.
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Percentage of the context kept when the engine scrolls its window.
    #[serde(default = "default_scroll_keep")]
    pub scroll_keep: u32,
    #[serde(default)]
    pub mlock: bool,
    #[serde(default = "default_engine_startup_timeout")]
    pub startup_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: Vec::new(),
            env: HashMap::new(),
            threads: default_threads(),
            context_size: default_context_size(),
            scroll_keep: default_scroll_keep(),
            mlock: false,
            startup_timeout_seconds: default_engine_startup_timeout(),
        }
    }
}

// ============================================================================
// PoolConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live engines.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Idle age after which the sweeper evicts a session (0 disables sweeping).
    #[serde(default)]
    pub max_context_age_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Persist engine state on eviction and shutdown.
    #[serde(default = "default_true")]
    pub persistence: bool,
}

impl PoolConfig {
    pub fn max_context_age(&self) -> Option<Duration> {
        (self.max_context_age_seconds > 0).then(|| Duration::from_secs(self.max_context_age_seconds))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_context_age_seconds: 0,
            sweep_interval_seconds: default_sweep_interval(),
            persistence: true,
        }
    }
}

// ============================================================================
// ReplyConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyConfig {
    /// Seconds without completion before a task takes a strike.
    #[serde(default = "default_reply_timeout")]
    pub timeout_seconds: u64,
    /// Hard cap on a single reply, in bytes.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Flush partial output to the transport while generating.
    #[serde(default)]
    pub live_edit: bool,
    #[serde(default = "default_live_edit_interval")]
    pub live_edit_interval_ms: u64,
    /// Reply to one in N untriggered messages (0 disables ambient replies).
    #[serde(default)]
    pub ambient_chance: u32,
    #[serde(default)]
    pub ambient_mode: AmbientMode,
    /// Reply on its own to a conversation quiet this long (0 disables).
    #[serde(default = "default_idle_reply_after")]
    pub idle_reply_after_seconds: u64,
    /// How often quiet conversations are looked for.
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_seconds: u64,
}

impl ReplyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn live_edit_interval(&self) -> Duration {
        Duration::from_millis(self.live_edit_interval_ms)
    }

    /// `None` when idle replies are off.
    pub fn idle_reply_after(&self) -> Option<Duration> {
        (self.idle_reply_after_seconds > 0)
            .then(|| Duration::from_secs(self.idle_reply_after_seconds))
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_seconds)
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_reply_timeout(),
            max_length: default_max_length(),
            live_edit: false,
            live_edit_interval_ms: default_live_edit_interval(),
            ambient_chance: 0,
            ambient_mode: AmbientMode::default(),
            idle_reply_after_seconds: default_idle_reply_after(),
            idle_check_interval_seconds: default_idle_check_interval(),
        }
    }
}

/// How the ambient reply chance is rolled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbientMode {
    /// Message creation second modulo the chance divisor (reproducible).
    #[default]
    Timestamp,
    /// Thread-local random number generator.
    Random,
}

// ============================================================================
// PriorityConfig
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PriorityConfig {
    /// Priority every task starts with.
    #[serde(default = "default_priority_initial")]
    pub initial: u8,
    /// Decrease per timeout strike.
    #[serde(default = "default_priority_step")]
    pub step: u8,
    /// Reaching this priority aborts the current step.
    #[serde(default)]
    pub floor: u8,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            initial: default_priority_initial(),
            step: default_priority_step(),
            floor: 0,
        }
    }
}

// ============================================================================
// ShardConfig
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ShardConfig {
    #[serde(default = "default_shard_count")]
    pub count: u32,
    #[serde(default)]
    pub id: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            count: default_shard_count(),
            id: 0,
        }
    }
}

// ============================================================================
// Texts
// ============================================================================

/// User-visible strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Texts {
    pub please_wait: String,
    pub thread_create_fail: String,
    pub model_missing: String,
    pub timeout: String,
    pub too_long: String,
    pub context_overflow: String,
    pub engine_unavailable: String,
    pub empty_reply: String,
    pub slow_marker: String,
    pub reset_done: String,
}

impl Texts {
    /// The longest suffix the pipeline may append to a reply.
    pub fn longest_notice(&self) -> &str {
        if self.timeout.len() >= self.too_long.len() {
            &self.timeout
        } else {
            &self.too_long
        }
    }
}

impl Default for Texts {
    fn default() -> Self {
        Self {
            please_wait: "Please wait...".to_string(),
            thread_create_fail:
                "Error: I couldn't create a thread here. Do I have enough permissions?".to_string(),
            model_missing:
                "Error: The model that was used in this thread could no longer be found."
                    .to_string(),
            timeout: "Error: Timeout".to_string(),
            too_long: "Error: Response too long".to_string(),
            context_overflow: "Error: This conversation no longer fits into my memory.".to_string(),
            engine_unavailable: "Error: No model is available right now, try again later."
                .to_string(),
            empty_reply: "...".to_string(),
            slow_marker: "(this is taking a while)".to_string(),
            reset_done: "Conversation has been reset.".to_string(),
        }
    }
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_bot_name() -> String {
    "Confab".to_string()
}

fn default_engine_command() -> String {
    "confab-engine".to_string()
}

fn default_threads() -> u32 {
    4
}

fn default_context_size() -> u32 {
    1012
}

fn default_scroll_keep() -> u32 {
    20
}

fn default_engine_startup_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    2
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_reply_timeout() -> u64 {
    120
}

fn default_max_length() -> usize {
    2000
}

fn default_live_edit_interval() -> u64 {
    3000
}

fn default_idle_reply_after() -> u64 {
    20 * 60
}

fn default_idle_check_interval() -> u64 {
    5 * 60
}

fn default_priority_initial() -> u8 {
    3
}

fn default_priority_step() -> u8 {
    1
}

fn default_shard_count() -> u32 {
    1
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports the following syntax (shell-compatible):
/// - `${VAR}` - Required variable, errors if not set
/// - `${VAR:-default}` - Optional variable with default value
/// - `$$` - Escaped `$` (only needed before `{` to prevent expansion)
///
/// Nested expansion such as `${VAR:-${DEFAULT}}` is not supported.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                result.push_str(&parse_var_reference(&mut chars)?);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Parse a variable reference after seeing `${`.
fn parse_var_reference(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<String, ConfigError> {
    let mut body = String::new();
    let mut closed = false;

    for c in chars.by_ref() {
        if c == '}' {
            closed = true;
            break;
        }
        body.push(c);
    }

    if !closed {
        return Err(ConfigError::UnclosedVarReference);
    }

    let (name, default) = match body.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (body.as_str(), None),
    };

    match (std::env::var(name), default) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(default)) => Ok(default.to_string()),
        (Err(_), None) => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.threads_only);
        assert_eq!(config.pool.size, 2);
        assert!(config.pool.persistence);
        assert!(config.pool.max_context_age().is_none());
        assert_eq!(config.engine.context_size, 1012);
        assert_eq!(config.engine.threads, 4);
        assert_eq!(config.engine.scroll_keep, 20);
        assert_eq!(config.reply.timeout(), Duration::from_secs(120));
        assert_eq!(config.priority.initial, 3);
        assert_eq!(config.shard, ShardConfig { count: 1, id: 0 });
        assert_eq!(config.texts.timeout, "Error: Timeout");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let config = Config::load(tmp_dir.path().join("missing.yaml"))
            .await
            .unwrap();
        assert_eq!(config.bot.name, "Confab");
        assert_eq!(config.reply.max_length, 2000);
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
default_model: 7b-chat
threads_only: false
bot:
  name: Llamy
  id: "4242"
engine:
  command: ./worker
  args: ["--gpu"]
  context_size: 2048
  scroll_keep: 30
pool:
  size: 4
  max_context_age_seconds: 600
  persistence: false
reply:
  timeout_seconds: 30
  live_edit: true
  ambient_chance: 20
  ambient_mode: random
  idle_reply_after_seconds: 0
priority:
  initial: 5
  step: 2
  floor: 1
shard:
  count: 3
  id: 2
texts:
  timeout: "Too slow!"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.default_model.as_deref(), Some("7b-chat"));
        assert!(!config.threads_only);
        assert_eq!(config.bot.name, "Llamy");
        assert_eq!(config.bot.id.as_deref(), Some("4242"));
        assert_eq!(config.engine.command, "./worker");
        assert_eq!(config.engine.args, vec!["--gpu".to_string()]);
        assert_eq!(config.engine.context_size, 2048);
        assert_eq!(config.pool.size, 4);
        assert_eq!(
            config.pool.max_context_age(),
            Some(Duration::from_secs(600))
        );
        assert!(!config.pool.persistence);
        assert!(config.reply.live_edit);
        assert_eq!(config.reply.ambient_chance, 20);
        assert_eq!(config.reply.ambient_mode, AmbientMode::Random);
        assert_eq!(config.reply.idle_reply_after(), None);
        assert_eq!(config.priority.initial, 5);
        assert_eq!(config.priority.step, 2);
        assert_eq!(config.priority.floor, 1);
        assert_eq!(config.shard, ShardConfig { count: 3, id: 2 });
        assert_eq!(config.texts.timeout, "Too slow!");
        // Untouched texts keep their defaults
        assert_eq!(config.texts.please_wait, "Please wait...");
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "pool: [unclosed").unwrap();

        let result = Config::load(file.path()).await;
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[tokio::test]
    async fn test_texts_file_overrides_inline_texts() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("texts.yaml"), "please_wait: \"Einen Moment...\"\n").unwrap();
        std::fs::write(
            tmp.path().join("confab.yaml"),
            "texts_file: texts.yaml\ntexts:\n  please_wait: ignored\n",
        )
        .unwrap();

        let config = Config::load(tmp.path().join("confab.yaml")).await.unwrap();
        assert_eq!(config.texts.please_wait, "Einen Moment...");
        assert_eq!(config.texts.timeout, "Error: Timeout");
    }

    #[test]
    fn test_validate_rejects_scroll_keep_out_of_range() {
        let mut config = Config::default();
        config.engine.scroll_keep = 99;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scroll_keep"));
    }

    #[test]
    fn test_validate_rejects_shard_id_outside_count() {
        let mut config = Config::default();
        config.shard = ShardConfig { count: 2, id: 2 };
        assert!(config.validate().is_err());

        config.shard = ShardConfig { count: 0, id: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_floor_at_initial() {
        let mut config = Config::default();
        config.priority.floor = config.priority.initial;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_max_length() {
        let mut config = Config::default();
        config.reply.max_length = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_replies_default_on_and_need_a_check_interval() {
        let mut config = Config::default();
        assert_eq!(
            config.reply.idle_reply_after(),
            Some(Duration::from_secs(1200))
        );
        assert_eq!(config.reply.idle_check_interval(), Duration::from_secs(300));

        config.reply.idle_check_interval_seconds = 0;
        assert!(config.validate().is_err());
        config.reply.idle_reply_after_seconds = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_are_resolved_against_config_dir() {
        let config = Config {
            prompt_file: Some(PathBuf::from("prompt.txt")),
            ..Config::default()
        };
        let paths = config.paths(Path::new("/srv/bot/confab.yaml"));
        assert_eq!(paths.workspace, PathBuf::from("/srv/bot/.confab"));
        assert_eq!(paths.models_dir, PathBuf::from("/srv/bot/models"));
        assert_eq!(paths.sessions_dir, PathBuf::from("/srv/bot/.confab/sessions"));
        assert_eq!(paths.cache_dir, PathBuf::from("/srv/bot/.confab/cache"));
        assert_eq!(
            paths.assignments_file,
            PathBuf::from("/srv/bot/.confab/assignments.yaml")
        );
        assert_eq!(paths.prompt_file, Some(PathBuf::from("/srv/bot/prompt.txt")));
        assert!(paths.instruct_prompt_file.is_none());
    }

    #[test]
    fn test_resolve_path_absolute() {
        let resolved = resolve_path(Path::new("/a/confab.yaml"), Path::new("/b/models"));
        assert_eq!(resolved, PathBuf::from("/b/models"));
    }

    #[test]
    fn test_resolve_path_config_in_current_dir() {
        let resolved = resolve_path(Path::new("confab.yaml"), Path::new("models"));
        assert_eq!(resolved, PathBuf::from("models"));
    }

    // ========================================================================
    // Environment Variable Expansion
    // ========================================================================

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "plain string without variables";
        assert_eq!(expand_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_expand_env_vars_required_var() {
        // SAFETY: Single-threaded test
        unsafe { std::env::set_var("CONFAB_TEST_REQUIRED", "test_value") };
        let result = expand_env_vars("prefix ${CONFAB_TEST_REQUIRED} suffix").unwrap();
        assert_eq!(result, "prefix test_value suffix");
        unsafe { std::env::remove_var("CONFAB_TEST_REQUIRED") };
    }

    #[test]
    fn test_expand_env_vars_missing_required_var() {
        // SAFETY: Single-threaded test
        unsafe { std::env::remove_var("CONFAB_MISSING_12345") };
        match expand_env_vars("value: ${CONFAB_MISSING_12345}") {
            Err(ConfigError::MissingEnvVar(name)) => assert_eq!(name, "CONFAB_MISSING_12345"),
            other => panic!("expected MissingEnvVar error, got {other:?}"),
        }
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        // SAFETY: Single-threaded test
        unsafe { std::env::remove_var("CONFAB_UNSET_WITH_DEFAULT") };
        let result = expand_env_vars("size: ${CONFAB_UNSET_WITH_DEFAULT:-4}").unwrap();
        assert_eq!(result, "size: 4");
    }

    #[test]
    fn test_expand_env_vars_with_empty_default() {
        // SAFETY: Single-threaded test
        unsafe { std::env::remove_var("CONFAB_UNSET_EMPTY") };
        let result = expand_env_vars("value: ${CONFAB_UNSET_EMPTY:-}").unwrap();
        assert_eq!(result, "value: ");
    }

    #[test]
    fn test_expand_env_vars_escaped_dollar() {
        let result = expand_env_vars("price: $$100 and ${CONFAB_ESCAPE:-value}").unwrap();
        assert_eq!(result, "price: $100 and value");
    }

    #[test]
    fn test_expand_env_vars_literal_dollar_without_brace() {
        assert_eq!(expand_env_vars("cost is $50").unwrap(), "cost is $50");
    }

    #[test]
    fn test_expand_env_vars_unclosed_brace() {
        assert!(matches!(
            expand_env_vars("value: ${UNCLOSED"),
            Err(ConfigError::UnclosedVarReference)
        ));
    }

    #[tokio::test]
    async fn test_config_load_with_env_var() {
        // SAFETY: Single-threaded test
        unsafe { std::env::set_var("CONFAB_TEST_ENGINE", "/opt/engine") };

        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
engine:
  command: ${{CONFAB_TEST_ENGINE}}
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.engine.command, "/opt/engine");

        unsafe { std::env::remove_var("CONFAB_TEST_ENGINE") };
    }
}
