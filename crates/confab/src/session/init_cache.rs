//! Building init caches.
//!
//! An init cache is the engine state right after the preamble was replayed
//! into a fresh engine. Sessions restore it instead of replaying the preamble
//! themselves. Caches are only built when missing.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{Engine, EngineError, EngineFactory};
use crate::model::{ModelCatalog, ModelDescriptor};
use crate::store::{InitCacheKey, InitCacheStore, StorageError};

#[derive(Debug, Error)]
pub enum InitCacheError {
    #[error("no preamble configured for {mode} mode")]
    MissingPreamble { mode: &'static str },

    /// The preamble leaves no room for a conversation. Fatal at startup.
    #[error("preamble for {key} does not fit the context ({fill}/{capacity} tokens)")]
    PreambleTooLong {
        key: InitCacheKey,
        fill: usize,
        capacity: usize,
    },

    #[error("engine error while building {key}: {source}")]
    Engine {
        key: InitCacheKey,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What `ensure_all` did.
#[derive(Debug, Default)]
pub struct InitCacheReport {
    pub built: Vec<InitCacheKey>,
    pub present: Vec<InitCacheKey>,
}

/// Replays preambles into fresh engines and stores the resulting state.
pub struct InitCacheBuilder {
    factory: Arc<dyn EngineFactory>,
    store: Arc<dyn InitCacheStore>,
    bot_name: String,
    freeform_preamble: Option<String>,
    instruct_preamble: Option<String>,
}

impl InitCacheBuilder {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        store: Arc<dyn InitCacheStore>,
        bot_name: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            store,
            bot_name: bot_name.into(),
            freeform_preamble: None,
            instruct_preamble: None,
        }
    }

    /// Preamble template for freeform conversations.
    pub fn with_freeform_preamble(mut self, template: impl Into<String>) -> Self {
        self.freeform_preamble = Some(template.into());
        self
    }

    /// Preamble template for instruct conversations.
    pub fn with_instruct_preamble(mut self, template: impl Into<String>) -> Self {
        self.instruct_preamble = Some(template.into());
        self
    }

    /// Build every missing cache for every mode each model allows.
    ///
    /// Stops at the first failure: a preamble that cannot be replayed makes
    /// the configuration unusable.
    pub async fn ensure_all(
        &self,
        catalog: &ModelCatalog,
    ) -> Result<InitCacheReport, InitCacheError> {
        let mut report = InitCacheReport::default();
        let mut models: Vec<_> = catalog.iter().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));

        for model in models {
            let modes = [
                (false, model.is_freeform_mode_allowed()),
                (true, model.is_instruct_mode_allowed()),
            ];
            for (instruct_mode, allowed) in modes {
                if !allowed {
                    continue;
                }
                let key = InitCacheKey::new(&model.name, instruct_mode);
                if self.store.exists(&key).await? {
                    debug!(cache = %key, "Init cache present");
                    report.present.push(key);
                    continue;
                }
                self.build(model, instruct_mode).await?;
                report.built.push(key);
            }
        }

        Ok(report)
    }

    /// Replay the preamble for one model and mode and store the result.
    pub async fn build(
        &self,
        model: &ModelDescriptor,
        instruct_mode: bool,
    ) -> Result<InitCacheKey, InitCacheError> {
        let key = InitCacheKey::new(&model.name, instruct_mode);
        let template = if instruct_mode {
            self.instruct_preamble
                .as_deref()
                .ok_or(InitCacheError::MissingPreamble { mode: "instruct" })?
        } else {
            self.freeform_preamble
                .as_deref()
                .ok_or(InitCacheError::MissingPreamble { mode: "freeform" })?
        };
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let preamble = render_preamble(template, &self.bot_name, model, &date);

        info!(cache = %key, "Building init cache");
        let mut engine = self
            .factory
            .create(model)
            .await
            .map_err(|source| InitCacheError::Engine {
                key: key.clone(),
                source,
            })?;

        let result = self.replay(engine.as_mut(), &key, &preamble).await;
        engine.shutdown().await;
        let state = result?;

        self.store.save(&key, &state).await?;
        info!(cache = %key, bytes = state.len(), "Init cache stored");
        Ok(key)
    }

    async fn replay(
        &self,
        engine: &mut dyn Engine,
        key: &InitCacheKey,
        preamble: &str,
    ) -> Result<Vec<u8>, InitCacheError> {
        let cancel = CancellationToken::new();
        let mut on_progress = |percent: f32| {
            debug!(cache = %key, percent = percent, "Replaying preamble");
        };

        match engine.append(preamble, &cancel, &mut on_progress).await {
            Ok(_) => {}
            Err(EngineError::ContextLengthExceeded { fill, capacity }) => {
                return Err(InitCacheError::PreambleTooLong {
                    key: key.clone(),
                    fill,
                    capacity,
                });
            }
            Err(source) => {
                return Err(InitCacheError::Engine {
                    key: key.clone(),
                    source,
                });
            }
        }

        let fill = engine.context_fill();
        let capacity = engine.context_size();
        if fill >= capacity {
            return Err(InitCacheError::PreambleTooLong {
                key: key.clone(),
                fill,
                capacity,
            });
        }

        engine
            .serialize()
            .await
            .map_err(|source| InitCacheError::Engine {
                key: key.clone(),
                source,
            })
    }
}

/// Fill in preamble placeholders.
///
/// Supported: `{{bot_name}}`, `{{date}}`, `{{user_prompt}}`, `{{bot_prompt}}`.
pub fn render_preamble(
    template: &str,
    bot_name: &str,
    model: &ModelDescriptor,
    date: &str,
) -> String {
    template
        .replace("{{bot_name}}", bot_name)
        .replace("{{date}}", date)
        .replace("{{user_prompt}}", &model.user_prompt)
        .replace("{{bot_prompt}}", &model.bot_prompt)
}
