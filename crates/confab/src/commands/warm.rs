//! `confab warm`: build missing init caches.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use confab::engine::SubprocessEngineFactory;
use confab::session::InitCacheBuilder;
use confab::store::file::FileInitCacheStore;

use super::{Loaded, load, read_preamble};

pub async fn run(config_path: &str) -> Result<()> {
    let loaded = load(config_path).await?;
    let builder = builder(&loaded).await?;

    let report = builder.ensure_all(&loaded.catalog).await?;
    for key in &report.built {
        println!("built    {key}");
    }
    for key in &report.present {
        println!("present  {key}");
    }
    info!(
        built = report.built.len(),
        present = report.present.len(),
        "Init caches ready"
    );
    Ok(())
}

/// Init cache builder for the loaded config.
pub async fn builder(loaded: &Loaded) -> Result<InitCacheBuilder> {
    let factory = Arc::new(SubprocessEngineFactory::new(loaded.config.engine.clone()));
    let store = Arc::new(FileInitCacheStore::new(&loaded.paths.cache_dir));

    let mut builder = InitCacheBuilder::new(factory, store, &loaded.config.bot.name);
    if let Some(text) = read_preamble(loaded.paths.prompt_file.as_deref()).await? {
        builder = builder.with_freeform_preamble(text);
    }
    if let Some(text) = read_preamble(loaded.paths.instruct_prompt_file.as_deref()).await? {
        builder = builder.with_instruct_preamble(text);
    }
    Ok(builder)
}
