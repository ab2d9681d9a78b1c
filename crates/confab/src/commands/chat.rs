//! `confab chat`: drive one always-reply conversation from the terminal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

use confab::engine::SubprocessEngineFactory;
use confab::gateway::{
    Author, BotHandler, BotHandlerConfig, BotMessageCache, InboundMessage, ReplyPolicy,
    Transport, TransportError, spawn_idle_replies,
};
use confab::pipeline::{PipelineSettings, ReplyPipeline};
use confab::pool::{SessionPool, spawn_sweeper};
use confab::scheduler::Scheduler;
use confab::store::file::{FileAssignmentStore, FileInitCacheStore, FileSessionStateStore};
use confab::store::{AssignmentStore, ChannelAssignment};

use super::{load, warm};

/// Conversation id of the terminal conversation.
const CONSOLE_CONVERSATION: &str = "console";

const GATE_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const GATE_MAX_IDLE: Duration = Duration::from_secs(7200);

// ============================================================================
// Console Transport
// ============================================================================

/// Prints bot messages to stdout.
struct ConsoleTransport {
    bot_name: String,
    next_id: AtomicU64,
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send_message(
        &self,
        _conversation_id: &str,
        text: &str,
    ) -> Result<String, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        println!("{}: {text}", self.bot_name);
        Ok(format!("bot-{id}"))
    }

    async fn edit_message(
        &self,
        _conversation_id: &str,
        _message_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        println!("{} (edit): {text}", self.bot_name);
        Ok(())
    }
}

// ============================================================================
// Command
// ============================================================================

pub async fn run(config_path: &str, model: Option<&str>, instruct: bool) -> Result<()> {
    let loaded = load(config_path).await?;
    let config = &loaded.config;

    // A preamble that does not fit the context is fatal here, not mid-chat
    let report = warm::builder(&loaded)
        .await?
        .ensure_all(&loaded.catalog)
        .await?;
    info!(built = report.built.len(), "Init caches ready");

    let model_name = match model.or(config.default_model.as_deref()) {
        Some(name) => name.to_string(),
        None => {
            let mut names: Vec<_> = loaded.catalog.iter().map(|m| m.name.clone()).collect();
            names.sort();
            match names.into_iter().next() {
                Some(name) => name,
                None => bail!("no models in {}", loaded.paths.models_dir.display()),
            }
        }
    };
    let descriptor = loaded
        .catalog
        .get(&model_name)
        .with_context(|| format!("model '{model_name}' is not in the catalog"))?;

    let assignments: Arc<dyn AssignmentStore> =
        Arc::new(FileAssignmentStore::new(&loaded.paths.assignments_file));
    assignments
        .put(
            CONSOLE_CONVERSATION,
            ChannelAssignment {
                model: descriptor.name.clone(),
                instruct_mode: descriptor.resolve_mode(instruct),
                owner_shard: Some(config.shard.id),
                created_at: Utc::now(),
            },
        )
        .await?;

    let factory = Arc::new(SubprocessEngineFactory::new(config.engine.clone()));
    let pool = SessionPool::new(
        &config.pool,
        factory,
        Arc::new(FileSessionStateStore::new(&loaded.paths.sessions_dir)),
    )
    .with_init_caches(Arc::new(FileInitCacheStore::new(&loaded.paths.cache_dir)));

    info!(
        size = pool.capacity(),
        persistence = pool.persistence_enabled(),
        "Session pool ready"
    );

    let background_cancel = CancellationToken::new();
    let sweeper = config.pool.max_context_age().map(|max_age| {
        spawn_sweeper(
            pool.clone(),
            config.pool.sweep_interval(),
            max_age,
            background_cancel.clone(),
        )
    });

    let scheduler = Scheduler::new(config.priority);
    scheduler.spawn_gate_cleanup(GATE_CLEANUP_INTERVAL, GATE_MAX_IDLE);
    let bot_messages = Arc::new(BotMessageCache::default());
    let transport: Arc<dyn Transport> = Arc::new(ConsoleTransport {
        bot_name: config.bot.name.clone(),
        next_id: AtomicU64::new(1),
    });
    let handler = Arc::new(BotHandler::new(BotHandlerConfig {
        catalog: loaded.catalog.clone(),
        pool: pool.clone(),
        scheduler: scheduler.clone(),
        pipeline: ReplyPipeline::new(
            PipelineSettings::from_config(config),
            transport.clone(),
            bot_messages.clone(),
        ),
        policy: ReplyPolicy::new(config, bot_messages.clone()),
        assignments,
        transport,
        bot_messages,
        shard: config.shard,
        default_model: config.default_model.clone(),
        threads_only: config.threads_only,
    }));
    let idle_replies = config.reply.idle_reply_after().map(|after| {
        spawn_idle_replies(
            handler.clone(),
            config.reply.idle_check_interval(),
            after,
            background_cancel.clone(),
        )
    });

    println!(
        "Chatting with {} ({}). Commands: /reset, /tasks, /sessions, /exit",
        config.bot.name, descriptor.name
    );
    let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut message_id = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" => break,
            "/tasks" => {
                for task in scheduler.list() {
                    println!(
                        "{} {} {} priority={} strikes={}",
                        task.id, task.name, task.status, task.priority, task.strikes
                    );
                }
                continue;
            }
            "/sessions" => {
                for session in pool.list().await {
                    println!(
                        "{} {} fill={:.0}% last_active={}",
                        session.id,
                        session.model,
                        session.fill_percent(),
                        session.last_activity.format("%H:%M:%S")
                    );
                }
                continue;
            }
            _ => {}
        }

        message_id += 1;
        let now = Utc::now();
        handler
            .handle_message(InboundMessage {
                conversation_id: CONSOLE_CONVERSATION.to_string(),
                conversation_created_at: now,
                message_id: format!("user-{message_id}"),
                created_at: now,
                author: Author {
                    id: user.clone(),
                    display_name: user.clone(),
                    is_bot: false,
                },
                content: line.to_string(),
                reference: None,
                mentions_bot: false,
            })
            .await;
    }

    background_cancel.cancel();
    for join in sweeper.into_iter().chain(idle_replies) {
        let _ = join.await;
    }
    handler.shutdown().await;
    Ok(())
}
