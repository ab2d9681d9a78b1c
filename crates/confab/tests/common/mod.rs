//! Common test utilities.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::oneshot;

use confab::config::{Config, PoolConfig, PriorityConfig};
use confab::engine::testing::ScriptedFactory;
use confab::gateway::{
    Author, BotHandler, BotHandlerConfig, BotMessageCache, InboundMessage, ReplyPolicy,
    Transport, TransportError,
};
use confab::model::{InstructModePolicy, ModelCatalog, ModelDescriptor, PromptLayout};
use confab::pipeline::{PipelineSettings, ReplyPipeline, ReplyReport, ReplyRequest};
use confab::pool::{SessionLease, SessionPool};
use confab::scheduler::{Scheduler, TaskSpec};
use confab::store::file::{FileAssignmentStore, FileInitCacheStore, FileSessionStateStore};

pub const BOT_NAME: &str = "Confab";

// ============================================================================
// Models
// ============================================================================

/// Descriptor with Alpaca-style prompts, usable in both modes.
pub fn model(name: &str) -> ModelDescriptor {
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

pub fn catalog() -> ModelCatalog {
    ModelCatalog::from_models([model("vicuna"), model("alpaca")])
}

// ============================================================================
// Recording Transport
// ============================================================================

/// One transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posted {
    Sent {
        conversation: String,
        id: String,
        text: String,
    },
    Edited {
        conversation: String,
        id: String,
        text: String,
    },
    Thread {
        conversation: String,
        parent: String,
        title: String,
        id: String,
    },
}

/// Transport that records everything and can fail thread creation.
#[derive(Default)]
pub struct RecordingTransport {
    next_id: AtomicU64,
    log: Mutex<Vec<Posted>>,
    fail_threads: AtomicBool,
}

impl RecordingTransport {
    pub fn fail_threads(&self, fail: bool) {
        self.fail_threads.store(fail, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<Posted> {
        self.log.lock().unwrap().clone()
    }

    /// Texts of edits, in order.
    pub fn edits(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|p| match p {
                Posted::Edited { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Current text of every message posted to `conversation`, oldest first.
    pub fn messages(&self, conversation: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut texts: HashMap<String, String> = HashMap::new();
        for posted in self.log() {
            match posted {
                Posted::Sent {
                    conversation: c,
                    id,
                    text,
                } if c == conversation => {
                    order.push(id.clone());
                    texts.insert(id, text);
                }
                Posted::Edited {
                    conversation: c,
                    id,
                    text,
                } if c == conversation => {
                    texts.insert(id, text);
                }
                _ => {}
            }
        }
        order.into_iter().filter_map(|id| texts.remove(&id)).collect()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<String, TransportError> {
        let id = self.next_id("msg");
        self.log.lock().unwrap().push(Posted::Sent {
            conversation: conversation_id.to_string(),
            id: id.clone(),
            text: text.to_string(),
        });
        Ok(id)
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        self.log.lock().unwrap().push(Posted::Edited {
            conversation: conversation_id.to_string(),
            id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn create_thread(
        &self,
        conversation_id: &str,
        message_id: &str,
        title: &str,
    ) -> Result<String, TransportError> {
        if self.fail_threads.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("missing permissions".to_string()));
        }
        let id = self.next_id("thread");
        self.log.lock().unwrap().push(Posted::Thread {
            conversation: conversation_id.to_string(),
            parent: message_id.to_string(),
            title: title.to_string(),
            id: id.clone(),
        });
        Ok(id)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Pipeline settings with fast-but-safe defaults.
pub fn settings() -> PipelineSettings {
    let config = Config::default();
    PipelineSettings {
        bot_name: BOT_NAME.to_string(),
        timeout: Duration::from_secs(5),
        max_length: 2000,
        live_edit: false,
        live_edit_interval: Duration::from_millis(3000),
        scroll_keep: 20,
        texts: config.texts,
    }
}

pub fn pool_config(size: usize, persistence: bool) -> PoolConfig {
    PoolConfig {
        size,
        max_context_age_seconds: 0,
        sweep_interval_seconds: 1,
        persistence,
    }
}

/// Every collaborator of the core, wired to in-memory or temp-dir backends.
pub struct Harness {
    pub dir: TempDir,
    pub factory: ScriptedFactory,
    pub pool: SessionPool,
    pub scheduler: Scheduler,
    pub transport: Arc<RecordingTransport>,
    pub bot_messages: Arc<BotMessageCache>,
    pub pipeline: ReplyPipeline,
    pub states: Arc<FileSessionStateStore>,
    pub init_caches: Arc<FileInitCacheStore>,
    pub assignments: Arc<FileAssignmentStore>,
}

impl Harness {
    pub fn new(capacity: usize) -> Self {
        Self::with_settings(capacity, settings())
    }

    pub fn with_settings(capacity: usize, settings: PipelineSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(capacity);
        let states = Arc::new(FileSessionStateStore::new(dir.path().join("sessions")));
        let init_caches = Arc::new(FileInitCacheStore::new(dir.path().join("cache")));
        let assignments = Arc::new(FileAssignmentStore::new(
            dir.path().join("assignments.yaml"),
        ));
        let pool = SessionPool::new(
            &pool_config(4, true),
            Arc::new(factory.clone()),
            states.clone(),
        )
        .with_init_caches(init_caches.clone());
        let transport = Arc::new(RecordingTransport::default());
        let bot_messages = Arc::new(BotMessageCache::default());
        let pipeline = ReplyPipeline::new(settings, transport.clone(), bot_messages.clone());

        Self {
            dir,
            factory,
            pool,
            scheduler: Scheduler::new(PriorityConfig::default()),
            transport,
            bot_messages,
            pipeline,
            states,
            init_caches,
            assignments,
        }
    }

    /// A handler over this harness, configured from `config`.
    pub fn handler(&self, config: &Config) -> BotHandler {
        BotHandler::new(BotHandlerConfig {
            catalog: catalog(),
            pool: self.pool.clone(),
            scheduler: self.scheduler.clone(),
            pipeline: self.pipeline.clone(),
            policy: ReplyPolicy::new(config, self.bot_messages.clone()),
            assignments: self.assignments.clone(),
            transport: self.transport.clone(),
            bot_messages: self.bot_messages.clone(),
            shard: config.shard,
            default_model: config.default_model.clone(),
            threads_only: config.threads_only,
        })
    }

    pub async fn session(&self, id: &str, instruct_mode: bool) -> SessionLease {
        self.pool
            .get_or_create(id, Arc::new(model("vicuna")), instruct_mode)
            .await
            .unwrap()
    }

    /// Run the pipeline inside a scheduler task, the way the handler does.
    pub async fn run(&self, session: SessionLease, request: ReplyRequest) -> ReplyReport {
        let (tx, rx) = oneshot::channel();
        let pipeline = self.pipeline.clone();
        self.scheduler
            .create_task(TaskSpec::new(&request.conversation_id), move |ctx| async move {
                let Some(_turn) = ctx.enter().await else {
                    return;
                };
                let report = pipeline.run(&ctx, &session, &request).await;
                let _ = tx.send(report);
            })
            .unwrap();
        rx.await.unwrap()
    }
}

pub fn request(conversation: &str, content: &str, generate: bool) -> ReplyRequest {
    ReplyRequest {
        conversation_id: conversation.to_string(),
        author: "alice".to_string(),
        content: content.to_string(),
        generate,
    }
}

// ============================================================================
// Messages
// ============================================================================

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

pub fn inbound(conversation: &str, content: &str) -> InboundMessage {
    InboundMessage {
        conversation_id: conversation.to_string(),
        conversation_created_at: at(1_700_000_000),
        message_id: format!("in-{content}"),
        created_at: at(1_700_000_001),
        author: Author {
            id: "u1".to_string(),
            display_name: "alice".to_string(),
            is_bot: false,
        },
        content: content.to_string(),
        reference: None,
        mentions_bot: false,
    }
}

/// Config for a bot that talks everywhere with `vicuna` by default.
pub fn open_config() -> Config {
    let mut config = Config::default();
    config.bot.name = BOT_NAME.to_string();
    config.threads_only = false;
    config.default_model = Some("vicuna".to_string());
    config
}
