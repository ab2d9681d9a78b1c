//! Inbound message handling.
//!
//! `BotHandler` resolves which model a conversation talks to, checks shard
//! ownership, dispatches commands, decides whether to reply, and hands the
//! rest to a scheduler task. It never blocks on the engine itself.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ShardConfig, Texts};
use crate::model::{ModelCatalog, ModelDescriptor};
use crate::pipeline::{ReplyPipeline, ReplyRequest};
use crate::pool::SessionPool;
use crate::scheduler::{Scheduler, SchedulerError, TaskContext, TaskId, TaskSpec};
use crate::store::{AssignmentStore, ChannelAssignment};

use super::idle::IdleTracker;
use super::trigger::{ReplyPolicy, ReplyTrigger};
use super::{BotMessageCache, InboundMessage, Transport};

// ============================================================================
// Configuration
// ============================================================================

/// Everything a [`BotHandler`] is wired to.
pub struct BotHandlerConfig {
    pub catalog: ModelCatalog,
    pub pool: SessionPool,
    pub scheduler: Scheduler,
    pub pipeline: ReplyPipeline,
    pub policy: ReplyPolicy,
    pub assignments: Arc<dyn AssignmentStore>,
    pub transport: Arc<dyn Transport>,
    pub bot_messages: Arc<BotMessageCache>,
    pub shard: ShardConfig,
    /// Model for conversations without an assignment.
    pub default_model: Option<String>,
    /// Ignore conversations without an assignment.
    pub threads_only: bool,
}

/// What `handle_message` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Not for this bot (own or empty message, unassigned conversation, no model).
    Ignored,
    /// Another shard owns the conversation.
    OtherShard,
    /// The assigned model is gone; the user was told.
    ModelMissing,
    /// A reset of the conversation was scheduled.
    Reset { task: TaskId },
    /// A new thread was opened and assigned.
    ThreadCreated { thread_id: String },
    /// Opening a thread failed; the user was told.
    ThreadFailed,
    /// A pipeline run was scheduled.
    Scheduled {
        task: TaskId,
        trigger: Option<ReplyTrigger>,
    },
}

/// Model and mode a conversation talks in.
#[derive(Debug, Clone)]
pub(super) struct ChannelTarget {
    pub model: Arc<ModelDescriptor>,
    pub instruct_mode: bool,
    /// The conversation is a thread assigned to the bot.
    pub assigned: bool,
}

// ============================================================================
// Bot Handler
// ============================================================================

pub struct BotHandler {
    pub(super) catalog: ModelCatalog,
    pub(super) pool: SessionPool,
    pub(super) scheduler: Scheduler,
    pub(super) pipeline: ReplyPipeline,
    pub(super) policy: ReplyPolicy,
    pub(super) assignments: Arc<dyn AssignmentStore>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) bot_messages: Arc<BotMessageCache>,
    pub(super) shard: ShardConfig,
    pub(super) idle: IdleTracker,
    default_model: Option<String>,
    threads_only: bool,
}

impl BotHandler {
    pub fn new(config: BotHandlerConfig) -> Self {
        Self {
            catalog: config.catalog,
            pool: config.pool,
            scheduler: config.scheduler,
            pipeline: config.pipeline,
            policy: config.policy,
            assignments: config.assignments,
            transport: config.transport,
            bot_messages: config.bot_messages,
            shard: config.shard,
            idle: IdleTracker::default(),
            default_model: config.default_model,
            threads_only: config.threads_only,
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(super) fn texts(&self) -> &Texts {
        &self.pipeline.settings().texts
    }

    /// Process one inbound message.
    pub async fn handle_message(&self, message: InboundMessage) -> HandleOutcome {
        if message.author.is_bot || message.content.trim().is_empty() {
            return HandleOutcome::Ignored;
        }
        let conversation_id = message.conversation_id.as_str();

        let assignment = match self.assignments.get(conversation_id).await {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to read assignment");
                None
            }
        };

        let owner = assignment.as_ref().and_then(|a| a.owner_shard);
        if !self.shard.owns(message.conversation_created_at, owner) {
            debug!(conversation = %conversation_id, "Conversation belongs to another shard");
            return HandleOutcome::OtherShard;
        }

        if let Some(command) = message.content.trim().strip_prefix('/')
            && let Some(outcome) = self
                .handle_command(command, &message, assignment.as_ref())
                .await
        {
            return outcome;
        }

        let target = match self.resolve_target(assignment.as_ref()) {
            Ok(Some(target)) => target,
            Ok(None) => return HandleOutcome::Ignored,
            Err(missing) => {
                warn!(conversation = %conversation_id, model = %missing, "Assigned model is missing");
                self.say(conversation_id, &self.texts().model_missing).await;
                return HandleOutcome::ModelMissing;
            }
        };

        let trigger = self.policy.decide(&message, target.assigned);
        if let Some(trigger) = trigger {
            debug!(conversation = %conversation_id, trigger = ?trigger, "Reply triggered");
        }

        self.idle.touch(conversation_id, target.clone());
        match self.schedule_reply(
            conversation_id,
            target,
            message.author.display_name.clone(),
            self.policy.normalize_mentions(&message.content),
            trigger.is_some(),
        ) {
            Ok(task) => HandleOutcome::Scheduled { task, trigger },
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Dropping message");
                HandleOutcome::Ignored
            }
        }
    }

    /// Spawn a pipeline run for one conversation. An empty `content` with
    /// `generate` set only asks the model to speak.
    pub(super) fn schedule_reply(
        &self,
        conversation_id: &str,
        target: ChannelTarget,
        author: String,
        content: String,
        generate: bool,
    ) -> Result<TaskId, SchedulerError> {
        let mut spec = TaskSpec::new(conversation_id);
        if !author.is_empty() {
            spec = spec.with_user(&author);
        }
        let job = ReplyJob {
            pool: self.pool.clone(),
            pipeline: self.pipeline.clone(),
            transport: self.transport.clone(),
            bot_messages: self.bot_messages.clone(),
            unavailable_text: self.texts().engine_unavailable.clone(),
            target,
            request: ReplyRequest {
                conversation_id: conversation_id.to_string(),
                author,
                content,
                generate,
            },
        };
        self.scheduler.create_task(spec, move |ctx| job.run(ctx))
    }

    /// Model and mode for a conversation.
    ///
    /// `Ok(None)` means the bot does not talk here. `Err` carries the name of
    /// an assigned model that is no longer in the catalog.
    pub(super) fn resolve_target(
        &self,
        assignment: Option<&ChannelAssignment>,
    ) -> Result<Option<ChannelTarget>, String> {
        if let Some(assignment) = assignment {
            let model = self
                .catalog
                .get(&assignment.model)
                .ok_or_else(|| assignment.model.clone())?;
            let instruct_mode = model.resolve_mode(assignment.instruct_mode);
            return Ok(Some(ChannelTarget {
                model,
                instruct_mode,
                assigned: true,
            }));
        }

        if self.threads_only {
            return Ok(None);
        }
        let Some(name) = self.default_model.as_deref() else {
            return Ok(None);
        };
        let Some(model) = self.catalog.get(name) else {
            warn!(model = %name, "Default model is not in the catalog");
            return Ok(None);
        };
        let instruct_mode = model.resolve_mode(false);
        Ok(Some(ChannelTarget {
            model,
            instruct_mode,
            assigned: false,
        }))
    }

    /// Post a message and remember it as the bot's own.
    pub(super) async fn say(&self, conversation_id: &str, text: &str) -> Option<String> {
        match self.transport.send_message(conversation_id, text).await {
            Ok(id) => {
                self.bot_messages.insert(id.clone());
                Some(id)
            }
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to send message");
                None
            }
        }
    }

    /// Stop accepting messages, kill running tasks, and persist sessions.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.pool.shutdown().await;
        info!("Bot handler shut down");
    }
}

// ============================================================================
// Reply Job
// ============================================================================

/// The body of one message task.
struct ReplyJob {
    pool: SessionPool,
    pipeline: ReplyPipeline,
    transport: Arc<dyn Transport>,
    bot_messages: Arc<BotMessageCache>,
    unavailable_text: String,
    target: ChannelTarget,
    request: ReplyRequest,
}

impl ReplyJob {
    async fn run(self, ctx: TaskContext) {
        let Some(_turn) = ctx.enter().await else {
            debug!(task = %ctx.id(), "Task killed before it got its turn");
            return;
        };
        let conversation_id = self.request.conversation_id.as_str();

        let session = match self
            .pool
            .get_or_create(
                conversation_id,
                self.target.model.clone(),
                self.target.instruct_mode,
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(conversation = %conversation_id, task = %ctx.id(), error = %e, "No session");
                if self.request.generate {
                    match self
                        .transport
                        .send_message(conversation_id, &self.unavailable_text)
                        .await
                    {
                        Ok(id) => self.bot_messages.insert(id),
                        Err(e) => warn!(error = %e, "Failed to send apology"),
                    }
                }
                return;
            }
        };

        let report = self.pipeline.run(&ctx, &session, &self.request).await;
        debug!(
            conversation = %conversation_id,
            task = %ctx.id(),
            state = ?report.final_state(),
            replied = report.reply.is_some(),
            "Message handled"
        );
    }
}
