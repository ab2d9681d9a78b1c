//! Slash command handling for inbound messages.

use chrono::Utc;
use tracing::{info, warn};

use crate::scheduler::TaskSpec;
use crate::store::ChannelAssignment;

use super::InboundMessage;
use super::handler::{BotHandler, HandleOutcome};

// ============================================================================
// Command Handlers
// ============================================================================

impl BotHandler {
    /// Dispatch a slash command.
    ///
    /// Returns `None` for unknown commands, which are then treated as regular
    /// messages.
    pub(super) async fn handle_command(
        &self,
        command: &str,
        message: &InboundMessage,
        assignment: Option<&ChannelAssignment>,
    ) -> Option<HandleOutcome> {
        let mut words = command.split_whitespace();
        match words.next()? {
            "reset" => Some(self.handle_reset_command(message, assignment).await),
            "thread" => {
                let model = words.next()?;
                let instruct_mode = words.next().is_some_and(|w| w == "instruct");
                Some(
                    self.handle_thread_command(message, model, instruct_mode)
                        .await,
                )
            }
            _ => None,
        }
    }

    /// Drop the conversation's session once every earlier message is done.
    async fn handle_reset_command(
        &self,
        message: &InboundMessage,
        assignment: Option<&ChannelAssignment>,
    ) -> HandleOutcome {
        if !matches!(self.resolve_target(assignment), Ok(Some(_))) {
            return HandleOutcome::Ignored;
        }

        self.idle.forget(&message.conversation_id);
        let pool = self.pool.clone();
        let transport = self.transport.clone();
        let bot_messages = self.bot_messages.clone();
        let done_text = self.texts().reset_done.clone();
        let conversation_id = message.conversation_id.clone();

        let spec = TaskSpec::new(&message.conversation_id).with_user(&message.author.display_name);
        let created = self.scheduler.create_task(spec, move |ctx| async move {
            let Some(_turn) = ctx.enter().await else {
                return;
            };
            let existed = pool.delete(&conversation_id).await;
            info!(conversation = %conversation_id, existed = existed, "Conversation reset");
            match transport.send_message(&conversation_id, &done_text).await {
                Ok(id) => bot_messages.insert(id),
                Err(e) => warn!(conversation = %conversation_id, error = %e, "Failed to confirm reset"),
            }
        });

        match created {
            Ok(task) => HandleOutcome::Reset { task },
            Err(e) => {
                warn!(conversation = %message.conversation_id, error = %e, "Dropping reset");
                HandleOutcome::Ignored
            }
        }
    }

    /// Open a thread on the message and assign it to `model`.
    async fn handle_thread_command(
        &self,
        message: &InboundMessage,
        model: &str,
        instruct_mode: bool,
    ) -> HandleOutcome {
        let conversation_id = message.conversation_id.as_str();
        let Some(model) = self.catalog.get(model) else {
            self.say(conversation_id, &self.texts().model_missing).await;
            return HandleOutcome::ModelMissing;
        };
        let instruct_mode = model.resolve_mode(instruct_mode);

        let title = if instruct_mode {
            format!("{} (instruct)", model.name)
        } else {
            model.name.clone()
        };
        let thread_id = match self
            .transport
            .create_thread(conversation_id, &message.message_id, &title)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to create thread");
                self.say(conversation_id, &self.texts().thread_create_fail)
                    .await;
                return HandleOutcome::ThreadFailed;
            }
        };

        let assignment = ChannelAssignment {
            model: model.name.clone(),
            instruct_mode,
            owner_shard: Some(self.shard.id),
            created_at: Utc::now(),
        };
        if let Err(e) = self.assignments.put(&thread_id, assignment).await {
            warn!(thread = %thread_id, error = %e, "Failed to record thread assignment");
            self.say(conversation_id, &self.texts().thread_create_fail)
                .await;
            return HandleOutcome::ThreadFailed;
        }

        info!(
            conversation = %conversation_id,
            thread = %thread_id,
            model = %model.name,
            instruct_mode = instruct_mode,
            "Thread created"
        );
        HandleOutcome::ThreadCreated { thread_id }
    }
}
