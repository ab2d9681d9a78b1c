//! Glue between a chat platform and the bot core.
//!
//! The platform side is reached through the [`Transport`] trait. Inbound
//! messages arrive as [`InboundMessage`] values and are handed to
//! [`BotHandler::handle_message`], which decides who owns the conversation,
//! whether to reply, and spawns one scheduler task per message. Conversations
//! that go quiet get an idle reply from [`spawn_idle_replies`].
//!
//! ```text
//! platform ──InboundMessage──▶ BotHandler ──▶ Scheduler task
//!                                  │               │ enter() fairness gate
//!                                  │               │ SessionPool::get_or_create
//!                                  │               ▼
//!                                  │          ReplyPipeline::run ──▶ Transport
//!                                  ▼
//!                           AssignmentStore
//! ```

mod commands;
pub mod handler;
pub mod idle;
pub mod shard;
pub mod transport;
pub mod trigger;

use chrono::{DateTime, Utc};

pub use handler::{BotHandler, BotHandlerConfig, HandleOutcome};
pub use idle::spawn_idle_replies;
pub use transport::{BotMessageCache, Transport, TransportError};
pub use trigger::{ReplyPolicy, ReplyTrigger};

/// Author of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub display_name: String,
    pub is_bot: bool,
}

/// A message as delivered by the platform.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub conversation_id: String,
    /// When the conversation was created; used for shard ownership.
    pub conversation_created_at: DateTime<Utc>,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub author: Author,
    pub content: String,
    /// Id of the message this one replies to.
    pub reference: Option<String>,
    /// The platform flagged an explicit mention of the bot.
    pub mentions_bot: bool,
}
