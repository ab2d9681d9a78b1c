//! Deciding whether an inbound message gets a reply.

use std::sync::Arc;

use rand::Rng;

use crate::config::{AmbientMode, Config};

use super::{BotMessageCache, InboundMessage};

/// Why the bot replies to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTrigger {
    /// The conversation is a thread assigned to the bot.
    AssignedThread,
    /// The message names the bot.
    Mention,
    /// The message replies to something the bot posted.
    ReplyToBot,
    /// The ambient chance came up.
    Ambient,
}

/// Reply decision rules for unassigned conversations.
#[derive(Clone)]
pub struct ReplyPolicy {
    bot_name: String,
    bot_id: Option<String>,
    /// Reply to one in `ambient_chance` messages; 0 disables.
    ambient_chance: u32,
    ambient_mode: AmbientMode,
    bot_messages: Arc<BotMessageCache>,
}

impl ReplyPolicy {
    pub fn new(config: &Config, bot_messages: Arc<BotMessageCache>) -> Self {
        Self {
            bot_name: config.bot.name.clone(),
            bot_id: config.bot.id.clone(),
            ambient_chance: config.reply.ambient_chance,
            ambient_mode: config.reply.ambient_mode,
            bot_messages,
        }
    }

    /// Decide whether `message` should be answered.
    ///
    /// Assigned threads always reply. Elsewhere the first matching rule wins:
    /// mention, reply to a bot message, then the ambient chance.
    pub fn decide(&self, message: &InboundMessage, assigned: bool) -> Option<ReplyTrigger> {
        if assigned {
            return Some(ReplyTrigger::AssignedThread);
        }
        if message.mentions_bot || self.names_bot(&message.content) {
            return Some(ReplyTrigger::Mention);
        }
        if let Some(reference) = &message.reference
            && self.bot_messages.contains(reference)
        {
            return Some(ReplyTrigger::ReplyToBot);
        }
        if self.ambient_roll(message) {
            return Some(ReplyTrigger::Ambient);
        }
        None
    }

    fn names_bot(&self, content: &str) -> bool {
        if !self.bot_name.is_empty()
            && content
                .to_lowercase()
                .contains(&self.bot_name.to_lowercase())
        {
            return true;
        }
        match &self.bot_id {
            Some(id) => {
                content.contains(&format!("<@{id}>")) || content.contains(&format!("<@!{id}>"))
            }
            None => false,
        }
    }

    fn ambient_roll(&self, message: &InboundMessage) -> bool {
        if self.ambient_chance == 0 {
            return false;
        }
        match self.ambient_mode {
            AmbientMode::Timestamp => {
                message
                    .created_at
                    .timestamp()
                    .rem_euclid(i64::from(self.ambient_chance))
                    == 0
            }
            AmbientMode::Random => rand::rng().random_range(0..self.ambient_chance) == 0,
        }
    }

    /// Replace platform mentions of the bot with its display name.
    pub fn normalize_mentions(&self, content: &str) -> String {
        let Some(id) = &self.bot_id else {
            return content.to_string();
        };
        content
            .replace(&format!("<@!{id}>"), &self.bot_name)
            .replace(&format!("<@{id}>"), &self.bot_name)
    }
}
