//! Turn formatting for both prompting modes.
//!
//! Instruct mode frames turns with the model's user/bot prompt templates.
//! Freeform mode renders a chat log, one `name: line` per line.

use crate::model::ModelDescriptor;

/// Formats the text a pipeline appends for one conversation.
#[derive(Debug, Clone, Copy)]
pub struct PromptFormat<'a> {
    pub model: &'a ModelDescriptor,
    pub instruct_mode: bool,
    pub bot_name: &'a str,
}

impl<'a> PromptFormat<'a> {
    pub fn new(model: &'a ModelDescriptor, instruct_mode: bool, bot_name: &'a str) -> Self {
        Self {
            model,
            instruct_mode,
            bot_name,
        }
    }

    fn separator(&self) -> &'static str {
        self.model.prompt_separator()
    }

    /// An incoming message.
    ///
    /// `user_turn_open` means the context already ends with the user prompt,
    /// so instruct mode must not repeat it. Empty content renders nothing.
    pub fn user_message(&self, author: &str, content: &str, user_turn_open: bool) -> String {
        let content = content.trim();
        if content.is_empty() {
            return String::new();
        }

        if self.instruct_mode {
            if user_turn_open {
                format!("{content}\n")
            } else {
                format!("{}{}{content}\n", self.model.user_prompt, self.separator())
            }
        } else {
            content
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(|line| format!("{author}: {line}\n"))
                .collect()
        }
    }

    /// The bot's turn marker, after which generation starts.
    pub fn trigger(&self) -> String {
        if self.instruct_mode {
            format!("{}{}", self.model.bot_prompt, self.separator())
        } else {
            format!("{}:", self.bot_name)
        }
    }

    /// What generation stops on.
    pub fn stop(&self) -> &'a str {
        self.model.stop_string(self.instruct_mode)
    }

    /// Text a user sees for a finished generation: stop string and
    /// surrounding whitespace removed.
    pub fn visible_reply(&self, generated: &str, hit_stop: bool) -> String {
        let text = if hit_stop {
            generated.strip_suffix(self.stop()).unwrap_or(generated)
        } else {
            generated
        };
        text.trim().to_string()
    }

    /// What to append after a reply so the next turn starts cleanly.
    ///
    /// Returns the text and whether the context then ends with an open user
    /// turn. `notice` is the truncation notice, if the reply was cut off.
    pub fn closing(&self, hit_stop: bool, notice: Option<&str>) -> (String, bool) {
        let mut tail = String::new();
        if let Some(notice) = notice {
            tail.push(' ');
            tail.push_str(notice);
        }

        // Instruct generations that hit the stop string end on the user prompt
        let open = hit_stop && self.instruct_mode;
        if open {
            tail.push_str(self.separator());
            return (tail, true);
        }
        if !(hit_stop && self.stop().ends_with('\n')) {
            tail.push('\n');
        }

        // Models that end turns with end-of-sequence never write the user prompt
        if self.instruct_mode && self.model.emits_eos {
            tail.push_str(&self.model.user_prompt);
            tail.push_str(self.separator());
            return (tail, true);
        }
        (tail, false)
    }
}
