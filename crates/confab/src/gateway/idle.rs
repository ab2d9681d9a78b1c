//! Idle replies: the bot speaks up in a conversation that has gone quiet.
//!
//! Every message the handler schedules restarts its conversation's quiet
//! timer. A background task periodically looks for conversations quiet for
//! longer than the threshold and schedules a generate-only run for each, so
//! the reply queues behind any earlier work through the usual fairness gate.
//! A conversation gets one idle reply per quiet period.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::TaskId;

use super::handler::{BotHandler, ChannelTarget};

/// Last time each conversation saw a message the bot handled.
#[derive(Default)]
pub(super) struct IdleTracker {
    quiet: DashMap<String, QuietSince>,
}

pub(super) struct QuietSince {
    pub since: Instant,
    pub target: ChannelTarget,
}

impl IdleTracker {
    pub fn touch(&self, conversation_id: &str, target: ChannelTarget) {
        self.quiet.insert(
            conversation_id.to_string(),
            QuietSince {
                since: Instant::now(),
                target,
            },
        );
    }

    pub fn forget(&self, conversation_id: &str) {
        self.quiet.remove(conversation_id);
    }

    /// Remove and return every conversation quiet for at least `after`.
    pub fn take_quiet(&self, after: Duration) -> Vec<(String, ChannelTarget)> {
        let now = Instant::now();
        let due: Vec<String> = self
            .quiet
            .iter()
            .filter(|entry| now.duration_since(entry.since) >= after)
            .map(|entry| entry.key().clone())
            .collect();

        due.into_iter()
            .filter_map(|id| {
                // A message may have arrived since the scan
                self.quiet
                    .remove_if(&id, |_, quiet| now.duration_since(quiet.since) >= after)
                    .map(|(id, quiet)| (id, quiet.target))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.quiet.len()
    }
}

impl BotHandler {
    /// Schedule a reply in every conversation quiet for at least `after`.
    pub fn reply_to_idle(&self, after: Duration) -> Vec<TaskId> {
        let mut scheduled = Vec::new();
        for (conversation_id, target) in self.idle.take_quiet(after) {
            match self.schedule_reply(&conversation_id, target, String::new(), String::new(), true)
            {
                Ok(task) => {
                    debug!(conversation = %conversation_id, task = %task, "Idle reply scheduled");
                    scheduled.push(task);
                }
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "Dropping idle reply")
                }
            }
        }
        scheduled
    }

    /// Conversations currently waiting to go quiet.
    pub fn tracked_conversations(&self) -> usize {
        self.idle.len()
    }
}

/// Run `handler.reply_to_idle(after)` every `interval` until `cancel` fires.
pub fn spawn_idle_replies(
    handler: Arc<BotHandler>,
    interval: Duration,
    after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs_f64(),
            after_secs = after.as_secs_f64(),
            "Idle replies started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let scheduled = handler.reply_to_idle(after);
                    if !scheduled.is_empty() {
                        debug!(count = scheduled.len(), "Idle replies scheduled");
                    }
                }
            }
        }

        debug!("Idle replies stopped");
    })
}
