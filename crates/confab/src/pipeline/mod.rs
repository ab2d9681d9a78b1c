//! Reply pipeline: the per-message state machine.
//!
//! ```text
//! Idle → AppendingUserMessage → AppendingTrigger → Generating → Finalizing → Idle
//!              │                      │                 │
//!              └──────────────────────┴─────────────────┴──▶ Aborted(reason)
//! ```
//!
//! Only the user message is appended when no reply was triggered. Every engine
//! step runs under a rolling watchdog: each time `reply.timeout` passes
//! without the step completing, the task takes a strike. The first strike
//! marks the reply as slow; reaching the priority floor interrupts the engine
//! and aborts (or, while generating, truncates) the reply.
//!
//! Nothing is persisted here; the sweeper and shutdown path take care of that.

mod prompt;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, Texts};
use crate::gateway::{BotMessageCache, Transport};
use crate::scheduler::{Strike, TaskContext};
use crate::session::{SessionError, SessionHandle};

pub use prompt::PromptFormat;

// ============================================================================
// States and reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyState {
    Idle,
    AppendingUserMessage,
    AppendingTrigger,
    Generating,
    Finalizing,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Hard timeout before generation started.
    Timeout,
    /// The context overflowed again after a reset.
    ContextOverflow,
    /// The session lost its engine.
    EngineUnavailable,
    /// Any other engine failure.
    Engine(String),
    /// The owning task was killed. Nothing user-visible happens.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationReason {
    Timeout,
    TooLong,
}

/// A reply that reached the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
    pub message_id: String,
    pub text: String,
}

/// What one pipeline run did.
#[derive(Debug, Clone)]
pub struct ReplyReport {
    /// Every state entered, in order.
    pub trail: Vec<ReplyState>,
    pub reply: Option<SentReply>,
    pub truncated: Option<TruncationReason>,
}

impl ReplyReport {
    fn new() -> Self {
        Self {
            trail: vec![ReplyState::Idle],
            reply: None,
            truncated: None,
        }
    }

    fn enter(&mut self, state: ReplyState) {
        debug!(state = ?state, "Reply pipeline state");
        self.trail.push(state);
    }

    pub fn final_state(&self) -> &ReplyState {
        self.trail.last().unwrap_or(&ReplyState::Idle)
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self.final_state() {
            ReplyState::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

/// One inbound message to run through the pipeline.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub conversation_id: String,
    /// Display name of the author, used in freeform mode.
    pub author: String,
    pub content: String,
    /// Whether to generate a reply after appending the message.
    pub generate: bool,
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub bot_name: String,
    /// Strike interval of the rolling watchdog.
    pub timeout: Duration,
    /// Hard cap on a posted reply, in bytes.
    pub max_length: usize,
    pub live_edit: bool,
    pub live_edit_interval: Duration,
    /// Percentage of the context the engine keeps when it scrolls.
    pub scroll_keep: u32,
    pub texts: Texts,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bot_name: config.bot.name.clone(),
            timeout: config.reply.timeout(),
            max_length: config.reply.max_length,
            live_edit: config.reply.live_edit,
            live_edit_interval: config.reply.live_edit_interval(),
            scroll_keep: config.engine.scroll_keep,
            texts: config.texts.clone(),
        }
    }

    /// Room for generated text, leaving space for a notice.
    fn reply_budget(&self) -> usize {
        self.max_length
            .saturating_sub(self.texts.longest_notice().len() + 1)
    }
}

// ============================================================================
// Step plumbing
// ============================================================================

/// Why an engine step did not complete normally.
#[derive(Debug)]
enum StepError {
    ContextOverflow,
    HardTimeout,
    Killed,
    Session(SessionError),
}

impl StepError {
    fn into_abort(self) -> AbortReason {
        match self {
            Self::ContextOverflow => AbortReason::ContextOverflow,
            Self::HardTimeout => AbortReason::Timeout,
            Self::Killed => AbortReason::Killed,
            Self::Session(e) => session_abort(e),
        }
    }
}

fn session_abort(e: SessionError) -> AbortReason {
    match e {
        SessionError::ActorShutdown => AbortReason::EngineUnavailable,
        SessionError::Engine(crate::engine::EngineError::Unavailable(_)) => {
            AbortReason::EngineUnavailable
        }
        SessionError::Engine(e) if e.is_context_length_exceeded() => AbortReason::ContextOverflow,
        SessionError::Engine(e) => AbortReason::Engine(e.to_string()),
    }
}

/// Which attempt of an append is being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    /// The session was just reset after an overflow.
    AfterReset,
}

/// Rolling timeout: fires every `timeout` until disarmed.
struct Watchdog {
    timeout: Duration,
    deadline: Instant,
    armed: bool,
}

impl Watchdog {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            armed: false,
        }
    }

    fn arm(&mut self) {
        self.deadline = Instant::now() + self.timeout;
        self.armed = true;
    }

    fn rearm(&mut self) {
        self.deadline += self.timeout;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

/// The message the user sees while a reply is in progress.
struct ReplyMessage {
    id: String,
    shown: String,
    last_edit: std::time::Instant,
}

/// Per-run mutable state shared by the steps.
struct RunState<'a> {
    ctx: &'a TaskContext,
    session: &'a SessionHandle,
    watchdog: Watchdog,
    message: Option<ReplyMessage>,
    slow_marked: bool,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Drives sessions through the reply state machine. Cheap to clone.
#[derive(Clone)]
pub struct ReplyPipeline {
    settings: Arc<PipelineSettings>,
    transport: Arc<dyn Transport>,
    bot_messages: Arc<BotMessageCache>,
}

impl ReplyPipeline {
    pub fn new(
        settings: PipelineSettings,
        transport: Arc<dyn Transport>,
        bot_messages: Arc<BotMessageCache>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            transport,
            bot_messages,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one message through the state machine.
    ///
    /// The caller holds the conversation's fairness gate. Failures never
    /// escape: they end in `Aborted` and, when a reply was expected, a
    /// user-visible notice.
    pub async fn run(
        &self,
        ctx: &TaskContext,
        session: &SessionHandle,
        request: &ReplyRequest,
    ) -> ReplyReport {
        let mut report = ReplyReport::new();
        let mut run = RunState {
            ctx,
            session,
            watchdog: Watchdog::new(self.settings.timeout),
            message: None,
            slow_marked: false,
        };

        if request.generate {
            self.post_placeholder(&mut run, &request.conversation_id)
                .await;
        }

        match self.drive(&mut run, request, &mut report).await {
            Ok(()) => report.enter(ReplyState::Idle),
            Err(reason) => {
                info!(
                    conversation = %request.conversation_id,
                    task = %ctx.id(),
                    reason = ?reason,
                    "Reply aborted"
                );
                if request.generate && reason != AbortReason::Killed {
                    let notice = self.abort_notice(&reason).to_string();
                    report.reply = self
                        .publish(&mut run, &request.conversation_id, &notice)
                        .await;
                }
                report.enter(ReplyState::Aborted(reason));
            }
        }
        report
    }

    async fn drive(
        &self,
        run: &mut RunState<'_>,
        request: &ReplyRequest,
        report: &mut ReplyReport,
    ) -> Result<(), AbortReason> {
        let model = run.session.model().clone();
        let prompt = PromptFormat::new(
            &model,
            run.session.instruct_mode(),
            &self.settings.bot_name,
        );

        // AppendingUserMessage
        report.enter(ReplyState::AppendingUserMessage);
        let user_turn_open = run
            .session
            .info()
            .await
            .map_err(session_abort)?
            .user_turn_open;
        let render_user = |attempt: Attempt| {
            let open = user_turn_open && attempt == Attempt::First;
            prompt.user_message(&request.author, &request.content, open)
        };
        if !render_user(Attempt::First).is_empty() {
            self.append_with_retry(run, false, render_user).await?;
            self.check_context_window(run).await;
        }

        if !request.generate {
            return Ok(());
        }

        // AppendingTrigger
        report.enter(ReplyState::AppendingTrigger);
        let render_trigger = |attempt: Attempt| match attempt {
            Attempt::First => prompt.trigger(),
            // The reset dropped the user message too
            Attempt::AfterReset => format!(
                "{}{}",
                prompt.user_message(&request.author, &request.content, false),
                prompt.trigger()
            ),
        };
        self.append_with_retry(run, false, render_trigger).await?;

        // Generating
        report.enter(ReplyState::Generating);
        let generation = self.generate(run, &request.conversation_id, prompt.stop()).await?;
        report.truncated = generation.truncated;

        // Finalizing
        report.enter(ReplyState::Finalizing);
        let notice = generation.truncated.map(|reason| match reason {
            TruncationReason::Timeout => self.settings.texts.timeout.as_str(),
            TruncationReason::TooLong => self.settings.texts.too_long.as_str(),
        });

        let mut visible = prompt.visible_reply(&generation.text, generation.hit_stop);
        visible = truncate_at_char_boundary(&visible, self.settings.reply_budget()).to_string();
        if visible.is_empty() && notice.is_none() {
            visible = self.settings.texts.empty_reply.clone();
        }
        if let Some(notice) = notice {
            if !visible.is_empty() {
                visible.push('\n');
            }
            visible.push_str(notice);
        }

        // A notice only enters the context when it ends the generated text
        let context_notice = notice.filter(|_| !generation.hit_stop);
        let (tail, opens) = prompt.closing(generation.hit_stop, context_notice);
        if !tail.is_empty() {
            // Closing the turn must not be cut short by the watchdog
            let cancel = CancellationToken::new();
            let (progress, _progress_rx) = mpsc::unbounded_channel();
            if let Err(e) = run.session.append(tail, opens, progress, cancel).await {
                warn!(conversation = %request.conversation_id, error = %e, "Failed to close reply turn");
            }
        }
        self.check_context_window(run).await;

        report.reply = self
            .publish(run, &request.conversation_id, &visible)
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    /// Append, resetting the session and retrying once on context overflow.
    async fn append_with_retry<R>(
        &self,
        run: &mut RunState<'_>,
        opens_user_turn: bool,
        render: R,
    ) -> Result<(), AbortReason>
    where
        R: Fn(Attempt) -> String,
    {
        match self
            .append(run, render(Attempt::First), opens_user_turn)
            .await
        {
            Ok(()) => Ok(()),
            Err(StepError::ContextOverflow) => {
                warn!(conversation = %run.session.id(), "Context overflow, resetting session and retrying");
                run.session.reset().await.map_err(session_abort)?;
                self.append(run, render(Attempt::AfterReset), opens_user_turn)
                    .await
                    .map_err(StepError::into_abort)
            }
            Err(e) => Err(e.into_abort()),
        }
    }

    /// One watched append.
    async fn append(
        &self,
        run: &mut RunState<'_>,
        text: String,
        opens_user_turn: bool,
    ) -> Result<(), StepError> {
        let ctx = run.ctx;
        let session = run.session;
        let cancel = ctx.cancel_token().child_token();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let op = session.append(text, opens_user_turn, progress_tx, cancel.clone());
        tokio::pin!(op);

        run.watchdog.arm();
        let mut hard_timeout = false;
        let result = loop {
            tokio::select! {
                biased;
                _ = ctx.killed() => return Err(StepError::Killed),
                result = &mut op => break result,
                Some(percent) = progress_rx.recv() => {
                    debug!(conversation = %session.id(), percent = percent, "Append progress");
                }
                _ = sleep_until(run.watchdog.deadline), if run.watchdog.armed => {
                    if self.on_timeout(run).await {
                        hard_timeout = true;
                        run.watchdog.disarm();
                        cancel.cancel();
                    }
                }
            }
        };
        run.watchdog.disarm();

        match result {
            Ok(_) if hard_timeout => Err(StepError::HardTimeout),
            Ok(outcome) if outcome.interrupted => Err(StepError::Killed),
            Ok(_) => Ok(()),
            Err(e) if e.is_context_length_exceeded() => Err(StepError::ContextOverflow),
            Err(e) => Err(StepError::Session(e)),
        }
    }

    /// Watched generation with length cap and live edits.
    async fn generate(
        &self,
        run: &mut RunState<'_>,
        conversation_id: &str,
        stop: &str,
    ) -> Result<GenerationOutcome, AbortReason> {
        let ctx = run.ctx;
        let session = run.session;
        let cancel = ctx.cancel_token().child_token();
        let (tokens_tx, mut tokens_rx) = mpsc::unbounded_channel::<String>();
        let op = session.generate(stop.to_string(), tokens_tx, cancel.clone());
        tokio::pin!(op);

        let budget = self.settings.reply_budget();
        let mut streamed = String::new();
        let mut truncated = None;

        run.watchdog.arm();
        let result = loop {
            tokio::select! {
                biased;
                _ = ctx.killed() => return Err(AbortReason::Killed),
                result = &mut op => break result,
                Some(token) = tokens_rx.recv() => {
                    streamed.push_str(&token);
                    if truncated.is_none() && streamed.trim().len() > budget {
                        info!(conversation = %conversation_id, "Reply too long, stopping generation");
                        truncated = Some(TruncationReason::TooLong);
                        run.watchdog.disarm();
                        cancel.cancel();
                    } else if truncated.is_none() && self.settings.live_edit {
                        self.live_edit(run, conversation_id, live_preview(&streamed, stop))
                            .await;
                    }
                }
                _ = sleep_until(run.watchdog.deadline), if run.watchdog.armed => {
                    if self.on_timeout(run).await {
                        truncated = Some(TruncationReason::Timeout);
                        run.watchdog.disarm();
                        cancel.cancel();
                    }
                }
            }
        };
        run.watchdog.disarm();

        let generation = match result {
            Ok(generation) => generation,
            Err(e) => return Err(session_abort(e)),
        };
        if generation.interrupted && truncated.is_none() {
            return Err(AbortReason::Killed);
        }
        // The last tokens may arrive after the call returned
        if truncated.is_none() && generation.text.trim().len() > budget {
            truncated = Some(TruncationReason::TooLong);
        }

        Ok(GenerationOutcome {
            text: generation.text,
            hit_stop: generation.hit_stop,
            truncated,
        })
    }

    /// Take a strike. Returns true on hard timeout.
    async fn on_timeout(&self, run: &mut RunState<'_>) -> bool {
        match run.ctx.strike() {
            Strike::HardTimeout => {
                warn!(conversation = %run.session.id(), task = %run.ctx.id(), "Hard timeout");
                true
            }
            Strike::Slow { first, priority } => {
                info!(
                    conversation = %run.session.id(),
                    task = %run.ctx.id(),
                    priority = priority,
                    "Reply is slow"
                );
                if first && !run.slow_marked {
                    run.slow_marked = true;
                    self.mark_slow(run).await;
                }
                run.watchdog.rearm();
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transport side effects
    // ------------------------------------------------------------------------

    async fn post_placeholder(&self, run: &mut RunState<'_>, conversation_id: &str) {
        let text = self.settings.texts.please_wait.clone();
        match self.transport.send_message(conversation_id, &text).await {
            Ok(id) => {
                self.bot_messages.insert(id.clone());
                run.message = Some(ReplyMessage {
                    id,
                    shown: text,
                    last_edit: std::time::Instant::now(),
                });
            }
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to post placeholder");
            }
        }
    }

    async fn mark_slow(&self, run: &mut RunState<'_>) {
        let Some(message) = run.message.as_mut() else {
            return;
        };
        let text = format!("{} {}", message.shown, self.settings.texts.slow_marker);
        match self
            .transport
            .edit_message(run.session.id(), &message.id, &text)
            .await
        {
            Ok(()) => message.shown = text,
            Err(e) => warn!(error = %e, "Failed to mark reply as slow"),
        }
    }

    async fn live_edit(&self, run: &mut RunState<'_>, conversation_id: &str, preview: &str) {
        let Some(message) = run.message.as_mut() else {
            return;
        };
        if message.last_edit.elapsed() < self.settings.live_edit_interval {
            return;
        }
        let text = preview.trim();
        if text.is_empty() || text == message.shown {
            return;
        }
        match self
            .transport
            .edit_message(conversation_id, &message.id, text)
            .await
        {
            Ok(()) => {
                message.shown = text.to_string();
                message.last_edit = std::time::Instant::now();
            }
            Err(e) => warn!(error = %e, "Live edit failed"),
        }
    }

    /// Show `text` as the reply: edit the placeholder, or post a new message.
    async fn publish(
        &self,
        run: &mut RunState<'_>,
        conversation_id: &str,
        text: &str,
    ) -> Option<SentReply> {
        if let Some(message) = run.message.as_mut() {
            match self
                .transport
                .edit_message(conversation_id, &message.id, text)
                .await
            {
                Ok(()) => {
                    message.shown = text.to_string();
                    return Some(SentReply {
                        message_id: message.id.clone(),
                        text: text.to_string(),
                    });
                }
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "Failed to edit reply, posting instead");
                }
            }
        }

        match self.transport.send_message(conversation_id, text).await {
            Ok(id) => {
                self.bot_messages.insert(id.clone());
                Some(SentReply {
                    message_id: id,
                    text: text.to_string(),
                })
            }
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to post reply");
                None
            }
        }
    }

    fn abort_notice(&self, reason: &AbortReason) -> &str {
        let texts = &self.settings.texts;
        match reason {
            AbortReason::Timeout => &texts.timeout,
            AbortReason::ContextOverflow => &texts.context_overflow,
            AbortReason::EngineUnavailable | AbortReason::Engine(_) => &texts.engine_unavailable,
            AbortReason::Killed => "",
        }
    }

    /// Warn once the context is past the point where the engine scrolls.
    async fn check_context_window(&self, run: &RunState<'_>) {
        let Ok(info) = run.session.info().await else {
            return;
        };
        let threshold = 100u32.saturating_sub(self.settings.scroll_keep) as f32;
        if info.context_size > 0 && info.fill_percent() > threshold {
            warn!(
                conversation = %info.id,
                fill = info.context_fill,
                size = info.context_size,
                "Context window nearly full, older text will scroll out"
            );
        }
    }
}

struct GenerationOutcome {
    text: String,
    hit_stop: bool,
    truncated: Option<TruncationReason>,
}

/// Longest prefix of `text` that is at most `max` bytes and ends on a char boundary.
/// Partial output safe to show while generating: everything before the stop
/// string, minus any tail that could still grow into it.
fn live_preview<'s>(streamed: &'s str, stop: &str) -> &'s str {
    if stop.is_empty() {
        return streamed;
    }
    if let Some(at) = streamed.find(stop) {
        return &streamed[..at];
    }
    let held = (1..stop.len())
        .rev()
        .filter(|&n| stop.is_char_boundary(n))
        .find(|&n| streamed.ends_with(&stop[..n]))
        .unwrap_or(0);
    &streamed[..streamed.len() - held]
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].trim_end()
}
