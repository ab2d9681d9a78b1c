//! Integration tests for the reply pipeline running inside scheduler tasks.

mod common;

use std::time::Duration;

use tokio::sync::oneshot;

use confab::pipeline::{AbortReason, ReplyState, TruncationReason};
use confab::scheduler::TaskSpec;

use common::{Harness, request, settings};

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn freeform_reply_is_posted_over_placeholder() {
    let h = Harness::new(1000);
    h.factory.push_reply(" Hi there!\n");
    let session = h.session("c1", false).await;

    let report = h.run(session.clone(), request("c1", "hello", true)).await;

    assert_eq!(
        report.trail,
        vec![
            ReplyState::Idle,
            ReplyState::AppendingUserMessage,
            ReplyState::AppendingTrigger,
            ReplyState::Generating,
            ReplyState::Finalizing,
            ReplyState::Idle,
        ]
    );
    assert_eq!(report.reply.as_ref().unwrap().text, "Hi there!");
    assert!(report.truncated.is_none());
    assert_eq!(h.transport.messages("c1"), vec!["Hi there!".to_string()]);
    assert!(h.bot_messages.contains(&report.reply.unwrap().message_id));
    assert_eq!(
        h.factory.appends(),
        vec!["alice: hello\n".to_string(), "Confab:".to_string()]
    );
}

#[tokio::test]
async fn instruct_reply_leaves_user_turn_open() {
    let h = Harness::new(1000);
    h.factory.push_reply(" Sure thing.\n### Human:");
    let session = h.session("c1", true).await;

    let report = h.run(session.clone(), request("c1", "hello", true)).await;
    assert_eq!(report.reply.unwrap().text, "Sure thing.");
    assert!(session.info().await.unwrap().user_turn_open);

    // The next message continues the turn the model opened
    h.run(session.clone(), request("c1", "again", false)).await;
    assert_eq!(
        h.factory.appends(),
        vec![
            "### Human:\nhello\n".to_string(),
            "### Assistant:\n".to_string(),
            "\n".to_string(),
            "again\n".to_string(),
        ]
    );

    let state = session.serialize().await.unwrap();
    assert!(
        String::from_utf8_lossy(&state)
            .ends_with("### Assistant:\n Sure thing.\n### Human:\nagain\n")
    );
}

#[tokio::test]
async fn empty_generation_posts_placeholder_text() {
    let h = Harness::new(1000);
    h.factory.push_reply("\n");
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    assert_eq!(report.reply.unwrap().text, settings().texts.empty_reply);
}

#[tokio::test]
async fn message_without_trigger_only_appends() {
    let h = Harness::new(1000);
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "one\ntwo", false)).await;

    assert_eq!(
        report.trail,
        vec![
            ReplyState::Idle,
            ReplyState::AppendingUserMessage,
            ReplyState::Idle,
        ]
    );
    assert!(report.reply.is_none());
    assert!(h.transport.log().is_empty());
    assert_eq!(
        h.factory.appends(),
        vec!["alice: one\nalice: two\n".to_string()]
    );
}

// ============================================================================
// Context Overflow
// ============================================================================

#[tokio::test]
async fn overflow_resets_and_retries_once() {
    let h = Harness::new(1000);
    h.factory.overflow_next_appends(1);
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", false)).await;

    assert_eq!(report.final_state(), &ReplyState::Idle);
    assert_eq!(h.factory.appends(), vec!["alice: hello\n".to_string()]);
    // No init cache: the reset replaced the engine
    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.factory.live(), 1);
}

#[tokio::test]
async fn second_overflow_aborts_with_notice() {
    let h = Harness::new(1000);
    h.factory.overflow_next_appends(2);
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    assert_eq!(report.abort_reason(), Some(&AbortReason::ContextOverflow));
    assert!(!report.trail.contains(&ReplyState::AppendingTrigger));
    assert_eq!(
        h.transport.messages("c1"),
        vec![settings().texts.context_overflow]
    );
    assert!(h.factory.appends().is_empty());
}

#[tokio::test]
async fn overflow_on_trigger_replays_user_message() {
    // Room for both messages, but not for the trigger after them
    let h = Harness::new(30);
    h.factory.push_reply(" ok\n");
    let session = h.session("c1", false).await;
    h.run(session.clone(), request("c1", "hello", false)).await;

    let report = h.run(session.clone(), request("c1", "again", true)).await;

    assert_eq!(report.reply.unwrap().text, "ok");
    assert_eq!(
        h.factory.appends(),
        vec![
            "alice: hello\n".to_string(),
            "alice: again\n".to_string(),
            "alice: again\nConfab:".to_string(),
        ]
    );
    let state = session.serialize().await.unwrap();
    assert_eq!(state, b"SCRIPTED1\nalice: again\nConfab: ok\n".to_vec());
}

// ============================================================================
// Timeouts and Limits
// ============================================================================

#[tokio::test]
async fn slow_generation_is_truncated_at_priority_floor() {
    let mut settings = settings();
    settings.timeout = Duration::from_millis(60);
    let texts = settings.texts.clone();
    let h = Harness::with_settings(10_000, settings);
    h.factory.set_token_delay(Duration::from_millis(40));
    h.factory.push_reply("word ".repeat(40));
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    assert_eq!(report.truncated, Some(TruncationReason::Timeout));
    assert_eq!(report.final_state(), &ReplyState::Idle);
    let reply = report.reply.unwrap().text;
    assert!(reply.starts_with("word"));
    assert!(reply.ends_with(&format!("\n{}", texts.timeout)));

    // The slow marker is shown exactly once
    let marker = format!("{} {}", texts.please_wait, texts.slow_marker);
    let marked = h.transport.edits().iter().filter(|t| **t == marker).count();
    assert_eq!(marked, 1);

    // The engine learns that its reply was cut off
    assert_eq!(
        h.factory.appends().last().unwrap(),
        &format!(" {}\n", texts.timeout)
    );
}

#[tokio::test]
async fn slow_append_aborts_with_timeout_notice() {
    let mut settings = settings();
    settings.timeout = Duration::from_millis(30);
    let texts = settings.texts.clone();
    let h = Harness::with_settings(1000, settings);
    h.factory.set_append_delay(Duration::from_millis(50));
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    assert_eq!(report.abort_reason(), Some(&AbortReason::Timeout));
    assert_eq!(h.transport.messages("c1"), vec![texts.timeout]);
}

#[tokio::test]
async fn long_reply_is_cut_with_notice() {
    let mut settings = settings();
    let notice_room = settings.texts.longest_notice().len() + 1;
    settings.max_length = notice_room + 12;
    let too_long = settings.texts.too_long.clone();
    let h = Harness::with_settings(1000, settings);
    h.factory.set_token_delay(Duration::from_millis(5));
    h.factory.push_reply("one two three four five six seven\n");
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    assert_eq!(report.truncated, Some(TruncationReason::TooLong));
    let reply = report.reply.unwrap().text;
    assert_eq!(reply, format!("one two thre\n{too_long}"));
    assert!(reply.len() <= notice_room + 12);
}

// ============================================================================
// Live Edits
// ============================================================================

#[tokio::test]
async fn live_edits_are_throttled_and_replaced_by_final_reply() {
    let mut settings = settings();
    settings.live_edit = true;
    settings.live_edit_interval = Duration::from_millis(25);
    let h = Harness::with_settings(1000, settings);
    h.factory.set_token_delay(Duration::from_millis(10));
    let words = ["one", "two", "three", "four", "five", "six", "seven", "eight", "nine"];
    h.factory.push_reply(format!(" {}\n", words.join(" ")));
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    let full = words.join(" ");
    assert_eq!(report.reply.unwrap().text, full);
    assert_eq!(h.transport.messages("c1"), vec![full.clone()]);

    let edits = h.transport.edits();
    let (last, partial) = edits.split_last().unwrap();
    assert_eq!(last, &full);
    assert!(!partial.is_empty());
    assert!(partial.len() < words.len());
    for pair in partial.windows(2) {
        assert!(pair[1].starts_with(&pair[0]) && pair[1].len() > pair[0].len());
    }
    assert!(partial.iter().all(|text| full.starts_with(text.as_str())));
}

#[tokio::test]
async fn live_edits_stop_once_reply_is_too_long() {
    let mut settings = settings();
    let notice_room = settings.texts.longest_notice().len() + 1;
    settings.max_length = notice_room + 12;
    settings.live_edit = true;
    settings.live_edit_interval = Duration::ZERO;
    let too_long = settings.texts.too_long.clone();
    let h = Harness::with_settings(1000, settings);
    h.factory.set_token_delay(Duration::from_millis(5));
    h.factory.push_reply("one two three four five six seven\n");
    let session = h.session("c1", false).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    assert_eq!(report.truncated, Some(TruncationReason::TooLong));
    let final_text = format!("one two thre\n{too_long}");
    assert_eq!(
        h.transport.edits(),
        vec!["one".to_string(), "one two".to_string(), final_text.clone()]
    );
    assert_eq!(h.transport.messages("c1"), vec![final_text]);
}

#[tokio::test]
async fn live_edits_never_show_the_stop_string() {
    let mut settings = settings();
    settings.live_edit = true;
    settings.live_edit_interval = Duration::ZERO;
    let h = Harness::with_settings(1000, settings);
    h.factory.set_token_delay(Duration::from_millis(5));
    h.factory.push_reply(" Sure thing.\n### Human:");
    let session = h.session("c1", true).await;

    let report = h.run(session, request("c1", "hello", true)).await;

    assert_eq!(report.reply.unwrap().text, "Sure thing.");
    let edits = h.transport.edits();
    assert!(edits.contains(&"Sure thing.".to_string()));
    assert!(edits.iter().all(|text| !text.contains('#')));
}

// ============================================================================
// Kill
// ============================================================================

#[tokio::test]
async fn killed_task_unwinds_silently() {
    let h = Harness::new(10_000);
    h.factory.set_token_delay(Duration::from_millis(30));
    h.factory.push_reply("word ".repeat(100));
    let session = h.session("c1", false).await;

    let (tx, rx) = oneshot::channel();
    let pipeline = h.pipeline.clone();
    let task = h
        .scheduler
        .create_task(TaskSpec::new("c1"), move |ctx| async move {
            let Some(_turn) = ctx.enter().await else {
                return;
            };
            let report = pipeline.run(&ctx, &session, &request("c1", "hi", true)).await;
            let _ = tx.send(report);
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.scheduler.kill(task));
    let report = rx.await.unwrap();

    assert_eq!(report.abort_reason(), Some(&AbortReason::Killed));
    assert_eq!(
        h.transport.messages("c1"),
        vec![settings().texts.please_wait]
    );
    h.scheduler.join_all().await;
    assert!(h.scheduler.is_empty());
}
