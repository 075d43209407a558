//! End-to-end scenarios across the webhook store, queue handler, and
//! pipeline, driven by scripted completions and the fake calendar provider.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::daemon::DaemonJobHandler;
use crate::embeddings::{Embedder, KeywordEmbedder};
use crate::queue::{Job, JobHandler};
use crate::testing::{test_pipeline, RecordingSms};
use crate::types::{CalendarEventUpsert, EventType, MessageType, RequestContext, TaskStatus};

const TZ: chrono_tz::Tz = chrono_tz::America::Los_Angeles;

fn classify_as_task() -> String {
    r#"{"type": "task"}"#.to_string()
}

fn tomorrow() -> String {
    (Utc::now().with_timezone(&TZ).date_naive() + Duration::days(1))
        .format("%Y-%m-%d")
        .to_string()
}

#[tokio::test]
async fn dentist_reminder_becomes_one_pending_task() {
    let parsed = format!(
        r#"[{{
            "title": "Call the dentist",
            "description": "",
            "priority": "medium",
            "category": "personal",
            "due_date": "{}",
            "due_time": "15:00"
        }}]"#,
        tomorrow()
    );
    let (pipeline, fixtures) = test_pipeline(vec![classify_as_task(), parsed]).await;
    let ctx = RequestContext::new("u1");

    let reply = pipeline
        .process_message(&ctx, "remind me to call the dentist tomorrow at 3pm", None)
        .await
        .unwrap();

    assert_eq!(reply.message_type, MessageType::Task);
    assert!(reply.response.starts_with("Got it! Added:"), "{}", reply.response);

    let tasks = fixtures
        .store
        .list_tasks_by_status(&ctx, TaskStatus::Pending)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.title, "Call the dentist");
    assert_eq!(task.category, "personal");
    // No goals stored, so the validator scores neutral without the model.
    assert_eq!(task.alignment_score, 0.5);
    let due_local = task.due_at.unwrap().with_timezone(&TZ);
    assert_eq!(due_local.format("%H:%M").to_string(), "15:00");
    assert_eq!(due_local.date_naive().to_string(), tomorrow());
    assert!(fixtures.completion.last_prompt().contains("call the dentist"));
}

#[tokio::test]
async fn estimated_task_lands_on_the_calendar() {
    let parsed = format!(
        r#"[{{
            "title": "Prep tax documents",
            "description": "",
            "priority": "medium",
            "category": "personal",
            "due_date": "{}",
            "due_time": "10:00",
            "estimated_hours": 1.5
        }}]"#,
        tomorrow()
    );
    let (pipeline, fixtures) = test_pipeline(vec![classify_as_task(), parsed]).await;
    let ctx = RequestContext::new("u1");

    pipeline
        .process_message(&ctx, "set aside 90 minutes tomorrow at 10 for taxes", None)
        .await
        .unwrap();

    // Due date + estimate + routed account: the task is auto-added remotely.
    assert!(fixtures.provider.has_remote_event("fake-1"));
    let tasks = fixtures
        .store
        .list_tasks_by_status(&ctx, TaskStatus::Pending)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].account_id.as_deref(), Some("acc-personal"));
}

#[tokio::test]
async fn duplicate_external_id_processes_once() {
    let parsed = format!(
        r#"[{{"title": "Call the dentist", "category": "personal", "due_date": "{}"}}]"#,
        tomorrow()
    );
    let (pipeline, fixtures) = test_pipeline(vec![classify_as_task(), parsed]).await;
    let pipeline = Arc::new(pipeline);
    let sms = Arc::new(RecordingSms::default());
    let handler = DaemonJobHandler::new(
        pipeline.clone(),
        sms.clone(),
        fixtures.config.clone(),
        TZ,
    );
    let ctx = RequestContext::new("u1");

    let first = fixtures
        .store
        .try_record_inbound(&ctx, "SM1", "+15550001", "+15550002", "remind me to call the dentist")
        .await
        .unwrap();
    assert!(first.is_some());

    let job = Job::ProcessMessage {
        external_id: "SM1".to_string(),
        user_id: "u1".to_string(),
    };
    handler.run(&job).await.unwrap();
    assert_eq!(sms.sent().len(), 1, "one reply for the first delivery");

    // Webhook-level redelivery: same SID records nothing new.
    let second = fixtures
        .store
        .try_record_inbound(&ctx, "SM1", "+15550001", "+15550002", "remind me to call the dentist")
        .await
        .unwrap();
    assert!(second.is_none());

    // Queue-level redelivery: the claim is gone, the job is a no-op.
    handler.run(&job).await.unwrap();
    assert_eq!(sms.sent().len(), 1);
    let tasks = fixtures
        .store
        .list_tasks_by_status(&ctx, TaskStatus::Pending)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1, "no duplicate task rows");
}

#[tokio::test]
async fn near_limit_work_task_is_deferred_not_rejected() {
    let parsed = r#"[{
        "title": "Quarterly report",
        "description": "",
        "priority": "high",
        "category": "work",
        "estimated_hours": 2.0
    }]"#
    .to_string();
    let (pipeline, fixtures) = test_pipeline(vec![classify_as_task(), parsed]).await;
    let ctx = RequestContext::new("u1");

    // 39.5 protected hours already on the books this week.
    let week_start = pipeline.killswitch().week_start(Utc::now());
    fixtures
        .store
        .upsert_event(&CalendarEventUpsert {
            external_event_id: "busy-week".to_string(),
            account_id: "acc-work".to_string(),
            title: "Client work".to_string(),
            description: None,
            start_time: week_start + Duration::hours(9),
            end_time: week_start + Duration::hours(9) + Duration::minutes(2370),
            location: None,
            event_type: EventType::Work,
            is_auto_blocked: false,
            task_id: None,
        })
        .await
        .unwrap();

    let reply = pipeline
        .process_message(&ctx, "block two hours for the quarterly report", None)
        .await
        .unwrap();

    let deferred = fixtures
        .store
        .list_tasks_by_status(&ctx, TaskStatus::Deferred)
        .await
        .unwrap();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].title, "Quarterly report");
    assert!(deferred[0].pushback_reason.as_deref().unwrap_or("").contains("Deferred"));
    assert!(
        fixtures
            .store
            .list_tasks_by_status(&ctx, TaskStatus::Rejected)
            .await
            .unwrap()
            .is_empty(),
        "good-value bad-timing tasks are deferred, never rejected"
    );
    assert!(reply.response.contains("deferred"), "{}", reply.response);
    assert!(reply.response.contains("Killswitch"), "{}", reply.response);
}

#[tokio::test]
async fn midweek_check_leaves_deferred_tasks_parked() {
    let parsed = r#"[{
        "title": "Quarterly report",
        "description": "",
        "priority": "high",
        "category": "work",
        "estimated_hours": 2.0
    }]"#
    .to_string();
    let (pipeline, fixtures) = test_pipeline(vec![classify_as_task(), parsed]).await;
    let ctx = RequestContext::new("u1");

    // 39.5 protected hours on the books: the 2h estimate projects past 40,
    // so the task lands deferred.
    let week_start = pipeline.killswitch().week_start(Utc::now());
    fixtures
        .store
        .upsert_event(&CalendarEventUpsert {
            external_event_id: "busy-week".to_string(),
            account_id: "acc-work".to_string(),
            title: "Client work".to_string(),
            description: None,
            start_time: week_start + Duration::hours(9),
            end_time: week_start + Duration::hours(9) + Duration::minutes(2370),
            location: None,
            event_type: EventType::Work,
            is_auto_blocked: false,
            task_id: None,
        })
        .await
        .unwrap();

    pipeline
        .process_message(&ctx, "block two hours for the quarterly report", None)
        .await
        .unwrap();
    let deferred = fixtures
        .store
        .list_tasks_by_status(&ctx, TaskStatus::Deferred)
        .await
        .unwrap();
    assert_eq!(deferred.len(), 1);

    // An hourly check later the same week must not resurface it; only a
    // week rollover does.
    let pipeline = Arc::new(pipeline);
    let sms = Arc::new(RecordingSms::default());
    let handler = DaemonJobHandler::new(pipeline, sms, fixtures.config.clone(), TZ);
    handler
        .run(&Job::KillswitchCheck {
            user_id: "u1".to_string(),
        })
        .await
        .unwrap();

    let deferred = fixtures
        .store
        .list_tasks_by_status(&ctx, TaskStatus::Deferred)
        .await
        .unwrap();
    assert_eq!(deferred.len(), 1, "same-week check resurfaced the deferral");
}

#[tokio::test]
async fn low_alignment_task_is_rejected_with_pushback() {
    let parsed = r#"[{
        "title": "Reorganize desktop icons",
        "description": "",
        "priority": "low",
        "category": "personal"
    }]"#
    .to_string();
    let validation = r#"{
        "alignmentScore": 0.2,
        "needsClarification": false,
        "clarificationPrompt": null,
        "reasoning": "Busywork that advances no goal.",
        "isValid": false
    }"#
    .to_string();
    let pushback = "Does rearranging icons ship the album? Skip it.".to_string();
    let (pipeline, fixtures) =
        test_pipeline(vec![classify_as_task(), parsed, validation, pushback]).await;
    let ctx = RequestContext::new("u1");

    // A stored goal makes validation go through the model.
    let embedding = KeywordEmbedder
        .embed("Finish mixing the album in the studio")
        .await
        .unwrap();
    fixtures
        .store
        .create_goal(
            &ctx,
            crate::types::NewGoal {
                title: "Finish mixing the album".to_string(),
                description: String::new(),
                category: "creative".to_string(),
                priority: 1,
                target_date: None,
                success_criteria: None,
                embedding,
            },
        )
        .await
        .unwrap();

    let reply = pipeline
        .process_message(&ctx, "reorganize my desktop icons sometime", None)
        .await
        .unwrap();

    let rejected = fixtures
        .store
        .list_tasks_by_status(&ctx, TaskStatus::Rejected)
        .await
        .unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(
        rejected[0].pushback_reason.as_deref(),
        Some("Busywork that advances no goal.")
    );
    assert!(reply.response.contains("Skip it"), "{}", reply.response);
}

#[tokio::test]
async fn killswitch_status_request_needs_no_model() {
    // "work hours?" hits the deterministic fast path; an empty script would
    // fail loudly if anything reached the completion service.
    let (pipeline, _fixtures) = test_pipeline(vec![]).await;
    let ctx = RequestContext::new("u1");

    let reply = pipeline.process_message(&ctx, "work hours?", None).await.unwrap();
    assert_eq!(reply.message_type, MessageType::Killswitch);
    assert!(reply.response.contains("/40"), "{}", reply.response);
}

#[tokio::test]
async fn exhausted_message_job_sends_one_apology() {
    // The classifier falls back to `task` on completion failure and the
    // parser falls back to a single raw candidate, so a dead completion
    // service still produces a task rather than an error.
    let (pipeline, fixtures) = test_pipeline(vec![]).await;
    let pipeline = Arc::new(pipeline);
    let sms = Arc::new(RecordingSms::default());
    let handler = DaemonJobHandler::new(pipeline, sms.clone(), fixtures.config.clone(), TZ);
    let ctx = RequestContext::new("u1");

    fixtures
        .store
        .try_record_inbound(&ctx, "SM9", "+15550001", "+15550002", "do the thing")
        .await
        .unwrap();

    let job = Job::ProcessMessage {
        external_id: "SM9".to_string(),
        user_id: "u1".to_string(),
    };
    handler.on_exhausted(&job, "provider down").await;

    let sent = sms.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+15550001");
    assert!(sent[0].1.contains("Sorry"));
    assert_eq!(fixtures.store.count_job_failures().await.unwrap(), 1);

    let message = fixtures.store.find_message("SM9").await.unwrap().unwrap();
    assert_eq!(message.status, crate::types::MessageStatus::Failed);
}
