//! The message-processing pipeline.
//!
//! One inbound message goes: classify → dispatch by type. The task branch
//! fans out over every candidate the parser extracted and runs each through
//! the killswitch gate, goal validation, and the calendar conflict check
//! before persisting. Advisory layers (validation, conflict check, auto
//! calendar add) degrade gracefully; the task itself is never lost to them.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::actions::ActionExecutor;
use crate::calendar::{CalendarProviderApi, CalendarService};
use crate::classifier;
use crate::config::AppConfig;
use crate::embeddings::Embedder;
use crate::error::PipelineError;
use crate::emailscan::EmailScanner;
use crate::goals::GoalOnboarding;
use crate::killswitch::Killswitch;
use crate::parser::TaskParser;
use crate::providers::CompletionService;
use crate::queryanswer::{AnswerMode, QueryAnswerer};
use crate::store::SqliteStore;
use crate::types::{
    ChatResponse, MessageType, NewTask, RequestContext, TaskCandidate, TaskStatus,
};
use crate::validator::{TaskValidator, LOW_VALUE_SCORE, NO_PUSHBACK_SCORE};

/// Hour of day a date-only deadline resolves to, reference-local.
const DEFAULT_DUE_HOUR: u32 = 9;
/// Slot suggestions offered alongside a conflict warning.
const SUGGESTED_SLOTS: usize = 3;

pub struct Pipeline {
    store: Arc<SqliteStore>,
    completion: Arc<dyn CompletionService>,
    embedder: Arc<dyn Embedder>,
    calendar_provider: Arc<dyn CalendarProviderApi>,
    email_scanner: Arc<dyn EmailScanner>,
    config: Arc<AppConfig>,
    reference_tz: Tz,
}

impl Pipeline {
    pub fn new(
        store: Arc<SqliteStore>,
        completion: Arc<dyn CompletionService>,
        embedder: Arc<dyn Embedder>,
        calendar_provider: Arc<dyn CalendarProviderApi>,
        email_scanner: Arc<dyn EmailScanner>,
        config: Arc<AppConfig>,
        reference_tz: Tz,
    ) -> Self {
        Self {
            store,
            completion,
            embedder,
            calendar_provider,
            email_scanner,
            config,
            reference_tz,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn killswitch(&self) -> Killswitch<'_> {
        Killswitch::new(
            &self.store,
            &self.config.killswitch,
            self.reference_tz,
            &self.config.assistant.protected_category,
        )
    }

    pub fn calendar(&self) -> CalendarService<'_> {
        CalendarService::new(
            &self.store,
            &*self.calendar_provider,
            &self.config.calendar,
            self.reference_tz,
        )
    }

    /// Process one already-recorded message body and produce the reply.
    /// Sending the reply is the caller's concern.
    pub async fn process_message(
        &self,
        ctx: &RequestContext,
        body: &str,
        external_id: Option<&str>,
    ) -> anyhow::Result<ChatResponse> {
        let history = self.store.recent_history(ctx, 10).await?;
        let message_type = classifier::classify(&*self.completion, body, &history).await;
        info!(r#type = message_type.as_str(), "message classified");

        let response = match message_type {
            MessageType::Killswitch => self.killswitch().format_status_message(ctx).await?,
            MessageType::Query | MessageType::Conversation => {
                let killswitch = self.killswitch();
                let answerer = QueryAnswerer::new(
                    &self.store,
                    &killswitch,
                    &*self.completion,
                    self.reference_tz,
                );
                let mode = if message_type == MessageType::Query {
                    AnswerMode::Query
                } else {
                    AnswerMode::Conversation
                };
                answerer.answer(ctx, body, &history, mode).await?
            }
            MessageType::Action => {
                let calendar = self.calendar();
                let executor = ActionExecutor::new(
                    &self.store,
                    &calendar,
                    &*self.completion,
                    self.reference_tz,
                );
                executor.execute(ctx, body).await?
            }
            MessageType::EmailScan => self.email_scanner.scan(ctx).await?,
            MessageType::Goals => {
                let onboarding =
                    GoalOnboarding::new(&self.store, &*self.embedder, &*self.completion);
                onboarding.handle(ctx, body, &history).await?
            }
            MessageType::Task => self.handle_task_creation(ctx, body, external_id).await?,
        };

        Ok(ChatResponse {
            response,
            message_type,
        })
    }

    async fn handle_task_creation(
        &self,
        ctx: &RequestContext,
        body: &str,
        external_id: Option<&str>,
    ) -> anyhow::Result<String> {
        let parser = TaskParser::new(self.reference_tz);
        let candidates = parser.parse(&*self.completion, body).await;
        info!(count = candidates.len(), "parsed task candidates");

        let killswitch = self.killswitch();
        let validator = TaskValidator::new(&self.store, &*self.embedder, &*self.completion);
        let protected = &self.config.assistant.protected_category;

        let mut confirmations: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut accepted = 0usize;

        for candidate in &candidates {
            let due_at = self.resolve_due(candidate);

            // Protected-category tasks hit the killswitch gate first;
            // blocked ones are deferred, never discarded.
            if candidate.category == *protected {
                let decision = killswitch
                    .should_block_task(ctx, candidate.estimated_hours)
                    .await?;
                if decision.blocked {
                    self.store
                        .create_task(
                            ctx,
                            NewTask {
                                raw_text: body.to_string(),
                                title: candidate.title.clone(),
                                description: candidate.description.clone(),
                                priority: candidate.priority,
                                category: candidate.category.clone(),
                                status: TaskStatus::Deferred,
                                alignment_score: 0.0,
                                pushback_reason: Some(format!(
                                    "Deferred: {}-hour killswitch active. Will resurface next week.",
                                    self.config.killswitch.limit_hours
                                )),
                                due_at,
                                estimated_hours: candidate.estimated_hours,
                                account_id: None,
                                source_message_id: external_id.map(str::to_string),
                            },
                        )
                        .await?;
                    confirmations.push(format!(
                        "Saved \"{}\", deferred until the killswitch resets",
                        candidate.title
                    ));
                    if !warnings.contains(&decision.message) {
                        warnings.push(decision.message);
                    }
                    continue;
                }
            }

            let validation = validator.validate(ctx, candidate).await;
            info!(
                title = %candidate.title,
                score = validation.alignment_score,
                valid = validation.is_valid,
                "candidate validated"
            );

            if validation.needs_clarification {
                let prompt = validation
                    .clarification_prompt
                    .clone()
                    .unwrap_or_else(|| "Can you provide more details about this task?".to_string());
                self.store
                    .create_task(
                        ctx,
                        NewTask {
                            raw_text: body.to_string(),
                            title: candidate.title.clone(),
                            description: candidate.description.clone(),
                            priority: candidate.priority,
                            category: candidate.category.clone(),
                            status: TaskStatus::ClarificationNeeded,
                            alignment_score: validation.alignment_score,
                            pushback_reason: None,
                            due_at,
                            estimated_hours: candidate.estimated_hours,
                            account_id: None,
                            source_message_id: external_id.map(str::to_string),
                        },
                    )
                    .await?;
                confirmations.push(format!("\"{}\": {}", candidate.title, prompt));
                continue;
            }

            if validation.alignment_score < LOW_VALUE_SCORE {
                let pushback = validator.pushback(candidate, &validation).await;
                self.store
                    .create_task(
                        ctx,
                        NewTask {
                            raw_text: body.to_string(),
                            title: candidate.title.clone(),
                            description: candidate.description.clone(),
                            priority: candidate.priority,
                            category: candidate.category.clone(),
                            status: TaskStatus::Rejected,
                            alignment_score: validation.alignment_score,
                            pushback_reason: Some(validation.reasoning.clone()),
                            due_at,
                            estimated_hours: candidate.estimated_hours,
                            account_id: None,
                            source_message_id: external_id.map(str::to_string),
                        },
                    )
                    .await?;
                confirmations.push(pushback);
                continue;
            }

            // Accepted. Route to an account, warn about conflicts, persist,
            // and best-effort add to the calendar.
            let account = self
                .store
                .account_for_type(ctx, account_type_for_category(&candidate.category))
                .await?;
            let conflict_warning = match self.conflict_warning(ctx, candidate, due_at).await {
                Ok(warning) => warning,
                Err(e) if e.is_advisory() => {
                    warn!(error = %e, "task created without conflict warning");
                    String::new()
                }
                Err(e) => return Err(e.into()),
            };

            let task = self
                .store
                .create_task(
                    ctx,
                    NewTask {
                        raw_text: body.to_string(),
                        title: candidate.title.clone(),
                        description: candidate.description.clone(),
                        priority: candidate.priority,
                        category: candidate.category.clone(),
                        status: TaskStatus::Pending,
                        alignment_score: validation.alignment_score,
                        pushback_reason: None,
                        due_at,
                        estimated_hours: candidate.estimated_hours,
                        account_id: account.as_ref().map(|a| a.id.clone()),
                        source_message_id: external_id.map(str::to_string),
                    },
                )
                .await?;
            info!(task_id = %task.id, title = %task.title, "task created");

            if let (Some(due), Some(hours), Some(account)) =
                (due_at, candidate.estimated_hours, account.as_ref())
            {
                let end = due + Duration::minutes((hours * 60.0).round() as i64);
                if let Err(e) = self
                    .calendar()
                    .create_event_from_task(
                        &account.id,
                        Some(&task.id),
                        &task.title,
                        &task.description,
                        due,
                        end,
                    )
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "auto calendar add failed");
                }
            }

            let mut line = format!("{} [{}]", candidate.title, candidate.category);
            if !candidate.description.is_empty() {
                line.push_str(&format!(" ({})", candidate.description));
            }
            line.push_str(&conflict_warning);
            if validation.alignment_score < NO_PUSHBACK_SCORE && !validation.reasoning.is_empty() {
                line.push_str(&format!(" (Heads up: {})", validation.reasoning));
            }
            confirmations.push(line);
            accepted += 1;

            if candidate.category == *protected {
                let decision = killswitch.should_block_task(ctx, None).await?;
                if !decision.message.is_empty() && !warnings.contains(&decision.message) {
                    warnings.push(decision.message);
                }
            }
        }

        // "Added" only fits when something actually landed on the list;
        // rejections and deferrals speak for themselves.
        let mut response = if confirmations.len() == 1 && accepted == 0 {
            confirmations[0].clone()
        } else if confirmations.len() == 1 {
            format!("Got it! Added: {}", confirmations[0])
        } else {
            let numbered: Vec<String> = confirmations
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{}. {c}", i + 1))
                .collect();
            format!(
                "Got it! Added {} tasks:\n{}",
                confirmations.len(),
                numbered.join("\n")
            )
        };
        if !warnings.is_empty() {
            response.push_str(&format!("\n\n{}", warnings.join("\n")));
        }
        Ok(response)
    }

    /// Conflict warning plus up to three open-slot suggestions, or empty.
    /// Only runs when the candidate has both a deadline and a duration.
    async fn conflict_warning(
        &self,
        ctx: &RequestContext,
        candidate: &TaskCandidate,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<String, PipelineError> {
        let (Some(due), Some(hours)) = (due_at, candidate.estimated_hours) else {
            return Ok(String::new());
        };
        let end = due + Duration::minutes((hours * 60.0).round() as i64);
        let calendar = self.calendar();
        let conflict = calendar
            .check_conflicts(ctx, due, end)
            .await
            .map_err(|e| PipelineError::ConflictCheck(e.to_string()))?;
        if !conflict.has_conflict {
            return Ok(String::new());
        }

        let mut warning = format!(
            "\nConflict: {} event(s) overlap ({})",
            conflict.conflicts.len(),
            conflict.conflicts[0].title,
        );
        match calendar
            .find_available_slots(ctx, hours, SUGGESTED_SLOTS)
            .await
        {
            Ok(slots) if !slots.is_empty() => {
                warning.push_str("\nHere are some open slots:");
                for slot in &slots {
                    warning.push_str(&format!("\n  • {}", slot.label));
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "slot suggestion failed"),
        }
        Ok(warning)
    }

    /// "YYYY-MM-DD" (+ optional "HH:MM") in the reference timezone.
    fn resolve_due(&self, candidate: &TaskCandidate) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(candidate.due_date.as_deref()?, "%Y-%m-%d").ok()?;
        let time = candidate
            .due_time
            .as_deref()
            .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
            .or_else(|| NaiveTime::from_hms_opt(DEFAULT_DUE_HOUR, 0, 0))?;
        self.reference_tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Category-to-account routing. Unknown categories go to the primary
/// account via the store's fallback.
fn account_type_for_category(category: &str) -> &str {
    match category {
        "work" => "work",
        "creative" => "creative",
        _ => "personal",
    }
}
