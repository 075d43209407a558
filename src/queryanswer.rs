//! Natural-language answers about schedule, tasks, and work hours.
//!
//! Gathers a compact context block (next week of events, open tasks, the
//! weekly hour total) and asks the completion service for an SMS-sized
//! answer. Conversation mode uses the same context with a looser register.

use chrono::{Duration, Utc};
use chrono_tz::Tz;

use crate::killswitch::Killswitch;
use crate::providers::CompletionService;
use crate::store::SqliteStore;
use crate::types::{HistoryTurn, RequestContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    Query,
    Conversation,
}

pub struct QueryAnswerer<'a> {
    store: &'a SqliteStore,
    killswitch: &'a Killswitch<'a>,
    completion: &'a dyn CompletionService,
    reference_tz: Tz,
}

impl<'a> QueryAnswerer<'a> {
    pub fn new(
        store: &'a SqliteStore,
        killswitch: &'a Killswitch<'a>,
        completion: &'a dyn CompletionService,
        reference_tz: Tz,
    ) -> Self {
        Self {
            store,
            killswitch,
            completion,
            reference_tz,
        }
    }

    pub async fn answer(
        &self,
        ctx: &RequestContext,
        question: &str,
        history: &[HistoryTurn],
        mode: AnswerMode,
    ) -> anyhow::Result<String> {
        let now = Utc::now().with_timezone(&self.reference_tz);
        let events = self.upcoming_events_block(ctx).await?;
        let tasks = self.open_tasks_block(ctx).await?;
        let status = self.killswitch.status(ctx).await?;

        let hours_line = if status.is_active {
            format!("{} this week (KILLSWITCH ACTIVE)", status.current_hours)
        } else {
            format!(
                "{} this week ({} remaining)",
                status.current_hours, status.remaining_hours
            )
        };

        let system_prompt = match mode {
            AnswerMode::Query => {
                "You are a sharp personal assistant. You answer questions about the user's \
schedule, tasks, and calendar concisely via SMS. Keep responses under 300 characters when \
possible. Be direct, warm, and practical. Use simple formatting (no markdown)."
            }
            AnswerMode::Conversation => {
                "You are a sharp personal assistant and thinking partner. Discuss ideas, weigh \
options, and give practical suggestions grounded in the user's actual schedule and tasks. \
Keep it SMS-sized. No markdown."
            }
        };

        let history_block = if history.is_empty() {
            String::new()
        } else {
            let turns: Vec<String> = history
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|t| format!("{}: {}", t.role, t.content))
                .collect();
            format!("\nRECENT CONVERSATION:\n{}\n", turns.join("\n"))
        };

        let prompt = format!(
            r#"CURRENT DATE/TIME: {now} ({tz})

CALENDAR (next 7 days):
{events}

OPEN TASKS:
{tasks}

WORK HOURS: {hours_line}
{history_block}
USER MESSAGE: "{question}"

Answer based on the context above. Be concise (SMS format). If you don't have enough info, say so honestly."#,
            now = now.format("%A, %B %-d, %Y %-I:%M %p"),
            tz = self.reference_tz.name(),
        );

        Ok(self.completion.complete(&prompt, system_prompt, 512).await?)
    }

    async fn upcoming_events_block(&self, ctx: &RequestContext) -> anyhow::Result<String> {
        let now = Utc::now();
        let events = self
            .store
            .upcoming_events(ctx, now, now + Duration::days(7), 30)
            .await?;
        if events.is_empty() {
            return Ok("No upcoming events.".to_string());
        }
        Ok(events
            .iter()
            .map(|e| {
                let start = e.start_time.with_timezone(&self.reference_tz);
                let end = e.end_time.with_timezone(&self.reference_tz);
                let location = e
                    .location
                    .as_deref()
                    .map(|l| format!(" @ {l}"))
                    .unwrap_or_default();
                format!(
                    "- {} {}-{}: {} [{}]{}",
                    start.format("%a %b %-d"),
                    start.format("%-I:%M %p"),
                    end.format("%-I:%M %p"),
                    e.title,
                    e.event_type.as_str(),
                    location,
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn open_tasks_block(&self, ctx: &RequestContext) -> anyhow::Result<String> {
        let tasks = self.store.list_open_tasks(ctx, 15).await?;
        if tasks.is_empty() {
            return Ok("No open tasks.".to_string());
        }
        Ok(tasks
            .iter()
            .map(|t| {
                let due = t
                    .due_at
                    .map(|d| {
                        format!(
                            " (due {})",
                            d.with_timezone(&self.reference_tz).format("%b %-d")
                        )
                    })
                    .unwrap_or_default();
                let hours = t
                    .estimated_hours
                    .map(|h| format!(" ~{h}h"))
                    .unwrap_or_default();
                format!(
                    "- [{}] {} [{}]{}{} - {}",
                    t.priority.as_str(),
                    t.title,
                    t.category,
                    due,
                    hours,
                    t.status.as_str(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KillswitchConfig;
    use crate::testing::ScriptedCompletion;
    use crate::types::{NewTask, Priority, TaskStatus};

    #[tokio::test]
    async fn answer_includes_task_and_hour_context() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = RequestContext::new("u1");
        store
            .create_task(
                &ctx,
                NewTask {
                    raw_text: "deck".into(),
                    title: "Finish the deck".into(),
                    description: String::new(),
                    priority: Priority::High,
                    category: "work".into(),
                    status: TaskStatus::Pending,
                    alignment_score: 0.8,
                    pushback_reason: None,
                    due_at: None,
                    estimated_hours: Some(2.0),
                    account_id: None,
                    source_message_id: None,
                },
            )
            .await
            .unwrap();

        let cfg = KillswitchConfig::default();
        let killswitch =
            Killswitch::new(&store, &cfg, chrono_tz::America::Los_Angeles, "work");
        let completion = ScriptedCompletion::new(vec!["You're free after 3pm.".to_string()]);
        let answerer = QueryAnswerer::new(
            &store,
            &killswitch,
            &completion,
            chrono_tz::America::Los_Angeles,
        );

        let reply = answerer
            .answer(&ctx, "am I free this afternoon?", &[], AnswerMode::Query)
            .await
            .unwrap();
        assert_eq!(reply, "You're free after 3pm.");

        let prompt = completion.last_prompt();
        assert!(prompt.contains("Finish the deck"));
        assert!(prompt.contains("WORK HOURS"));
        assert!(prompt.contains("No upcoming events."));
    }

    #[tokio::test]
    async fn history_is_included_when_present() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = RequestContext::new("u1");
        let cfg = KillswitchConfig::default();
        let killswitch =
            Killswitch::new(&store, &cfg, chrono_tz::America::Los_Angeles, "work");
        let completion = ScriptedCompletion::new(vec!["Sure.".to_string()]);
        let answerer = QueryAnswerer::new(
            &store,
            &killswitch,
            &completion,
            chrono_tz::America::Los_Angeles,
        );

        let history = vec![HistoryTurn {
            role: "user",
            content: "thinking about moving the offsite".to_string(),
        }];
        answerer
            .answer(&ctx, "what do you think?", &history, AnswerMode::Conversation)
            .await
            .unwrap();
        assert!(completion.last_prompt().contains("RECENT CONVERSATION"));
        assert!(completion.last_prompt().contains("moving the offsite"));
    }
}
