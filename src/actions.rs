//! Natural-language management commands over existing tasks and events.
//!
//! A command is parsed into a [`ParsedAction`] by the completion service,
//! then executed against the store and calendar. Target matching is fuzzy
//! but careful: an exact title match wins, a single substring match is
//! accepted, and anything ambiguous comes back as a clarifying question
//! instead of mutating a guess.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::warn;

use crate::calendar::{CalendarService, RemoteEventPatch};
use crate::providers::CompletionService;
use crate::store::SqliteStore;
use crate::tasks;
use crate::types::{CalendarEvent, Priority, RequestContext, Task, TaskStatus};

pub const VALID_CATEGORIES: &[&str] = &["work", "creative", "personal", "home"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CompleteTask,
    DeleteTask,
    EditTask,
    ReprioritizeTask,
    RecategorizeTask,
    UpdateHours,
    CancelEvent,
    RescheduleEvent,
    CreateEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParsedAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub target: String,
    #[serde(default)]
    pub new_value: Option<String>,
    #[serde(default)]
    pub new_date: Option<String>,
    #[serde(default)]
    pub new_time: Option<String>,
    #[serde(default)]
    pub new_priority: Option<String>,
    #[serde(default)]
    pub new_category: Option<String>,
    #[serde(default)]
    pub duration_hours: Option<f64>,
}

/// Outcome of target matching.
enum Match<T> {
    None,
    One(T),
    Ambiguous(Vec<T>),
}

pub struct ActionExecutor<'a> {
    store: &'a SqliteStore,
    calendar: &'a CalendarService<'a>,
    completion: &'a dyn CompletionService,
    reference_tz: Tz,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(
        store: &'a SqliteStore,
        calendar: &'a CalendarService<'a>,
        completion: &'a dyn CompletionService,
        reference_tz: Tz,
    ) -> Self {
        Self {
            store,
            calendar,
            completion,
            reference_tz,
        }
    }

    pub async fn execute(&self, ctx: &RequestContext, body: &str) -> anyhow::Result<String> {
        let Some(action) = self.parse_action(body).await else {
            return Ok("I couldn't understand that command. Try something like: \"mark [task] as done\", \
\"delete [task]\", \"cancel [event]\", or \"reschedule [event] to Friday at 3pm\"."
                .to_string());
        };

        match action.action_type {
            ActionType::CompleteTask => self.complete_task(ctx, &action.target).await,
            ActionType::DeleteTask => self.delete_task(ctx, &action.target).await,
            ActionType::EditTask => {
                self.edit_task(ctx, &action.target, action.new_value.as_deref())
                    .await
            }
            ActionType::ReprioritizeTask => {
                self.reprioritize_task(ctx, &action.target, action.new_priority.as_deref())
                    .await
            }
            ActionType::RecategorizeTask => {
                self.recategorize_task(ctx, &action.target, action.new_category.as_deref())
                    .await
            }
            ActionType::UpdateHours => {
                self.update_hours(ctx, &action.target, action.duration_hours)
                    .await
            }
            ActionType::CancelEvent => self.cancel_event(ctx, &action.target).await,
            ActionType::RescheduleEvent => self.reschedule_event(ctx, &action).await,
            ActionType::CreateEvent => self.create_event(ctx, &action).await,
        }
    }

    async fn parse_action(&self, body: &str) -> Option<ParsedAction> {
        let now = Utc::now().with_timezone(&self.reference_tz);
        let prompt = format!(
            r#"Parse this message into a management action. TODAY is {day}, {date}.

MESSAGE: "{body}"

Return JSON with:
{{
  "type": one of: "complete_task", "delete_task", "edit_task", "reprioritize_task", "recategorize_task", "update_hours", "cancel_event", "reschedule_event", "create_event",
  "target": the name/description of the task or event being referenced (use the most identifying keywords),
  "new_value": (for edit_task) the new title/description,
  "new_date": (for reschedule/create) ISO date string YYYY-MM-DD,
  "new_time": (for reschedule/create) time in HH:MM 24hr format,
  "new_priority": (for reprioritize) one of "urgent", "high", "medium", "low",
  "new_category": (for recategorize_task) one of "work", "creative", "personal", "home",
  "duration_hours": (for update_hours or create_event) number of hours
}}

Only include fields that are relevant. Return JSON only."#,
            day = now.format("%A"),
            date = now.format("%Y-%m-%d"),
        );

        let value = self
            .completion
            .complete_json(
                &prompt,
                "You parse management commands into structured JSON actions. Return valid JSON only.",
                256,
            )
            .await
            .ok()?;
        match serde_json::from_value(value) {
            Ok(action) => Some(action),
            Err(e) => {
                warn!(error = %e, "unparseable action");
                None
            }
        }
    }

    /// Fuzzy task lookup: exact case-insensitive title match wins, then a
    /// single substring match; several substring matches are ambiguous.
    async fn match_task(&self, ctx: &RequestContext, target: &str) -> anyhow::Result<Match<Task>> {
        let candidates = self.store.find_tasks_by_title(ctx, target).await?;
        Ok(resolve_match(candidates, target, |t| &t.title))
    }

    async fn match_event(
        &self,
        ctx: &RequestContext,
        target: &str,
    ) -> anyhow::Result<Match<CalendarEvent>> {
        let candidates = self
            .store
            .find_events_by_title(ctx, target, Utc::now())
            .await?;
        Ok(resolve_match(candidates, target, |e| &e.title))
    }

    async fn complete_task(&self, ctx: &RequestContext, target: &str) -> anyhow::Result<String> {
        let task = match self.match_task(ctx, target).await? {
            Match::None => return Ok(no_task_match(target)),
            Match::Ambiguous(tasks) => return Ok(ambiguous(target, tasks.iter().map(|t| t.title.as_str()))),
            Match::One(task) => task,
        };
        if task.status == TaskStatus::Completed {
            return Ok(format!("\"{}\" is already marked as done.", task.title));
        }
        tasks::transition(self.store, ctx, &task, TaskStatus::Completed).await?;
        Ok(format!("Done! Marked \"{}\" as complete.", task.title))
    }

    async fn delete_task(&self, ctx: &RequestContext, target: &str) -> anyhow::Result<String> {
        let task = match self.match_task(ctx, target).await? {
            Match::None => return Ok(no_task_match(target)),
            Match::Ambiguous(tasks) => return Ok(ambiguous(target, tasks.iter().map(|t| t.title.as_str()))),
            Match::One(task) => task,
        };
        self.store.delete_task(ctx, &task.id).await?;
        Ok(format!("Deleted \"{}\" from your tasks.", task.title))
    }

    async fn edit_task(
        &self,
        ctx: &RequestContext,
        target: &str,
        new_value: Option<&str>,
    ) -> anyhow::Result<String> {
        let Some(new_value) = new_value.filter(|v| !v.is_empty()) else {
            return Ok("What should I change the task to? Try: \"edit [task name] to [new name]\"".to_string());
        };
        let task = match self.match_task(ctx, target).await? {
            Match::None => return Ok(no_task_match(target)),
            Match::Ambiguous(tasks) => return Ok(ambiguous(target, tasks.iter().map(|t| t.title.as_str()))),
            Match::One(task) => task,
        };
        self.store.update_task_title(ctx, &task.id, new_value).await?;
        Ok(format!("Updated \"{}\" → \"{}\"", task.title, new_value))
    }

    async fn reprioritize_task(
        &self,
        ctx: &RequestContext,
        target: &str,
        priority: Option<&str>,
    ) -> anyhow::Result<String> {
        let Some(priority) = priority
            .filter(|p| matches!(*p, "urgent" | "high" | "medium" | "low"))
        else {
            return Ok("Invalid priority. Use: urgent, high, medium, or low.".to_string());
        };
        let task = match self.match_task(ctx, target).await? {
            Match::None => return Ok(no_task_match(target)),
            Match::Ambiguous(tasks) => return Ok(ambiguous(target, tasks.iter().map(|t| t.title.as_str()))),
            Match::One(task) => task,
        };
        self.store
            .update_task_priority(ctx, &task.id, Priority::parse(priority))
            .await?;
        Ok(format!("Changed \"{}\" priority to {}.", task.title, priority))
    }

    async fn recategorize_task(
        &self,
        ctx: &RequestContext,
        target: &str,
        category: Option<&str>,
    ) -> anyhow::Result<String> {
        let Some(category) = category.filter(|c| VALID_CATEGORIES.contains(c)) else {
            return Ok(format!(
                "Invalid category. Use: {}.",
                VALID_CATEGORIES.join(", ")
            ));
        };
        let task = match self.match_task(ctx, target).await? {
            Match::None => return Ok(no_task_match(target)),
            Match::Ambiguous(tasks) => return Ok(ambiguous(target, tasks.iter().map(|t| t.title.as_str()))),
            Match::One(task) => task,
        };
        self.store.update_task_category(ctx, &task.id, category).await?;
        Ok(format!("Moved \"{}\" to the {} category.", task.title, category))
    }

    async fn update_hours(
        &self,
        ctx: &RequestContext,
        target: &str,
        hours: Option<f64>,
    ) -> anyhow::Result<String> {
        let Some(hours) = hours.filter(|h| *h > 0.0) else {
            return Ok("How many hours? Try: \"change [task] to 3 hours\"".to_string());
        };
        let task = match self.match_task(ctx, target).await? {
            Match::None => return Ok(no_task_match(target)),
            Match::Ambiguous(tasks) => return Ok(ambiguous(target, tasks.iter().map(|t| t.title.as_str()))),
            Match::One(task) => task,
        };
        self.store.update_task_hours(ctx, &task.id, hours).await?;
        Ok(format!("Updated \"{}\" to {} hour(s).", task.title, hours))
    }

    async fn cancel_event(&self, ctx: &RequestContext, target: &str) -> anyhow::Result<String> {
        let event = match self.match_event(ctx, target).await? {
            Match::None => {
                return Ok(format!("Couldn't find an upcoming event matching \"{target}\"."))
            }
            Match::Ambiguous(events) => {
                return Ok(ambiguous(target, events.iter().map(|e| e.title.as_str())))
            }
            Match::One(event) => event,
        };
        match self.calendar.delete_event(&event).await {
            Ok(()) => {
                let date = event
                    .start_time
                    .with_timezone(&self.reference_tz)
                    .format("%a %b %-d");
                Ok(format!("Cancelled \"{}\" on {}.", event.title, date))
            }
            Err(e) => {
                warn!(error = %e, event = %event.external_event_id, "cancel failed");
                Ok(format!(
                    "Found \"{}\" but couldn't delete it from the calendar. It may have been removed already.",
                    event.title
                ))
            }
        }
    }

    async fn reschedule_event(
        &self,
        ctx: &RequestContext,
        action: &ParsedAction,
    ) -> anyhow::Result<String> {
        let Some(new_date) = action.new_date.as_deref() else {
            return Ok("When should I reschedule it to? Try: \"reschedule [event] to Friday at 3pm\"".to_string());
        };
        let event = match self.match_event(ctx, &action.target).await? {
            Match::None => {
                return Ok(format!(
                    "Couldn't find an upcoming event matching \"{}\".",
                    action.target
                ))
            }
            Match::Ambiguous(events) => {
                return Ok(ambiguous(&action.target, events.iter().map(|e| e.title.as_str())))
            }
            Match::One(event) => event,
        };

        // Absent a new time, keep the event's original time of day.
        let original_time = event.start_time.with_timezone(&self.reference_tz).time();
        let Some(new_start) = self.resolve_datetime(new_date, action.new_time.as_deref(), Some(original_time))
        else {
            return Ok(format!("I couldn't make sense of the date \"{new_date}\"."));
        };
        let duration = event.end_time - event.start_time;
        let new_end = new_start + duration;

        match self
            .calendar
            .update_event(
                &event,
                RemoteEventPatch {
                    start_time: Some(new_start),
                    end_time: Some(new_end),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(()) => {
                let local = new_start.with_timezone(&self.reference_tz);
                Ok(format!(
                    "Rescheduled \"{}\" to {} at {}.",
                    event.title,
                    local.format("%a %b %-d"),
                    local.format("%-I:%M %p"),
                ))
            }
            Err(e) => {
                warn!(error = %e, event = %event.external_event_id, "reschedule failed");
                Ok(format!(
                    "Found \"{}\" but couldn't update it on the calendar.",
                    event.title
                ))
            }
        }
    }

    async fn create_event(
        &self,
        ctx: &RequestContext,
        action: &ParsedAction,
    ) -> anyhow::Result<String> {
        let Some(date) = action.new_date.as_deref() else {
            return Ok("When should I schedule it? Try: \"add meeting Wednesday at 2pm\"".to_string());
        };
        let Some(start) = self.resolve_datetime(date, action.new_time.as_deref(), None) else {
            return Ok(format!("I couldn't make sense of the date \"{date}\"."));
        };
        let duration = action.duration_hours.filter(|h| *h > 0.0).unwrap_or(1.0);
        let end = start + Duration::minutes((duration * 60.0).round() as i64);

        let Some(account) = self
            .store
            .list_accounts(ctx)
            .await?
            .into_iter()
            .find(|a| a.is_primary)
        else {
            return Ok("No connected calendar account found. Connect one first.".to_string());
        };

        match self
            .calendar
            .create_event_from_task(&account.id, None, &action.target, "Created via SMS", start, end)
            .await
        {
            Ok(_) => {
                let local = start.with_timezone(&self.reference_tz);
                Ok(format!(
                    "Added \"{}\" to your calendar: {} at {} ({}hr).",
                    action.target,
                    local.format("%a %b %-d"),
                    local.format("%-I:%M %p"),
                    duration,
                ))
            }
            Err(e) => {
                warn!(error = %e, "event creation failed");
                Ok("Couldn't create the event on the calendar. Try again later.".to_string())
            }
        }
    }

    /// "YYYY-MM-DD" plus optional "HH:MM" in the reference timezone.
    /// Defaults to 9am when no time is given or carried over.
    fn resolve_datetime(
        &self,
        date: &str,
        time: Option<&str>,
        fallback_time: Option<NaiveTime>,
    ) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        let time = match time {
            Some(t) => NaiveTime::parse_from_str(t, "%H:%M").ok()?,
            None => fallback_time.or_else(|| NaiveTime::from_hms_opt(9, 0, 0))?,
        };
        self.reference_tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn no_task_match(target: &str) -> String {
    format!("Couldn't find a task matching \"{target}\". Check your task list and try again.")
}

fn ambiguous<'t>(target: &str, titles: impl Iterator<Item = &'t str>) -> String {
    let listed: Vec<String> = titles.take(5).map(|t| format!("\"{t}\"")).collect();
    format!(
        "A few things match \"{target}\": {}. Which one did you mean?",
        listed.join(", ")
    )
}

/// Shared matching policy for tasks and events.
fn resolve_match<T>(mut candidates: Vec<T>, target: &str, title: impl Fn(&T) -> &str) -> Match<T> {
    if candidates.is_empty() {
        return Match::None;
    }
    let target_lower = target.to_lowercase();
    let exact: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| title(c).to_lowercase() == target_lower)
        .map(|(i, _)| i)
        .collect();
    if let [index] = exact[..] {
        return Match::One(candidates.swap_remove(index));
    }
    if candidates.len() == 1 {
        return Match::One(candidates.swap_remove(0));
    }
    Match::Ambiguous(candidates)
}
