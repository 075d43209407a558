//! Core domain types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Explicit per-request tenancy scope. Every repository call that touches
/// user-owned rows takes one of these; there is no implicit "no filter" mode.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: String,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Classification of an inbound message. Drives pipeline dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Query,
    Conversation,
    Task,
    Action,
    Killswitch,
    EmailScan,
    Goals,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Query => "query",
            MessageType::Conversation => "conversation",
            MessageType::Task => "task",
            MessageType::Action => "action",
            MessageType::Killswitch => "killswitch",
            MessageType::EmailScan => "email_scan",
            MessageType::Goals => "goals",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "urgent" => Priority::Urgent,
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// Task lifecycle states. Transitions are enforced in `tasks::allowed_transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    ClarificationNeeded,
    Completed,
    Deferred,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::ClarificationNeeded => "clarification_needed",
            TaskStatus::Completed => "completed",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "active" => Some(TaskStatus::Active),
            "clarification_needed" => Some(TaskStatus::ClarificationNeeded),
            "completed" => Some(TaskStatus::Completed),
            "deferred" => Some(TaskStatus::Deferred),
            "rejected" => Some(TaskStatus::Rejected),
            _ => None,
        }
    }
}

/// Processing state of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Received => "received",
            MessageStatus::Processing => "processing",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(MessageStatus::Received),
            "processing" => Some(MessageStatus::Processing),
            "processed" => Some(MessageStatus::Processed),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An inbound or outbound message row. Inbound rows double as the
/// idempotency record: `external_id` is unique.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub external_id: String,
    pub direction: Direction,
    pub from_addr: String,
    pub to_addr: String,
    pub body: String,
    pub status: MessageStatus,
    pub user_id: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A persisted task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub raw_text: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub category: String,
    pub status: TaskStatus,
    pub alignment_score: f64,
    pub pushback_reason: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f64>,
    pub account_id: Option<String>,
    pub user_id: String,
    pub source_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for creating a task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub raw_text: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub category: String,
    pub status: TaskStatus,
    pub alignment_score: f64,
    pub pushback_reason: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f64>,
    pub account_id: Option<String>,
    pub source_message_id: Option<String>,
}

/// One structured task candidate extracted from free text. A single message
/// can yield several of these; each is validated independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCandidate {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_category")]
    pub category: String,
    /// "YYYY-MM-DD" in the reference timezone, if the message mentioned one.
    #[serde(default)]
    pub due_date: Option<String>,
    /// "HH:MM" 24h in the reference timezone.
    #[serde(default)]
    pub due_time: Option<String>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

fn default_category() -> String {
    "personal".to_string()
}

/// Result of scoring a task candidate against the user's goals.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationResult {
    #[serde(rename = "alignmentScore")]
    pub alignment_score: f64,
    #[serde(rename = "needsClarification")]
    pub needs_clarification: bool,
    #[serde(rename = "clarificationPrompt", default)]
    pub clarification_prompt: Option<String>,
    pub reasoning: String,
    #[serde(rename = "isValid")]
    pub is_valid: bool,
}

/// A long-lived user goal. Consulted by the validator, never mutated by it.
#[derive(Debug, Clone)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: i32,
    pub target_date: Option<DateTime<Utc>>,
    pub success_criteria: Option<String>,
    pub embedding: Vec<f32>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGoal {
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: i32,
    pub target_date: Option<DateTime<Utc>>,
    pub success_criteria: Option<String>,
    pub embedding: Vec<f32>,
}

/// Inferred type of a cached calendar event. Assigned at sync time so the
/// killswitch never has to guess from titles afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Work,
    Workout,
    Studio,
    Personal,
    Blocked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Work => "work",
            EventType::Workout => "workout",
            EventType::Studio => "studio",
            EventType::Personal => "personal",
            EventType::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "work" => EventType::Work,
            "workout" => EventType::Workout,
            "studio" => EventType::Studio,
            "blocked" => EventType::Blocked,
            _ => EventType::Personal,
        }
    }
}

/// A calendar account belonging to a user (one per connected calendar).
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub account_type: String,
    pub email: String,
    pub is_primary: bool,
}

/// Local cache row for an external calendar event.
#[derive(Debug, Clone)]
pub struct CalendarEvent {
    pub id: String,
    pub external_event_id: String,
    pub account_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub location: Option<String>,
    pub event_type: EventType,
    pub is_auto_blocked: bool,
    pub task_id: Option<String>,
    pub synced_at: DateTime<Utc>,
}

impl CalendarEvent {
    pub fn duration_hours(&self) -> f64 {
        (self.end_time - self.start_time).num_minutes() as f64 / 60.0
    }
}

/// Upsert input for the calendar cache.
#[derive(Debug, Clone)]
pub struct CalendarEventUpsert {
    pub external_event_id: String,
    pub account_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub location: Option<String>,
    pub event_type: EventType,
    pub is_auto_blocked: bool,
    pub task_id: Option<String>,
}

/// Weekly protected-hours ledger. One row per user per ISO week; the hour
/// total is derived from the calendar cache, never hand-edited.
#[derive(Debug, Clone)]
pub struct WorkWeek {
    pub id: String,
    pub user_id: String,
    /// Monday of the week, "YYYY-MM-DD" in the reference timezone.
    pub week_start_date: String,
    pub total_hours: f64,
    /// JSON snapshot of contributing events, for audit/explanation.
    pub events_json: String,
    pub alert_sent_at: Option<DateTime<Utc>>,
    pub triggered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct KillswitchStatus {
    pub current_hours: f64,
    pub remaining_hours: f64,
    pub is_active: bool,
    pub alert_sent: bool,
    pub week_start_date: String,
}

#[derive(Debug, Clone)]
pub struct BlockDecision {
    pub blocked: bool,
    pub message: String,
}

/// Result of a conflict check against the event cache.
#[derive(Debug, Clone)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub conflicts: Vec<CalendarEvent>,
}

/// An open slot proposed by the slot finder.
#[derive(Debug, Clone)]
pub struct AvailableSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Human-readable day/time, e.g. "Wed Mar 4, 9:00 AM–10:30 AM".
    pub label: String,
}

/// Response returned from the pipeline for one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub message_type: MessageType,
}

/// One turn of recent conversation, passed to the classifier and answerer.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: &'static str, // "user" or "assistant"
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::ClarificationNeeded,
            TaskStatus::Completed,
            TaskStatus::Deferred,
            TaskStatus::Rejected,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn priority_defaults_to_medium_on_unknown() {
        assert_eq!(Priority::parse("???"), Priority::Medium);
        assert_eq!(Priority::parse("urgent"), Priority::Urgent);
    }

    #[test]
    fn event_type_defaults_to_personal() {
        assert_eq!(EventType::parse("brunch"), EventType::Personal);
        assert_eq!(EventType::parse("work"), EventType::Work);
    }
}
