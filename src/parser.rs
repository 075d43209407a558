//! Free-text to structured task candidates.
//!
//! One message can carry several distinct tasks ("book the studio and call
//! the contractor"); the parser returns all of them. Relative dates are
//! resolved against the reference timezone, never server-local time. On any
//! model failure the whole message becomes a single medium/personal
//! candidate so nothing the user sent is lost.

use chrono::Utc;
use chrono_tz::Tz;
use tracing::warn;

use crate::providers::CompletionService;
use crate::types::{Priority, TaskCandidate};

const PARSER_SYSTEM: &str = "You are an assistant's message parser. Parse user messages into \
structured tasks.\nAlways return a valid JSON array. Be concise but include helpful descriptions.";

pub struct TaskParser {
    reference_tz: Tz,
}

impl TaskParser {
    pub fn new(reference_tz: Tz) -> Self {
        Self { reference_tz }
    }

    pub async fn parse(
        &self,
        completion: &dyn CompletionService,
        raw_text: &str,
    ) -> Vec<TaskCandidate> {
        let now = Utc::now().with_timezone(&self.reference_tz);
        let current_date = now.format("%Y-%m-%d");
        let current_day = now.format("%A");
        let current_datetime = now.format("%A, %B %-d, %Y %-I:%M %p");

        let prompt = format!(
            r#"Parse this message into structured task(s). If the message contains multiple distinct tasks, return ALL of them. Return ONLY valid JSON, no markdown.

CURRENT DATE/TIME: {current_datetime} ({tz})
Today is: {current_day}, {current_date}

MESSAGE: "{raw_text}"

Return a JSON array of tasks. Even if there's only one task, wrap it in an array:
[
  {{
    "title": "short, actionable title (max 60 chars)",
    "description": "fuller context: who, what, why, any details from the message. 1-2 sentences.",
    "priority": "urgent|high|medium|low",
    "category": "work|creative|personal|home",
    "due_date": "YYYY-MM-DD if mentioned, otherwise null",
    "due_time": "HH:MM 24-hour if a time was mentioned, otherwise null",
    "estimated_hours": number if mentioned, otherwise null
  }}
]

Rules:
- Title should be SHORT and scannable (e.g. "Book studio time" not "Book studio time tomorrow for recording session")
- Description should capture the details from the message
- If the message mentions work, a meeting, a project, or a client → category: "work"
- If it mentions the studio, music, writing, or a show → category: "creative"
- If it mentions the house, a contractor, hosting, or errands around home → category: "home"
- Otherwise → category: "personal"
- If the message uses words like "ASAP", "urgent", "now", "today" → priority: "urgent"
- If the message mentions a deadline → priority: "high"
- Default priority: "medium"
- Parse relative dates against the CURRENT DATE above (e.g. "tomorrow" = the day after {current_date})
- If one message has multiple tasks, return EACH as a separate item"#,
            tz = self.reference_tz.name(),
        );

        match completion.complete_json(&prompt, PARSER_SYSTEM, 1024).await {
            Ok(value) => {
                // Tolerate a bare object for a single task.
                let items = match value {
                    serde_json::Value::Array(items) => items,
                    other => vec![other],
                };
                let candidates: Vec<TaskCandidate> = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value::<TaskCandidate>(item).ok())
                    .map(|c| normalize(c, raw_text))
                    .collect();
                if candidates.is_empty() {
                    vec![fallback_candidate(raw_text)]
                } else {
                    candidates
                }
            }
            Err(e) => {
                warn!(error = %e, "task parse failed, using fallback candidate");
                vec![fallback_candidate(raw_text)]
            }
        }
    }
}

fn normalize(mut candidate: TaskCandidate, raw_text: &str) -> TaskCandidate {
    if candidate.title.trim().is_empty() {
        candidate.title = truncate_title(raw_text);
    }
    if candidate.category.trim().is_empty() {
        candidate.category = "personal".to_string();
    }
    candidate
}

/// A whole-message candidate used whenever parsing yields nothing usable.
pub fn fallback_candidate(raw_text: &str) -> TaskCandidate {
    TaskCandidate {
        title: truncate_title(raw_text),
        description: String::new(),
        priority: Priority::Medium,
        category: "personal".to_string(),
        due_date: None,
        due_time: None,
        estimated_hours: None,
    }
}

fn truncate_title(raw_text: &str) -> String {
    raw_text.chars().take(60).collect::<String>().trim().to_string()
}
