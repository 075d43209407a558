//! Inbound message classification.
//!
//! Deterministic keyword/regex fast paths run first in a fixed priority
//! order; only messages they cannot place go to the completion service.
//! An LLM failure classifies as `task`: a spurious task beats a silently
//! dropped request.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::providers::CompletionService;
use crate::types::{HistoryTurn, MessageType};

static ACTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(mark|check off|finished|completed)\b.*\b(done|complete|finished)\b",
        r"\b(delete|remove|cancel)\b.*\b(task|event|meeting|appointment)\b",
        r"\b(cancel|delete)\b\s+(my|the)\b",
        r"\b(reschedule|move)\b.*\b(to|for)\b",
        r"\b(change|edit|update|rename)\b.*\b(task|to|priority)\b",
        r"\b(set|change)\b.*\b(priority|urgent|high|medium|low)\b",
        r"\bmark\b.*\bas\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static action pattern"))
    .collect()
});

const QUESTION_OPENERS: &[&str] = &[
    "what", "when", "where", "who", "how", "am i", "do i", "is there", "are there", "can i",
    "show me", "tell me",
];

const CONVERSATION_CUES: &[&str] = &[
    "brainstorm",
    "ideas for",
    "help me think",
    "let's think",
    "let's discuss",
    "what do you think",
    "what would you suggest",
    "any suggestions",
    "give me ideas",
    "pros and cons",
    "help me decide",
    "better way to",
    "advice on",
    "how should i approach",
    "let's plan",
];

/// Fast-path classification. `None` means ambiguous: fall through to the
/// model. Rules are checked in priority order; the specific intents
/// (email scan, goals, killswitch) win over the generic question opener,
/// so "how many hours this week?" never degrades into a plain query.
pub fn classify_fast(body: &str) -> Option<MessageType> {
    let lower = body.to_lowercase().trim().to_string();
    let lower = lower.as_str();

    let email_scan = (lower.contains("scan") && lower.contains("email"))
        || (lower.contains("email") && lower.contains("todo"))
        || (lower.contains("check") && lower.contains("email") && lower.contains("task"))
        || lower.contains("email action items")
        || lower == "emails";
    if email_scan {
        return Some(MessageType::EmailScan);
    }

    let goals = (lower.contains("set") && lower.contains("goal"))
        || (lower.contains("my goal") && !lower.starts_with("what"))
        || lower.contains("goal onboarding")
        || (lower.contains("help") && lower.contains("goal"))
        || (lower.contains("plan") && lower.contains("goal"))
        || lower == "goals";
    if goals {
        return Some(MessageType::Goals);
    }

    let killswitch = lower.contains("work hours")
        || lower.contains("killswitch")
        || (lower.contains("how many hours") && lower.contains("week"));
    if killswitch {
        return Some(MessageType::Killswitch);
    }

    if ACTION_PATTERNS.iter().any(|p| p.is_match(lower)) {
        return Some(MessageType::Action);
    }

    if CONVERSATION_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some(MessageType::Conversation);
    }

    let question = QUESTION_OPENERS.iter().any(|o| lower.starts_with(o)) || lower.ends_with('?');
    if question {
        return Some(MessageType::Query);
    }

    None
}

const CLASSIFY_SYSTEM: &str = "You classify messages. Return only valid JSON.";

/// Full classification: fast paths, then the completion service with recent
/// conversation context.
pub async fn classify(
    completion: &dyn CompletionService,
    body: &str,
    history: &[HistoryTurn],
) -> MessageType {
    if let Some(message_type) = classify_fast(body) {
        debug!(r#type = message_type.as_str(), "fast-path classification");
        return message_type;
    }

    let history_context = if history.is_empty() {
        String::new()
    } else {
        let turns: Vec<String> = history
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect();
        format!("\nRECENT CONVERSATION:\n{}\n", turns.join("\n"))
    };

    let prompt = format!(
        r#"Classify this message into one of these types:
- "query": asking a factual question about schedule, calendar, tasks, or status
- "conversation": brainstorming, discussing ideas, asking for advice or suggestions, general discussion, thinking through a problem together
- "task": requesting to create something new (a new task, reminder, etc.)
- "action": managing an existing task or calendar event (mark done, delete, edit, reschedule, cancel, reprioritize)
- "goals": setting up, describing, or discussing goals
{history_context}
MESSAGE: "{body}"

Consider the conversation context when classifying. For example, "yes" after a question about goals should be "goals", a follow-up to a brainstorm should be "conversation", and a factual question should be "query".

Return JSON: {{"type": "query"}} or {{"type": "conversation"}} or {{"type": "task"}} or {{"type": "action"}} or {{"type": "goals"}}"#
    );

    match completion.complete_json(&prompt, CLASSIFY_SYSTEM, 64).await {
        Ok(value) => match value["type"].as_str() {
            Some("query") => MessageType::Query,
            Some("conversation") => MessageType::Conversation,
            Some("action") => MessageType::Action,
            Some("goals") => MessageType::Goals,
            _ => MessageType::Task,
        },
        Err(e) => {
            warn!(error = %e, "classification fallback to task");
            MessageType::Task
        }
    }
}
