//! Goal-alignment validation and pushback.
//!
//! Each task candidate is scored against the user's nearest goals. The
//! validator is advisory: any infrastructure failure fails open with a
//! neutral 0.5 score so tasks are never lost to a scoring outage.

use tracing::warn;

use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::PipelineError;
use crate::providers::CompletionService;
use crate::store::SqliteStore;
use crate::types::{Goal, RequestContext, TaskCandidate, ValidationResult};

/// Scores at or above this create the task with no commentary.
pub const NO_PUSHBACK_SCORE: f64 = 0.7;
/// Scores below this reject the task with a pushback message.
pub const LOW_VALUE_SCORE: f64 = 0.5;

const VALIDATOR_SYSTEM: &str =
    "You are a chief-of-staff assistant. Ruthlessly protect the user's time and goals.";

pub struct TaskValidator<'a> {
    store: &'a SqliteStore,
    embedder: &'a dyn Embedder,
    completion: &'a dyn CompletionService,
}

impl<'a> TaskValidator<'a> {
    pub fn new(
        store: &'a SqliteStore,
        embedder: &'a dyn Embedder,
        completion: &'a dyn CompletionService,
    ) -> Self {
        Self {
            store,
            embedder,
            completion,
        }
    }

    pub async fn validate(
        &self,
        ctx: &RequestContext,
        candidate: &TaskCandidate,
    ) -> ValidationResult {
        match self.try_validate(ctx, candidate).await {
            Ok(result) => result,
            Err(e) => {
                let err = PipelineError::ValidationService(e.to_string());
                warn!(error = %err, title = %candidate.title, "validation failed open");
                neutral_result("Validation service error. Task allowed by default.")
            }
        }
    }

    async fn try_validate(
        &self,
        ctx: &RequestContext,
        candidate: &TaskCandidate,
    ) -> anyhow::Result<ValidationResult> {
        let task_text = format!("{}. {}", candidate.title, candidate.description);
        let task_embedding = self.embedder.embed(&task_text).await?;

        let goals = self.store.list_goals(ctx).await?;
        if goals.is_empty() {
            return Ok(neutral_result(
                "No goals set up yet. Accepted without goal scoring.",
            ));
        }

        let nearest = nearest_goals(&goals, &task_embedding, 3);
        let goals_context: Vec<String> = nearest
            .iter()
            .map(|(goal, similarity)| {
                format!("- {} (similarity: {:.1}%)", goal.title, similarity * 100.0)
            })
            .collect();

        let description = if candidate.description.is_empty() {
            "No description provided"
        } else {
            &candidate.description
        };

        let prompt = format!(
            r#"Evaluate this task against the user's goals.

**Task:** {title}
**Description:** {description}
**Category:** {category}

**Most Similar Goals:**
{goals_context}

Return JSON:
{{
  "alignmentScore": 0.0-1.0,
  "needsClarification": true/false,
  "clarificationPrompt": "question to ask if unclear (or null)",
  "reasoning": "1-2 sentence explanation of alignment or why it's low-value",
  "isValid": true/false
}}

**Scoring Guide:**
- 0.8-1.0: Directly advances a top-priority goal
- 0.5-0.7: Supports a goal but not critical path
- 0.0-0.4: Low value, distraction, or busywork

If a task doesn't clearly advance one of the goals above, score it low."#,
            title = candidate.title,
            category = candidate.category,
            goals_context = goals_context.join("\n"),
        );

        let value = self
            .completion
            .complete_json(&prompt, VALIDATOR_SYSTEM, 512)
            .await?;
        let result: ValidationResult = serde_json::from_value(value)?;
        Ok(result)
    }

    /// Commentary attached to the task confirmation, graded by score band:
    /// clarification question, generated pushback, a heads-up, or nothing.
    pub async fn pushback(
        &self,
        candidate: &TaskCandidate,
        validation: &ValidationResult,
    ) -> String {
        if validation.needs_clarification {
            if let Some(prompt) = &validation.clarification_prompt {
                return prompt.clone();
            }
        }

        if validation.alignment_score < LOW_VALUE_SCORE {
            let prompt = format!(
                r#"Generate a SHORT pushback message (2-3 sentences max) for this task that doesn't align with the user's goals.

**Task:** {title}
**Reasoning:** {reasoning}

**Style Guide:**
- Be direct but not rude
- Ask a rhetorical question about whether the task advances a real goal
- Suggest the actual priority or what should be done instead
- Keep it under 160 characters for SMS

Generate pushback:"#,
                title = candidate.title,
                reasoning = validation.reasoning,
            );

            match self.completion.complete(&prompt, VALIDATOR_SYSTEM, 256).await {
                Ok(message) => return message.trim().to_string(),
                Err(e) => {
                    warn!(error = %e, "pushback generation failed, using reasoning");
                    return format!("Skipping this one: {}", validation.reasoning);
                }
            }
        }

        if validation.alignment_score < NO_PUSHBACK_SCORE {
            return format!(
                "Got it, but heads up: this isn't a high-priority goal item. {}",
                validation.reasoning
            );
        }

        String::new()
    }
}

fn neutral_result(reasoning: &str) -> ValidationResult {
    ValidationResult {
        alignment_score: 0.5,
        needs_clarification: false,
        clarification_prompt: None,
        reasoning: reasoning.to_string(),
        is_valid: true,
    }
}

/// Top-k goals by cosine similarity, most similar first.
fn nearest_goals<'g>(goals: &'g [Goal], embedding: &[f32], k: usize) -> Vec<(&'g Goal, f64)> {
    let mut scored: Vec<(&Goal, f64)> = goals
        .iter()
        .map(|goal| (goal, cosine_similarity(&goal.embedding, embedding)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}
