//! Goal onboarding over SMS.
//!
//! Short "goals"-style messages get an intro prompt; longer messages are
//! parsed into structured goals across categories and saved with their
//! embeddings so the validator can score future tasks against them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::actions::VALID_CATEGORIES;
use crate::embeddings::Embedder;
use crate::providers::CompletionService;
use crate::store::SqliteStore;
use crate::types::{HistoryTurn, NewGoal, RequestContext};

#[derive(Debug, Deserialize)]
struct ParsedGoals {
    categories: Vec<ParsedCategory>,
}

#[derive(Debug, Deserialize)]
struct ParsedCategory {
    category: String,
    goals: Vec<ParsedGoal>,
}

#[derive(Debug, Deserialize)]
struct ParsedGoal {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    success_criteria: Option<String>,
    #[serde(default)]
    target_date: Option<String>,
    #[serde(default = "default_goal_priority")]
    priority: i32,
}

fn default_goal_priority() -> i32 {
    2
}

pub struct GoalOnboarding<'a> {
    store: &'a SqliteStore,
    embedder: &'a dyn Embedder,
    completion: &'a dyn CompletionService,
}

impl<'a> GoalOnboarding<'a> {
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

    pub async fn handle(
        &self,
        ctx: &RequestContext,
        body: &str,
        history: &[HistoryTurn],
    ) -> anyhow::Result<String> {
        let lower = body.to_lowercase().trim().to_string();
        let category_list = VALID_CATEGORIES.join(", ");

        // Short messages get the intro; longer ones are actual goal content.
        let is_short = body.len() < 100;
        if is_short
            && (lower == "goals"
                || lower.contains("set up")
                || lower.contains("help")
                || lower.contains("onboarding"))
        {
            let existing = self.store.list_goals(ctx).await?;
            let intro = if existing.is_empty() {
                "Let's set up your goals! I'll help you create measurable goals for each area of your life.".to_string()
            } else {
                format!("You have {} goals set up. Want to add more?", existing.len())
            };
            return Ok(format!(
                "{intro}\n\nTell me what you want to achieve; you can describe goals for one \
area or paste in all your goals at once. Your categories: {category_list}.\n\nFor example: \
\"For work, I want to get promoted to senior engineer by end of year\"\n\nThink about outcomes \
you can measure: results that lead to a larger objective."
            ));
        }

        match self.parse_and_save(ctx, body, history, &category_list).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(error = %e, "goal parsing failed");
                Ok("I had trouble processing all those goals. Try sending them in smaller \
chunks, one area at a time. For example, start with your work goals."
                    .to_string())
            }
        }
    }

    async fn parse_and_save(
        &self,
        ctx: &RequestContext,
        body: &str,
        history: &[HistoryTurn],
        category_list: &str,
    ) -> anyhow::Result<String> {
        let history_context = if history.is_empty() {
            String::new()
        } else {
            let turns: Vec<String> = history
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|t| format!("{}: {}", t.role, t.content))
                .collect();
            format!("\nPrevious conversation:\n{}\n", turns.join("\n"))
        };

        let prompt = format!(
            r#"The user is describing their goals. Parse their input into structured goals grouped by category.

The user's available categories are: {category_list}.
Map each goal to the best-fitting category. If a goal doesn't fit any existing category, use the closest match.
{history_context}
User's latest input:
"{body}"

For each goal mentioned, extract:
- A concise title
- Description of what it means
- Measurable success criteria
- Target date (YYYY-MM-DD format; use the dates they mention, or reasonable defaults)
- Priority (1=highest, 3=lowest)

Return JSON:
{{
  "categories": [
    {{
      "category": "work",
      "goals": [
        {{
          "title": "Concise goal title",
          "description": "What this goal means",
          "success_criteria": "How to measure success",
          "target_date": "2026-12-31",
          "priority": 1
        }}
      ]
    }}
  ]
}}"#
        );

        let value = self
            .completion
            .complete_json(
                &prompt,
                "You are a chief-of-staff assistant. Extract ALL goals the user described; do \
not summarize or reduce them. Preserve their specific metrics and dates. Keep titles concise \
but descriptive.",
                4096,
            )
            .await?;
        let parsed: ParsedGoals = serde_json::from_value(value)?;
        if parsed.categories.is_empty() {
            anyhow::bail!("no goals extracted");
        }

        let mut total_saved = 0usize;
        let mut summary_parts = Vec::new();

        for category in &parsed.categories {
            let mut titles = Vec::new();
            for goal in &category.goals {
                let embedding = self
                    .embedder
                    .embed(&format!("{}. {}", goal.title, goal.description))
                    .await?;
                self.store
                    .create_goal(
                        ctx,
                        NewGoal {
                            title: goal.title.clone(),
                            description: goal.description.clone(),
                            category: category.category.clone(),
                            priority: goal.priority,
                            target_date: goal.target_date.as_deref().and_then(parse_target_date),
                            success_criteria: goal.success_criteria.clone(),
                            embedding,
                        },
                    )
                    .await?;
                titles.push(goal.title.clone());
                total_saved += 1;
            }

            let mut name = category.category.clone();
            if let Some(first) = name.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            let numbered: Vec<String> = titles
                .iter()
                .enumerate()
                .map(|(i, t)| format!("{}. {}", i + 1, t))
                .collect();
            summary_parts.push(format!("{name}: {}", numbered.join(", ")));
        }

        Ok(format!(
            "Done! I've saved {total_saved} goals across {} areas:\n\n{}",
            parsed.categories.len(),
            summary_parts.join("\n\n"),
        ))
    }
}

fn parse_target_date(s: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0)?,
        Utc,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::KeywordEmbedder;
    use crate::testing::ScriptedCompletion;

    #[tokio::test]
    async fn short_message_gets_intro() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = RequestContext::new("u1");
        let completion = ScriptedCompletion::failing();
        let onboarding = GoalOnboarding::new(&store, &KeywordEmbedder, &completion);

        let reply = onboarding.handle(&ctx, "goals", &[]).await.unwrap();
        assert!(reply.contains("Let's set up your goals"));
        assert!(reply.contains("work, creative, personal, home"));
    }

    #[tokio::test]
    async fn detailed_message_saves_goals() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = RequestContext::new("u1");
        let completion = ScriptedCompletion::new(vec![r#"{
            "categories": [
                {
                    "category": "work",
                    "goals": [
                        {"title": "Get promoted", "description": "Senior engineer by December", "success_criteria": "Promo packet accepted", "target_date": "2026-12-31", "priority": 1}
                    ]
                },
                {
                    "category": "health",
                    "goals": [
                        {"title": "Run a half marathon", "description": "Spring race", "priority": 2}
                    ]
                }
            ]
        }"#
        .to_string()]);
        let onboarding = GoalOnboarding::new(&store, &KeywordEmbedder, &completion);

        let body = "For work, I want to get promoted to senior engineer by end of year. \
I also want to run a half marathon in the spring.";
        let reply = onboarding.handle(&ctx, body, &[]).await.unwrap();
        assert!(reply.contains("saved 2 goals across 2 areas"));

        let goals = store.list_goals(&ctx).await.unwrap();
        assert_eq!(goals.len(), 2);
        assert!(goals.iter().all(|g| !g.embedding.is_empty()));
        let promoted = goals.iter().find(|g| g.title == "Get promoted").unwrap();
        assert!(promoted.target_date.is_some());
    }

    #[tokio::test]
    async fn parse_failure_suggests_smaller_chunks() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = RequestContext::new("u1");
        let completion = ScriptedCompletion::failing();
        let onboarding = GoalOnboarding::new(&store, &KeywordEmbedder, &completion);

        let body = "x".repeat(150);
        let reply = onboarding.handle(&ctx, &body, &[]).await.unwrap();
        assert!(reply.contains("smaller chunks"));
    }

    #[test]
    fn target_date_parsing() {
        assert!(parse_target_date("2026-12-31").is_some());
        assert!(parse_target_date("soon").is_none());
    }
}
