//! Morning briefing: one SMS summarizing the day ahead.

use chrono::{Duration, TimeZone, Utc};
use chrono_tz::Tz;

use crate::killswitch::Killswitch;
use crate::store::SqliteStore;
use crate::types::{Priority, RequestContext};

const MAX_TASKS: u32 = 5;
const MAX_EVENTS: u32 = 10;

pub struct MorningBriefing<'a> {
    store: &'a SqliteStore,
    killswitch: &'a Killswitch<'a>,
    reference_tz: Tz,
}

impl<'a> MorningBriefing<'a> {
    pub fn new(store: &'a SqliteStore, killswitch: &'a Killswitch<'a>, reference_tz: Tz) -> Self {
        Self {
            store,
            killswitch,
            reference_tz,
        }
    }

    /// Today's events, the top open tasks, and the work-hour tally.
    pub async fn compose(&self, ctx: &RequestContext) -> anyhow::Result<String> {
        let now = Utc::now().with_timezone(&self.reference_tz);
        let day_start = self
            .reference_tz
            .from_local_datetime(&now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default())
            .earliest()
            .unwrap_or(now)
            .with_timezone(&Utc);
        let day_end = day_start + Duration::days(1);

        let events = self
            .store
            .upcoming_events(ctx, day_start, day_end, MAX_EVENTS)
            .await?;
        let tasks = self.store.list_open_tasks(ctx, MAX_TASKS).await?;
        let status = self.killswitch.status(ctx).await?;

        let mut lines = vec![format!(
            "Good morning! {}",
            now.format("%A, %B %-d")
        )];

        if events.is_empty() {
            lines.push("\nNo events on the calendar today.".to_string());
        } else {
            lines.push("\nToday:".to_string());
            for event in &events {
                let local = event.start_time.with_timezone(&self.reference_tz);
                lines.push(format!("  {} {}", local.format("%-I:%M %p"), event.title));
            }
        }

        if !tasks.is_empty() {
            lines.push("\nOpen tasks:".to_string());
            for task in &tasks {
                let marker = match task.priority {
                    Priority::Urgent => "‼ ",
                    Priority::High => "! ",
                    _ => "",
                };
                lines.push(format!("  • {marker}{}", task.title));
            }
        }

        lines.push(format!(
            "\nWork hours: {:.1}/{:.0} this week",
            status.current_hours,
            status.current_hours + status.remaining_hours
        ));
        if status.is_active {
            lines.push("Killswitch is active: no new work until Monday.".to_string());
        }

        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KillswitchConfig;
    use crate::types::{Account, CalendarEventUpsert, EventType, NewTask, TaskStatus};

    #[tokio::test]
    async fn briefing_lists_events_tasks_and_hours() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = RequestContext::new("u1");
        store
            .upsert_account(&Account {
                id: "acc1".to_string(),
                user_id: "u1".to_string(),
                account_type: "personal".to_string(),
                email: String::new(),
                is_primary: true,
            })
            .await
            .unwrap();

        // Noon local is inside today's briefing window no matter when the
        // test runs.
        let tz = chrono_tz::America::Los_Angeles;
        let today = Utc::now().with_timezone(&tz).date_naive();
        let noon = tz
            .from_local_datetime(&today.and_hms_opt(12, 0, 0).unwrap())
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        store
            .upsert_event(&CalendarEventUpsert {
                external_event_id: "e1".to_string(),
                account_id: "acc1".to_string(),
                title: "Standup".to_string(),
                description: None,
                start_time: noon,
                end_time: noon + Duration::minutes(30),
                location: None,
                event_type: EventType::Work,
                is_auto_blocked: false,
                task_id: None,
            })
            .await
            .unwrap();
        store
            .create_task(
                &ctx,
                NewTask {
                    raw_text: "ship the deck".to_string(),
                    title: "Ship the deck".to_string(),
                    description: String::new(),
                    priority: Priority::High,
                    category: "work".to_string(),
                    status: TaskStatus::Pending,
                    alignment_score: 0.9,
                    pushback_reason: None,
                    due_at: None,
                    estimated_hours: None,
                    account_id: None,
                    source_message_id: None,
                },
            )
            .await
            .unwrap();

        let cfg = KillswitchConfig::default();
        let ks = Killswitch::new(&store, &cfg, chrono_tz::America::Los_Angeles, "work");
        let briefing = MorningBriefing::new(&store, &ks, chrono_tz::America::Los_Angeles);

        let text = briefing.compose(&ctx).await.unwrap();
        assert!(text.starts_with("Good morning!"));
        assert!(text.contains("Standup"));
        assert!(text.contains("! Ship the deck"));
        assert!(text.contains("Work hours:"));
    }

    #[tokio::test]
    async fn empty_day_still_produces_a_briefing() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = RequestContext::new("u1");
        let cfg = KillswitchConfig::default();
        let ks = Killswitch::new(&store, &cfg, chrono_tz::America::Los_Angeles, "work");
        let briefing = MorningBriefing::new(&store, &ks, chrono_tz::America::Los_Angeles);

        let text = briefing.compose(&ctx).await.unwrap();
        assert!(text.contains("No events on the calendar today."));
        assert!(!text.contains("Open tasks:"));
    }
}
