//! Calendar engine: provider sync, conflict detection, slot finding, and
//! provider-first mutations.
//!
//! The local event cache is the only thing the hot path (conflict checks,
//! killswitch math, slot search) ever reads; the provider is consulted only
//! during sync and mutations.

mod provider;

pub use provider::{CalendarProviderApi, GoogleCalendarProvider, RemoteEvent, RemoteEventPatch};

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::config::CalendarConfig;
use crate::store::SqliteStore;
use crate::types::{
    AvailableSlot, CalendarEvent, CalendarEventUpsert, ConflictCheck, EventType, RequestContext,
};

pub struct CalendarService<'a> {
    store: &'a SqliteStore,
    provider: &'a dyn CalendarProviderApi,
    config: &'a CalendarConfig,
    reference_tz: Tz,
}

impl<'a> CalendarService<'a> {
    pub fn new(
        store: &'a SqliteStore,
        provider: &'a dyn CalendarProviderApi,
        config: &'a CalendarConfig,
        reference_tz: Tz,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            reference_tz,
        }
    }

    /// Mirror one account's provider events into the cache, then drop cached
    /// events inside the window that the provider no longer returned.
    pub async fn sync_account(&self, account_id: &str) -> anyhow::Result<usize> {
        let now = Utc::now();
        let time_min = now - Duration::days(self.config.sync_days_back);
        let time_max = now + Duration::days(self.config.sync_days_forward);

        let events = self
            .provider
            .list_events(account_id, time_min, time_max)
            .await?;

        let mut fresh_ids = Vec::with_capacity(events.len());
        for event in &events {
            fresh_ids.push(event.id.clone());
            self.store
                .upsert_event(&CalendarEventUpsert {
                    external_event_id: event.id.clone(),
                    account_id: account_id.to_string(),
                    title: event.title.clone(),
                    description: event.description.clone(),
                    start_time: event.start_time,
                    end_time: event.end_time,
                    location: event.location.clone(),
                    event_type: infer_event_type(&event.title),
                    is_auto_blocked: false,
                    task_id: None,
                })
                .await?;
        }

        let removed = self
            .store
            .delete_stale_events(account_id, time_min, time_max, &fresh_ids)
            .await?;
        if removed > 0 {
            info!(account_id, removed, "dropped events deleted upstream");
        }
        info!(account_id, synced = events.len(), "calendar sync complete");
        Ok(events.len())
    }

    pub async fn sync_all(&self, ctx: &RequestContext) -> anyhow::Result<()> {
        for account in self.store.list_accounts(ctx).await? {
            if let Err(e) = self.sync_account(&account.id).await {
                // One broken account must not stall the others.
                warn!(account_id = %account.id, error = %e, "account sync failed");
            }
        }
        Ok(())
    }

    /// Half-open overlap check against every account the user owns.
    pub async fn check_conflicts(
        &self,
        ctx: &RequestContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<ConflictCheck> {
        let account_ids: Vec<String> = self
            .store
            .list_accounts(ctx)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        let conflicts = self.store.events_overlapping(&account_ids, start, end).await?;
        Ok(ConflictCheck {
            has_conflict: !conflicts.is_empty(),
            conflicts,
        })
    }

    /// First `limit` business-hour gaps of at least `duration_hours`, scanning
    /// at most `slot_lookahead_days` days ahead. Hours are local to the
    /// reference timezone; slots never start in the past.
    pub async fn find_available_slots(
        &self,
        ctx: &RequestContext,
        duration_hours: f64,
        limit: usize,
    ) -> anyhow::Result<Vec<AvailableSlot>> {
        let now = Utc::now();
        let duration = Duration::minutes((duration_hours * 60.0).round() as i64);
        let account_ids: Vec<String> = self
            .store
            .list_accounts(ctx)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();

        let mut slots = Vec::new();
        let today = now.with_timezone(&self.reference_tz).date_naive();

        for day_offset in 0..self.config.slot_lookahead_days {
            if slots.len() >= limit {
                break;
            }
            let date = today + Duration::days(day_offset);
            let Some(window_start) = self.local_instant(date, self.config.business_start_hour)
            else {
                continue;
            };
            let Some(window_end) = self.local_instant(date, self.config.business_end_hour) else {
                continue;
            };

            let mut cursor = window_start.max(now);
            if cursor + duration > window_end {
                continue;
            }

            let busy = self
                .store
                .events_overlapping(&account_ids, window_start, window_end)
                .await?;

            for event in &busy {
                if slots.len() >= limit {
                    break;
                }
                if event.start_time >= cursor + duration {
                    slots.push(self.slot(cursor, cursor + duration));
                }
                cursor = cursor.max(event.end_time);
            }
            if slots.len() < limit && cursor + duration <= window_end {
                slots.push(self.slot(cursor, cursor + duration));
            }
        }

        slots.truncate(limit);
        Ok(slots)
    }

    fn local_instant(&self, date: chrono::NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
        self.reference_tz
            .from_local_datetime(&date.and_hms_opt(hour, 0, 0)?)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn slot(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> AvailableSlot {
        let local_start = start.with_timezone(&self.reference_tz);
        let local_end = end.with_timezone(&self.reference_tz);
        AvailableSlot {
            start,
            end,
            label: format!(
                "{}, {}–{}",
                local_start.format("%a %b %-d"),
                local_start.format("%-I:%M %p"),
                local_end.format("%-I:%M %p"),
            ),
        }
    }

    /// Provider-first event creation: the cache row is written only after
    /// the provider accepted the event and assigned an ID.
    pub async fn create_event_from_task(
        &self,
        account_id: &str,
        task_id: Option<&str>,
        title: &str,
        description: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let external_event_id = self
            .provider
            .insert_event(account_id, title, description, start, end)
            .await?;

        self.store
            .upsert_event(&CalendarEventUpsert {
                external_event_id: external_event_id.clone(),
                account_id: account_id.to_string(),
                title: title.to_string(),
                description: Some(description.to_string()),
                start_time: start,
                end_time: end,
                location: None,
                event_type: EventType::Personal,
                is_auto_blocked: false,
                task_id: task_id.map(str::to_string),
            })
            .await?;

        info!(external_event_id, task_id, "created calendar event");
        Ok(external_event_id)
    }

    pub async fn update_event(
        &self,
        event: &CalendarEvent,
        patch: RemoteEventPatch,
    ) -> anyhow::Result<()> {
        self.provider
            .patch_event(&event.account_id, &event.external_event_id, &patch)
            .await?;

        self.store
            .upsert_event(&CalendarEventUpsert {
                external_event_id: event.external_event_id.clone(),
                account_id: event.account_id.clone(),
                title: patch.title.unwrap_or_else(|| event.title.clone()),
                description: patch.description.or_else(|| event.description.clone()),
                start_time: patch.start_time.unwrap_or(event.start_time),
                end_time: patch.end_time.unwrap_or(event.end_time),
                location: event.location.clone(),
                event_type: event.event_type,
                is_auto_blocked: event.is_auto_blocked,
                task_id: event.task_id.clone(),
            })
            .await?;
        Ok(())
    }

    pub async fn delete_event(&self, event: &CalendarEvent) -> anyhow::Result<()> {
        self.provider
            .delete_event(&event.account_id, &event.external_event_id)
            .await?;
        self.store
            .delete_event_by_external_id(&event.external_event_id)
            .await?;
        Ok(())
    }
}

static EVENT_TYPE_RULES: Lazy<Vec<(Regex, EventType)>> = Lazy::new(|| {
    [
        (r"\b(work\s?out|gym|run)\b", EventType::Workout),
        (r"\b(studio|music)\b", EventType::Studio),
        (r"\b(work|meeting)\b", EventType::Work),
        (r"\b(blocked|focus)\b", EventType::Blocked),
    ]
    .into_iter()
    .map(|(p, t)| (Regex::new(p).expect("static event type pattern"), t))
    .collect()
});

/// Event-type tag assigned at sync time. Downstream consumers (killswitch)
/// read the tag and never re-derive it from titles. Word boundaries keep
/// "run" from matching inside "Brunch".
pub fn infer_event_type(title: &str) -> EventType {
    let lower = title.to_lowercase();
    for (pattern, event_type) in EVENT_TYPE_RULES.iter() {
        if pattern.is_match(&lower) {
            return *event_type;
        }
    }
    EventType::Personal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCalendarProvider;
    use crate::types::Account;

    fn calendar_config() -> CalendarConfig {
        CalendarConfig {
            sync_days_back: 7,
            sync_days_forward: 90,
            slot_lookahead_days: 14,
            business_start_hour: 9,
            business_end_hour: 18,
            accounts: Vec::new(),
        }
    }

    async fn seed_account(store: &SqliteStore) -> RequestContext {
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
        ctx
    }

    #[test]
    fn event_type_inference() {
        assert_eq!(infer_event_type("Morning gym"), EventType::Workout);
        assert_eq!(infer_event_type("Studio session"), EventType::Studio);
        assert_eq!(infer_event_type("Team meeting"), EventType::Work);
        assert_eq!(infer_event_type("Focus block"), EventType::Blocked);
        assert_eq!(infer_event_type("Brunch"), EventType::Personal);
        assert_eq!(infer_event_type("Morning run"), EventType::Workout);
        // "work out" wins over "work" because it is checked first.
        assert_eq!(infer_event_type("Work out with Sam"), EventType::Workout);
    }

    #[tokio::test]
    async fn sync_mirrors_and_prunes() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_account(&store).await;
        let provider = FakeCalendarProvider::default();
        let cfg = calendar_config();
        let calendar =
            CalendarService::new(&store, &provider, &cfg, chrono_tz::America::Los_Angeles);

        let now = Utc::now();
        provider.add_remote_event("r1", "Team meeting", now + Duration::days(1), now + Duration::days(1) + Duration::hours(1));
        provider.add_remote_event("r2", "Brunch", now + Duration::days(2), now + Duration::days(2) + Duration::hours(2));

        calendar.sync_account("acc1").await.unwrap();
        let cached = store.find_event_by_external_id("r1").await.unwrap().unwrap();
        assert_eq!(cached.event_type, EventType::Work);

        // Remote deletion propagates on the next sync.
        provider.remove_remote_event("r2");
        calendar.sync_account("acc1").await.unwrap();
        assert!(store.find_event_by_external_id("r2").await.unwrap().is_none());
        assert!(store.find_event_by_external_id("r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conflict_check_spans_all_accounts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = seed_account(&store).await;
        store
            .upsert_account(&Account {
                id: "acc2".to_string(),
                user_id: "u1".to_string(),
                account_type: "work".to_string(),
                email: String::new(),
                is_primary: false,
            })
            .await
            .unwrap();

        let now = Utc::now();
        store
            .upsert_event(&CalendarEventUpsert {
                external_event_id: "e1".to_string(),
                account_id: "acc2".to_string(),
                title: "1:1".to_string(),
                description: None,
                start_time: now + Duration::hours(2),
                end_time: now + Duration::hours(3),
                location: None,
                event_type: EventType::Work,
                is_auto_blocked: false,
                task_id: None,
            })
            .await
            .unwrap();

        let provider = FakeCalendarProvider::default();
        let cfg = calendar_config();
        let calendar =
            CalendarService::new(&store, &provider, &cfg, chrono_tz::America::Los_Angeles);

        let check = calendar
            .check_conflicts(&ctx, now + Duration::hours(2) + Duration::minutes(30), now + Duration::hours(4))
            .await
            .unwrap();
        assert!(check.has_conflict);
        assert_eq!(check.conflicts[0].title, "1:1");

        // Half-open: touching boundaries do not conflict.
        let check = calendar
            .check_conflicts(&ctx, now + Duration::hours(3), now + Duration::hours(4))
            .await
            .unwrap();
        assert!(!check.has_conflict);
    }

    #[tokio::test]
    async fn slot_finder_respects_busy_time_and_business_hours() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = seed_account(&store).await;
        let provider = FakeCalendarProvider::default();
        let cfg = calendar_config();
        let tz = chrono_tz::America::Los_Angeles;
        let calendar = CalendarService::new(&store, &provider, &cfg, tz);

        // Block tomorrow 9:00-17:00 local, leaving only the 17:00-18:00 gap.
        let tomorrow = (Utc::now().with_timezone(&tz).date_naive()) + Duration::days(1);
        let busy_start = tz
            .from_local_datetime(&tomorrow.and_hms_opt(9, 0, 0).unwrap())
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        store
            .upsert_event(&CalendarEventUpsert {
                external_event_id: "busy".to_string(),
                account_id: "acc1".to_string(),
                title: "Offsite".to_string(),
                description: None,
                start_time: busy_start,
                end_time: busy_start + Duration::hours(8),
                location: None,
                event_type: EventType::Work,
                is_auto_blocked: false,
                task_id: None,
            })
            .await
            .unwrap();

        let slots = calendar.find_available_slots(&ctx, 1.0, 10).await.unwrap();
        assert!(!slots.is_empty());
        for slot in &slots {
            let local = slot.start.with_timezone(&tz);
            assert!(local.format("%H").to_string().parse::<u32>().unwrap() >= 9);
            let conflict = calendar
                .check_conflicts(&ctx, slot.start, slot.end)
                .await
                .unwrap();
            assert!(!conflict.has_conflict, "proposed slot overlaps busy time");
        }
        // The tomorrow slot must be the 17:00 gap.
        let tomorrow_slots: Vec<_> = slots
            .iter()
            .filter(|s| s.start.with_timezone(&tz).date_naive() == tomorrow)
            .collect();
        assert!(tomorrow_slots
            .iter()
            .all(|s| s.start.with_timezone(&tz).format("%H:%M").to_string() == "17:00"));
    }

    #[tokio::test]
    async fn slot_labels_are_human_readable() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ctx = seed_account(&store).await;
        let provider = FakeCalendarProvider::default();
        let cfg = calendar_config();
        let calendar =
            CalendarService::new(&store, &provider, &cfg, chrono_tz::America::Los_Angeles);

        let slots = calendar.find_available_slots(&ctx, 1.5, 3).await.unwrap();
        assert_eq!(slots.len(), 3);
        for slot in &slots {
            assert!(slot.label.contains(','));
            assert!(slot.label.contains('–'));
            assert!((slot.end - slot.start).num_minutes() == 90);
        }
    }

    #[tokio::test]
    async fn mutations_are_provider_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed_account(&store).await;
        let provider = FakeCalendarProvider::default();
        let cfg = calendar_config();
        let calendar =
            CalendarService::new(&store, &provider, &cfg, chrono_tz::America::Los_Angeles);

        let now = Utc::now();
        let id = calendar
            .create_event_from_task("acc1", Some("task-1"), "Deep work", "Blocked from task", now, now + Duration::hours(2))
            .await
            .unwrap();
        assert!(provider.has_remote_event(&id));
        let cached = store.find_event_by_external_id(&id).await.unwrap().unwrap();
        assert_eq!(cached.task_id.as_deref(), Some("task-1"));

        // Failed provider insert leaves no cache row.
        provider.fail_next_insert();
        let err = calendar
            .create_event_from_task("acc1", Some("task-2"), "Doomed", "", now, now + Duration::hours(1))
            .await;
        assert!(err.is_err());

        calendar.delete_event(&cached).await.unwrap();
        assert!(!provider.has_remote_event(&id));
        assert!(store.find_event_by_external_id(&id).await.unwrap().is_none());
    }
}
