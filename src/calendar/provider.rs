//! Calendar provider seam.
//!
//! The engine only talks to [`CalendarProviderApi`]; the Google
//! implementation speaks the Calendar v3 REST API with a bearer token per
//! account. Mutations in the engine are provider-first: the remote call
//! happens before the cache write, so the cache never claims something the
//! provider rejected.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AccountConfig;

/// One timed event as the provider reports it. All-day events carry no
/// dateTime and are filtered out before this struct is built.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub location: Option<String>,
}

/// Partial update; `None` fields are left untouched remotely.
#[derive(Debug, Clone, Default)]
pub struct RemoteEventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CalendarProviderApi: Send + Sync {
    async fn list_events(
        &self,
        account_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RemoteEvent>>;

    /// Returns the provider's event ID.
    async fn insert_event(
        &self,
        account_id: &str,
        title: &str,
        description: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> anyhow::Result<String>;

    async fn patch_event(
        &self,
        account_id: &str,
        external_event_id: &str,
        patch: &RemoteEventPatch,
    ) -> anyhow::Result<()>;

    async fn delete_event(&self, account_id: &str, external_event_id: &str) -> anyhow::Result<()>;
}

const GOOGLE_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// Google Calendar over REST. Access tokens are looked up from the env var
/// each account's config names, so rotation needs no restart.
pub struct GoogleCalendarProvider {
    client: Client,
    base_url: String,
    token_envs: HashMap<String, String>,
}

impl GoogleCalendarProvider {
    pub fn new(accounts: &[AccountConfig]) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: GOOGLE_BASE.to_string(),
            token_envs: accounts
                .iter()
                .map(|a| (a.id.clone(), a.token_env.clone()))
                .collect(),
        })
    }

    fn token_for(&self, account_id: &str) -> anyhow::Result<String> {
        let env_name = self
            .token_envs
            .get(account_id)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no token env configured for account {account_id}"))?;
        std::env::var(env_name)
            .map_err(|_| anyhow::anyhow!("env var {env_name} for account {account_id} is not set"))
    }

    fn events_url(&self, suffix: &str) -> String {
        format!("{}/calendars/primary/events{suffix}", self.base_url)
    }

    fn parse_remote_event(item: &Value) -> Option<RemoteEvent> {
        let id = item["id"].as_str()?;
        // Missing dateTime means an all-day event; skip it.
        let start = item["start"]["dateTime"].as_str()?;
        let end = item["end"]["dateTime"].as_str()?;
        Some(RemoteEvent {
            id: id.to_string(),
            title: item["summary"].as_str().unwrap_or("Untitled Event").to_string(),
            description: item["description"].as_str().map(str::to_string),
            start_time: DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc),
            end_time: DateTime::parse_from_rfc3339(end).ok()?.with_timezone(&Utc),
            location: item["location"].as_str().map(str::to_string),
        })
    }
}

#[async_trait]
impl CalendarProviderApi for GoogleCalendarProvider {
    async fn list_events(
        &self,
        account_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RemoteEvent>> {
        let token = self.token_for(account_id)?;
        let resp = self
            .client
            .get(self.events_url(""))
            .bearer_auth(token)
            .query(&[
                ("timeMin", time_min.to_rfc3339()),
                ("timeMax", time_max.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
                ("maxResults", "2500".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: Value = resp.json().await?;
        let items = body["items"].as_array().cloned().unwrap_or_default();
        let events: Vec<RemoteEvent> = items.iter().filter_map(Self::parse_remote_event).collect();
        debug!(account_id, count = events.len(), "listed provider events");
        Ok(events)
    }

    async fn insert_event(
        &self,
        account_id: &str,
        title: &str,
        description: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let token = self.token_for(account_id)?;
        let body = json!({
            "summary": title,
            "description": description,
            "start": { "dateTime": start_time.to_rfc3339() },
            "end": { "dateTime": end_time.to_rfc3339() },
        });

        let resp = self
            .client
            .post(self.events_url(""))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let created: Value = resp.json().await?;
        created["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("provider returned event without an id"))
    }

    async fn patch_event(
        &self,
        account_id: &str,
        external_event_id: &str,
        patch: &RemoteEventPatch,
    ) -> anyhow::Result<()> {
        let token = self.token_for(account_id)?;
        let mut body = json!({});
        if let Some(title) = &patch.title {
            body["summary"] = json!(title);
        }
        if let Some(description) = &patch.description {
            body["description"] = json!(description);
        }
        if let Some(start) = patch.start_time {
            body["start"] = json!({ "dateTime": start.to_rfc3339() });
        }
        if let Some(end) = patch.end_time {
            body["end"] = json!({ "dateTime": end.to_rfc3339() });
        }

        self.client
            .patch(self.events_url(&format!("/{external_event_id}")))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_event(&self, account_id: &str, external_event_id: &str) -> anyhow::Result<()> {
        let token = self.token_for(account_id)?;
        self.client
            .delete(self.events_url(&format!("/{external_event_id}")))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
