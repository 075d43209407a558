//! Shared test doubles. Compiled only for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::calendar::{CalendarProviderApi, RemoteEvent, RemoteEventPatch};
use crate::config::AppConfig;
use crate::emailscan::NoEmailScanner;
use crate::embeddings::KeywordEmbedder;
use crate::gateway::SmsGateway;
use crate::pipeline::Pipeline;
use crate::providers::{CompletionError, CompletionService};
use crate::store::SqliteStore;
use crate::types::Account;

/// Completion service that replays canned responses in order and records
/// every prompt it was given.
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    fail: bool,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Every call fails as a provider outage.
    pub fn failing() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn last_prompt(&self) -> String {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        prompt: &str,
        _system_prompt: &str,
        _max_tokens: u32,
    ) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail {
            return Err(CompletionError::from_status(503, "scripted outage"));
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CompletionError::malformed("script exhausted"))
    }
}

/// Gateway that records sends instead of talking to Twilio.
#[derive(Default)]
pub struct RecordingSms {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSms {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsGateway for RecordingSms {
    async fn send(&self, to: &str, body: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

/// In-memory calendar provider. Events live in a map keyed by external ID;
/// account IDs are accepted but not segregated, which matches the
/// single-user tests that use it.
#[derive(Default)]
pub struct FakeCalendarProvider {
    events: Mutex<HashMap<String, RemoteEvent>>,
    fail_insert: AtomicBool,
    next_id: AtomicU64,
}

impl FakeCalendarProvider {
    pub fn add_remote_event(
        &self,
        id: &str,
        title: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) {
        self.events.lock().unwrap().insert(
            id.to_string(),
            RemoteEvent {
                id: id.to_string(),
                title: title.to_string(),
                description: None,
                start_time: start,
                end_time: end,
                location: None,
            },
        );
    }

    pub fn remove_remote_event(&self, id: &str) {
        self.events.lock().unwrap().remove(id);
    }

    pub fn has_remote_event(&self, id: &str) -> bool {
        self.events.lock().unwrap().contains_key(id)
    }

    /// The next insert fails once, then the provider recovers.
    pub fn fail_next_insert(&self) {
        self.fail_insert.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CalendarProviderApi for FakeCalendarProvider {
    async fn list_events(
        &self,
        _account_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RemoteEvent>> {
        let mut events: Vec<RemoteEvent> = self
            .events
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.start_time < time_max && e.end_time > time_min)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_time);
        Ok(events)
    }

    async fn insert_event(
        &self,
        _account_id: &str,
        title: &str,
        description: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        if self.fail_insert.swap(false, Ordering::SeqCst) {
            anyhow::bail!("provider rejected the insert");
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.events.lock().unwrap().insert(
            id.clone(),
            RemoteEvent {
                id: id.clone(),
                title: title.to_string(),
                description: if description.is_empty() {
                    None
                } else {
                    Some(description.to_string())
                },
                start_time,
                end_time,
                location: None,
            },
        );
        Ok(id)
    }

    async fn patch_event(
        &self,
        _account_id: &str,
        external_event_id: &str,
        patch: &RemoteEventPatch,
    ) -> anyhow::Result<()> {
        let mut events = self.events.lock().unwrap();
        let event = events
            .get_mut(external_event_id)
            .ok_or_else(|| anyhow::anyhow!("no such remote event: {external_event_id}"))?;
        if let Some(title) = &patch.title {
            event.title = title.clone();
        }
        if let Some(description) = &patch.description {
            event.description = Some(description.clone());
        }
        if let Some(start) = patch.start_time {
            event.start_time = start;
        }
        if let Some(end) = patch.end_time {
            event.end_time = end;
        }
        Ok(())
    }

    async fn delete_event(&self, _account_id: &str, external_event_id: &str) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .remove(external_event_id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no such remote event: {external_event_id}"))
    }
}

/// Handles kept by pipeline tests for seeding and assertions.
pub struct PipelineFixtures {
    pub store: Arc<SqliteStore>,
    pub completion: Arc<ScriptedCompletion>,
    pub provider: Arc<FakeCalendarProvider>,
    pub config: Arc<AppConfig>,
}

/// Full pipeline on an in-memory store with scripted completions, a fake
/// calendar provider, and both a personal (primary) and a work account.
pub async fn test_pipeline(scripts: Vec<String>) -> (Pipeline, PipelineFixtures) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    for (id, account_type, is_primary) in
        [("acc-personal", "personal", true), ("acc-work", "work", false)]
    {
        store
            .upsert_account(&Account {
                id: id.to_string(),
                user_id: "u1".to_string(),
                account_type: account_type.to_string(),
                email: String::new(),
                is_primary,
            })
            .await
            .unwrap();
    }

    let completion = Arc::new(ScriptedCompletion::new(scripts));
    let provider = Arc::new(FakeCalendarProvider::default());
    let config: Arc<AppConfig> = Arc::new(
        toml::from_str(
            r#"
            [provider]
            api_key = "sk-test"
            "#,
        )
        .unwrap(),
    );

    let pipeline = Pipeline::new(
        store.clone(),
        completion.clone(),
        Arc::new(KeywordEmbedder),
        provider.clone(),
        Arc::new(NoEmailScanner),
        config.clone(),
        chrono_tz::America::Los_Angeles,
    );

    (
        pipeline,
        PipelineFixtures {
            store,
            completion,
            provider,
            config,
        },
    )
}
