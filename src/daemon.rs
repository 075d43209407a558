//! Daemon wiring: builds the component graph, runs the queue handler for
//! background jobs, and serves HTTP until shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::briefing::MorningBriefing;
use crate::config::AppConfig;
use crate::emailscan::NoEmailScanner;
use crate::embeddings::KeywordEmbedder;
use crate::gateway::{SmsGateway, TwilioGateway};
use crate::pipeline::Pipeline;
use crate::providers::AnthropicProvider;
use crate::queue::{Job, JobError, JobHandler, JobRunner};
use crate::scheduler::Scheduler;
use crate::server::{self, AppState};
use crate::store::SqliteStore;
use crate::types::{Account, MessageStatus, RequestContext};

const APOLOGY_REPLY: &str =
    "Sorry, I hit a snag processing your message. Please send it again in a bit.";

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let reference_tz: Tz = config
        .assistant
        .reference_timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid reference timezone"))?;

    let store = Arc::new(SqliteStore::open(&config.database.db_path).await?);
    seed_accounts(&store, &config).await?;

    let completion = Arc::new(AnthropicProvider::new(
        &config.provider.api_key,
        &config.provider.model,
        config.provider.timeout_secs,
    )?);
    let calendar_provider = Arc::new(crate::calendar::GoogleCalendarProvider::new(
        &config.calendar.accounts,
    )?);
    let sms: Arc<dyn SmsGateway> = Arc::new(TwilioGateway::new(&config.twilio)?);

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        completion,
        Arc::new(KeywordEmbedder),
        calendar_provider,
        Arc::new(NoEmailScanner),
        config.clone(),
        reference_tz,
    ));

    let handler = Arc::new(DaemonJobHandler {
        pipeline: pipeline.clone(),
        sms,
        config: config.clone(),
        reference_tz,
    });
    let (queue, runner) = JobRunner::start(config.queue.clone(), handler);
    let scheduler = Scheduler::start(
        &config.scheduler,
        queue.clone(),
        reference_tz,
        &config.assistant.owner_user_id,
    )?;

    // Warm the calendar cache before the first webhook arrives.
    queue.enqueue(Job::CalendarSync {
        user_id: config.assistant.owner_user_id.clone(),
    });

    let state = Arc::new(AppState {
        pipeline,
        queue,
        config,
    });
    let result = server::serve(state).await;

    scheduler.shutdown();
    runner.shutdown();
    result
}

/// Mirror configured calendar accounts into the store so routing and
/// killswitch queries can join on them.
async fn seed_accounts(store: &SqliteStore, config: &AppConfig) -> anyhow::Result<()> {
    for account in &config.calendar.accounts {
        store
            .upsert_account(&Account {
                id: account.id.clone(),
                user_id: config.assistant.owner_user_id.clone(),
                account_type: account.account_type.clone(),
                email: account.email.clone(),
                is_primary: account.is_primary,
            })
            .await?;
    }
    info!(count = config.calendar.accounts.len(), "seeded accounts");
    Ok(())
}

/// Executes queued jobs. Everything transient is reported as retryable and
/// left to the queue's backoff; the exhaustion hook is where a message job
/// turns into an apology SMS.
pub struct DaemonJobHandler {
    pipeline: Arc<Pipeline>,
    sms: Arc<dyn SmsGateway>,
    config: Arc<AppConfig>,
    reference_tz: Tz,
}

impl DaemonJobHandler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        sms: Arc<dyn SmsGateway>,
        config: Arc<AppConfig>,
        reference_tz: Tz,
    ) -> Self {
        Self {
            pipeline,
            sms,
            config,
            reference_tz,
        }
    }
}

#[async_trait]
impl JobHandler for DaemonJobHandler {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::ProcessMessage {
                external_id,
                user_id,
            } => self.process_message(external_id, user_id).await,
            Job::CalendarSync { user_id } => {
                let ctx = RequestContext::new(user_id.clone());
                self.pipeline
                    .calendar()
                    .sync_all(&ctx)
                    .await
                    .map_err(JobError::Retryable)
            }
            Job::KillswitchCheck { user_id } => self.killswitch_check(user_id).await,
            Job::MorningBriefing { user_id } => self.morning_briefing(user_id).await,
        }
    }

    async fn on_exhausted(&self, job: &Job, error: &str) {
        let payload = serde_json::to_string(job).unwrap_or_default();
        let recorded = crate::error::PipelineError::JobExhausted(error.to_string()).to_string();
        if let Err(e) = self
            .pipeline
            .store()
            .record_job_failure(job.kind(), &payload, &recorded)
            .await
        {
            error!(kind = job.kind(), error = %e, "could not record job failure");
        }

        // A dead message job owes the sender an answer.
        if let Job::ProcessMessage { external_id, .. } = job {
            let store = self.pipeline.store();
            if let Err(e) = store
                .set_message_status(external_id, MessageStatus::Failed, None)
                .await
            {
                error!(external_id, error = %e, "could not mark message failed");
            }
            match store.find_message(external_id).await {
                Ok(Some(message)) => {
                    if let Err(e) = self.sms.send(&message.from_addr, APOLOGY_REPLY).await {
                        error!(external_id, error = %e, "could not send apology");
                    }
                }
                Ok(None) => warn!(external_id, "exhausted job for unknown message"),
                Err(e) => error!(external_id, error = %e, "could not load message for apology"),
            }
        }
    }
}

impl DaemonJobHandler {
    async fn process_message(&self, external_id: &str, user_id: &str) -> Result<(), JobError> {
        let store = self.pipeline.store();

        // Claiming flips received/failed to processing; losing the claim
        // means another delivery of the same SID got here first.
        let claimed = store
            .claim_for_processing(external_id)
            .await
            .map_err(JobError::Retryable)?;
        if !claimed {
            info!(external_id, "message already claimed, skipping");
            return Ok(());
        }

        let message = store
            .find_message(external_id)
            .await
            .map_err(JobError::Retryable)?
            .ok_or_else(|| {
                JobError::Fatal(anyhow::anyhow!("claimed message {external_id} not found"))
            })?;

        let ctx = RequestContext::new(user_id);
        let reply = match self
            .pipeline
            .process_message(&ctx, &message.body, Some(external_id))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                // Release the claim so the retry can pick it up.
                store
                    .set_message_status(external_id, MessageStatus::Failed, None)
                    .await
                    .map_err(JobError::Retryable)?;
                return Err(JobError::Retryable(e));
            }
        };

        if let Err(e) = self.sms.send(&message.from_addr, &reply.response).await {
            store
                .set_message_status(external_id, MessageStatus::Failed, None)
                .await
                .map_err(JobError::Retryable)?;
            return Err(JobError::Retryable(e));
        }
        store
            .record_outbound(&ctx, &message.from_addr, &reply.response)
            .await
            .map_err(JobError::Retryable)?;
        store
            .set_message_status(external_id, MessageStatus::Processed, None)
            .await
            .map_err(JobError::Retryable)?;
        Ok(())
    }

    async fn killswitch_check(&self, user_id: &str) -> Result<(), JobError> {
        let ctx = RequestContext::new(user_id);
        let killswitch = self.pipeline.killswitch();
        killswitch
            .check_and_enforce(&ctx, &*self.sms, &self.config.assistant.owner_phone)
            .await
            .map_err(JobError::Retryable)?;

        // Tasks deferred in an earlier week come back once the week rolls
        // over and the switch is off again. The week-start cutoff keeps a
        // mid-week deferral parked through the rest of its own week.
        let status = killswitch.status(&ctx).await.map_err(JobError::Retryable)?;
        if !status.is_active {
            let week_start = killswitch.week_start(Utc::now());
            let reactivated = self
                .pipeline
                .store()
                .reactivate_deferred_tasks(&ctx, week_start)
                .await
                .map_err(JobError::Retryable)?;
            if reactivated > 0 {
                info!(reactivated, "deferred tasks reactivated");
                if !self.config.assistant.owner_phone.is_empty() {
                    let note = format!(
                        "New week: {reactivated} deferred task(s) are back on your list."
                    );
                    if let Err(e) = self.sms.send(&self.config.assistant.owner_phone, &note).await {
                        warn!(error = %e, "could not send reactivation note");
                    }
                }
            }
        }
        Ok(())
    }

    async fn morning_briefing(&self, user_id: &str) -> Result<(), JobError> {
        if self.config.assistant.owner_phone.is_empty() {
            warn!("no owner phone configured, skipping briefing");
            return Ok(());
        }
        let ctx = RequestContext::new(user_id);
        let killswitch = self.pipeline.killswitch();
        let briefing = MorningBriefing::new(self.pipeline.store(), &killswitch, self.reference_tz);
        let text = briefing.compose(&ctx).await.map_err(JobError::Retryable)?;
        self.sms
            .send(&self.config.assistant.owner_phone, &text)
            .await
            .map_err(JobError::Retryable)
    }
}
