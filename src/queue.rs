//! In-process retrying job queue.
//!
//! Jobs carry only IDs; handlers reload state from the store, so a retry
//! always sees current data. Failures are classified by the handler:
//! retryable ones are re-enqueued with exponential backoff, fatal ones and
//! exhausted retries go to the handler's exhaustion hook exactly once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::QueueConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    /// One inbound message, by idempotency key.
    ProcessMessage { external_id: String, user_id: String },
    CalendarSync { user_id: String },
    KillswitchCheck { user_id: String },
    MorningBriefing { user_id: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::ProcessMessage { .. } => "process_message",
            Job::CalendarSync { .. } => "calendar_sync",
            Job::KillswitchCheck { .. } => "killswitch_check",
            Job::MorningBriefing { .. } => "morning_briefing",
        }
    }
}

#[derive(Debug)]
pub enum JobError {
    /// Transient; worth another attempt.
    Retryable(anyhow::Error),
    /// Retrying cannot help; goes straight to the exhaustion hook.
    Fatal(anyhow::Error),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<(), JobError>;

    /// Called once when a job is out of attempts (or failed fatally).
    async fn on_exhausted(&self, job: &Job, error: &str);
}

#[derive(Debug)]
struct Envelope {
    job: Job,
    attempt: u32,
}

/// Cloneable enqueue handle.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl JobQueue {
    pub fn enqueue(&self, job: Job) {
        debug!(kind = job.kind(), "enqueue");
        if self.tx.send(Envelope { job, attempt: 1 }).is_err() {
            // Runner is gone; only happens during shutdown.
            warn!("job queue is closed, dropping job");
        }
    }
}

pub struct JobRunner {
    handle: JoinHandle<()>,
}

impl JobRunner {
    /// Start the dispatch loop. Concurrency is bounded by a semaphore;
    /// backoff sleeps happen inside the per-job task so they never stall
    /// the dispatcher.
    pub fn start(config: QueueConfig, handler: Arc<dyn JobHandler>) -> (JobQueue, JobRunner) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let queue = JobQueue { tx: tx.clone() };
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));

        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let handler = handler.clone();
                let tx = tx.clone();
                let config = config.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let Envelope { job, attempt } = envelope;
                    match handler.run(&job).await {
                        Ok(()) => {
                            debug!(kind = job.kind(), attempt, "job done");
                        }
                        Err(JobError::Fatal(e)) => {
                            error!(kind = job.kind(), attempt, error = %e, "job failed fatally");
                            handler.on_exhausted(&job, &e.to_string()).await;
                        }
                        Err(JobError::Retryable(e)) if attempt < config.max_attempts => {
                            let delay = backoff_delay(config.backoff_base_ms, attempt);
                            warn!(
                                kind = job.kind(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "job failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Envelope {
                                job,
                                attempt: attempt + 1,
                            });
                        }
                        Err(JobError::Retryable(e)) => {
                            error!(kind = job.kind(), attempt, error = %e, "job exhausted retries");
                            handler.on_exhausted(&job, &e.to_string()).await;
                        }
                    }
                });
            }
        });

        (queue, JobRunner { handle })
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// base * 2^(attempt-1): 2s, 4s, 8s with the default base.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << (attempt - 1).min(16)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyHandler {
        attempts: AtomicU32,
        succeed_on: u32,
        fatal: bool,
        exhausted: Mutex<Vec<String>>,
    }

    impl FlakyHandler {
        fn new(succeed_on: u32) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                succeed_on,
                fatal: false,
                exhausted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn run(&self, _job: &Job) -> Result<(), JobError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fatal {
                return Err(JobError::Fatal(anyhow::anyhow!("bad payload")));
            }
            if attempt >= self.succeed_on {
                Ok(())
            } else {
                Err(JobError::Retryable(anyhow::anyhow!("transient")))
            }
        }

        async fn on_exhausted(&self, job: &Job, error: &str) {
            self.exhausted
                .lock()
                .unwrap()
                .push(format!("{}: {error}", job.kind()));
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            max_attempts: 3,
            backoff_base_ms: 2000,
            concurrency: 4,
        }
    }

    fn job() -> Job {
        Job::ProcessMessage {
            external_id: "SM1".to_string(),
            user_id: "u1".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(2000, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2000, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(2000, 3), Duration::from_millis(8000));
    }

    proptest::proptest! {
        #[test]
        fn backoff_never_shrinks_or_overflows(
            base in 0u64..100_000,
            attempt in 1u32..64,
        ) {
            let delay = backoff_delay(base, attempt);
            let next = backoff_delay(base, attempt + 1);
            proptest::prop_assert!(next >= delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let handler = Arc::new(FlakyHandler::new(3));
        let (queue, runner) = JobRunner::start(config(), handler.clone());

        queue.enqueue(job());
        // Two backoffs (2s + 4s) plus slack; paused time auto-advances.
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
        assert!(handler.exhausted.lock().unwrap().is_empty());
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_hook_fires_once_after_max_attempts() {
        let handler = Arc::new(FlakyHandler::new(u32::MAX));
        let (queue, runner) = JobRunner::start(config(), handler.clone());

        queue.enqueue(job());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
        let exhausted = handler.exhausted.lock().unwrap();
        assert_eq!(exhausted.len(), 1);
        assert!(exhausted[0].starts_with("process_message"));
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_skip_retries() {
        let mut flaky = FlakyHandler::new(u32::MAX);
        flaky.fatal = true;
        let handler = Arc::new(flaky);
        let (queue, runner) = JobRunner::start(config(), handler.clone());

        queue.enqueue(job());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(handler.exhausted.lock().unwrap().len(), 1);
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn independent_jobs_run_concurrently() {
        let handler = Arc::new(FlakyHandler::new(1));
        let (queue, runner) = JobRunner::start(config(), handler.clone());

        for i in 0..8 {
            queue.enqueue(Job::ProcessMessage {
                external_id: format!("SM{i}"),
                user_id: "u1".to_string(),
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 8);
        runner.shutdown();
    }
}
