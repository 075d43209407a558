//! Cron-driven recurring jobs.
//!
//! Each schedule gets its own loop that sleeps until the next cron
//! occurrence in the reference timezone and then enqueues a job; the queue
//! applies its usual retry policy. An empty cron expression disables that
//! schedule.

use chrono::Utc;
use chrono_tz::Tz;
use croner::Cron;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::queue::{Job, JobQueue};

pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(
        config: &SchedulerConfig,
        queue: JobQueue,
        reference_tz: Tz,
        user_id: &str,
    ) -> anyhow::Result<Scheduler> {
        let mut handles = Vec::new();
        let schedules: [(&str, &str, Job); 3] = [
            (
                "killswitch_check",
                &config.killswitch_cron,
                Job::KillswitchCheck {
                    user_id: user_id.to_string(),
                },
            ),
            (
                "calendar_sync",
                &config.calendar_sync_cron,
                Job::CalendarSync {
                    user_id: user_id.to_string(),
                },
            ),
            (
                "morning_briefing",
                &config.briefing_cron,
                Job::MorningBriefing {
                    user_id: user_id.to_string(),
                },
            ),
        ];

        for (name, expr, job) in schedules {
            if expr.trim().is_empty() {
                info!(schedule = name, "schedule disabled");
                continue;
            }
            // Cron::new alone defers parsing; parse() here so a bad
            // expression fails startup instead of a spawned loop.
            let cron = Cron::new(expr)
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid cron for {name} ({expr}): {e}"))?;
            handles.push(Self::spawn_loop(name, cron, queue.clone(), reference_tz, job));
        }

        Ok(Scheduler { handles })
    }

    fn spawn_loop(
        name: &'static str,
        cron: Cron,
        queue: JobQueue,
        reference_tz: Tz,
        job: Job,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&reference_tz);
                let next = match cron.find_next_occurrence(&now, false) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(schedule = name, error = %e, "no next cron occurrence");
                        return;
                    }
                };
                let wait = (next - now).to_std().unwrap_or_default();
                info!(
                    schedule = name,
                    next = %next.format("%Y-%m-%d %H:%M %Z"),
                    "scheduled"
                );
                tokio::time::sleep(wait).await;
                queue.enqueue(job.clone());
                // Step past the fired minute so the same occurrence never
                // matches twice.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        })
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedules_parse() {
        let config = SchedulerConfig::default();
        for expr in [
            &config.killswitch_cron,
            &config.calendar_sync_cron,
            &config.briefing_cron,
        ] {
            assert!(expr.parse::<Cron>().is_ok(), "cron {expr} should parse");
        }
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_at_startup() {
        let config = SchedulerConfig {
            killswitch_cron: "not a cron".to_string(),
            ..SchedulerConfig::default()
        };
        let (queue, runner) = crate::queue::JobRunner::start(
            crate::config::QueueConfig::default(),
            std::sync::Arc::new(NopHandler),
        );
        let result = Scheduler::start(&config, queue, chrono_tz::America::Los_Angeles, "owner");
        assert!(result.is_err());
        runner.shutdown();
    }

    #[tokio::test]
    async fn empty_cron_disables_schedule() {
        let config = SchedulerConfig {
            killswitch_cron: String::new(),
            calendar_sync_cron: String::new(),
            briefing_cron: String::new(),
        };
        let (queue, runner) = crate::queue::JobRunner::start(
            crate::config::QueueConfig::default(),
            std::sync::Arc::new(NopHandler),
        );
        let scheduler =
            Scheduler::start(&config, queue, chrono_tz::America::Los_Angeles, "owner").unwrap();
        assert!(scheduler.handles.is_empty());
        scheduler.shutdown();
        runner.shutdown();
    }

    struct NopHandler;

    #[async_trait::async_trait]
    impl crate::queue::JobHandler for NopHandler {
        async fn run(&self, _job: &Job) -> Result<(), crate::queue::JobError> {
            Ok(())
        }
        async fn on_exhausted(&self, _job: &Job, _error: &str) {}
    }
}
