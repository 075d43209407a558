//! Weekly work-hour killswitch.
//!
//! Hours are always recomputed from the calendar cache, never incremented,
//! so the total is self-healing after event edits. Which events count is
//! decided at sync time (`event_type = work`) or by the owning account's
//! type; titles are never inspected here.
//!
//! Weeks start Monday 00:00 in the reference timezone. The 35-hour alert
//! fires once per week; the trigger flag is per-week too, so everything
//! resets naturally at the Monday rollover.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde_json::json;
use tracing::info;

use crate::config::KillswitchConfig;
use crate::gateway::SmsGateway;
use crate::store::SqliteStore;
use crate::types::{BlockDecision, KillswitchStatus, RequestContext};

pub struct Killswitch<'a> {
    store: &'a SqliteStore,
    config: &'a KillswitchConfig,
    reference_tz: Tz,
    protected_account_type: String,
}

impl<'a> Killswitch<'a> {
    pub fn new(
        store: &'a SqliteStore,
        config: &'a KillswitchConfig,
        reference_tz: Tz,
        protected_account_type: &str,
    ) -> Self {
        Self {
            store,
            config,
            reference_tz,
            protected_account_type: protected_account_type.to_string(),
        }
    }

    /// UTC instant of Monday 00:00 of the current week, reference timezone.
    pub fn week_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.reference_tz);
        let days_back = local.weekday().num_days_from_monday() as i64;
        let monday = local.date_naive() - Duration::days(days_back);
        // Midnight always exists on a date boundary in IANA zones we accept.
        self.reference_tz
            .from_local_datetime(&monday.and_hms_opt(0, 0, 0).unwrap_or_default())
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now)
    }

    fn week_start_date(&self, now: DateTime<Utc>) -> String {
        self.week_start(now)
            .with_timezone(&self.reference_tz)
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Recompute this week's protected hours from the event cache and
    /// persist the derived total.
    pub async fn calculate_weekly_hours(&self, ctx: &RequestContext) -> anyhow::Result<f64> {
        let now = Utc::now();
        let week_start = self.week_start(now);
        let week_end = week_start + Duration::days(7);

        let events = self
            .store
            .protected_events_in_week(ctx, week_start, week_end, &self.protected_account_type)
            .await?;

        let mut total_hours = 0.0;
        let mut snapshot = Vec::new();
        for event in &events {
            let hours = event.duration_hours();
            total_hours += hours;
            snapshot.push(json!({
                "title": event.title,
                "start": event.start_time.to_rfc3339(),
                "end": event.end_time.to_rfc3339(),
                "hours": (hours * 100.0).round() / 100.0,
            }));
        }
        let total_hours = (total_hours * 100.0).round() / 100.0;

        self.store
            .upsert_week_hours(
                ctx,
                &self.week_start_date(now),
                total_hours,
                &serde_json::to_string(&snapshot)?,
            )
            .await?;

        Ok(total_hours)
    }

    pub async fn status(&self, ctx: &RequestContext) -> anyhow::Result<KillswitchStatus> {
        let current_hours = self.calculate_weekly_hours(ctx).await?;
        let week_start_date = self.week_start_date(Utc::now());

        let week = self.store.get_week(ctx, &week_start_date).await?;
        let triggered = week.as_ref().is_some_and(|w| w.triggered_at.is_some());
        let alert_sent = week.as_ref().is_some_and(|w| w.alert_sent_at.is_some());

        Ok(KillswitchStatus {
            current_hours,
            remaining_hours: (self.config.limit_hours - current_hours).max(0.0),
            is_active: triggered || current_hours >= self.config.limit_hours,
            alert_sent,
            week_start_date,
        })
    }

    /// Periodic enforcement: trigger at the limit, alert once at the
    /// threshold. Both send at most one SMS per week.
    pub async fn check_and_enforce(
        &self,
        ctx: &RequestContext,
        sms: &dyn SmsGateway,
        owner_phone: &str,
    ) -> anyhow::Result<()> {
        let status = self.status(ctx).await?;
        info!(
            hours = status.current_hours,
            limit = self.config.limit_hours,
            "weekly protected hours"
        );

        let already_triggered = self
            .store
            .get_week(ctx, &status.week_start_date)
            .await?
            .is_some_and(|w| w.triggered_at.is_some());

        if status.current_hours >= self.config.limit_hours && !already_triggered {
            self.store
                .mark_triggered(ctx, &status.week_start_date)
                .await?;
            let message = format!(
                "KILLSWITCH ACTIVE: you've hit {} work hours this week. No new work tasks until Monday.",
                self.config.limit_hours
            );
            sms.send(owner_phone, &message).await?;
            info!("killswitch triggered");
            return Ok(());
        }

        if status.current_hours >= self.config.alert_threshold_hours && !status.alert_sent {
            self.store
                .mark_alert_sent(ctx, &status.week_start_date)
                .await?;
            let remaining = (status.remaining_hours * 10.0).round() / 10.0;
            let message = format!(
                "Work-hours alert: you're at {} hours this week ({} remaining before the killswitch).",
                status.current_hours, remaining
            );
            sms.send(owner_phone, &message).await?;
            info!("work-hours alert sent");
        }

        Ok(())
    }

    /// Gate for new protected-category tasks. A task with an hour estimate
    /// is also blocked when it would push the week past the limit. Blocked
    /// tasks are deferred by the caller, never discarded.
    pub async fn should_block_task(
        &self,
        ctx: &RequestContext,
        estimated_hours: Option<f64>,
    ) -> anyhow::Result<BlockDecision> {
        let status = self.status(ctx).await?;

        if status.is_active {
            return Ok(BlockDecision {
                blocked: true,
                message: format!(
                    "Killswitch active: {}/{} work hours this week. No new work tasks until Monday.",
                    status.current_hours, self.config.limit_hours
                ),
            });
        }

        if let Some(hours) = estimated_hours {
            let projected = status.current_hours + hours;
            if projected > self.config.limit_hours {
                return Ok(BlockDecision {
                    blocked: true,
                    message: format!(
                        "Killswitch: {hours}h of new work would put the week at {projected:.1}/{} hours. Deferring it to next week.",
                        self.config.limit_hours
                    ),
                });
            }
        }

        if status.remaining_hours <= self.config.warn_remaining_hours {
            return Ok(BlockDecision {
                blocked: false,
                message: format!(
                    "Only {:.1} work hours remaining this week.",
                    status.remaining_hours
                ),
            });
        }

        Ok(BlockDecision {
            blocked: false,
            message: String::new(),
        })
    }

    /// SMS-friendly status with a ten-segment progress bar.
    pub async fn format_status_message(&self, ctx: &RequestContext) -> anyhow::Result<String> {
        let status = self.status(ctx).await?;
        let remaining = (status.remaining_hours * 10.0).round() / 10.0;

        if status.is_active {
            return Ok(format!(
                "Killswitch is ACTIVE. You've logged {} work hours this week. No new work tasks until Monday.",
                status.current_hours
            ));
        }

        let bar = progress_bar(status.current_hours, self.config.limit_hours);
        Ok(format!(
            "Work hours this week: {}/{}\n{}\n{} hours remaining.",
            status.current_hours, self.config.limit_hours, bar, remaining
        ))
    }
}

fn progress_bar(current: f64, max: f64) -> String {
    let filled = (((current / max) * 10.0).round() as usize).min(10);
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}
