use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub killswitch: KillswitchConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        let mut config: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;

        // Env overlay for secrets, so config.toml can be committed without them.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                config.provider.api_key = key;
            }
        }
        if let Ok(token) = std::env::var("TWILIO_AUTH_TOKEN") {
            if !token.is_empty() {
                config.twilio.auth_token = token;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.provider.api_key.is_empty() {
            anyhow::bail!("provider.api_key is not set (config or ANTHROPIC_API_KEY)");
        }
        if self.killswitch.alert_threshold_hours >= self.killswitch.limit_hours {
            anyhow::bail!(
                "killswitch.alert_threshold_hours ({}) must be below killswitch.limit_hours ({})",
                self.killswitch.alert_threshold_hours,
                self.killswitch.limit_hours
            );
        }
        self.assistant
            .reference_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| {
                anyhow::anyhow!(
                    "assistant.reference_timezone '{}' is not a valid IANA timezone",
                    self.assistant.reference_timezone
                )
            })?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_provider_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "attache.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    /// All relative-date resolution and week boundaries use this timezone,
    /// never the machine's local time.
    #[serde(default = "default_reference_timezone")]
    pub reference_timezone: String,
    /// Phone number the owner texts from; also where alerts go.
    #[serde(default)]
    pub owner_phone: String,
    /// Single-tenant default user; the chat endpoint may authenticate others.
    #[serde(default = "default_owner_user_id")]
    pub owner_user_id: String,
    /// Category subject to killswitch enforcement.
    #[serde(default = "default_protected_category")]
    pub protected_category: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            reference_timezone: default_reference_timezone(),
            owner_phone: String::new(),
            owner_user_id: default_owner_user_id(),
            protected_category: default_protected_category(),
        }
    }
}

fn default_reference_timezone() -> String {
    "America/Los_Angeles".to_string()
}
fn default_owner_user_id() -> String {
    "owner".to_string()
}
fn default_protected_category() -> String {
    "work".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bearer token for the authenticated chat endpoint.
    #[serde(default)]
    pub chat_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            chat_token: String::new(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8321".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct KillswitchConfig {
    #[serde(default = "default_limit_hours")]
    pub limit_hours: f64,
    #[serde(default = "default_alert_threshold_hours")]
    pub alert_threshold_hours: f64,
    /// Non-blocking warning once remaining hours drop to this.
    #[serde(default = "default_warn_remaining_hours")]
    pub warn_remaining_hours: f64,
}

impl Default for KillswitchConfig {
    fn default() -> Self {
        Self {
            limit_hours: default_limit_hours(),
            alert_threshold_hours: default_alert_threshold_hours(),
            warn_remaining_hours: default_warn_remaining_hours(),
        }
    }
}

fn default_limit_hours() -> f64 {
    40.0
}
fn default_alert_threshold_hours() -> f64 {
    35.0
}
fn default_warn_remaining_hours() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalendarConfig {
    /// Sync window: how far back and forward to mirror provider events.
    #[serde(default = "default_sync_days_back")]
    pub sync_days_back: i64,
    #[serde(default = "default_sync_days_forward")]
    pub sync_days_forward: i64,
    /// Slot search scans at most this many days ahead.
    #[serde(default = "default_slot_lookahead_days")]
    pub slot_lookahead_days: i64,
    /// Business-hour window for slot suggestions, local to the reference tz.
    #[serde(default = "default_business_start_hour")]
    pub business_start_hour: u32,
    #[serde(default = "default_business_end_hour")]
    pub business_end_hour: u32,
    /// Accounts seeded into the store at startup.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            sync_days_back: default_sync_days_back(),
            sync_days_forward: default_sync_days_forward(),
            slot_lookahead_days: default_slot_lookahead_days(),
            business_start_hour: default_business_start_hour(),
            business_end_hour: default_business_end_hour(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    pub id: String,
    pub account_type: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_primary: bool,
    /// Env var holding the provider access token for this account.
    #[serde(default)]
    pub token_env: String,
}

fn default_sync_days_back() -> i64 {
    7
}
fn default_sync_days_forward() -> i64 {
    90
}
fn default_slot_lookahead_days() -> i64 {
    14
}
fn default_business_start_hour() -> u32 {
    9
}
fn default_business_end_hour() -> u32 {
    18
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    2000
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Cron for the recurring killswitch check.
    #[serde(default = "default_killswitch_cron")]
    pub killswitch_cron: String,
    /// Cron for calendar cache refresh.
    #[serde(default = "default_calendar_sync_cron")]
    pub calendar_sync_cron: String,
    /// Cron for the morning briefing; empty disables it.
    #[serde(default = "default_briefing_cron")]
    pub briefing_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            killswitch_cron: default_killswitch_cron(),
            calendar_sync_cron: default_calendar_sync_cron(),
            briefing_cron: default_briefing_cron(),
        }
    }
}

fn default_killswitch_cron() -> String {
    // Hourly during the work day, Mon-Fri.
    "0 9-19 * * 1-5".to_string()
}
fn default_calendar_sync_cron() -> String {
    "*/15 * * * *".to_string()
}
fn default_briefing_cron() -> String {
    "0 7 * * *".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> AppConfig {
        toml::from_str(
            r#"
            [provider]
            api_key = "sk-test"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_every_section() {
        let config = minimal();
        assert_eq!(config.killswitch.limit_hours, 40.0);
        assert_eq!(config.killswitch.alert_threshold_hours, 35.0);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.calendar.slot_lookahead_days, 14);
        assert_eq!(config.assistant.reference_timezone, "America/Los_Angeles");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = minimal();
        config.killswitch.alert_threshold_hours = 45.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_timezone() {
        let mut config = minimal();
        config.assistant.reference_timezone = "Mars/Olympus_Mons".to_string();
        assert!(config.validate().is_err());
    }
}
