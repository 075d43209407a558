//! Outbound SMS seam and TwiML rendering.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::TwilioConfig;

#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> anyhow::Result<()>;
}

/// Twilio REST client. Messages are form-posted with basic auth.
pub struct TwilioGateway {
    client: Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
}

impl TwilioGateway {
    pub fn new(config: &TwilioConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.phone_number.clone(),
            base_url: "https://api.twilio.com".to_string(),
        })
    }
}

#[async_trait]
impl SmsGateway for TwilioGateway {
    async fn send(&self, to: &str, body: &str) -> anyhow::Result<()> {
        if self.account_sid.is_empty() {
            // Unconfigured Twilio is a supported mode for local runs.
            warn!(to, "twilio not configured, dropping outbound SMS");
            return Ok(());
        }

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );
        let params = [("To", to), ("From", self.from_number.as_str()), ("Body", body)];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("twilio send failed ({status}): {detail}");
        }
        debug!(to, chars = body.len(), "sent SMS");
        Ok(())
    }
}

/// Empty TwiML: acknowledge the webhook without replying. Actual replies
/// go out through the REST client once the queued job finishes.
pub fn twiml_empty() -> String {
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>".to_string()
}
