//! Email scanning seam.
//!
//! Scanning mail for action items needs a mail provider integration; the
//! pipeline only depends on [`EmailScanner`]. The default implementation
//! reports that no mail account is connected, which keeps the `email_scan`
//! message type honest without one.

use async_trait::async_trait;

use crate::types::RequestContext;

#[async_trait]
pub trait EmailScanner: Send + Sync {
    /// Scan recent mail and return an SMS-sized summary of action items.
    async fn scan(&self, ctx: &RequestContext) -> anyhow::Result<String>;
}

pub struct NoEmailScanner;

#[async_trait]
impl EmailScanner for NoEmailScanner {
    async fn scan(&self, _ctx: &RequestContext) -> anyhow::Result<String> {
        Ok("No mail account is connected yet, so I can't scan your email. \
Connect one and try again."
            .to_string())
    }
}
