//! Mail dispatch collaborator. The broker only ever sends party invite
//! links; delivery is delegated to an operator-run webhook. With mail
//! disabled the invite intent is logged and reported as unsent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{BrokerError, Result};

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns whether the invite was actually handed off for delivery.
    async fn send_invite(&self, to: &str, link: &str, deal_name: &str) -> Result<bool>;
}

/// POSTs the invite to `MAIL_WEBHOOK_URL` as JSON.
pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send_invite(&self, to: &str, link: &str, deal_name: &str) -> Result<bool> {
        let payload = json!({
            "to": to,
            "subject": format!("You have been invited to the swap \"{deal_name}\""),
            "link": link,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::AdapterTransient(format!("mail webhook: {e}")))?;
        if !response.status().is_success() {
            warn!(to = %to, status = %response.status(), "mail webhook rejected invite");
            return Ok(false);
        }
        info!(to = %to, "invite dispatched");
        Ok(true)
    }
}

/// Stand-in when mail is disabled: the link only travels out-of-band.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send_invite(&self, to: &str, link: &str, _deal_name: &str) -> Result<bool> {
        info!(to = %to, link = %link, "mail disabled, invite not sent");
        Ok(false)
    }
}

pub fn from_config(config: &Config) -> Arc<dyn Mailer> {
    match (&config.email_enabled, &config.mail_webhook_url) {
        (true, Some(url)) => Arc::new(WebhookMailer { client: reqwest::Client::new(), url: url.clone() }),
        (true, None) => {
            warn!("EMAIL_ENABLED set without MAIL_WEBHOOK_URL, mail stays disabled");
            Arc::new(DisabledMailer)
        }
        _ => Arc::new(DisabledMailer),
    }
}
