//! Outbound email delivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{CampaignSection, MailerKind};
use crate::errors::CampaignError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Delivers one message. An error fails only that recipient.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), CampaignError>;
}

/// Writes messages to the log instead of delivering them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), CampaignError> {
        info!(
            to = %email.to,
            subject = %email.subject,
            bytes = email.text.len(),
            "Email delivered to log"
        );
        Ok(())
    }
}

/// POSTs each message as JSON to a mail relay.
pub struct HttpMailer {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpMailer {
    pub fn new(url: String, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), CampaignError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("User-Agent", "placescout")
            .json(email);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let resp = request
            .send()
            .await
            .map_err(|e| CampaignError::Delivery(format!("mail relay unreachable: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CampaignError::Delivery(format!(
                "mail relay returned {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }
}

pub fn build_mailer(config: &CampaignSection) -> Result<Arc<dyn Mailer>> {
    match config.mailer {
        MailerKind::Log => Ok(Arc::new(LogMailer)),
        MailerKind::Http => {
            let url = config
                .relay_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("campaign.relay_url is required for the http mailer"))?;
            Ok(Arc::new(HttpMailer::new(url, config.relay_token.clone())?))
        }
    }
}
