//! One dispatch batch of a campaign's outbox.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::campaign::mailer::{Mailer, OutgoingEmail};
use crate::config::CampaignSection;
use crate::db::{DbHandle, format_timestamp};
use crate::errors::CampaignError;
use crate::models::{CampaignStatus, EmailCampaign, OutboxEntry};

pub const TOKEN_LENGTH: usize = 48;
pub const MAX_ERROR_CHARS: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub campaign_id: i64,
    pub status: CampaignStatus,
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Pending entries left in the whole campaign after this batch.
    pub pending: i64,
}

impl BatchOutcome {
    /// Whether another batch should follow.
    pub fn has_more(&self) -> bool {
        self.pending > 0 && !self.status.is_terminal()
    }
}

#[derive(Clone)]
pub struct CampaignDispatcher {
    db: DbHandle,
    mailer: Arc<dyn Mailer>,
    public_url: String,
    from_address: String,
    batch_size: usize,
    token_ttl_days: i64,
}

impl CampaignDispatcher {
    pub fn new(
        db: DbHandle,
        mailer: Arc<dyn Mailer>,
        public_url: String,
        config: &CampaignSection,
    ) -> Self {
        Self {
            db,
            mailer,
            public_url,
            from_address: config.from_address.clone(),
            batch_size: config.effective_batch_size(),
            token_ttl_days: config.token_ttl_days,
        }
    }

    /// Process up to one batch of PENDING entries, oldest first.
    ///
    /// Delivery failures are recorded on the entry and never abort the
    /// batch. Store errors abort it; untouched entries stay PENDING and a
    /// retry reuses any token already issued.
    pub async fn dispatch_batch(&self, campaign_id: i64) -> Result<BatchOutcome, CampaignError> {
        // Status comes from the conditional update itself, never a prior read.
        let campaign = self
            .db
            .call(move |db| db.mark_campaign_sending(campaign_id))
            .await?
            .ok_or(CampaignError::NotFound { id: campaign_id })?;
        if campaign.status.is_terminal() {
            debug!(campaign_id, status = campaign.status.as_str(), "Campaign already finished");
            return Ok(BatchOutcome {
                campaign_id,
                status: campaign.status,
                attempted: 0,
                sent: 0,
                failed: 0,
                pending: campaign.pending_count,
            });
        }
        let limit = self.batch_size as i64;
        let entries = self
            .db
            .call(move |db| db.pending_outbox(campaign_id, limit))
            .await?;

        let attempted = entries.len();
        let mut sent = 0;
        let mut failed = 0;
        for entry in entries {
            let token = self.issue_token(&entry).await?;
            let email = self.compose(&campaign, &entry, &token);
            let entry_id = entry.id;
            match self.mailer.send(&email).await {
                Ok(()) => {
                    if self.db.call(move |db| db.mark_outbox_sent(entry_id)).await? {
                        sent += 1;
                    }
                }
                Err(e) => {
                    let message = truncate_chars(&e.to_string(), MAX_ERROR_CHARS);
                    warn!(
                        campaign_id,
                        outbox_id = entry_id,
                        email = %entry.email,
                        error = %message,
                        "Email campaign send failed"
                    );
                    if self
                        .db
                        .call(move |db| db.mark_outbox_failed(entry_id, &message))
                        .await?
                    {
                        failed += 1;
                    }
                }
            }
        }

        let campaign = self
            .db
            .call(move |db| {
                let counts = db.outbox_counts(campaign_id)?;
                db.apply_campaign_counts(campaign_id, &counts)
            })
            .await?;
        info!(
            campaign_id,
            attempted,
            sent,
            failed,
            pending = campaign.pending_count,
            status = campaign.status.as_str(),
            "Campaign batch dispatched"
        );

        Ok(BatchOutcome {
            campaign_id,
            status: campaign.status,
            attempted,
            sent,
            failed,
            pending: campaign.pending_count,
        })
    }

    /// The entry's token, minting and persisting one on first use.
    async fn issue_token(&self, entry: &OutboxEntry) -> Result<String, CampaignError> {
        if let Some(token) = &entry.token {
            return Ok(token.clone());
        }
        let candidate = generate_token();
        let expires_at = format_timestamp(Utc::now() + ChronoDuration::days(self.token_ttl_days));
        let entry_id = entry.id;
        let email = entry.email.clone();
        let token = self
            .db
            .call(move |db| db.assign_outbox_token(entry_id, &candidate, &email, &expires_at))
            .await?;
        Ok(token)
    }

    fn compose(&self, campaign: &EmailCampaign, entry: &OutboxEntry, token: &str) -> OutgoingEmail {
        let link = delivery_link(&self.public_url, token);
        OutgoingEmail {
            from: self.from_address.clone(),
            to: entry.email.clone(),
            subject: campaign.subject.clone(),
            text: render_body(&campaign.body_text, &link, &entry.email, token),
        }
    }
}

/// An unguessable alphanumeric delivery token.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

pub fn delivery_link(public_url: &str, token: &str) -> String {
    format!("{}/index.html?t={}", public_url.trim_end_matches('/'), token)
}

pub fn render_body(template: &str, link: &str, email: &str, token: &str) -> String {
    template
        .replace("{{checkin_link}}", link)
        .replace("{{email}}", email)
        .replace("{{token}}", token)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
