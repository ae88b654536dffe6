//! Email campaigns: recipient selection, the outbox dispatcher and response
//! correlation, fronted by [`CampaignService`].

pub mod correlator;
pub mod dispatcher;
pub mod mailer;
pub mod queue;
pub mod recipients;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ServiceConfig;
use crate::db::DbHandle;
use crate::errors::CampaignError;
use crate::models::{EmailCampaign, OutboxEntry, Recipient, RecipientFilter};

pub use correlator::{ResponseSubmission, ResponseSummary};
pub use dispatcher::CampaignDispatcher;
pub use queue::{CampaignQueue, RetryPolicy};

const MAX_SUBJECT_CHARS: usize = 255;
const MIN_BODY_CHARS: usize = 3;
const DEFAULT_LIST_LIMIT: i64 = 30;
const MAX_LIST_LIMIT: i64 = 100;

/// Body of a send request: the message plus the recipient filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CampaignRequest {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(flatten)]
    pub filter: RecipientFilter,
    #[serde(default)]
    pub dry_run: bool,
}

impl CampaignRequest {
    fn validate(&self) -> Result<(), CampaignError> {
        let subject = self.subject.trim();
        if subject.is_empty() {
            return Err(CampaignError::Validation("subject is required".into()));
        }
        if subject.chars().count() > MAX_SUBJECT_CHARS {
            return Err(CampaignError::Validation(format!(
                "subject must be at most {} characters",
                MAX_SUBJECT_CHARS
            )));
        }
        if self.body_text.trim().chars().count() < MIN_BODY_CHARS {
            return Err(CampaignError::Validation(format!(
                "body_text must be at least {} characters",
                MIN_BODY_CHARS
            )));
        }
        recipients::validate_filter(&self.filter)
    }
}

/// Recipients a filter resolves to, without persisting anything.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    pub count: usize,
    /// At most [`recipients::PREVIEW_SIZE`] entries.
    pub recipients: Vec<Recipient>,
    pub filters: RecipientFilter,
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    DryRun(RecipientPreview),
    Queued { campaign_id: i64, count: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignListing {
    pub total: usize,
    pub campaigns: Vec<EmailCampaign>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignDetail {
    pub campaign: EmailCampaign,
    pub response_summary: ResponseSummary,
    pub outbox: Vec<OutboxEntry>,
}

#[derive(Clone)]
pub struct CampaignService {
    db: DbHandle,
    queue: CampaignQueue,
    detail_outbox_limit: usize,
}

impl CampaignService {
    pub fn new(db: DbHandle, queue: CampaignQueue, detail_outbox_limit: usize) -> Self {
        Self {
            db,
            queue,
            detail_outbox_limit: detail_outbox_limit.max(1),
        }
    }

    /// Wire the mailer, dispatcher and queue described by `config`.
    pub fn from_config(db: DbHandle, config: &ServiceConfig) -> anyhow::Result<Self> {
        let mailer = mailer::build_mailer(&config.campaign)?;
        let dispatcher = CampaignDispatcher::new(
            db.clone(),
            mailer,
            config.server.public_url.clone(),
            &config.campaign,
        );
        let queue = CampaignQueue::new(
            dispatcher,
            db.clone(),
            RetryPolicy::from_config(&config.campaign),
        );
        Ok(Self::new(db, queue, config.campaign.detail_outbox_limit))
    }

    pub fn queue(&self) -> &CampaignQueue {
        &self.queue
    }

    pub async fn preview(&self, filter: RecipientFilter) -> Result<RecipientPreview, CampaignError> {
        recipients::validate_filter(&filter)?;
        let resolved = self.resolve(filter.clone()).await?;
        Ok(preview_of(resolved, filter, None))
    }

    /// Create and enqueue a campaign, or only report its recipients when
    /// `dry_run` is set.
    pub async fn send(
        &self,
        request: CampaignRequest,
        requested_by: Option<String>,
    ) -> Result<SendOutcome, CampaignError> {
        request.validate()?;
        let resolved = self.resolve(request.filter.clone()).await?;
        if request.dry_run {
            return Ok(SendOutcome::DryRun(preview_of(
                resolved,
                request.filter,
                Some(true),
            )));
        }
        if resolved.is_empty() {
            return Err(CampaignError::NoRecipients);
        }

        let count = resolved.len();
        let CampaignRequest {
            subject,
            body_text,
            filter,
            ..
        } = request;
        let campaign = self
            .db
            .call(move |db| {
                db.create_campaign(
                    subject.trim(),
                    &body_text,
                    &filter,
                    requested_by.as_deref(),
                    &resolved,
                )
            })
            .await?;
        info!(campaign_id = campaign.id, count, "Campaign queued");
        self.queue.enqueue(campaign.id);
        Ok(SendOutcome::Queued {
            campaign_id: campaign.id,
            count,
        })
    }

    pub async fn list(&self, limit: Option<i64>) -> Result<CampaignListing, CampaignError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let campaigns = self.db.call(move |db| db.list_campaigns(limit)).await?;
        Ok(CampaignListing {
            total: campaigns.len(),
            campaigns,
        })
    }

    /// The campaign with its most recent outbox entries, after bringing
    /// their response status up to date.
    pub async fn detail(&self, id: i64) -> Result<CampaignDetail, CampaignError> {
        let limit = self.detail_outbox_limit as i64;
        let found = self
            .db
            .call(move |db| {
                let Some(campaign) = db.get_campaign(id)? else {
                    return Ok(None);
                };
                let mut outbox = db.recent_outbox(id, limit)?;
                let summary = correlator::correlate(db, &mut outbox)?;
                Ok(Some(CampaignDetail {
                    campaign,
                    response_summary: summary,
                    outbox,
                }))
            })
            .await?;
        found.ok_or(CampaignError::NotFound { id })
    }

    /// Stop a campaign at its next batch boundary. Terminal campaigns are
    /// returned unchanged.
    pub async fn cancel(&self, id: i64) -> Result<EmailCampaign, CampaignError> {
        let campaign = self
            .db
            .call(move |db| db.cancel_campaign(id))
            .await?
            .ok_or(CampaignError::NotFound { id })?;
        info!(campaign_id = id, status = campaign.status.as_str(), "Campaign cancel requested");
        Ok(campaign)
    }

    pub async fn record_response(
        &self,
        submission: ResponseSubmission,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<i64, CampaignError> {
        let id = self
            .db
            .call(move |db| {
                correlator::record_response(
                    db,
                    &submission,
                    ip_address.as_deref(),
                    user_agent.as_deref(),
                )
            })
            .await?;
        Ok(id)
    }

    async fn resolve(&self, filter: RecipientFilter) -> Result<Vec<Recipient>, CampaignError> {
        Ok(self
            .db
            .call(move |db| recipients::resolve_recipients(db, &filter))
            .await?)
    }
}

fn preview_of(
    resolved: Vec<Recipient>,
    filters: RecipientFilter,
    dry_run: Option<bool>,
) -> RecipientPreview {
    let count = resolved.len();
    let recipients = resolved.into_iter().take(recipients::PREVIEW_SIZE).collect();
    RecipientPreview {
        dry_run,
        count,
        recipients,
        filters,
    }
}
