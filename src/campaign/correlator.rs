//! Response correlation.
//!
//! A recipient's response is never pushed into the outbox. It is derived on
//! read from the newest check-in recorded against the recipient's token, and
//! stale outbox rows are brought up to date as a side effect.

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::campaign::recipients::is_valid_email;
use crate::db::{Db, now_timestamp};
use crate::errors::CampaignError;
use crate::models::{CheckinResponse, OutboxEntry, ResponseStatus};

/// Response counts over a set of outbox entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ResponseSummary {
    pub interested: usize,
    pub unsubscribed: usize,
    pub pending: usize,
}

impl ResponseSummary {
    fn count(&mut self, status: ResponseStatus) {
        match status {
            ResponseStatus::Interested => self.interested += 1,
            ResponseStatus::Unsubscribed => self.unsubscribed += 1,
            ResponseStatus::Pending => self.pending += 1,
        }
    }
}

/// Response status implied by the check-ins recorded for `token`.
pub fn compute_response(db: &Db, token: Option<&str>) -> Result<ResponseStatus> {
    let token = match token.map(str::trim) {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(ResponseStatus::Pending),
    };
    Ok(db
        .latest_response_for_token(token)?
        .map(CheckinResponse::to_response_status)
        .unwrap_or(ResponseStatus::Pending))
}

/// Recompute the response of every entry, persist the ones that changed and
/// return the summary. Delivery status is left alone.
pub fn correlate(db: &Db, entries: &mut [OutboxEntry]) -> Result<ResponseSummary> {
    let mut summary = ResponseSummary::default();
    let now = now_timestamp();
    for entry in entries.iter_mut() {
        let status = compute_response(db, entry.token.as_deref())?;
        if status != entry.response_status {
            let responded_at = (status != ResponseStatus::Pending).then(|| now.clone());
            db.update_outbox_response(entry.id, status, responded_at.as_deref())?;
            debug!(
                outbox_id = entry.id,
                from = entry.response_status.as_str(),
                to = status.as_str(),
                "Outbox response updated"
            );
            entry.response_status = status;
            entry.responded_at = responded_at;
        }
        summary.count(status);
    }
    Ok(summary)
}

/// A recipient's answer as submitted through the check-in page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSubmission {
    pub token: String,
    pub email: String,
    pub response: CheckinResponse,
}

impl ResponseSubmission {
    pub fn parse(token: &str, email: &str, response: &str) -> Result<Self, CampaignError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CampaignError::Validation("token is required".into()));
        }
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(CampaignError::Validation("email must be a valid address".into()));
        }
        let response = response
            .trim()
            .parse::<CheckinResponse>()
            .map_err(|_| {
                CampaignError::Validation("response must be one of: interested, unsubscribe".into())
            })?;
        Ok(Self {
            token: token.to_string(),
            email: email.to_string(),
            response,
        })
    }
}

/// Append the response as a check-in event. Outbox rows catch up the next
/// time their campaign is inspected.
pub fn record_response(
    db: &Db,
    submission: &ResponseSubmission,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> Result<i64> {
    db.record_checkin(
        &submission.token,
        &submission.email,
        Some(submission.response),
        ip_address,
        user_agent,
    )
}
