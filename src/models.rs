use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Pipeline runs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub query: String,
    pub status: RunStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub elapsed_ms: Option<i64>,
    pub rows: Option<i64>,
    pub report_path: Option<String>,
    pub error: Option<String>,
    pub source: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl PipelineRun {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// Terminal fields written when a run finishes.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub elapsed_ms: i64,
    pub rows: i64,
    pub report_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLogLine {
    pub seq: i64,
    pub level: String,
    pub line: String,
    pub created_at: String,
}

// ── Campaigns ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Queued,
    Sending,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Sending => "SENDING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "SENDING" => Ok(Self::Sending),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid outbox status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Pending,
    Interested,
    Unsubscribed,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Interested => "INTERESTED",
            Self::Unsubscribed => "UNSUBSCRIBED",
        }
    }
}

impl FromStr for ResponseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "INTERESTED" => Ok(Self::Interested),
            "UNSUBSCRIBED" => Ok(Self::Unsubscribed),
            _ => Err(format!("Invalid response status: {}", s)),
        }
    }
}

/// A recipient's answer recorded through the check-in page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckinResponse {
    Interested,
    Unsubscribe,
}

impl CheckinResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "interested",
            Self::Unsubscribe => "unsubscribe",
        }
    }

    pub fn to_response_status(self) -> ResponseStatus {
        match self {
            Self::Interested => ResponseStatus::Interested,
            Self::Unsubscribe => ResponseStatus::Unsubscribed,
        }
    }
}

impl FromStr for CheckinResponse {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interested" => Ok(Self::Interested),
            "unsubscribe" => Ok(Self::Unsubscribe),
            _ => Err(format!("Invalid response: {}", s)),
        }
    }
}

/// Recipient selection criteria. Every field is optional; unset fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecipientFilter {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub normalized_category: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub selected_emails: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    pub email: String,
    pub place_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailCampaign {
    pub id: i64,
    pub subject: String,
    pub body_text: String,
    pub filters: RecipientFilter,
    pub status: CampaignStatus,
    pub requested_by: Option<String>,
    pub total_recipients: i64,
    pub pending_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub campaign_id: i64,
    pub place_id: Option<String>,
    pub email: String,
    pub source: Option<String>,
    pub token: Option<String>,
    pub status: OutboxStatus,
    pub response_status: ResponseStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub sent_at: Option<String>,
    pub responded_at: Option<String>,
    pub created_at: String,
}

/// Campaign aggregates recomputed from the outbox table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
}

impl OutboxCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.sent + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trips_through_str() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("running".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_status_serializes_uppercase() {
        let json = serde_json::to_string(&RunStatus::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }

    #[test]
    fn test_campaign_terminal_states() {
        assert!(!CampaignStatus::Queued.is_terminal());
        assert!(!CampaignStatus::Sending.is_terminal());
        assert!(CampaignStatus::Completed.is_terminal());
        assert!(CampaignStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_checkin_response_maps_to_response_status() {
        assert_eq!(
            CheckinResponse::Interested.to_response_status(),
            ResponseStatus::Interested
        );
        assert_eq!(
            CheckinResponse::Unsubscribe.to_response_status(),
            ResponseStatus::Unsubscribed
        );
        assert!("maybe".parse::<CheckinResponse>().is_err());
    }

    #[test]
    fn test_recipient_filter_deserializes_sparse_json() {
        let filter: RecipientFilter =
            serde_json::from_str(r#"{"province": "Chiang Mai", "limit": 20}"#).unwrap();
        assert_eq!(filter.province.as_deref(), Some("Chiang Mai"));
        assert_eq!(filter.limit, Some(20));
        assert!(filter.status.is_none());
        assert!(filter.selected_emails.is_none());
    }
}
