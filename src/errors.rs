//! Typed error hierarchy for placescout.
//!
//! Three top-level enums cover the three subsystems:
//! - `LockError`: run lock acquisition failures
//! - `RunError`: pipeline run orchestration failures
//! - `CampaignError`: campaign creation and dispatch failures

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the cross-process run lock.
///
/// `Busy` is the expected "already running" case; the other variants are
/// I/O failures and must not be confused with contention.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Run lock {0} is held by another process")]
    Busy(PathBuf),

    #[error("Failed to create lock file at {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to acquire run lock: {0}")]
    AcquireFailed(#[source] std::io::Error),
}

/// Errors from the pipeline run orchestrator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid run request: {0}")]
    Validation(String),

    #[error("Pipeline is already running. Please wait for current run to finish.")]
    Busy,

    #[error("{message}: {source}")]
    Environment {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn pipeline process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to read pipeline output: {0}")]
    Output(#[source] std::io::Error),

    #[error("Pipeline run {id} not found")]
    NotFound { id: i64 },

    #[error(transparent)]
    Lock(LockError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<LockError> for RunError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(_) => RunError::Busy,
            other => RunError::Lock(other),
        }
    }
}

/// Errors from the campaign subsystem.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("Invalid campaign request: {0}")]
    Validation(String),

    #[error("No recipients matched filters")]
    NoRecipients,

    #[error("Campaign {id} not found")]
    NotFound { id: i64 },

    #[error("Email delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
