//! Run request validation and worker environment construction.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::RunError;

pub const DEFAULT_CONCURRENCY: u32 = 2;
pub const DEFAULT_LANG: &str = "th";
pub const DEFAULT_INACTIVITY: &str = "3m";
pub const DEFAULT_RADIUS: u32 = 7000;
pub const DEFAULT_DEPTH: u32 = 2;

const SUPPORTED_LANGS: &[&str] = &["th", "en"];

static INACTIVITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[smh]$").expect("valid inactivity regex"));

/// A run request as it arrives over HTTP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub query: String,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub inactivity: Option<String>,
    #[serde(default)]
    pub radius: Option<u32>,
    #[serde(default)]
    pub depth: Option<u32>,
}

/// Validated run parameters with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub query: String,
    pub concurrency: u32,
    pub lang: String,
    pub inactivity: String,
    pub radius: u32,
    pub depth: u32,
}

impl RunRequest {
    pub fn validate(&self) -> Result<RunParams, RunError> {
        let query = self.query.trim();
        if query.chars().count() < 3 {
            return Err(RunError::Validation(
                "query must be at least 3 characters".into(),
            ));
        }

        let concurrency = self.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        check_range("concurrency", concurrency, 1, 8)?;

        let lang = self.lang.as_deref().unwrap_or(DEFAULT_LANG);
        if !SUPPORTED_LANGS.contains(&lang) {
            return Err(RunError::Validation(format!(
                "lang must be one of: {}",
                SUPPORTED_LANGS.join(", ")
            )));
        }

        let inactivity = self.inactivity.as_deref().unwrap_or(DEFAULT_INACTIVITY);
        if !INACTIVITY_RE.is_match(inactivity) {
            return Err(RunError::Validation(
                "inactivity must look like 30s, 3m or 1h".into(),
            ));
        }

        let radius = self.radius.unwrap_or(DEFAULT_RADIUS);
        check_range("radius", radius, 1000, 50_000)?;

        let depth = self.depth.unwrap_or(DEFAULT_DEPTH);
        check_range("depth", depth, 1, 100)?;

        Ok(RunParams {
            query: query.to_string(),
            concurrency,
            lang: lang.to_string(),
            inactivity: inactivity.to_string(),
            radius,
            depth,
        })
    }
}

fn check_range(name: &str, value: u32, min: u32, max: u32) -> Result<(), RunError> {
    if value < min || value > max {
        return Err(RunError::Validation(format!(
            "{} must be between {} and {}",
            name, min, max
        )));
    }
    Ok(())
}

impl RunParams {
    /// Variables layered over the inherited environment of the worker.
    pub fn env_overrides(&self, callback_url: &str) -> Vec<(String, String)> {
        vec![
            ("CHECKIN_API_URL".to_string(), callback_url.to_string()),
            ("PIPELINE_CONCURRENCY".to_string(), self.concurrency.to_string()),
            ("PIPELINE_LANG".to_string(), self.lang.clone()),
            ("PIPELINE_INACTIVITY".to_string(), self.inactivity.clone()),
            ("PIPELINE_RADIUS".to_string(), self.radius.to_string()),
            ("PIPELINE_DEPTH".to_string(), self.depth.to_string()),
        ]
    }
}
