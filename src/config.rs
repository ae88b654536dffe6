//! Service configuration.
//!
//! Settings are layered: built-in defaults, then `placescout.toml` (or the
//! file passed with `--config`), then environment variables. `.env` in the
//! working directory is loaded before the environment is consulted.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8010
//! public_url = "https://example.org"
//!
//! [database]
//! path = "storage/placescout.db"
//!
//! [pipeline]
//! project_root = ".."
//! command = ["python3", "scripts/run_pipeline_test.py"]
//! timeout_secs = 2700
//! retention_days = 30
//!
//! [campaign]
//! batch_size = 50
//! mailer = "http"
//! relay_url = "https://mail-relay.internal/send"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "placescout.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub campaign: CampaignSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base URL, used for delivery links and as the
    /// fallback callback URL handed to the pipeline worker.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Permissive CORS for a local UI dev server.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Working directory of the worker process; relative artifact paths
    /// below are resolved against it.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Directory holding the run lock and the state snapshot.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL the worker reports back to. Falls back to `server.public_url`.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_query_file")]
    pub query_file: PathBuf,
    #[serde(default = "default_results_csv")]
    pub results_csv: PathBuf,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    /// Completed runs older than this many days are pruned. Zero or less disables pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default = "default_error_tail_lines")]
    pub error_tail_lines: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            state_dir: default_state_dir(),
            command: default_command(),
            timeout_secs: default_timeout_secs(),
            callback_url: None,
            query_file: default_query_file(),
            results_csv: default_results_csv(),
            report_path: default_report_path(),
            retention_days: default_retention_days(),
            tail_lines: default_tail_lines(),
            error_tail_lines: default_error_tail_lines(),
        }
    }
}

impl PipelineSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.project_root.join(relative)
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("pipeline_runner.lock")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("pipeline_runner.state.json")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailerKind {
    /// Write messages to the log only.
    #[default]
    Log,
    /// POST messages as JSON to an HTTP mail relay.
    Http,
}

impl std::str::FromStr for MailerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" => Ok(MailerKind::Log),
            "http" => Ok(MailerKind::Http),
            _ => anyhow::bail!("Invalid mailer '{}'. Valid values: log, http", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_token_ttl_days")]
    pub token_ttl_days: i64,
    #[serde(default = "default_detail_outbox_limit")]
    pub detail_outbox_limit: usize,
    /// Attempts per batch before the queue gives up on a campaign.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Pause between consecutive batches of the same campaign.
    #[serde(default)]
    pub continue_delay_ms: u64,
    #[serde(default)]
    pub mailer: MailerKind,
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub relay_token: Option<String>,
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

impl Default for CampaignSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            token_ttl_days: default_token_ttl_days(),
            detail_outbox_limit: default_detail_outbox_limit(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            continue_delay_ms: 0,
            mailer: MailerKind::default(),
            relay_url: None,
            relay_token: None,
            from_address: default_from_address(),
        }
    }
}

impl CampaignSection {
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, 500)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Emit JSON lines on stderr instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files. Disabled when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8010
}

fn default_public_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("storage/placescout.db")
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("storage/framework/cache")
}

fn default_command() -> Vec<String> {
    vec!["python3".to_string(), "scripts/run_pipeline_test.py".to_string()]
}

fn default_timeout_secs() -> u64 {
    2700
}

fn default_query_file() -> PathBuf {
    PathBuf::from("config/queries.txt")
}

fn default_results_csv() -> PathBuf {
    PathBuf::from("output/results.csv")
}

fn default_report_path() -> PathBuf {
    PathBuf::from("output/pipeline_test_report.txt")
}

fn default_retention_days() -> i64 {
    30
}

fn default_tail_lines() -> usize {
    200
}

fn default_error_tail_lines() -> usize {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_token_ttl_days() -> i64 {
    30
}

fn default_detail_outbox_limit() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_from_address() -> String {
    "no-reply@localhost".to_string()
}

impl ServiceConfig {
    /// Load configuration from `path` (if it exists) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML file, returning defaults when the file does not exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PLACESCOUT_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("PLACESCOUT_PORT") {
            self.server.port = v.parse().context("PLACESCOUT_PORT must be a port number")?;
        }
        if let Some(v) = lookup("PLACESCOUT_PUBLIC_URL").or_else(|| lookup("APP_URL")) {
            self.server.public_url = v;
        }
        if let Some(v) = lookup("PLACESCOUT_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PLACESCOUT_PROJECT_ROOT") {
            self.pipeline.project_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PLACESCOUT_STATE_DIR") {
            self.pipeline.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PIPELINE_PYTHON") {
            // Swap the interpreter, keep the script arguments.
            if self.pipeline.command.is_empty() {
                self.pipeline.command = default_command();
            }
            self.pipeline.command[0] = v;
        }
        if let Some(v) = lookup("PLACESCOUT_PIPELINE_TIMEOUT_SECS") {
            self.pipeline.timeout_secs = v
                .parse()
                .context("PLACESCOUT_PIPELINE_TIMEOUT_SECS must be an integer")?;
        }
        if let Some(v) = lookup("PIPELINE_INTERNAL_API_URL").or_else(|| lookup("CHECKIN_API_URL")) {
            self.pipeline.callback_url = Some(v);
        }
        if let Some(v) = lookup("PIPELINE_RUN_RETENTION_DAYS") {
            self.pipeline.retention_days = v
                .parse()
                .context("PIPELINE_RUN_RETENTION_DAYS must be an integer")?;
        }
        if let Some(v) = lookup("EMAIL_CAMPAIGN_BATCH_SIZE") {
            self.campaign.batch_size = v
                .parse()
                .context("EMAIL_CAMPAIGN_BATCH_SIZE must be an integer")?;
        }
        if let Some(v) = lookup("EMAIL_TOKEN_EXPIRES_DAYS") {
            self.campaign.token_ttl_days = v
                .parse()
                .context("EMAIL_TOKEN_EXPIRES_DAYS must be an integer")?;
        }
        if let Some(v) = lookup("PLACESCOUT_MAILER") {
            self.campaign.mailer = v.parse()?;
        }
        if let Some(v) = lookup("PLACESCOUT_MAIL_RELAY_URL") {
            self.campaign.relay_url = Some(v);
        }
        if let Some(v) = lookup("PLACESCOUT_MAIL_RELAY_TOKEN") {
            self.campaign.relay_token = Some(v);
        }
        if let Some(v) = lookup("PLACESCOUT_MAIL_FROM") {
            self.campaign.from_address = v;
        }
        if let Some(v) = lookup("PLACESCOUT_LOG_JSON") {
            self.logging.json = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("PLACESCOUT_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// The base URL handed to the worker process for reporting back.
    pub fn callback_base_url(&self) -> String {
        self.pipeline
            .callback_url
            .clone()
            .unwrap_or_else(|| self.server.public_url.clone())
    }
}
