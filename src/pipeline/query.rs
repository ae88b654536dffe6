//! Read side of the pipeline: reconciled status, run listings and log pages.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PipelineSection;
use crate::db::DbHandle;
use crate::errors::RunError;
use crate::models::{PipelineRun, RunLogLine, RunStatus};
use crate::pipeline::executor::tail_lines;
use crate::pipeline::lock::RunLock;
use crate::pipeline::state::StateStore;

pub const DEFAULT_RUN_LIMIT: i64 = 50;
pub const MAX_RUN_LIMIT: i64 = 200;
pub const DEFAULT_LOG_LIMIT: i64 = 500;
pub const MAX_LOG_LIMIT: i64 = 1000;

/// Status shown when no run has ever been recorded.
const STATUS_IDLE: &str = "IDLE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStatusView {
    pub run_id: Option<i64>,
    pub running: bool,
    pub status: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_query: Option<String>,
    pub ok: Option<bool>,
    pub rows: Option<i64>,
    pub elapsed_ms: Option<i64>,
    pub error: Option<String>,
    pub report_path: Option<String>,
    pub output: Vec<String>,
}

/// A run row as served by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: PipelineRun,
    pub running: bool,
}

impl From<PipelineRun> for RunView {
    fn from(run: PipelineRun) -> Self {
        let running = run.is_running();
        Self { run, running }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListing {
    pub total: usize,
    pub runs: Vec<RunView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogPage {
    pub run_id: i64,
    pub count: usize,
    pub logs: Vec<RunLogLine>,
    pub last_seq: i64,
}

#[derive(Clone)]
pub struct RunQueryService {
    db: DbHandle,
    lock: RunLock,
    state: StateStore,
    report_path: PathBuf,
    tail_lines: usize,
}

impl RunQueryService {
    pub fn new(db: DbHandle, config: &PipelineSection) -> Self {
        Self {
            db,
            lock: RunLock::new(config.lock_path()),
            state: StateStore::new(config.state_path()),
            report_path: config.resolve(&config.report_path),
            tail_lines: config.tail_lines,
        }
    }

    /// Merge the run table, the state snapshot and a live lock probe.
    ///
    /// The run row referenced by the snapshot is preferred, falling back to
    /// the newest row. A held lock always means running, even if the row
    /// says otherwise.
    pub async fn status(&self) -> Result<RunStatusView, RunError> {
        let snapshot = self.state.read();
        let snapshot_run_id = snapshot.as_ref().and_then(|s| s.run_id);
        let run = self
            .db
            .call(move |db| match snapshot_run_id {
                Some(id) => match db.get_run(id)? {
                    Some(run) => Ok(Some(run)),
                    None => db.latest_run(),
                },
                None => db.latest_run(),
            })
            .await?;

        let lock_held = match self.lock.is_held() {
            Ok(held) => held,
            Err(e) => {
                warn!("Run lock probe failed: {}", e);
                false
            }
        };
        let running = lock_held || run.as_ref().is_some_and(|r| r.is_running());

        let mut output = match &run {
            Some(run) => {
                let id = run.id;
                let limit = self.tail_lines as i64;
                self.db
                    .call(move |db| db.tail_run_logs(id, limit))
                    .await?
                    .into_iter()
                    .map(|l| l.line)
                    .collect()
            }
            None => Vec::new(),
        };
        if output.is_empty() {
            output = self.report_tail();
        }

        let report_path = self
            .report_path
            .is_file()
            .then(|| self.report_path.display().to_string());

        let view = match run {
            Some(run) => RunStatusView {
                run_id: Some(run.id),
                running,
                status: run.status.as_str().to_string(),
                ok: run
                    .status
                    .is_terminal()
                    .then_some(run.status == RunStatus::Success),
                started_at: run.started_at,
                finished_at: run.finished_at,
                last_query: Some(run.query),
                rows: run.rows,
                elapsed_ms: run.elapsed_ms,
                error: run.error,
                report_path,
                output,
            },
            None => {
                let snapshot = snapshot.unwrap_or_default();
                RunStatusView {
                    run_id: None,
                    running,
                    status: if running { "RUNNING" } else { STATUS_IDLE }.to_string(),
                    started_at: snapshot.started_at,
                    finished_at: snapshot.finished_at,
                    last_query: snapshot.last_query,
                    ok: snapshot.ok,
                    rows: snapshot.rows,
                    elapsed_ms: snapshot.elapsed_ms,
                    error: None,
                    report_path,
                    output,
                }
            }
        };
        Ok(view)
    }

    pub async fn list_runs(&self, limit: Option<i64>) -> Result<RunListing, RunError> {
        let limit = limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
        let runs = self.db.call(move |db| db.list_runs(limit)).await?;
        Ok(RunListing {
            total: runs.len(),
            runs: runs.into_iter().map(RunView::from).collect(),
        })
    }

    pub async fn get_run(&self, id: i64) -> Result<RunView, RunError> {
        self.db
            .call(move |db| db.get_run(id))
            .await?
            .map(RunView::from)
            .ok_or(RunError::NotFound { id })
    }

    /// Log lines after `since_seq`, for incremental polling.
    pub async fn logs(
        &self,
        run_id: i64,
        since_seq: Option<i64>,
        limit: Option<i64>,
    ) -> Result<RunLogPage, RunError> {
        let since_seq = since_seq.unwrap_or(0).max(0);
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
        let logs = self
            .db
            .call(move |db| {
                if db.get_run(run_id)?.is_none() {
                    return Ok(None);
                }
                db.get_run_logs(run_id, since_seq, limit).map(Some)
            })
            .await?
            .ok_or(RunError::NotFound { id: run_id })?;
        let last_seq = logs.last().map(|l| l.seq).unwrap_or(since_seq);
        Ok(RunLogPage {
            run_id,
            count: logs.len(),
            logs,
            last_seq,
        })
    }

    fn report_tail(&self) -> Vec<String> {
        match std::fs::read(&self.report_path) {
            Ok(bytes) => tail_lines(&String::from_utf8_lossy(&bytes), self.tail_lines),
            Err(_) => Vec::new(),
        }
    }
}
