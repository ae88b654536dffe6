//! Pipeline run orchestration.
//!
//! A run goes IDLE → RUNNING → SUCCESS | FAILED. The run lock gates the
//! first transition; the lock guard lives for the whole run, so it is
//! released on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::PipelineSection;
use crate::db::{DbHandle, format_timestamp, now_timestamp};
use crate::errors::RunError;
use crate::models::{PipelineRun, RunCompletion, RunStatus};
use crate::pipeline::executor::{self, ExecOutcome, ExecRequest, ExitKind};
use crate::pipeline::lock::RunLock;
use crate::pipeline::log_appender::{LogAppender, RunLogSink};
use crate::pipeline::params::{RunParams, RunRequest};
use crate::pipeline::state::{RunSnapshot, StateStore};

/// Source tag stored on runs started through this service.
pub const RUN_SOURCE: &str = "logs_console";

const ORPHANED_RUN_ERROR: &str = "orchestrator exited before the run finished";

/// Result of a run that got as far as creating its row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub ok: bool,
    pub run_id: i64,
    pub elapsed_ms: i64,
    pub rows: i64,
    pub report_path: Option<String>,
    pub output: Vec<String>,
}

pub struct PipelineRunner {
    db: DbHandle,
    config: PipelineSection,
    callback_url: String,
    lock: RunLock,
    state: StateStore,
    appender: Arc<LogAppender>,
}

impl PipelineRunner {
    pub fn new(db: DbHandle, config: PipelineSection, callback_url: String) -> Self {
        let lock = RunLock::new(config.lock_path());
        let state = StateStore::new(config.state_path());
        let appender = Arc::new(LogAppender::new(db.clone()));
        Self {
            db,
            config,
            callback_url,
            lock,
            state,
            appender,
        }
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Validate, take the lock and run the worker to completion.
    ///
    /// Returns `Err` only when the run never started (validation, busy,
    /// environment). Once a row exists every failure is folded into a
    /// `RunReport` with `ok = false`.
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport, RunError> {
        let params = request.validate()?;
        let guard = self.lock.try_acquire()?;

        self.prepare_environment(&params)?;

        let query = params.query.clone();
        let run = self
            .db
            .call(move |db| db.create_run(&query, RUN_SOURCE))
            .await?;
        info!(run_id = run.id, query = %run.query, "Pipeline run started");

        let started_at = run.started_at.clone().unwrap_or_else(now_timestamp);
        self.write_state(&RunSnapshot::started(run.id, &run.query, &started_at));

        let start = Instant::now();
        let sink = RunLogSink::new(self.appender.clone(), run.id);
        let exec_request = ExecRequest {
            command: self.config.command.clone(),
            working_dir: self.config.project_root.clone(),
            env: params.env_overrides(&self.callback_url),
            timeout: self.config.timeout(),
        };
        let executed = executor::execute(&exec_request, &sink).await;
        self.appender.finish(run.id).await;
        let elapsed_ms = start.elapsed().as_millis() as i64;

        let report_path = self.existing_report_path();
        let (completion, output) = match executed {
            Ok(outcome) => {
                let rows = count_result_rows(&self.config.resolve(&self.config.results_csv));
                let error = self.failure_text(&outcome);
                let status = if outcome.success() {
                    RunStatus::Success
                } else {
                    RunStatus::Failed
                };
                (
                    RunCompletion {
                        status,
                        elapsed_ms,
                        rows,
                        report_path: report_path.clone(),
                        error,
                    },
                    outcome.tail(self.config.tail_lines),
                )
            }
            Err(e) => {
                error!(run_id = run.id, "Pipeline run error: {}", e);
                (
                    RunCompletion {
                        status: RunStatus::Failed,
                        elapsed_ms,
                        rows: 0,
                        report_path: report_path.clone(),
                        error: Some(e.to_string()),
                    },
                    vec![format!("Pipeline run error: {}", e)],
                )
            }
        };

        let finished = self.complete(&run, completion).await;
        let ok = finished.status == RunStatus::Success;
        info!(
            run_id = run.id,
            status = finished.status.as_str(),
            elapsed_ms,
            rows = finished.rows.unwrap_or(0),
            "Pipeline run finished"
        );

        drop(guard);

        if let Err(e) = self.prune().await {
            warn!("Failed to prune old pipeline runs: {:#}", e);
        }

        Ok(RunReport {
            ok,
            run_id: run.id,
            elapsed_ms,
            rows: finished.rows.unwrap_or(0),
            report_path,
            output,
        })
    }

    /// Delete completed runs older than the retention horizon.
    pub async fn prune(&self) -> anyhow::Result<usize> {
        if self.config.retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = format_timestamp(Utc::now() - ChronoDuration::days(self.config.retention_days));
        let deleted = self.db.call(move |db| db.prune_runs(&cutoff)).await?;
        if deleted > 0 {
            info!(deleted, "Pruned old pipeline runs");
        }
        Ok(deleted)
    }

    /// Mark RUNNING rows left behind by a crashed orchestrator as FAILED.
    ///
    /// Only acts when the run lock can be taken, so a live run in another
    /// process is never touched.
    pub async fn recover_orphans(&self) -> anyhow::Result<usize> {
        let _guard = match self.lock.try_acquire() {
            Ok(guard) => guard,
            Err(crate::errors::LockError::Busy(_)) => return Ok(0),
            Err(e) => return Err(e).context("Failed to take run lock for recovery"),
        };

        let orphans = self.db.call(|db| db.running_runs()).await?;
        for run in &orphans {
            let completion = RunCompletion {
                status: RunStatus::Failed,
                elapsed_ms: elapsed_since(run.started_at.as_deref()),
                rows: 0,
                report_path: None,
                error: Some(ORPHANED_RUN_ERROR.to_string()),
            };
            let id = run.id;
            self.db.call(move |db| db.finish_run(id, &completion)).await?;
            warn!(run_id = id, "Marked orphaned pipeline run as failed");
        }

        if let Some(snapshot) = self.state.read().filter(|s| s.running) {
            self.write_state(&RunSnapshot {
                running: false,
                finished_at: Some(now_timestamp()),
                ok: Some(false),
                error: Some(ORPHANED_RUN_ERROR.to_string()),
                ..snapshot
            });
        }
        Ok(orphans.len())
    }

    fn prepare_environment(&self, params: &RunParams) -> Result<(), RunError> {
        if !self.config.project_root.is_dir() {
            return Err(RunError::Environment {
                message: format!(
                    "Cannot resolve project root {}",
                    self.config.project_root.display()
                ),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            });
        }

        let query_file = self.config.resolve(&self.config.query_file);
        let write = || -> std::io::Result<()> {
            if let Some(parent) = query_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&query_file, &params.query)
        };
        write().map_err(|source| RunError::Environment {
            message: "Failed to write query file".to_string(),
            source,
        })
    }

    /// Persist the terminal row and snapshot together. A store failure is
    /// logged and the in-memory completion is reported instead.
    async fn complete(&self, run: &PipelineRun, completion: RunCompletion) -> PipelineRun {
        let id = run.id;
        let stored = {
            let completion = completion.clone();
            self.db.call(move |db| db.finish_run(id, &completion)).await
        };
        let finished = match stored {
            Ok(row) => row,
            Err(e) => {
                error!(run_id = id, "Failed to record run completion: {:#}", e);
                PipelineRun {
                    status: completion.status,
                    finished_at: Some(now_timestamp()),
                    elapsed_ms: Some(completion.elapsed_ms),
                    rows: Some(completion.rows),
                    report_path: completion.report_path.clone(),
                    error: completion.error.clone(),
                    ..run.clone()
                }
            }
        };

        self.write_state(&RunSnapshot {
            running: false,
            run_id: Some(id),
            started_at: finished.started_at.clone(),
            finished_at: finished.finished_at.clone(),
            last_query: Some(finished.query.clone()),
            ok: Some(finished.status == RunStatus::Success),
            rows: finished.rows,
            elapsed_ms: finished.elapsed_ms,
            error: finished.error.clone(),
        });
        finished
    }

    fn failure_text(&self, outcome: &ExecOutcome) -> Option<String> {
        match outcome.exit {
            ExitKind::Exited(Some(0)) => None,
            ExitKind::TimedOut => Some(format!(
                "Pipeline exceeded time limit ({}s)",
                self.config.timeout_secs
            )),
            ExitKind::Exited(code) => {
                let tail = outcome.tail(self.config.error_tail_lines);
                if tail.is_empty() {
                    Some(match code {
                        Some(c) => format!("Pipeline process failed with exit code: {}", c),
                        None => "Pipeline process was terminated by a signal".to_string(),
                    })
                } else {
                    Some(tail.join("\n"))
                }
            }
        }
    }

    fn existing_report_path(&self) -> Option<String> {
        let path = self.config.resolve(&self.config.report_path);
        path.is_file().then(|| path.display().to_string())
    }

    fn write_state(&self, snapshot: &RunSnapshot) {
        if let Err(e) = self.state.write(snapshot) {
            warn!("Failed to write run state: {:#}", e);
        }
    }
}

/// Data rows in the results CSV: non-empty lines minus the header.
pub fn count_result_rows(path: &Path) -> i64 {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let lines = content.lines().filter(|l| !l.trim().is_empty()).count() as i64;
            (lines - 1).max(0)
        }
        Err(_) => 0,
    }
}

fn elapsed_since(started_at: Option<&str>) -> i64 {
    started_at
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_milliseconds().max(0))
        .unwrap_or(0)
}
