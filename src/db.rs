use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Format used for every timestamp column. Fixed width, so lexical order is
/// chronological order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Async-safe handle to the store.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct Db {
    conn: Connection,
}

const RUN_COLUMNS: &str = "id, query, status, started_at, finished_at, elapsed_ms, rows, report_path, error, source, created_at, updated_at";

const CAMPAIGN_COLUMNS: &str = "id, subject, body_text, filters_json, status, requested_by, total_recipients, pending_count, sent_count, failed_count, started_at, finished_at, last_error, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, campaign_id, place_id, email, source, token, status, response_status, retry_count, last_error, sent_at, responded_at, created_at";

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    query TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'RUNNING',
                    started_at TEXT,
                    finished_at TEXT,
                    elapsed_ms INTEGER,
                    rows INTEGER,
                    report_path TEXT,
                    error TEXT,
                    source TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipeline_run_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pipeline_run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    level TEXT NOT NULL DEFAULT 'info',
                    line TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(pipeline_run_id, seq)
                );

                CREATE TABLE IF NOT EXISTS places (
                    place_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'NEW',
                    province TEXT,
                    district TEXT,
                    category TEXT,
                    normalized_category TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS emails (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    place_id TEXT NOT NULL REFERENCES places(place_id) ON DELETE CASCADE,
                    email TEXT NOT NULL,
                    source TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(place_id, email)
                );

                CREATE TABLE IF NOT EXISTS checkins (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    token TEXT NOT NULL,
                    email TEXT NOT NULL,
                    response TEXT,
                    ip_address TEXT,
                    user_agent TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS invite_tokens (
                    token TEXT PRIMARY KEY,
                    email TEXT NOT NULL,
                    used_at TEXT,
                    expires_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS email_campaigns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subject TEXT NOT NULL,
                    body_text TEXT NOT NULL,
                    filters_json TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    requested_by TEXT,
                    total_recipients INTEGER NOT NULL DEFAULT 0,
                    pending_count INTEGER NOT NULL DEFAULT 0,
                    sent_count INTEGER NOT NULL DEFAULT 0,
                    failed_count INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT,
                    finished_at TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS email_outbox (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    campaign_id INTEGER NOT NULL REFERENCES email_campaigns(id) ON DELETE CASCADE,
                    place_id TEXT,
                    email TEXT NOT NULL,
                    source TEXT,
                    token TEXT,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    response_status TEXT NOT NULL DEFAULT 'PENDING',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    sent_at TEXT,
                    responded_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(campaign_id, email)
                );

                CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status);
                CREATE INDEX IF NOT EXISTS idx_pipeline_runs_created ON pipeline_runs(created_at);
                CREATE INDEX IF NOT EXISTS idx_emails_place ON emails(place_id);
                CREATE INDEX IF NOT EXISTS idx_checkins_token ON checkins(token);
                CREATE INDEX IF NOT EXISTS idx_checkins_email ON checkins(email);
                CREATE INDEX IF NOT EXISTS idx_invite_tokens_email ON invite_tokens(email);
                CREATE INDEX IF NOT EXISTS idx_email_campaigns_status ON email_campaigns(status);
                CREATE INDEX IF NOT EXISTS idx_email_outbox_campaign_status ON email_outbox(campaign_id, status);
                CREATE INDEX IF NOT EXISTS idx_email_outbox_token ON email_outbox(token);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Pipeline runs ─────────────────────────────────────────────────

    pub fn create_run(&self, query: &str, source: &str) -> Result<PipelineRun> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (query, status, started_at, source, created_at, updated_at)
                 VALUES (?1, 'RUNNING', ?2, ?3, ?2, ?2)",
                params![query, now, source],
            )
            .context("Failed to insert pipeline run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Pipeline run not found after insert")
    }

    pub fn finish_run(&self, id: i64, completion: &RunCompletion) -> Result<PipelineRun> {
        let now = now_timestamp();
        self.conn
            .execute(
                "UPDATE pipeline_runs
                 SET status = ?1, finished_at = ?2, elapsed_ms = ?3, rows = ?4, report_path = ?5, error = ?6, updated_at = ?2
                 WHERE id = ?7",
                params![
                    completion.status.as_str(),
                    now,
                    completion.elapsed_ms,
                    completion.rows,
                    completion.report_path,
                    completion.error,
                    id
                ],
            )
            .context("Failed to update pipeline run")?;
        self.get_run(id)?.context("Pipeline run not found after update")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::read)
            .optional()
            .context("Failed to query pipeline run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn latest_run(&self) -> Result<Option<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs ORDER BY id DESC LIMIT 1");
        let row = self
            .conn
            .query_row(&sql, [], RunRow::read)
            .optional()
            .context("Failed to query latest pipeline run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn list_runs(&self, limit: i64) -> Result<Vec<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs ORDER BY id DESC LIMIT ?1");
        self.query_runs(&sql, params![limit])
    }

    pub fn running_runs(&self) -> Result<Vec<PipelineRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE status = 'RUNNING' ORDER BY id"
        );
        self.query_runs(&sql, [])
    }

    fn query_runs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<PipelineRun>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare pipeline run query")?;
        let rows = stmt
            .query_map(params, RunRow::read)
            .context("Failed to query pipeline runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read pipeline_run row")?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    /// Delete finished runs created before `cutoff`. RUNNING rows are never touched.
    pub fn prune_runs(&self, cutoff: &str) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM pipeline_runs WHERE created_at < ?1 AND status != 'RUNNING'",
                params![cutoff],
            )
            .context("Failed to prune pipeline runs")?;
        Ok(deleted)
    }

    /// Insert `lines` with consecutive sequence numbers starting at `first_seq`.
    /// All-or-nothing: either every line is stored or none is.
    pub fn insert_run_logs(&self, run_id: i64, first_seq: i64, lines: &[String]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = now_timestamp();
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO pipeline_run_logs (pipeline_run_id, seq, level, line, created_at)
                     VALUES (?1, ?2, 'info', ?3, ?4)",
                )
                .context("Failed to prepare log insert")?;
            for (offset, line) in lines.iter().enumerate() {
                stmt.execute(params![run_id, first_seq + offset as i64, line, now])
                    .context("Failed to insert run log line")?;
            }
        }
        tx.commit().context("Failed to commit run log lines")?;
        Ok(())
    }

    /// Log lines with `seq > since_seq`, oldest first.
    pub fn get_run_logs(&self, run_id: i64, since_seq: i64, limit: i64) -> Result<Vec<RunLogLine>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, level, line, created_at FROM pipeline_run_logs
                 WHERE pipeline_run_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )
            .context("Failed to prepare get_run_logs")?;
        let rows = stmt
            .query_map(params![run_id, since_seq, limit], read_log_line)
            .context("Failed to query run logs")?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row.context("Failed to read run log row")?);
        }
        Ok(lines)
    }

    /// The last `limit` log lines of a run, oldest first.
    pub fn tail_run_logs(&self, run_id: i64, limit: i64) -> Result<Vec<RunLogLine>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, level, line, created_at FROM pipeline_run_logs
                 WHERE pipeline_run_id = ?1 ORDER BY seq DESC LIMIT ?2",
            )
            .context("Failed to prepare tail_run_logs")?;
        let rows = stmt
            .query_map(params![run_id, limit], read_log_line)
            .context("Failed to query run log tail")?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row.context("Failed to read run log row")?);
        }
        lines.reverse();
        Ok(lines)
    }

    // ── Places and emails ─────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) fn insert_place(&self, place: &NewPlace) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO places (place_id, name, status, province, district, category, normalized_category, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    place.place_id,
                    place.name,
                    place.status,
                    place.province,
                    place.district,
                    place.category,
                    place.normalized_category,
                    now_timestamp()
                ],
            )
            .context("Failed to insert place")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_email(&self, place_id: &str, email: &str, source: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO emails (place_id, email, source, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![place_id, email, source, now_timestamp()],
            )
            .context("Failed to insert email")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Raw recipient candidates for `filter`, newest email first. Not normalized or deduplicated.
    pub fn candidate_recipients(&self, filter: &RecipientFilter, limit: i64) -> Result<Vec<Recipient>> {
        let mut sql = String::from(
            "SELECT emails.email, emails.place_id, emails.source FROM emails
             JOIN places ON places.place_id = emails.place_id WHERE 1 = 1",
        );
        let mut values: Vec<String> = Vec::new();
        let columns = [
            ("places.status", &filter.status),
            ("places.province", &filter.province),
            ("places.district", &filter.district),
            ("places.category", &filter.category),
            ("places.normalized_category", &filter.normalized_category),
            ("emails.source", &filter.source),
        ];
        for (column, value) in columns {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                values.push(v.to_string());
                sql.push_str(&format!(" AND {} = ?{}", column, values.len()));
            }
        }
        sql.push_str(&format!(" ORDER BY emails.id DESC LIMIT {}", limit));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare candidate_recipients")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                Ok(Recipient {
                    email: row.get(0)?,
                    place_id: row.get(1)?,
                    source: row.get(2)?,
                })
            })
            .context("Failed to query recipients")?;
        let mut recipients = Vec::new();
        for row in rows {
            recipients.push(row.context("Failed to read recipient row")?);
        }
        Ok(recipients)
    }

    // ── Check-ins and tokens ──────────────────────────────────────────

    pub fn record_checkin(
        &self,
        token: &str,
        email: &str,
        response: Option<CheckinResponse>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO checkins (token, email, response, ip_address, user_agent, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    token,
                    email,
                    response.map(|r| r.as_str()),
                    ip_address,
                    user_agent,
                    now_timestamp()
                ],
            )
            .context("Failed to insert check-in")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The most recent recipient response recorded against `token`.
    pub fn latest_response_for_token(&self, token: &str) -> Result<Option<CheckinResponse>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT response FROM checkins WHERE token = ?1 AND response IS NOT NULL
                 ORDER BY id DESC LIMIT 1",
                params![token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query check-in response")?;
        value
            .map(|v| v.parse::<CheckinResponse>().map_err(|e| anyhow::anyhow!(e)))
            .transpose()
    }

    /// Every email that has unsubscribed through a check-in, as stored.
    pub fn unsubscribed_emails(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT email FROM checkins WHERE response = 'unsubscribe'")
            .context("Failed to prepare unsubscribed_emails")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query unsubscribed emails")?;
        let mut emails = Vec::new();
        for row in rows {
            emails.push(row.context("Failed to read check-in row")?);
        }
        Ok(emails)
    }

    /// Attach `token` to an outbox entry unless it already has one, recording
    /// the invite token for the recipient. Returns the token now stored on the entry.
    pub fn assign_outbox_token(
        &self,
        outbox_id: i64,
        token: &str,
        email: &str,
        expires_at: &str,
    ) -> Result<String> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT token FROM email_outbox WHERE id = ?1",
                params![outbox_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read outbox token")?
            .context("Outbox entry not found")?;
        if let Some(existing) = existing {
            return Ok(existing);
        }
        let now = now_timestamp();
        tx.execute(
            "INSERT INTO invite_tokens (token, email, used_at, expires_at, created_at)
             VALUES (?1, ?2, NULL, ?3, ?4)
             ON CONFLICT(token) DO UPDATE SET email = excluded.email, used_at = NULL, expires_at = excluded.expires_at",
            params![token, email, expires_at, now],
        )
        .context("Failed to record invite token")?;
        tx.execute(
            "UPDATE email_outbox SET token = ?1, updated_at = ?2 WHERE id = ?3",
            params![token, now, outbox_id],
        )
        .context("Failed to store outbox token")?;
        tx.commit().context("Failed to commit token assignment")?;
        Ok(token.to_string())
    }

    pub fn count_invite_tokens_for(&self, email: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM invite_tokens WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )
            .context("Failed to count invite tokens")
    }

    // ── Campaigns ─────────────────────────────────────────────────────

    /// Create a campaign and its outbox in one transaction.
    pub fn create_campaign(
        &self,
        subject: &str,
        body_text: &str,
        filters: &RecipientFilter,
        requested_by: Option<&str>,
        recipients: &[Recipient],
    ) -> Result<EmailCampaign> {
        let filters_json = serde_json::to_string(filters).context("Failed to encode filters")?;
        let total = recipients.len() as i64;
        let now = now_timestamp();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO email_campaigns
                (subject, body_text, filters_json, status, requested_by, total_recipients, pending_count, sent_count, failed_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'QUEUED', ?4, ?5, ?5, 0, 0, ?6, ?6)",
            params![subject, body_text, filters_json, requested_by, total, now],
        )
        .context("Failed to insert campaign")?;
        let campaign_id = tx.last_insert_rowid();
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO email_outbox (campaign_id, place_id, email, source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                )
                .context("Failed to prepare outbox insert")?;
            for r in recipients {
                stmt.execute(params![campaign_id, r.place_id, r.email, r.source, now])
                    .context("Failed to insert outbox entry")?;
            }
        }
        tx.commit().context("Failed to commit campaign")?;
        self.get_campaign(campaign_id)?
            .context("Campaign not found after insert")
    }

    pub fn get_campaign(&self, id: i64) -> Result<Option<EmailCampaign>> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM email_campaigns WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], CampaignRow::read)
            .optional()
            .context("Failed to query campaign")?;
        row.map(CampaignRow::into_campaign).transpose()
    }

    pub fn list_campaigns(&self, limit: i64) -> Result<Vec<EmailCampaign>> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM email_campaigns ORDER BY id DESC LIMIT ?1");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_campaigns")?;
        let rows = stmt
            .query_map(params![limit], CampaignRow::read)
            .context("Failed to query campaigns")?;
        let mut campaigns = Vec::new();
        for row in rows {
            let r = row.context("Failed to read campaign row")?;
            campaigns.push(r.into_campaign()?);
        }
        Ok(campaigns)
    }

    /// Campaigns still QUEUED or SENDING, oldest first.
    pub fn unfinished_campaign_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM email_campaigns WHERE status IN ('QUEUED', 'SENDING') ORDER BY id",
            )
            .context("Failed to prepare unfinished_campaign_ids")?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query unfinished campaigns")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read campaign id")?;
        Ok(ids)
    }

    /// Move a non-terminal campaign into SENDING, stamping `started_at` on first call.
    /// Returns the campaign as stored afterwards, or `None` if it does not exist.
    pub fn mark_campaign_sending(&self, id: i64) -> Result<Option<EmailCampaign>> {
        let now = now_timestamp();
        self.conn
            .execute(
                "UPDATE email_campaigns
                 SET status = 'SENDING', started_at = COALESCE(started_at, ?1), updated_at = ?1
                 WHERE id = ?2 AND status IN ('QUEUED', 'SENDING')",
                params![now, id],
            )
            .context("Failed to mark campaign sending")?;
        self.get_campaign(id)
    }

    /// Cancel a campaign unless it is already terminal. Returns `None` if it does not exist.
    pub fn cancel_campaign(&self, id: i64) -> Result<Option<EmailCampaign>> {
        let now = now_timestamp();
        self.conn
            .execute(
                "UPDATE email_campaigns SET status = 'CANCELLED', finished_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status IN ('QUEUED', 'SENDING')",
                params![now, id],
            )
            .context("Failed to cancel campaign")?;
        self.get_campaign(id)
    }

    pub fn set_campaign_error(&self, id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE email_campaigns SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, now_timestamp(), id],
            )
            .context("Failed to record campaign error")?;
        Ok(())
    }

    /// Recount pending/sent/failed from the outbox.
    pub fn outbox_counts(&self, campaign_id: i64) -> Result<OutboxCounts> {
        self.conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'SENT' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0)
                 FROM email_outbox WHERE campaign_id = ?1",
                params![campaign_id],
                |row| {
                    Ok(OutboxCounts {
                        pending: row.get(0)?,
                        sent: row.get(1)?,
                        failed: row.get(2)?,
                    })
                },
            )
            .context("Failed to count outbox entries")
    }

    /// Store recomputed aggregates. A campaign with nothing pending becomes
    /// COMPLETED; a cancelled campaign keeps its status.
    pub fn apply_campaign_counts(&self, id: i64, counts: &OutboxCounts) -> Result<EmailCampaign> {
        let now = now_timestamp();
        self.conn
            .execute(
                "UPDATE email_campaigns SET
                    pending_count = ?1,
                    sent_count = ?2,
                    failed_count = ?3,
                    status = CASE
                        WHEN status = 'CANCELLED' THEN status
                        WHEN ?1 > 0 THEN 'SENDING'
                        ELSE 'COMPLETED' END,
                    finished_at = CASE
                        WHEN status = 'CANCELLED' THEN finished_at
                        WHEN ?1 > 0 THEN NULL
                        ELSE ?4 END,
                    updated_at = ?4
                 WHERE id = ?5",
                params![counts.pending, counts.sent, counts.failed, now, id],
            )
            .context("Failed to update campaign counts")?;
        self.get_campaign(id)?.context("Campaign not found after count update")
    }

    /// Up to `limit` PENDING entries, oldest first.
    pub fn pending_outbox(&self, campaign_id: i64, limit: i64) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM email_outbox
             WHERE campaign_id = ?1 AND status = 'PENDING' ORDER BY id LIMIT ?2"
        );
        self.query_outbox(&sql, params![campaign_id, limit])
    }

    /// The `limit` most recent entries of a campaign, newest first.
    pub fn recent_outbox(&self, campaign_id: i64, limit: i64) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM email_outbox
             WHERE campaign_id = ?1 ORDER BY id DESC LIMIT ?2"
        );
        self.query_outbox(&sql, params![campaign_id, limit])
    }

    pub fn get_outbox_entry(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM email_outbox WHERE id = ?1");
        Ok(self.query_outbox(&sql, params![id])?.into_iter().next())
    }

    fn query_outbox<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare outbox query")?;
        let rows = stmt
            .query_map(params, OutboxRow::read)
            .context("Failed to query outbox")?;
        let mut entries = Vec::new();
        for row in rows {
            let r = row.context("Failed to read outbox row")?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }

    /// PENDING → SENT. Returns false if the entry was no longer pending.
    pub fn mark_outbox_sent(&self, id: i64) -> Result<bool> {
        let now = now_timestamp();
        let changed = self
            .conn
            .execute(
                "UPDATE email_outbox
                 SET status = 'SENT', sent_at = ?1, response_status = 'PENDING', responded_at = NULL, last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'PENDING'",
                params![now, id],
            )
            .context("Failed to mark outbox entry sent")?;
        Ok(changed > 0)
    }

    /// PENDING → FAILED, bumping the retry counter. Returns false if the entry was no longer pending.
    pub fn mark_outbox_failed(&self, id: i64, error: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE email_outbox
                 SET status = 'FAILED', retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'PENDING'",
                params![error, now_timestamp(), id],
            )
            .context("Failed to mark outbox entry failed")?;
        Ok(changed > 0)
    }

    pub fn update_outbox_response(
        &self,
        id: i64,
        status: ResponseStatus,
        responded_at: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE email_outbox SET response_status = ?1, responded_at = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), responded_at, now_timestamp(), id],
            )
            .context("Failed to update outbox response")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate_run(&self, id: i64, created_at: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pipeline_runs SET created_at = ?1 WHERE id = ?2",
                params![created_at, id],
            )
            .context("Failed to backdate run")?;
        Ok(())
    }
}

/// A place row for seeding recipient tests.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct NewPlace {
    pub place_id: String,
    pub name: String,
    pub status: String,
    pub province: Option<String>,
    pub district: Option<String>,
    pub category: Option<String>,
    pub normalized_category: Option<String>,
}

// ── Row types ─────────────────────────────────────────────────────────

fn read_log_line(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunLogLine> {
    Ok(RunLogLine {
        seq: row.get(0)?,
        level: row.get(1)?,
        line: row.get(2)?,
        created_at: row.get(3)?,
    })
}

struct RunRow {
    id: i64,
    query: String,
    status: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    elapsed_ms: Option<i64>,
    rows: Option<i64>,
    report_path: Option<String>,
    error: Option<String>,
    source: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            query: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            finished_at: row.get(4)?,
            elapsed_ms: row.get(5)?,
            rows: row.get(6)?,
            report_path: row.get(7)?,
            error: row.get(8)?,
            source: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<PipelineRun> {
        let status = self.status.parse::<RunStatus>().map_err(|e| anyhow::anyhow!(e))?;
        Ok(PipelineRun {
            id: self.id,
            query: self.query,
            status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            elapsed_ms: self.elapsed_ms,
            rows: self.rows,
            report_path: self.report_path,
            error: self.error,
            source: self.source,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct CampaignRow {
    id: i64,
    subject: String,
    body_text: String,
    filters_json: String,
    status: String,
    requested_by: Option<String>,
    total_recipients: i64,
    pending_count: i64,
    sent_count: i64,
    failed_count: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CampaignRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject: row.get(1)?,
            body_text: row.get(2)?,
            filters_json: row.get(3)?,
            status: row.get(4)?,
            requested_by: row.get(5)?,
            total_recipients: row.get(6)?,
            pending_count: row.get(7)?,
            sent_count: row.get(8)?,
            failed_count: row.get(9)?,
            started_at: row.get(10)?,
            finished_at: row.get(11)?,
            last_error: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_campaign(self) -> Result<EmailCampaign> {
        let status = self
            .status
            .parse::<CampaignStatus>()
            .map_err(|e| anyhow::anyhow!(e))?;
        let filters: RecipientFilter = serde_json::from_str(&self.filters_json)
            .context("Failed to decode campaign filters")?;
        Ok(EmailCampaign {
            id: self.id,
            subject: self.subject,
            body_text: self.body_text,
            filters,
            status,
            requested_by: self.requested_by,
            total_recipients: self.total_recipients,
            pending_count: self.pending_count,
            sent_count: self.sent_count,
            failed_count: self.failed_count,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct OutboxRow {
    id: i64,
    campaign_id: i64,
    place_id: Option<String>,
    email: String,
    source: Option<String>,
    token: Option<String>,
    status: String,
    response_status: String,
    retry_count: i64,
    last_error: Option<String>,
    sent_at: Option<String>,
    responded_at: Option<String>,
    created_at: String,
}

impl OutboxRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            campaign_id: row.get(1)?,
            place_id: row.get(2)?,
            email: row.get(3)?,
            source: row.get(4)?,
            token: row.get(5)?,
            status: row.get(6)?,
            response_status: row.get(7)?,
            retry_count: row.get(8)?,
            last_error: row.get(9)?,
            sent_at: row.get(10)?,
            responded_at: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_entry(self) -> Result<OutboxEntry> {
        let status = self.status.parse::<OutboxStatus>().map_err(|e| anyhow::anyhow!(e))?;
        let response_status = self
            .response_status
            .parse::<ResponseStatus>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(OutboxEntry {
            id: self.id,
            campaign_id: self.campaign_id,
            place_id: self.place_id,
            email: self.email,
            source: self.source,
            token: self.token,
            status,
            response_status,
            retry_count: self.retry_count,
            last_error: self.last_error,
            sent_at: self.sent_at,
            responded_at: self.responded_at,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(email: &str) -> Recipient {
        Recipient {
            email: email.to_string(),
            place_id: None,
            source: Some("website".to_string()),
        }
    }

    fn seed_place(db: &Db, place_id: &str, province: &str) -> Result<()> {
        db.insert_place(&NewPlace {
            place_id: place_id.to_string(),
            name: format!("Place {}", place_id),
            status: "NEW".to_string(),
            province: Some(province.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = Db::new_in_memory()?;
        // Running migrations twice must be harmless.
        db.run_migrations()?;
        assert!(db.latest_run()?.is_none());
        Ok(())
    }

    #[test]
    fn test_file_database_persists_between_opens() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("scout.db");
        {
            let db = Db::new(&path)?;
            db.create_run("coffee shop", "test")?;
        }
        let db = Db::new(&path)?;
        let run = db.latest_run()?.expect("run should persist");
        assert_eq!(run.query, "coffee shop");
        Ok(())
    }

    #[test]
    fn test_create_and_finish_run() -> Result<()> {
        let db = Db::new_in_memory()?;
        let run = db.create_run("coffee shop", "logs_console")?;
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_none());

        let finished = db.finish_run(
            run.id,
            &RunCompletion {
                status: RunStatus::Success,
                elapsed_ms: 1234,
                rows: 42,
                report_path: Some("/tmp/report.txt".into()),
                error: None,
            },
        )?;
        assert_eq!(finished.status, RunStatus::Success);
        assert_eq!(finished.rows, Some(42));
        assert_eq!(finished.elapsed_ms, Some(1234));
        assert!(finished.finished_at.is_some());
        Ok(())
    }

    #[test]
    fn test_list_runs_newest_first_with_limit() -> Result<()> {
        let db = Db::new_in_memory()?;
        for q in ["a", "b", "c"] {
            db.create_run(q, "test")?;
        }
        let runs = db.list_runs(2)?;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].query, "c");
        assert_eq!(runs[1].query, "b");
        Ok(())
    }

    #[test]
    fn test_run_logs_since_and_tail() -> Result<()> {
        let db = Db::new_in_memory()?;
        let run = db.create_run("q", "test")?;
        let lines: Vec<String> = (1..=5).map(|i| format!("line {}", i)).collect();
        db.insert_run_logs(run.id, 1, &lines)?;

        let since = db.get_run_logs(run.id, 2, 10)?;
        assert_eq!(since.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![3, 4, 5]);

        let limited = db.get_run_logs(run.id, 0, 2)?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].line, "line 1");

        let tail = db.tail_run_logs(run.id, 2)?;
        assert_eq!(tail.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(tail[0].level, "info");
        Ok(())
    }

    #[test]
    fn test_duplicate_seq_rolls_back_whole_batch() -> Result<()> {
        let db = Db::new_in_memory()?;
        let run = db.create_run("q", "test")?;
        db.insert_run_logs(run.id, 1, &["first".to_string()])?;
        let result = db.insert_run_logs(run.id, 0, &["zero".to_string(), "dup".to_string()]);
        assert!(result.is_err());
        let logs = db.get_run_logs(run.id, -1, 10)?;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].line, "first");
        Ok(())
    }

    #[test]
    fn test_prune_skips_running_and_recent_runs() -> Result<()> {
        let db = Db::new_in_memory()?;
        let old_done = db.create_run("old done", "test")?;
        db.finish_run(
            old_done.id,
            &RunCompletion {
                status: RunStatus::Failed,
                elapsed_ms: 1,
                rows: 0,
                report_path: None,
                error: Some("boom".into()),
            },
        )?;
        db.insert_run_logs(old_done.id, 1, &["x".to_string()])?;
        let old_running = db.create_run("old running", "test")?;
        let recent = db.create_run("recent", "test")?;
        db.finish_run(
            recent.id,
            &RunCompletion {
                status: RunStatus::Success,
                elapsed_ms: 1,
                rows: 0,
                report_path: None,
                error: None,
            },
        )?;
        db.backdate_run(old_done.id, "2020-01-01T00:00:00.000Z")?;
        db.backdate_run(old_running.id, "2020-01-01T00:00:00.000Z")?;

        let deleted = db.prune_runs("2021-01-01T00:00:00.000Z")?;
        assert_eq!(deleted, 1);
        assert!(db.get_run(old_done.id)?.is_none());
        assert!(db.get_run(old_running.id)?.is_some());
        assert!(db.get_run(recent.id)?.is_some());
        // Logs went with their run.
        assert!(db.get_run_logs(old_done.id, 0, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_candidate_recipients_filters_and_orders() -> Result<()> {
        let db = Db::new_in_memory()?;
        seed_place(&db, "p1", "Bangkok")?;
        seed_place(&db, "p2", "Chiang Mai")?;
        db.insert_email("p1", "a@example.com", "website")?;
        db.insert_email("p2", "b@example.com", "website")?;
        db.insert_email("p1", "c@example.com", "facebook")?;

        let all = db.candidate_recipients(&RecipientFilter::default(), 100)?;
        let emails: Vec<_> = all.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(emails, vec!["c@example.com", "b@example.com", "a@example.com"]);

        let filter = RecipientFilter {
            province: Some("Bangkok".into()),
            source: Some("website".into()),
            ..Default::default()
        };
        let picked = db.candidate_recipients(&filter, 100)?;
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].email, "a@example.com");
        assert_eq!(picked[0].place_id.as_deref(), Some("p1"));

        let capped = db.candidate_recipients(&RecipientFilter::default(), 1)?;
        assert_eq!(capped.len(), 1);
        Ok(())
    }

    #[test]
    fn test_latest_response_for_token() -> Result<()> {
        let db = Db::new_in_memory()?;
        assert!(db.latest_response_for_token("tok")?.is_none());
        db.record_checkin("tok", "a@example.com", None, None, Some("Mozilla"))?;
        assert!(db.latest_response_for_token("tok")?.is_none());
        db.record_checkin("tok", "a@example.com", Some(CheckinResponse::Interested), None, None)?;
        db.record_checkin("tok", "a@example.com", Some(CheckinResponse::Unsubscribe), None, None)?;
        assert_eq!(
            db.latest_response_for_token("tok")?,
            Some(CheckinResponse::Unsubscribe)
        );
        assert_eq!(db.unsubscribed_emails()?, vec!["a@example.com".to_string()]);
        Ok(())
    }

    #[test]
    fn test_create_campaign_with_outbox() -> Result<()> {
        let db = Db::new_in_memory()?;
        let filters = RecipientFilter {
            province: Some("Bangkok".into()),
            ..Default::default()
        };
        let campaign = db.create_campaign(
            "Hello",
            "Body {{checkin_link}}",
            &filters,
            Some("127.0.0.1"),
            &[recipient("a@example.com"), recipient("b@example.com")],
        )?;
        assert_eq!(campaign.status, CampaignStatus::Queued);
        assert_eq!(campaign.total_recipients, 2);
        assert_eq!(campaign.pending_count, 2);
        assert_eq!(campaign.filters, filters);

        let pending = db.pending_outbox(campaign.id, 10)?;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].email, "a@example.com");
        assert!(pending[0].token.is_none());
        assert_eq!(pending[0].response_status, ResponseStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_duplicate_recipient_rolls_back_campaign() -> Result<()> {
        let db = Db::new_in_memory()?;
        let result = db.create_campaign(
            "Hello",
            "Body",
            &RecipientFilter::default(),
            None,
            &[recipient("a@example.com"), recipient("a@example.com")],
        );
        assert!(result.is_err());
        assert!(db.list_campaigns(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_assign_outbox_token_is_sticky() -> Result<()> {
        let db = Db::new_in_memory()?;
        let campaign = db.create_campaign(
            "s",
            "body",
            &RecipientFilter::default(),
            None,
            &[recipient("a@example.com")],
        )?;
        let entry = &db.pending_outbox(campaign.id, 1)?[0];
        let first = db.assign_outbox_token(entry.id, "tok-1", &entry.email, "2099-01-01T00:00:00.000Z")?;
        let second = db.assign_outbox_token(entry.id, "tok-2", &entry.email, "2099-01-01T00:00:00.000Z")?;
        assert_eq!(first, "tok-1");
        assert_eq!(second, "tok-1");
        assert_eq!(db.count_invite_tokens_for("a@example.com")?, 1);
        Ok(())
    }

    #[test]
    fn test_outbox_transitions_only_from_pending() -> Result<()> {
        let db = Db::new_in_memory()?;
        let campaign = db.create_campaign(
            "s",
            "body",
            &RecipientFilter::default(),
            None,
            &[recipient("a@example.com"), recipient("b@example.com")],
        )?;
        let entries = db.pending_outbox(campaign.id, 10)?;
        assert!(db.mark_outbox_sent(entries[0].id)?);
        assert!(!db.mark_outbox_sent(entries[0].id)?);
        assert!(!db.mark_outbox_failed(entries[0].id, "late")?);
        assert!(db.mark_outbox_failed(entries[1].id, "smtp down")?);

        let failed = db.get_outbox_entry(entries[1].id)?.unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("smtp down"));

        let counts = db.outbox_counts(campaign.id)?;
        assert_eq!(counts, OutboxCounts { pending: 0, sent: 1, failed: 1 });
        Ok(())
    }

    #[test]
    fn test_apply_counts_completes_or_keeps_sending() -> Result<()> {
        let db = Db::new_in_memory()?;
        let campaign = db.create_campaign(
            "s",
            "body",
            &RecipientFilter::default(),
            None,
            &[recipient("a@example.com")],
        )?;
        let sending = db.mark_campaign_sending(campaign.id)?.unwrap();
        assert_eq!(sending.status, CampaignStatus::Sending);
        assert!(sending.started_at.is_some());

        let still = db.apply_campaign_counts(campaign.id, &OutboxCounts { pending: 1, sent: 0, failed: 0 })?;
        assert_eq!(still.status, CampaignStatus::Sending);
        assert!(still.finished_at.is_none());

        let done = db.apply_campaign_counts(campaign.id, &OutboxCounts { pending: 0, sent: 1, failed: 0 })?;
        assert_eq!(done.status, CampaignStatus::Completed);
        assert!(done.finished_at.is_some());

        // Terminal campaigns are not resurrected.
        let after = db.mark_campaign_sending(campaign.id)?.unwrap();
        assert_eq!(after.status, CampaignStatus::Completed);
        assert!(db.mark_campaign_sending(99)?.is_none());
        Ok(())
    }

    #[test]
    fn test_mark_sending_after_cancel_stays_cancelled() -> Result<()> {
        let db = Db::new_in_memory()?;
        let campaign = db.create_campaign(
            "s",
            "body",
            &RecipientFilter::default(),
            None,
            &[recipient("a@example.com")],
        )?;
        db.cancel_campaign(campaign.id)?;
        let after = db.mark_campaign_sending(campaign.id)?.unwrap();
        assert_eq!(after.status, CampaignStatus::Cancelled);
        assert!(after.started_at.is_none());
        Ok(())
    }

    #[test]
    fn test_cancel_campaign() -> Result<()> {
        let db = Db::new_in_memory()?;
        assert!(db.cancel_campaign(99)?.is_none());
        let campaign = db.create_campaign(
            "s",
            "body",
            &RecipientFilter::default(),
            None,
            &[recipient("a@example.com")],
        )?;
        let cancelled = db.cancel_campaign(campaign.id)?.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);

        let counted = db.apply_campaign_counts(campaign.id, &OutboxCounts { pending: 1, sent: 0, failed: 0 })?;
        assert_eq!(counted.status, CampaignStatus::Cancelled);
        Ok(())
    }

    #[test]
    fn test_delete_campaign_cascades_outbox() -> Result<()> {
        let db = Db::new_in_memory()?;
        let campaign = db.create_campaign(
            "s",
            "body",
            &RecipientFilter::default(),
            None,
            &[recipient("a@example.com")],
        )?;
        db.conn
            .execute("DELETE FROM email_campaigns WHERE id = ?1", params![campaign.id])?;
        assert!(db.recent_outbox(campaign.id, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = format_timestamp(
            DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z").unwrap().with_timezone(&Utc),
        );
        let later = format_timestamp(
            DateTime::parse_from_rfc3339("2024-01-02T03:04:05.5Z").unwrap().with_timezone(&Utc),
        );
        assert_eq!(earlier, "2024-01-02T03:04:05.000Z");
        assert!(earlier < later);
    }

    #[tokio::test]
    async fn test_db_handle_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(Db::new_in_memory()?);
        let run = handle.call(|db| db.create_run("async", "test")).await?;
        let fetched = handle.call(move |db| db.get_run(run.id)).await?;
        assert_eq!(fetched.unwrap().query, "async");
        Ok(())
    }
}
