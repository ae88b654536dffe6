//! Turns the worker's raw output stream into numbered log rows.
//!
//! Each run keeps a partial-line buffer and the next sequence number.
//! Sequence numbers start at 1 and only advance when a batch of lines is
//! stored, so the stored log never has gaps. Blank lines are dropped
//! without consuming a number.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::DbHandle;
use crate::pipeline::executor::OutputSink;

#[derive(Debug)]
struct LineState {
    pending: Vec<u8>,
    next_seq: i64,
}

impl Default for LineState {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            next_seq: 1,
        }
    }
}

pub struct LogAppender {
    db: DbHandle,
    runs: Mutex<HashMap<i64, LineState>>,
}

impl LogAppender {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Feed a raw chunk for `run_id`. Complete lines are stored; a trailing
    /// fragment waits for the next chunk. Storage errors are logged, never returned.
    pub async fn append(&self, run_id: i64, chunk: &[u8]) {
        let mut runs = self.runs.lock().await;
        let state = runs.entry(run_id).or_default();
        state.pending.extend_from_slice(chunk);
        let lines = take_complete_lines(&mut state.pending);
        self.store(run_id, state, lines).await;
    }

    /// Flush whatever fragment is left and forget the run's state.
    pub async fn finish(&self, run_id: i64) {
        let mut runs = self.runs.lock().await;
        let Some(mut state) = runs.remove(&run_id) else {
            return;
        };
        let rest = std::mem::take(&mut state.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        if !line.is_empty() {
            self.store(run_id, &mut state, vec![line]).await;
        }
        debug!(run_id, last_seq = state.next_seq - 1, "Run log closed");
    }

    /// Number the next line of `run_id` would get.
    pub async fn next_seq(&self, run_id: i64) -> i64 {
        self.runs
            .lock()
            .await
            .get(&run_id)
            .map(|s| s.next_seq)
            .unwrap_or(1)
    }

    async fn store(&self, run_id: i64, state: &mut LineState, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let first_seq = state.next_seq;
        let count = lines.len() as i64;
        let result = self
            .db
            .call(move |db| db.insert_run_logs(run_id, first_seq, &lines))
            .await;
        match result {
            Ok(()) => state.next_seq += count,
            Err(e) => warn!(run_id, first_seq, count, "Failed to store run log lines: {:#}", e),
        }
    }
}

/// Split `buffer` on `\n`, `\r\n` and bare `\r`, returning trimmed non-blank
/// lines and leaving the trailing incomplete fragment in place.
fn take_complete_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < buffer.len() {
        match buffer[i] {
            b'\n' | b'\r' => {
                push_line(&mut lines, &buffer[start..i]);
                if buffer[i] == b'\r' && buffer.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    buffer.drain(..start);
    lines
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}

/// Routes one run's executor output into the appender.
pub struct RunLogSink {
    appender: Arc<LogAppender>,
    run_id: i64,
}

impl RunLogSink {
    pub fn new(appender: Arc<LogAppender>, run_id: i64) -> Self {
        Self { appender, run_id }
    }
}

#[async_trait]
impl OutputSink for RunLogSink {
    async fn on_chunk(&self, chunk: &[u8]) {
        self.appender.append(self.run_id, chunk).await;
    }
}
