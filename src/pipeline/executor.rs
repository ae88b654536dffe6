//! Spawns the worker process and streams its output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::RunError;

const READ_CHUNK_SIZE: usize = 8192;

/// How long to keep reading after the process exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Receives output chunks in arrival order, stdout and stderr interleaved.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn on_chunk(&self, chunk: &[u8]);
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Layered over the inherited environment.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The process exited on its own. `None` when killed by a signal.
    Exited(Option<i32>),
    /// The process outlived the timeout and was killed.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit: ExitKind,
    /// Everything the process wrote, decoded lossily.
    pub output: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit == ExitKind::Exited(Some(0))
    }

    /// The last `n` non-empty lines of output.
    pub fn tail(&self, n: usize) -> Vec<String> {
        tail_lines(&self.output, n)
    }
}

pub fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text
        .trim()
        .split(['\n', '\r'])
        .filter(|l| !l.trim().is_empty())
        .collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].iter().map(|l| l.to_string()).collect()
}

/// Run `request` to completion or timeout, forwarding every chunk to `sink`.
///
/// Spawn failure is returned as `RunError::SpawnFailed`. Timeouts and
/// non-zero exits are reported through `ExecOutcome`, not as errors.
pub async fn execute(request: &ExecRequest, sink: &dyn OutputSink) -> Result<ExecOutcome, RunError> {
    let (program, args) = request.command.split_first().ok_or_else(|| {
        RunError::SpawnFailed(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "pipeline command is empty",
        ))
    })?;

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(&request.working_dir)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(RunError::SpawnFailed)?;

    debug!(pid = ?child.id(), program = %program, "Spawned pipeline process");

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, tx.clone(), "stdout")));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, tx.clone(), "stderr")));
    }
    drop(tx);

    let mut output: Vec<u8> = Vec::new();
    let mut streams_open = true;
    let waited = tokio::time::timeout(request.timeout, async {
        loop {
            tokio::select! {
                chunk = rx.recv(), if streams_open => match chunk {
                    Some(chunk) => {
                        output.extend_from_slice(&chunk);
                        sink.on_chunk(&chunk).await;
                    }
                    None => streams_open = false,
                },
                status = child.wait() => break status,
            }
        }
    })
    .await;

    let exit = match waited {
        Ok(Ok(status)) => {
            // A descendant may still hold the pipes open; take what is
            // already buffered and stop waiting after a short grace.
            let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
                while let Some(chunk) = rx.recv().await {
                    output.extend_from_slice(&chunk);
                    sink.on_chunk(&chunk).await;
                }
            })
            .await;
            if drained.is_err() {
                debug!("Pipeline output still open after exit, detaching readers");
            }
            for reader in &readers {
                reader.abort();
            }
            ExitKind::Exited(status.code())
        }
        Ok(Err(e)) => return Err(RunError::Output(e)),
        Err(_) => {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "Pipeline process exceeded time limit, killing it"
            );
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed-out pipeline process: {}", e);
            }
            for reader in &readers {
                reader.abort();
            }
            // Keep whatever was already read.
            while let Ok(chunk) = rx.try_recv() {
                output.extend_from_slice(&chunk);
                sink.on_chunk(&chunk).await;
            }
            ExitKind::TimedOut
        }
    };

    Ok(ExecOutcome {
        exit,
        output: String::from_utf8_lossy(&output).into_owned(),
    })
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(stream, "Failed to read pipeline output: {}", e);
                break;
            }
        }
    }
}
