//! Subprocess-backed [`ScraperInvoker`].
//!
//! Launches the configured program, streams its stderr into the log while it
//! runs, reads stdout to the end, and enforces a wall-clock deadline. The
//! child is spawned with `kill_on_drop`, and is killed explicitly when the
//! deadline passes.

use super::{parse_output, ScraperInvoker};
use crate::config::ScraperConfig;
use crate::error::PipelineError;
use crate::models::{ScrapeResult, Source};
use crate::utils::truncate_for_log;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

/// How long to keep draining stdout/stderr after the child exits.
/// Grandchildren (browsers, drivers) inherit the pipes and can hold them open
/// indefinitely.
const PIPE_DRAIN: Duration = Duration::from_secs(5);

/// Upper bound on stderr retained for error reports.
const STDERR_KEEP_BYTES: usize = 64 * 1024;

const STDOUT_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    max_jobs: u32,
    headless: bool,
}

impl ProcessInvoker {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        max_jobs: u32,
        headless: bool,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            max_jobs,
            headless,
        }
    }

    pub fn from_config(config: &ScraperConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            config.timeout(),
            config.max_jobs,
            config.headless,
        )
    }

    fn command(&self, keyword: &str, source: Source) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--keyword")
            .arg(keyword)
            .arg("--source")
            .arg(source.as_str())
            .arg("--max-jobs")
            .arg(self.max_jobs.to_string())
            .arg("--headless")
            .arg(if self.headless { "true" } else { "false" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl ScraperInvoker for ProcessInvoker {
    #[instrument(level = "info", skip(self), fields(program = %self.program))]
    async fn invoke(&self, keyword: &str, source: Source) -> Result<ScrapeResult, PipelineError> {
        let t0 = Instant::now();
        let mut child = self
            .command(keyword, source)
            .spawn()
            .map_err(PipelineError::Spawn)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(PipelineError::Spawn(std::io::Error::other(
                "scraper stdio was not captured",
            )));
        };
        let (chunks_tx, mut chunks_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(pump_stdout(stdout, chunks_tx));
        let mut stderr_task = tokio::spawn(forward_stderr(stderr));

        // The deadline covers the child's lifetime only; pipe draining is
        // bounded separately below.
        let status = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!(error = %e, "Lost contact with scraper process");
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(PipelineError::ExternalProcess {
                    code: None,
                    stderr: e.to_string(),
                });
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Scraper exceeded deadline; killing it");
                if let Err(e) = child.kill().await {
                    error!(error = %e, "Failed to kill timed-out scraper");
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(PipelineError::Timeout(self.timeout));
            }
        };

        let drain_deadline = Instant::now() + PIPE_DRAIN;
        let (out, stdout_closed) = drain_stdout(&mut chunks_rx, drain_deadline).await;
        if !stdout_closed {
            stdout_task.abort();
            warn!("Scraper stdout still held open after exit; using what was written");
        }

        let stderr_text = match timeout_at(drain_deadline, &mut stderr_task).await {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => String::new(),
            Err(_) => {
                stderr_task.abort();
                String::new()
            }
        };

        let elapsed_ms = t0.elapsed().as_millis() as u64;
        if !status.success() {
            warn!(code = ?status.code(), elapsed_ms, "Scraper exited with failure");
            return Err(PipelineError::ExternalProcess {
                code: status.code(),
                stderr: truncate_for_log(stderr_text.trim(), 2000),
            });
        }

        info!(elapsed_ms, stdout_bytes = out.len(), "Scraper finished");
        parse_output(&out)
    }
}

/// Copy stdout into the channel until EOF.
async fn pump_stdout(mut stdout: ChildStdout, chunks: UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; STDOUT_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if chunks.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading scraper stdout");
                break;
            }
        }
    }
}

/// Collect stdout chunks until the pipe closes or `deadline` passes.
///
/// Returns the bytes and whether the pipe reached EOF.
async fn drain_stdout(chunks: &mut UnboundedReceiver<Vec<u8>>, deadline: Instant) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    loop {
        match timeout_at(deadline, chunks.recv()).await {
            Ok(Some(chunk)) => out.extend_from_slice(&chunk),
            Ok(None) => return (out, true),
            Err(_) => {
                while let Ok(chunk) = chunks.try_recv() {
                    out.extend_from_slice(&chunk);
                }
                return (out, false);
            }
        }
    }
}

/// Forward each stderr line to the log and keep a bounded copy for error reports.
///
/// Lines are raw bytes decoded lossily; stderr is read to EOF whatever its
/// encoding so the child never writes into a closed pipe.
async fn forward_stderr(stderr: ChildStderr) -> String {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut kept = String::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                info!(scraper_stderr = %text);
                if kept.len() < STDERR_KEEP_BYTES {
                    kept.push_str(text);
                    kept.push('\n');
                }
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading scraper stderr");
                break;
            }
        }
    }
    kept
}
