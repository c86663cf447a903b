// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use foreman_plan::{PlanStep, StepObservation, StepStatus, STREAM_CAP_BYTES};

use crate::invocation::parse_invocation;
use crate::registry::{CommandContext, CommandRegistry};

/// Timeout applied when a step does not carry its own.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Directory (under the step cwd) that collects failure diagnostics.
pub const FAILURE_LOG_DIR: &str = ".goagent";

/// Outcome of executing one step.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub observation: StepObservation,
    /// Run error (spawn failure, timeout, cancellation, non-zero exit).
    pub error: Option<String>,
    /// The step was interrupted by plan-context cancellation.
    pub canceled: bool,
}

/// Runs OS-shell and internal commands for plan steps.
pub struct Executor {
    registry: Arc<CommandRegistry>,
    default_timeout: Duration,
}

impl Executor {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            registry,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Execute one step under the given cancellation scope.
    ///
    /// The observation carries post-processed streams; the failure log (when
    /// a run error occurred) captures the raw ones.
    pub async fn execute(&self, step: &PlanStep, cancel: &CancellationToken) -> ExecResult {
        let draft = &step.command;
        debug!(step = %step.id, shell = %draft.shell, "executing step");

        let raw = if draft.is_internal() {
            self.run_internal(step, cancel).await
        } else {
            self.run_shell(step, cancel).await
        };

        if let Some(error) = &raw.error {
            write_failure_log(draft, error, &raw.stdout, &raw.stderr);
        }

        let (stdout, stdout_clipped) = post_process(&raw.stdout, draft);
        let (stderr, stderr_clipped) = post_process(&raw.stderr, draft);

        let status = if raw.error.is_none() {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        ExecResult {
            observation: StepObservation {
                id: step.id.clone(),
                status,
                stdout,
                stderr,
                exit_code: raw.exit_code,
                details: raw.error.clone().unwrap_or_default(),
                truncated: stdout_clipped || stderr_clipped,
            },
            error: raw.error,
            canceled: raw.canceled,
        }
    }

    async fn run_shell(&self, step: &PlanStep, cancel: &CancellationToken) -> RawOutcome {
        let draft = &step.command;
        let mut parts: Vec<String> = draft.shell.split_whitespace().map(str::to_string).collect();
        if parts.is_empty() {
            parts.push("/bin/sh".into());
        }
        let executable = parts.remove(0);
        if parts.is_empty() {
            parts.push("-lc".into());
        }
        parts.push(draft.run.clone());

        let mut cmd = Command::new(&executable);
        cmd.args(&parts);
        if !draft.cwd.is_empty() {
            cmd.current_dir(&draft.cwd);
        }
        // Detach from any controlling terminal and make sure a timed-out
        // child is killed when its future is dropped.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let timeout_secs = draft.timeout_sec.unwrap_or(self.default_timeout.as_secs());
        let timeout = Duration::from_secs(timeout_secs);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => RawOutcome::canceled(),
            result = tokio::time::timeout(timeout, cmd.output()) => match result {
                Err(_) => RawOutcome::error(format!("timeout after {timeout_secs}s")),
                Ok(Err(e)) => RawOutcome::error(format!("failed to start: {e}")),
                Ok(Ok(output)) => {
                    let exit_code = output.status.code().unwrap_or(-1);
                    RawOutcome {
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                        exit_code,
                        error: (exit_code != 0).then(|| format!("exit status {exit_code}")),
                        canceled: false,
                    }
                }
            },
        }
    }

    async fn run_internal(&self, step: &PlanStep, cancel: &CancellationToken) -> RawOutcome {
        let draft = &step.command;
        let invocation = match parse_invocation(&draft.run) {
            Ok(inv) => inv,
            Err(e) => return RawOutcome::error(format!("invalid internal command: {e}")),
        };
        let Some(command) = self.registry.get(&invocation.name) else {
            return RawOutcome::error(format!("unknown internal command: {}", invocation.name));
        };

        let cwd = if draft.cwd.is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&draft.cwd)
        };
        let ctx = CommandContext {
            cwd,
            cancel: cancel.clone(),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => RawOutcome::canceled(),
            outcome = command.run(&invocation, &ctx) => RawOutcome {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code,
                error: (outcome.exit_code != 0)
                    .then(|| format!("exit status {}", outcome.exit_code)),
                canceled: false,
            },
        }
    }
}

#[derive(Debug, Default)]
struct RawOutcome {
    stdout: String,
    stderr: String,
    exit_code: i32,
    error: Option<String>,
    canceled: bool,
}

impl RawOutcome {
    fn error(message: String) -> Self {
        Self {
            exit_code: -1,
            error: Some(message),
            ..Default::default()
        }
    }

    fn canceled() -> Self {
        Self {
            exit_code: -1,
            error: Some("operation canceled".into()),
            canceled: true,
            ..Default::default()
        }
    }
}

/// Apply the step's output filters in order: regex line filter, trailing
/// byte window, trailing line window, then the hard per-stream cap.
/// Returns the processed text and whether the hard cap clipped it.
fn post_process(stream: &str, draft: &foreman_plan::CommandDraft) -> (String, bool) {
    let mut text = stream.to_string();

    if !draft.filter_regex.is_empty() {
        match regex::Regex::new(&draft.filter_regex) {
            Ok(re) => {
                let kept: Vec<&str> = text.lines().filter(|l| re.is_match(l)).collect();
                let mut filtered = kept.join("\n");
                if !filtered.is_empty() && text.ends_with('\n') {
                    filtered.push('\n');
                }
                text = filtered;
            }
            // An invalid pattern passes the output through untouched.
            Err(_) => {}
        }
    }

    if let Some(max_bytes) = draft.max_bytes {
        if text.len() > max_bytes {
            let mut cut = text.len() - max_bytes;
            while cut < text.len() && !text.is_char_boundary(cut) {
                cut += 1;
            }
            text = text[cut..].to_string();
        }
    }

    if let Some(tail_lines) = draft.tail_lines {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() > tail_lines {
            let mut tail = lines[lines.len() - tail_lines..].join("\n");
            if !tail.is_empty() && text.ends_with('\n') {
                tail.push('\n');
            }
            text = tail;
        }
    }

    let mut clipped = false;
    if text.len() > STREAM_CAP_BYTES {
        let mut cut = text.len() - STREAM_CAP_BYTES;
        while cut < text.len() && !text.is_char_boundary(cut) {
            cut += 1;
        }
        text = text[cut..].to_string();
        clipped = true;
    }

    (text, clipped)
}

/// Best-effort failure diagnostic under `<cwd>/.goagent/`.
/// Never propagates errors.
fn write_failure_log(
    draft: &foreman_plan::CommandDraft,
    error: &str,
    stdout: &str,
    stderr: &str,
) {
    let base = if draft.cwd.is_empty() {
        match std::env::current_dir() {
            Ok(d) => d,
            Err(_) => return,
        }
    } else {
        PathBuf::from(&draft.cwd)
    };
    let dir = base.join(FAILURE_LOG_DIR);
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("failure-{stamp}.txt"));
    let body = format!(
        "run: {run}\nshell: {shell}\ncwd: {cwd}\ntimestamp: {now}\nerror: {error}\n\n\
         --- stdout ---\n{stdout}\n\n--- stderr ---\n{stderr}\n",
        run = draft.run,
        shell = draft.shell,
        cwd = draft.cwd,
        now = Utc::now().to_rfc3339(),
    );
    if let Err(e) = std::fs::write(&path, body) {
        warn!(path = %path.display(), "failed to write failure log: {e}");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
