// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Shell token routing a step to the in-process command registry instead of
/// an OS shell.
pub const AGENT_SHELL: &str = "agent";

/// Hard per-stream cap applied to observation stdout/stderr (tail kept).
pub const STREAM_CAP_BYTES: usize = 50 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Abandoned,
}

impl StepStatus {
    /// Whether this status ends the step's lifecycle for the current plan.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// The command a plan step wants executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandDraft {
    /// OS shell path with optional flags ("/bin/bash", "sh -c"), or the
    /// [`AGENT_SHELL`] sentinel for internal commands.
    pub shell: String,
    /// Command text handed to the shell (or the internal invocation line).
    pub run: String,
    /// Working directory; empty uses the process cwd.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    /// Timeout in seconds; `None` uses the executor default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    /// Regex keeping only matching output lines; invalid patterns are
    /// ignored and pass the output through unfiltered.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filter_regex: String,
    /// Keep only the last N lines of each stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<usize>,
    /// Keep only the trailing N bytes of each stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
    /// Free-text justification from the planner.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl CommandDraft {
    /// Simple OS-shell draft, used pervasively in tests.
    pub fn shell_command(run: impl Into<String>) -> Self {
        Self {
            shell: "/bin/bash".into(),
            run: run.into(),
            ..Default::default()
        }
    }

    /// Internal-command draft routed to the registry.
    pub fn internal(run: impl Into<String>) -> Self {
        Self {
            shell: AGENT_SHELL.into(),
            run: run.into(),
            ..Default::default()
        }
    }

    /// True when the shell token routes to the internal registry.
    pub fn is_internal(&self) -> bool {
        self.shell.trim().eq_ignore_ascii_case(AGENT_SHELL)
    }
}

/// One node of the plan DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub status: StepStatus,
    /// Step ids that must reach `completed` before this step is ready.
    /// Ids not present in the current plan are treated as already satisfied.
    #[serde(rename = "waitingForId", skip_serializing_if = "Vec::is_empty")]
    pub waiting_for_id: Vec<String>,
    pub command: CommandDraft,
    /// Result attached once the step has executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<StepObservation>,
    /// Scheduler-internal dispatch flag; never serialized.
    #[serde(skip)]
    pub executing: bool,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, title: impl Into<String>, command: CommandDraft) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            command,
            ..Default::default()
        }
    }

    pub fn waiting_for(mut self, ids: &[&str]) -> Self {
        self.waiting_for_id = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Structured result of executing one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StepObservation {
    pub id: String,
    pub status: StepStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub details: String,
    pub truncated: bool,
}

/// JSON envelope returned to the planner after a plan execution (or a
/// validation failure).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanObservationPayload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan_observation: Vec<StepObservation>,
    /// Rolled-up streams and exit code from the last executed step.
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub summary: String,
    pub details: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_parse_error: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub schema_validation_error: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub response_validation_error: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub canceled_by_human: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub operation_canceled: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl PlanObservationPayload {
    /// Re-enforce the per-stream size cap on the envelope and every per-step
    /// entry before serialization.  Oversized streams keep their tail.
    pub fn enforce_limits(&mut self) {
        let mut clipped = false;
        clipped |= cap_tail(&mut self.stdout);
        clipped |= cap_tail(&mut self.stderr);
        for obs in &mut self.plan_observation {
            let mut step_clipped = false;
            step_clipped |= cap_tail(&mut obs.stdout);
            step_clipped |= cap_tail(&mut obs.stderr);
            if step_clipped {
                obs.truncated = true;
                clipped = true;
            }
        }
        if clipped {
            self.truncated = true;
        }
    }
}

/// Truncate `s` in place to the trailing [`STREAM_CAP_BYTES`], aligned to a
/// character boundary.  Returns `true` when anything was removed.
fn cap_tail(s: &mut String) -> bool {
    if s.len() <= STREAM_CAP_BYTES {
        return false;
    }
    let mut cut = s.len() - STREAM_CAP_BYTES;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    *s = s[cut..].to_string();
    true
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Statuses ──────────────────────────────────────────────────────────────

    #[test]
    fn pending_is_not_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
    }

    #[test]
    fn completed_failed_abandoned_are_terminal() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Abandoned.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Abandoned).unwrap(),
            "\"abandoned\""
        );
    }

    // ── Command drafts ────────────────────────────────────────────────────────

    #[test]
    fn agent_sentinel_is_case_insensitive() {
        let mut c = CommandDraft::internal("apply_patch");
        assert!(c.is_internal());
        c.shell = "Agent".into();
        assert!(c.is_internal());
        c.shell = " AGENT ".into();
        assert!(c.is_internal());
    }

    #[test]
    fn os_shell_is_not_internal() {
        assert!(!CommandDraft::shell_command("ls").is_internal());
    }

    #[test]
    fn draft_deserializes_from_camel_case() {
        let c: CommandDraft = serde_json::from_str(
            r#"{"shell":"/bin/bash","run":"echo a","timeoutSec":5,"tailLines":10}"#,
        )
        .unwrap();
        assert_eq!(c.timeout_sec, Some(5));
        assert_eq!(c.tail_lines, Some(10));
    }

    // ── Plan steps ────────────────────────────────────────────────────────────

    #[test]
    fn step_deserializes_waiting_for_id() {
        let s: PlanStep = serde_json::from_str(
            r#"{"id":"s2","title":"t","waitingForId":["s1"],"command":{"shell":"/bin/bash","run":"x"}}"#,
        )
        .unwrap();
        assert_eq!(s.waiting_for_id, vec!["s1"]);
        assert_eq!(s.status, StepStatus::Pending);
        assert!(!s.executing);
    }

    #[test]
    fn executing_flag_is_never_serialized() {
        let mut s = PlanStep::new("s1", "t", CommandDraft::shell_command("x"));
        s.executing = true;
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("executing"));
    }

    // ── Payload limits ────────────────────────────────────────────────────────

    #[test]
    fn enforce_limits_keeps_small_payloads_untouched() {
        let mut p = PlanObservationPayload {
            stdout: "small".into(),
            ..Default::default()
        };
        p.enforce_limits();
        assert_eq!(p.stdout, "small");
        assert!(!p.truncated);
    }

    #[test]
    fn enforce_limits_caps_envelope_stdout_to_tail() {
        let mut p = PlanObservationPayload {
            stdout: "x".repeat(STREAM_CAP_BYTES + 100),
            ..Default::default()
        };
        p.enforce_limits();
        assert_eq!(p.stdout.len(), STREAM_CAP_BYTES);
        assert!(p.truncated);
    }

    #[test]
    fn enforce_limits_marks_the_step_that_was_clipped() {
        let mut p = PlanObservationPayload {
            plan_observation: vec![
                StepObservation {
                    id: "s1".into(),
                    stderr: "y".repeat(STREAM_CAP_BYTES * 2),
                    ..Default::default()
                },
                StepObservation {
                    id: "s2".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        p.enforce_limits();
        assert!(p.plan_observation[0].truncated);
        assert!(!p.plan_observation[1].truncated);
        assert!(p.truncated);
    }

    #[test]
    fn cap_tail_keeps_the_tail_not_the_head() {
        let mut s = format!("{}{}", "a".repeat(200), "b".repeat(STREAM_CAP_BYTES));
        cap_tail(&mut s);
        assert!(s.chars().all(|c| c == 'b'));
    }

    #[test]
    fn payload_flags_are_omitted_when_false() {
        let p = PlanObservationPayload {
            summary: "ok".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("jsonParseError"));
        assert!(!json.contains("canceledByHuman"));
    }

    #[test]
    fn payload_round_trips_camel_case() {
        let p = PlanObservationPayload {
            plan_observation: vec![StepObservation {
                id: "s1".into(),
                status: StepStatus::Completed,
                exit_code: 0,
                ..Default::default()
            }],
            summary: "Executed 1 plan step(s).".into(),
            canceled_by_human: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("planObservation"));
        assert!(json.contains("canceledByHuman"));
        let back: PlanObservationPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.plan_observation[0].id, "s1");
        assert!(back.canceled_by_human);
    }
}
