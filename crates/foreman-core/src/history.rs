// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only conversation log with token-budget compaction and amnesia.
//!
//! Messages are never deleted.  Two mechanisms bound the log's token cost:
//! the *amnesia scrubber* strips bulky payloads out of messages older than a
//! configurable number of passes, and the *compactor* rewrites the oldest
//! messages in place as `[summary]` one-liners whenever the planner-visible
//! snapshot would exceed its budget.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use tracing::{debug, warn};

use foreman_model::{estimate_tokens, truncate_runes, ChatMessage, Role};
use foreman_plan::PlanObservationPayload;

/// Rune cap applied by the amnesia scrubber.
const AMNESIA_RUNES: usize = 512;

/// Rune cap for a compaction summary snippet.
const SUMMARY_RUNES: usize = 160;

/// Compaction passes are bounded so a pathological history cannot spin the
/// snapshot call.
const MAX_COMPACTION_ITERATIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct HistoryOptions {
    /// Passes after which assistant/tool payloads are scrubbed; 0 disables.
    pub amnesia_after_passes: u32,
    pub max_context_tokens: usize,
    pub compact_when_percent: f32,
    /// Dump path for the planner-visible history; `None` suppresses it.
    pub log_path: Option<PathBuf>,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            amnesia_after_passes: 0,
            max_context_tokens: 128_000,
            compact_when_percent: 0.85,
            log_path: None,
        }
    }
}

/// The conversation history.  The first element is always the seed system
/// message; system messages are immutable after seeding.
pub struct History {
    messages: RwLock<Vec<ChatMessage>>,
    current_pass: AtomicU32,
    options: HistoryOptions,
}

impl History {
    pub fn new(system_prompt: impl Into<String>, options: HistoryOptions) -> Self {
        let seed = ChatMessage::system(system_prompt);
        Self {
            messages: RwLock::new(vec![seed]),
            current_pass: AtomicU32::new(0),
            options,
        }
    }

    // ── Pass counter ──────────────────────────────────────────────────────────

    pub fn current_pass(&self) -> u32 {
        self.current_pass.load(Ordering::SeqCst)
    }

    /// Advance to the next pass and return its number.
    pub fn increment_pass(&self) -> u32 {
        self.current_pass.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the counter at the start of a new prompt.
    pub fn reset_pass(&self) {
        self.current_pass.store(0, Ordering::SeqCst);
    }

    // ── Appending ─────────────────────────────────────────────────────────────

    /// Append a message tagged with the current pass, then run the amnesia
    /// scrubber while still holding the write lock.
    pub fn append(&self, mut message: ChatMessage) {
        message.pass = self.current_pass();
        let mut messages = self.messages.write().unwrap();
        messages.push(message);
        self.scrub_locked(&mut messages);
    }

    pub fn len(&self) -> usize {
        self.messages.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.messages.read().unwrap())
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Read-only copy of the log.
    pub fn history_snapshot(&self) -> Vec<ChatMessage> {
        self.messages.read().unwrap().clone()
    }

    /// Planner-visible copy: compacts in place first (so the rewrite is
    /// durable), then clones and dumps the result when a log path is set.
    pub fn planning_history_snapshot(&self) -> Vec<ChatMessage> {
        let snapshot = {
            let mut messages = self.messages.write().unwrap();
            self.compact_locked(&mut messages);
            messages.clone()
        };
        self.dump(&snapshot);
        snapshot
    }

    // ── Amnesia ───────────────────────────────────────────────────────────────

    fn scrub_locked(&self, messages: &mut [ChatMessage]) {
        let threshold = self.options.amnesia_after_passes;
        if threshold == 0 {
            return;
        }
        let now = self.current_pass();
        for message in messages.iter_mut() {
            if now.saturating_sub(message.pass) < threshold {
                continue;
            }
            match message.role {
                Role::Assistant => {
                    message.content = truncate_runes(&message.content, AMNESIA_RUNES);
                    for call in &mut message.tool_calls {
                        call.arguments = truncate_runes(&call.arguments, AMNESIA_RUNES);
                    }
                }
                Role::Tool => scrub_tool_message(message),
                _ => {}
            }
        }
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn compact_locked(&self, messages: &mut [ChatMessage]) {
        let budget = (self.options.max_context_tokens as f32 * self.options.compact_when_percent)
            as usize;
        if budget == 0 {
            return;
        }
        let mut estimate = estimate_tokens(messages);
        if estimate <= budget {
            return;
        }
        debug!(estimate, budget, "history over budget, compacting");

        let mut iterations = 0;
        while estimate > budget && iterations < MAX_COMPACTION_ITERATIONS {
            iterations += 1;
            let mut progressed = false;
            for i in 0..messages.len() {
                if estimate <= budget {
                    break;
                }
                if messages[i].role == Role::System || messages[i].summarized {
                    continue;
                }
                let before = messages[i].approx_tokens();
                summarize_message(&mut messages[i]);
                estimate = estimate - before + messages[i].approx_tokens();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        debug!(estimate, iterations, "compaction finished");
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn dump(&self, snapshot: &[ChatMessage]) {
        let Some(path) = &self.options.log_path else {
            return;
        };
        match serde_json::to_string_pretty(snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), "failed to write history dump: {e}");
                }
            }
            Err(e) => warn!("failed to serialize history dump: {e}"),
        }
    }
}

/// Blank the bulky streams out of a stale tool observation.  Unparseable
/// content falls back to plain truncation.
fn scrub_tool_message(message: &mut ChatMessage) {
    match serde_json::from_str::<PlanObservationPayload>(&message.content) {
        Ok(mut payload) => {
            payload.stdout.clear();
            payload.stderr.clear();
            for obs in &mut payload.plan_observation {
                obs.stdout.clear();
                obs.stderr.clear();
            }
            payload.details = truncate_runes(&payload.details, AMNESIA_RUNES);
            if let Ok(json) = serde_json::to_string(&payload) {
                message.content = json;
            }
        }
        Err(_) => {
            message.content = truncate_runes(&message.content, AMNESIA_RUNES);
        }
    }
}

/// Rewrite a message as a `[summary] <role> recap: <snippet>` one-liner.
/// Summaries are flagged so they are never re-summarized.
fn summarize_message(message: &mut ChatMessage) {
    let snippet = match message.role {
        Role::Tool => tool_snippet(&message.content),
        _ => message.content.clone(),
    };
    let snippet = truncate_runes(&collapse_whitespace(&snippet), SUMMARY_RUNES);
    message.content = format!("[summary] {} recap: {snippet}", message.role.as_str());
    for call in &mut message.tool_calls {
        call.arguments = truncate_runes(&call.arguments, SUMMARY_RUNES);
    }
    message.summarized = true;
}

/// Digest a tool observation: summary, details, up to six `id=status`
/// tuples, and the cancellation/truncation flags.
fn tool_snippet(content: &str) -> String {
    let Ok(payload) = serde_json::from_str::<PlanObservationPayload>(content) else {
        return content.to_string();
    };
    let mut parts: Vec<String> = Vec::new();
    if !payload.summary.is_empty() {
        parts.push(payload.summary.clone());
    }
    if !payload.details.is_empty() {
        parts.push(payload.details.clone());
    }
    let steps: Vec<String> = payload
        .plan_observation
        .iter()
        .take(6)
        .map(|o| format!("{}={}", o.id, o.status))
        .collect();
    if !steps.is_empty() {
        parts.push(steps.join(" "));
    }
    if payload.canceled_by_human || payload.operation_canceled {
        parts.push("canceled".into());
    }
    if payload.truncated {
        parts.push("truncated".into());
    }
    parts.join(" | ")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::ToolCall;
    use foreman_plan::{StepObservation, StepStatus};

    fn history(options: HistoryOptions) -> History {
        History::new("seed prompt", options)
    }

    fn payload_json(stdout: &str, details: &str) -> String {
        let payload = PlanObservationPayload {
            plan_observation: vec![StepObservation {
                id: "s1".into(),
                status: StepStatus::Completed,
                stdout: stdout.into(),
                ..Default::default()
            }],
            stdout: stdout.into(),
            summary: "Executed 1 plan step(s).".into(),
            details: details.into(),
            ..Default::default()
        };
        serde_json::to_string(&payload).unwrap()
    }

    // ── Seeding & appending ───────────────────────────────────────────────────

    #[test]
    fn first_element_is_the_system_seed() {
        let h = history(HistoryOptions::default());
        let snap = h.history_snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].role, Role::System);
        assert_eq!(snap[0].content, "seed prompt");
    }

    #[test]
    fn append_tags_the_current_pass() {
        let h = history(HistoryOptions::default());
        h.increment_pass();
        h.increment_pass();
        h.append(ChatMessage::user("hi"));
        assert_eq!(h.history_snapshot()[1].pass, 2);
    }

    #[test]
    fn pass_counter_resets_per_prompt() {
        let h = history(HistoryOptions::default());
        h.increment_pass();
        h.reset_pass();
        assert_eq!(h.current_pass(), 0);
        assert_eq!(h.increment_pass(), 1);
    }

    // ── Amnesia ───────────────────────────────────────────────────────────────

    #[test]
    fn amnesia_disabled_leaves_messages_alone() {
        let h = history(HistoryOptions::default());
        let long = "x".repeat(2000);
        h.append(ChatMessage::assistant(&long));
        h.increment_pass();
        h.increment_pass();
        h.append(ChatMessage::user("tick"));
        assert_eq!(h.history_snapshot()[1].content, long);
    }

    #[test]
    fn stale_assistant_content_is_truncated_to_512_runes() {
        let h = history(HistoryOptions {
            amnesia_after_passes: 2,
            ..Default::default()
        });
        h.append(ChatMessage::assistant("y".repeat(3000)));
        h.increment_pass();
        h.increment_pass();
        h.append(ChatMessage::user("tick"));
        let scrubbed = &h.history_snapshot()[1];
        assert!(scrubbed.content.chars().count() <= 512);
        assert!(scrubbed.content.ends_with('…'));
    }

    #[test]
    fn stale_tool_call_arguments_are_truncated() {
        let h = history(HistoryOptions {
            amnesia_after_passes: 1,
            ..Default::default()
        });
        let call = ToolCall::new("c1", "open-agent", "a".repeat(4000));
        h.append(ChatMessage::assistant_tool_call("", call));
        h.increment_pass();
        h.append(ChatMessage::user("tick"));
        let scrubbed = &h.history_snapshot()[1];
        assert!(scrubbed.tool_calls[0].arguments.chars().count() <= 512);
    }

    #[test]
    fn stale_tool_message_streams_are_blanked() {
        let h = history(HistoryOptions {
            amnesia_after_passes: 1,
            ..Default::default()
        });
        h.append(ChatMessage::tool("c1", "open-agent", payload_json("huge output", "fine")));
        h.increment_pass();
        h.append(ChatMessage::user("tick"));
        let scrubbed = &h.history_snapshot()[1];
        let payload: PlanObservationPayload = serde_json::from_str(&scrubbed.content).unwrap();
        assert!(payload.stdout.is_empty());
        assert!(payload.plan_observation[0].stdout.is_empty());
        assert_eq!(payload.summary, "Executed 1 plan step(s).");
    }

    #[test]
    fn unparseable_tool_content_falls_back_to_truncation() {
        let h = history(HistoryOptions {
            amnesia_after_passes: 1,
            ..Default::default()
        });
        h.append(ChatMessage::tool("c1", "open-agent", "z".repeat(2000)));
        h.increment_pass();
        h.append(ChatMessage::user("tick"));
        assert!(h.history_snapshot()[1].content.chars().count() <= 512);
    }

    #[test]
    fn fresh_messages_are_not_scrubbed() {
        let h = history(HistoryOptions {
            amnesia_after_passes: 5,
            ..Default::default()
        });
        let long = "k".repeat(1000);
        h.increment_pass();
        h.append(ChatMessage::assistant(&long));
        h.append(ChatMessage::user("tick"));
        assert_eq!(h.history_snapshot()[1].content, long);
    }

    // ── Token estimation ──────────────────────────────────────────────────────

    #[test]
    fn estimated_tokens_grows_with_content() {
        let h = history(HistoryOptions::default());
        let before = h.estimated_tokens();
        h.append(ChatMessage::user("some reasonably sized message body"));
        assert!(h.estimated_tokens() > before);
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn tiny_budget() -> HistoryOptions {
        HistoryOptions {
            max_context_tokens: 100,
            compact_when_percent: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn under_budget_snapshot_is_untouched() {
        let h = history(HistoryOptions::default());
        h.append(ChatMessage::user("short"));
        let snap = h.planning_history_snapshot();
        assert_eq!(snap[1].content, "short");
        assert!(!snap[1].summarized);
    }

    #[test]
    fn over_budget_messages_become_summaries_oldest_first() {
        let h = history(tiny_budget());
        h.append(ChatMessage::user(format!("first message {}", "a".repeat(400))));
        h.append(ChatMessage::assistant(format!("second message {}", "b".repeat(400))));
        let snap = h.planning_history_snapshot();
        assert!(snap[1].summarized);
        assert!(snap[1].content.starts_with("[summary] user recap:"));
        assert!(snap[1].content.chars().count() <= 160 + 32);
    }

    #[test]
    fn system_seed_is_never_summarized() {
        let h = history(tiny_budget());
        h.append(ChatMessage::user("c".repeat(2000)));
        let snap = h.planning_history_snapshot();
        assert_eq!(snap[0].content, "seed prompt");
        assert!(!snap[0].summarized);
    }

    #[test]
    fn tool_summaries_digest_the_payload() {
        let h = history(tiny_budget());
        h.append(ChatMessage::tool(
            "c1",
            "open-agent",
            payload_json(&"big ".repeat(300), "went fine"),
        ));
        let snap = h.planning_history_snapshot();
        let content = &snap[1].content;
        assert!(content.starts_with("[summary] tool recap:"), "{content}");
        assert!(content.contains("Executed 1 plan step(s)."));
        assert!(content.contains("s1=completed"));
    }

    #[test]
    fn compaction_is_idempotent() {
        let h = history(tiny_budget());
        for i in 0..5 {
            h.append(ChatMessage::user(format!("message {i} {}", "p".repeat(300))));
        }
        let first = h.planning_history_snapshot();
        let second = h.planning_history_snapshot();
        let contents: Vec<&str> = first.iter().map(|m| m.content.as_str()).collect();
        let contents2: Vec<&str> = second.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, contents2);
    }

    #[test]
    fn summaries_are_immune_to_resummarization() {
        let h = history(tiny_budget());
        h.append(ChatMessage::user("q".repeat(1000)));
        let first = h.planning_history_snapshot()[1].clone();
        h.append(ChatMessage::user("r".repeat(1000)));
        let again = h.planning_history_snapshot();
        assert_eq!(again[1].content, first.content);
    }

    #[test]
    fn whitespace_is_collapsed_in_summaries() {
        let h = history(tiny_budget());
        h.append(ChatMessage::user(format!(
            "spread    out\n\n\ttext {}",
            "s".repeat(500)
        )));
        let snap = h.planning_history_snapshot();
        assert!(snap[1].content.contains("spread out text"));
    }

    // ── Dump ──────────────────────────────────────────────────────────────────

    #[test]
    fn planning_snapshot_writes_the_dump_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let h = history(HistoryOptions {
            log_path: Some(path.clone()),
            ..Default::default()
        });
        h.append(ChatMessage::user("logged"));
        h.planning_history_snapshot();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("logged"));
    }

    #[test]
    fn no_log_path_means_no_dump() {
        let h = history(HistoryOptions::default());
        h.append(ChatMessage::user("x"));
        // Nothing to assert on disk; just exercise the suppressed path.
        let snap = h.planning_history_snapshot();
        assert_eq!(snap.len(), 2);
    }
}
