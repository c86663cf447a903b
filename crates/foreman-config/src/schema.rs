// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Model identifier forwarded to the planner API.
    pub model: String,
    /// Optional reasoning effort ("low" | "medium" | "high") forwarded as
    /// `reasoning: {effort}` on every request.  `None` omits the field.
    pub reasoning_effort: Option<String>,
    /// Base URL of the OpenAI-compatible responses endpoint.
    pub api_base_url: String,
    /// Explicit API key; prefer `api_key_env` in config files so that
    /// secrets stay out of version control.
    pub api_key: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Stream planner responses and forward text deltas as they arrive.
    /// When disabled the runtime still receives the final tool call, but no
    /// incremental assistant output is emitted.
    #[serde(default = "default_true")]
    pub use_streaming: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            reasoning_effort: None,
            api_base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            use_streaming: true,
        }
    }
}

fn default_buffer() -> usize {
    16
}
fn default_exit_commands() -> Vec<String> {
    ["exit", "quit", "/exit", "/quit"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard cap on passes per user prompt.  0 disables the cap.
    #[serde(default)]
    pub max_passes: u32,
    /// Run unattended: synthesize the initial prompt from `hands_free_topic`
    /// and answer every input request with `hands_free_auto_reply`.
    #[serde(default)]
    pub hands_free: bool,
    /// Topic used to synthesize the initial prompt in hands-free mode.
    pub hands_free_topic: Option<String>,
    /// Reply injected whenever the runtime would otherwise ask the user for
    /// input.  `None` means hands-free sessions stop at the first question.
    pub hands_free_auto_reply: Option<String>,
    /// Capacity of the input event queue (clamped to ≥ 1).
    #[serde(default = "default_buffer")]
    pub input_buffer: usize,
    /// Capacity of the output event queue (clamped to ≥ 1).
    #[serde(default = "default_buffer")]
    pub output_buffer: usize,
    /// Skip spawning the interactive stdin line reader.
    #[serde(default)]
    pub disable_input_reader: bool,
    /// Skip spawning the output forwarder worker.
    #[serde(default)]
    pub disable_output_forwarding: bool,
    /// Milliseconds to wait on a full output queue before dropping the
    /// event.  0 waits forever.
    #[serde(default)]
    pub emit_timeout_ms: u64,
    /// Words recognized by the line reader as a shutdown request.
    #[serde(default = "default_exit_commands")]
    pub exit_commands: Vec<String>,
    /// Text appended to the built-in system prompt (toolchain notes,
    /// house rules, repository conventions).
    pub system_prompt_augment: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_passes: 0,
            hands_free: false,
            hands_free_topic: None,
            hands_free_auto_reply: None,
            input_buffer: default_buffer(),
            output_buffer: default_buffer(),
            disable_input_reader: false,
            disable_output_forwarding: false,
            emit_timeout_ms: 0,
            exit_commands: default_exit_commands(),
            system_prompt_augment: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Passes after which old assistant/tool messages are scrubbed of bulky
    /// payloads.  0 disables the scrubber.
    #[serde(default)]
    pub amnesia_after_passes: u32,
    /// Context window ceiling in tokens.  `None` selects a per-model default
    /// (see [`crate::context_budget_for`]).
    pub max_context_tokens: Option<usize>,
    /// Fraction of `max_context_tokens` at which compaction starts.
    /// `None` selects the per-model default.
    pub compact_when_percent: Option<f32>,
    /// Path of the planner-visible history dump.  `None` uses
    /// `history.json`; an empty string suppresses the dump entirely.
    pub history_log_path: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            amnesia_after_passes: 0,
            max_context_tokens: None,
            compact_when_percent: None,
            history_log_path: None,
        }
    }
}

impl Config {
    /// Resolve the planner API key: explicit value first, then the
    /// configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.planner.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        self.planner
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }

    /// Effective (context ceiling, compaction fraction) for the configured
    /// model, honouring explicit overrides.
    pub fn context_budget(&self) -> (usize, f32) {
        let (table_max, table_pct) = crate::context_budget_for(&self.planner.model);
        (
            self.history.max_context_tokens.unwrap_or(table_max),
            self.history.compact_when_percent.unwrap_or(table_pct),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_planner_targets_openai() {
        let c = Config::default();
        assert_eq!(c.planner.model, "gpt-4o");
        assert!(c.planner.api_base_url.starts_with("https://"));
        assert!(c.planner.use_streaming);
    }

    #[test]
    fn default_exit_commands_include_slash_variants() {
        let c = Config::default();
        assert!(c.runtime.exit_commands.iter().any(|s| s == "/quit"));
        assert!(c.runtime.exit_commands.iter().any(|s| s == "exit"));
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.runtime.input_buffer, 16);
        assert_eq!(c.history.amnesia_after_passes, 0);
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let c: Config = serde_yaml::from_str("runtime:\n  max_passes: 7\n").unwrap();
        assert_eq!(c.runtime.max_passes, 7);
        assert_eq!(c.runtime.output_buffer, 16);
        assert!(c.planner.use_streaming);
    }

    #[test]
    fn context_budget_override_wins_over_table() {
        let mut c = Config::default();
        c.history.max_context_tokens = Some(9000);
        c.history.compact_when_percent = Some(0.5);
        assert_eq!(c.context_budget(), (9000, 0.5));
    }

    #[test]
    fn resolve_api_key_prefers_explicit_value() {
        let mut c = Config::default();
        c.planner.api_key = Some("sk-explicit".into());
        c.planner.api_key_env = Some("FOREMAN_TEST_KEY_UNSET".into());
        assert_eq!(c.resolve_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn resolve_api_key_missing_everywhere_is_none() {
        let mut c = Config::default();
        c.planner.api_key = None;
        c.planner.api_key_env = Some("FOREMAN_TEST_KEY_DEFINITELY_UNSET".into());
        assert!(c.resolve_api_key().is_none());
    }
}
