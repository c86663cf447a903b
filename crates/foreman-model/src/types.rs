// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single structured function invocation emitted by the planner.
///
/// `arguments` is the raw JSON text; during streaming it grows fragment by
/// fragment and is only guaranteed to be a complete object once the stream
/// has finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier assigned by the planner (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One entry in the conversation history.
///
/// Tool-role messages must carry `tool_call_id` and `name` so the planner can
/// associate the observation with the call that produced it.  Assistant
/// messages that invoked the plan tool carry the call in `tool_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
    /// Pass counter at append time; 0 for seed messages.
    #[serde(default)]
    pub pass: u32,
    /// Set once the compactor has rewritten this message as a summary.
    /// Summaries are never summarized again.
    #[serde(default)]
    pub summarized: bool,
}

impl ChatMessage {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
            pass: 0,
            summarized: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    /// Assistant message carrying a tool call (the planner's plan response).
    pub fn assistant_tool_call(content: impl Into<String>, call: ToolCall) -> Self {
        let mut msg = Self::base(Role::Assistant, content);
        msg.tool_calls = vec![call];
        msg
    }

    /// Tool observation message answering the call with the given id.
    pub fn tool(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(Role::Tool, content);
        msg.tool_call_id = Some(call_id.into());
        msg.name = Some(name.into());
        msg
    }

    /// Approximate token cost of this message.
    ///
    /// Per-message overhead of 4 tokens plus one quarter of the rune count of
    /// every populated string field, with a minimum of 1 token per non-empty
    /// string.  Each tool call adds its own 4-token envelope.
    pub fn approx_tokens(&self) -> usize {
        let mut total = 4usize;
        total += field_tokens(self.role.as_str());
        total += field_tokens(&self.content);
        total += field_tokens(self.tool_call_id.as_deref().unwrap_or(""));
        total += field_tokens(self.name.as_deref().unwrap_or(""));
        for call in &self.tool_calls {
            total += 4;
            total += field_tokens(&call.id);
            total += field_tokens(&call.name);
            total += field_tokens(&call.arguments);
        }
        total
    }
}

/// ⌈runes/4⌉ with a floor of 1 for non-empty strings, 0 for empty.
fn field_tokens(s: &str) -> usize {
    if s.is_empty() {
        return 0;
    }
    let runes = s.chars().count();
    runes.div_ceil(4).max(1)
}

/// Approximate token cost of a whole history slice.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.approx_tokens()).sum()
}

/// Truncate `s` to at most `max_runes` characters, ellipsis included, always
/// splitting on a character boundary.
pub fn truncate_runes(s: &str, max_runes: usize) -> String {
    if s.chars().count() <= max_runes {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_runes.saturating_sub(1)).collect();
    format!("{kept}…")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
