// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Server-sent-event parser for planner response streams.
//!
//! The planner answers with an SSE stream whose events carry text deltas and
//! the fragments of one structured tool call.  Vendors name the same
//! semantic event differently, so each handler matches an enumerated alias
//! set; unknown families are ignored rather than failed.
//!
//! A single parser instance serves a single stream.  `on_delta` is invoked
//! synchronously from the reader as fragments arrive, including the live
//! `message`/`reasoning` text recovered from partial tool-call arguments.

use serde_json::Value;
use tracing::debug;

use crate::partial::{
    decode_json_escapes, extract_string_array_field, extract_string_field, trim_dangling_escape,
};
use crate::types::ToolCall;

/// Text fragments of the assistant's visible output.
const TEXT_DELTA_EVENTS: &[&str] = &[
    "response.output_text.delta",
    "output_text.delta",
    "response.text.delta",
    "text.delta",
];

/// Tool-call deltas that may carry a call id, a name, and/or an arguments
/// fragment in one payload.
const TOOL_CALL_DELTA_EVENTS: &[&str] = &[
    "response.function_call.delta",
    "function_call.delta",
    "response.tool_call.delta",
    "tool_call.delta",
    "response.output_item.added",
];

/// Dedicated arguments-only deltas.
const ARGUMENTS_DELTA_EVENTS: &[&str] = &[
    "response.function_call_arguments.delta",
    "function_call_arguments.delta",
    "function_call.arguments.delta",
    "arguments.delta",
];

/// A message delta wrapping an inner text delta.
const MESSAGE_DELTA_EVENTS: &[&str] = &["message.delta", "response.message.delta"];

/// Stream-completion events carrying the aggregated response payload.
const COMPLETION_EVENTS: &[&str] = &[
    "response.completed",
    "response.done",
    "response.output_item.done",
    "completed",
    "done",
];

/// What the caller should do after feeding one line to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Continue,
    Done,
}

/// Accumulates one tool call from interleaved SSE deltas.
#[derive(Debug, Default)]
pub struct StreamParser {
    tool_id: String,
    tool_name: String,
    tool_args: String,
    /// Longest `message` text already forwarded to `on_delta`.
    last_emitted_message: String,
    /// Number of `reasoning` entries already forwarded.
    last_emitted_reasoning_count: usize,
    /// Event name from a preceding `event:` line, consumed by the next
    /// `data:` line when its JSON carries no `type` field.
    pending_event: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one complete SSE line.  Comment lines and unknown event families
    /// are ignored; the `[DONE]` sentinel ends the stream.
    pub fn handle_line(
        &mut self,
        line: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> StreamOutcome {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            // Keepalive / comment.
            return StreamOutcome::Continue;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.pending_event = Some(name.trim().to_string());
            return StreamOutcome::Continue;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return StreamOutcome::Continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return StreamOutcome::Done;
        }
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            debug!("ignoring unparseable SSE data line");
            return StreamOutcome::Continue;
        };
        // A preceding `event:` line types this data line, but an inline
        // `type` field wins; either way the pending name is consumed.
        let pending = self.pending_event.take();
        let event_type = payload
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .or(pending);
        let Some(event_type) = event_type else {
            return StreamOutcome::Continue;
        };
        self.handle_event(&event_type, &payload, on_delta)
    }

    /// Dispatch one typed event to its family handler.
    pub fn handle_event(
        &mut self,
        event_type: &str,
        payload: &Value,
        on_delta: &mut dyn FnMut(&str),
    ) -> StreamOutcome {
        if TEXT_DELTA_EVENTS.contains(&event_type) {
            if let Some(text) = payload
                .get("delta")
                .and_then(|d| d.as_str())
                .or_else(|| payload.get("text").and_then(|t| t.as_str()))
            {
                if !text.is_empty() {
                    on_delta(text);
                }
            }
            return StreamOutcome::Continue;
        }

        if TOOL_CALL_DELTA_EVENTS.contains(&event_type) {
            self.handle_tool_call_delta(payload, on_delta);
            return StreamOutcome::Continue;
        }

        if ARGUMENTS_DELTA_EVENTS.contains(&event_type) {
            if let Some(fragment) = arguments_fragment(payload) {
                self.tool_args.push_str(&fragment);
                self.emit_partial(on_delta);
            }
            return StreamOutcome::Continue;
        }

        if MESSAGE_DELTA_EVENTS.contains(&event_type) {
            let inner = payload
                .get("delta")
                .and_then(|d| d.get("text").or_else(|| d.get("content")))
                .and_then(|t| t.as_str());
            if let Some(text) = inner {
                if !text.is_empty() {
                    on_delta(text);
                }
            }
            return StreamOutcome::Continue;
        }

        if COMPLETION_EVENTS.contains(&event_type) {
            if self.tool_args.is_empty() || self.tool_name.is_empty() || self.tool_id.is_empty() {
                self.recover_from_aggregate(payload);
            }
            return StreamOutcome::Done;
        }

        // Unknown family — skip rather than fail.
        debug!(event = event_type, "ignoring unrecognized stream event");
        StreamOutcome::Continue
    }

    /// The accumulated tool call, or `None` when the stream carried neither a
    /// name nor any arguments.
    pub fn finish(self) -> Option<ToolCall> {
        if self.tool_name.is_empty() && self.tool_args.is_empty() {
            return None;
        }
        Some(ToolCall {
            id: self.tool_id,
            name: self.tool_name,
            arguments: self.tool_args,
        })
    }

    fn handle_tool_call_delta(&mut self, payload: &Value, on_delta: &mut dyn FnMut(&str)) {
        // The item wrapper is used by output_item.added; deltas put fields at
        // the top level or under `delta`.
        let scopes = [
            Some(payload),
            payload.get("item"),
            payload.get("delta").filter(|d| d.is_object()),
        ];

        let mut new_id = None;
        let mut new_name = None;
        for scope in scopes.iter().flatten() {
            if new_id.is_none() {
                new_id = scope
                    .get("call_id")
                    .or_else(|| scope.get("id"))
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty());
            }
            if new_name.is_none() {
                new_name = scope
                    .get("name")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty());
            }
        }

        if let Some(id) = new_id {
            if !self.tool_id.is_empty() && self.tool_id != id {
                // A different call supersedes the current one; drop the
                // partial accumulation and start over.
                self.tool_args.clear();
                self.last_emitted_message.clear();
                self.last_emitted_reasoning_count = 0;
            }
            self.tool_id = id.to_string();
        }
        if let Some(name) = new_name {
            self.tool_name = name.to_string();
        }

        if let Some(fragment) = arguments_fragment(payload) {
            self.tool_args.push_str(&fragment);
            self.emit_partial(on_delta);
        }
    }

    /// Surface new `message` text and `reasoning` entries recovered from the
    /// partially accumulated arguments object.
    fn emit_partial(&mut self, on_delta: &mut dyn FnMut(&str)) {
        if let Some((raw, complete)) = extract_string_field(&self.tool_args, "message") {
            let stable = if complete {
                raw.as_str()
            } else {
                trim_dangling_escape(&raw)
            };
            let decoded = decode_json_escapes(stable);
            if decoded.len() > self.last_emitted_message.len()
                && decoded.starts_with(&self.last_emitted_message)
            {
                let suffix = &decoded[self.last_emitted_message.len()..];
                on_delta(suffix);
                self.last_emitted_message = decoded;
            }
        }

        let reasoning = extract_string_array_field(&self.tool_args, "reasoning");
        for entry in reasoning.iter().skip(self.last_emitted_reasoning_count) {
            on_delta(&format!("\n{entry}"));
        }
        if reasoning.len() > self.last_emitted_reasoning_count {
            self.last_emitted_reasoning_count = reasoning.len();
        }
    }

    /// Best-effort depth-first search over the aggregated completion payload
    /// for the tool-call fields a delta never delivered.
    fn recover_from_aggregate(&mut self, payload: &Value) {
        if self.tool_name.is_empty() {
            if let Some(name) = find_string_by_key(payload, "name") {
                self.tool_name = name;
            }
        }
        if self.tool_id.is_empty() {
            if let Some(id) = find_string_by_key(payload, "call_id") {
                self.tool_id = id;
            }
        }
        if self.tool_args.is_empty() {
            if let Some(args) = find_value_by_key(payload, "arguments") {
                self.tool_args = match args {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
            }
        }
    }
}

/// Pull an arguments fragment from wherever the vendor put it: a top-level
/// string, a nested delta object, or a raw delta string.
fn arguments_fragment(payload: &Value) -> Option<String> {
    if let Some(s) = payload.get("arguments").and_then(|v| v.as_str()) {
        return Some(s.to_string());
    }
    if let Some(delta) = payload.get("delta") {
        if let Some(s) = delta.as_str() {
            return Some(s.to_string());
        }
        if let Some(s) = delta.get("arguments").and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    payload
        .get("item")
        .and_then(|i| i.get("arguments"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn find_string_by_key(v: &Value, key: &str) -> Option<String> {
    find_value_by_key(v, key).and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    })
}

fn find_value_by_key(v: &Value, key: &str) -> Option<Value> {
    match v {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                if !found.is_null() {
                    return Some(found.clone());
                }
            }
            map.values().find_map(|child| find_value_by_key(child, key))
        }
        Value::Array(items) => items.iter().find_map(|child| find_value_by_key(child, key)),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
