// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::stream::{StreamOutcome, StreamParser};
use crate::types::{ChatMessage, Role, ToolCall};

/// Maximum transient-failure retries per request.
const MAX_RETRIES: u32 = 3;

/// Description of the single tool exposed to the planner.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// The orchestrator's view of the planner.
///
/// Both operations return the final accumulated tool call; the streaming
/// variant additionally forwards text fragments (assistant `message` text and
/// `reasoning` entries) to `on_delta` as they arrive.  `ctx` is the caller's
/// cancellation scope: it aborts the stream read mid-request and suspends any
/// pending retry.
#[async_trait]
pub trait PlannerClient: Send + Sync {
    async fn request_plan(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
    ) -> anyhow::Result<ToolCall>;

    async fn request_plan_streaming(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<ToolCall>;
}

/// HTTPS planner client speaking the OpenAI-compatible responses wire format.
pub struct HttpPlannerClient {
    client: reqwest::Client,
    responses_url: String,
    api_key: Option<String>,
    model: String,
    reasoning_effort: Option<String>,
    tool: ToolSpec,
}

impl HttpPlannerClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        reasoning_effort: Option<String>,
        tool: ToolSpec,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            responses_url: format!("{base}/responses"),
            api_key,
            model: model.into(),
            reasoning_effort,
            tool,
        }
    }

    fn build_body(&self, history: &[ChatMessage]) -> Value {
        let input: Vec<Value> = history.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": self.model,
            "input": input,
            "stream": true,
            "tools": [{
                "type": "function",
                "name": self.tool.name,
                "description": self.tool.description,
                "parameters": self.tool.parameters,
            }],
            "tool_choice": "required",
        });
        if let Some(effort) = &self.reasoning_effort {
            body["reasoning"] = json!({ "effort": effort });
        }
        body
    }

    /// Send the request and classify any failure as retryable or fatal.
    /// Only failures that occur before the stream starts are retryable, so a
    /// retry never re-emits deltas the consumer already saw.
    async fn open_stream(&self, body: &Value) -> Result<reqwest::Response, AttemptError> {
        let mut req = self.client.post(&self.responses_url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                return Err(AttemptError {
                    retryable: true,
                    error: anyhow::Error::new(e).context("planner request failed"),
                })
            }
        };
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retryable = status.as_u16() == 429 || status.is_server_error();
        let text = resp.text().await.unwrap_or_default();
        Err(AttemptError {
            retryable,
            error: anyhow::anyhow!("planner error {status}: {text}"),
        })
    }

    async fn drive(
        &self,
        ctx: &CancellationToken,
        resp: reqwest::Response,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<ToolCall> {
        let mut parser = StreamParser::new();
        let mut byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets; keep a line buffer
        // across chunks and parse only complete lines.
        let mut buf = String::new();
        let mut finished = false;

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => bail!("planner stream aborted: context cancelled"),
                next = byte_stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.context("reading planner stream")?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(nl) = buf.find('\n') {
                let line = buf[..nl].to_string();
                buf.drain(..=nl);
                if parser.handle_line(&line, &mut *on_delta) == StreamOutcome::Done {
                    finished = true;
                    break 'read;
                }
            }
        }
        if !finished && !buf.is_empty() {
            // Final line without a trailing newline.
            parser.handle_line(&buf, &mut *on_delta);
        }

        match parser.finish() {
            Some(call) => Ok(call),
            None => bail!("planner stream ended without a tool call"),
        }
    }

    async fn request_with_retries(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<ToolCall> {
        let body = self.build_body(history);
        debug!(
            model = %self.model,
            messages = history.len(),
            "requesting plan"
        );
        let backoff = Backoff::transport();
        let mut attempt = 0u32;
        loop {
            let opened = tokio::select! {
                biased;
                _ = ctx.cancelled() => bail!("planner request aborted: context cancelled"),
                opened = self.open_stream(&body) => opened,
            };
            match opened {
                Ok(resp) => return self.drive(ctx, resp, &mut *on_delta).await,
                Err(AttemptError { retryable, error }) => {
                    if !retryable || attempt >= MAX_RETRIES {
                        return Err(error);
                    }
                    let delay = backoff.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient planner failure, retrying: {error:#}"
                    );
                    // Retry is suspended once the caller's context is done.
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => {
                            bail!("planner retry abandoned: context cancelled")
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

struct AttemptError {
    retryable: bool,
    error: anyhow::Error,
}

#[async_trait]
impl PlannerClient for HttpPlannerClient {
    async fn request_plan(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
    ) -> anyhow::Result<ToolCall> {
        self.request_with_retries(ctx, history, &mut |_| {}).await
    }

    async fn request_plan_streaming(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<ToolCall> {
        self.request_with_retries(ctx, history, on_delta).await
    }
}

/// Map one history message to the responses-endpoint input format.
///
/// Tool observations travel as `developer` turns with `input_text` content;
/// assistant turns use `output_text`; user and system turns use `input_text`.
fn message_to_wire(msg: &ChatMessage) -> Value {
    let (role, content_type) = match msg.role {
        Role::System => ("system", "input_text"),
        Role::User => ("user", "input_text"),
        Role::Assistant => ("assistant", "output_text"),
        Role::Tool => ("developer", "input_text"),
    };
    json!({
        "role": role,
        "content": [{ "type": content_type, "text": msg.content }],
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
