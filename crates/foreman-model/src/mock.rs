// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::PlannerClient;
use crate::types::{ChatMessage, ToolCall};

/// One scripted planner response.
#[derive(Debug, Clone)]
pub enum PlannerScript {
    /// Emit the deltas in order, then return the tool call.
    Call { deltas: Vec<String>, call: ToolCall },
    /// Fail the request with this message.
    Error(String),
}

impl PlannerScript {
    /// A plan-tool call with the given raw JSON arguments and no deltas.
    pub fn plan(arguments: impl Into<String>) -> Self {
        Self::Call {
            deltas: Vec::new(),
            call: ToolCall::new("scripted-call", "open-agent", arguments),
        }
    }
}

/// Pre-scripted planner for tests and offline runs.  Each request pops the
/// next script from the front of the queue; the history that accompanied the
/// most recent request is captured for inspection.
pub struct ScriptedPlanner {
    scripts: Mutex<Vec<PlannerScript>>,
    /// History snapshot from the most recent request.
    pub last_history: Mutex<Option<Vec<ChatMessage>>>,
    /// Total number of requests served.
    pub request_count: Mutex<usize>,
}

impl ScriptedPlanner {
    pub fn new(scripts: Vec<PlannerScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_history: Mutex::new(None),
            request_count: Mutex::new(0),
        }
    }

    /// Planner that answers every request with the same arguments.
    pub fn always(arguments: impl Into<String>) -> Self {
        let args = arguments.into();
        // A generous repeat count keeps loop-style tests simple without
        // implementing an infinite script.
        Self::new((0..64).map(|_| PlannerScript::plan(args.clone())).collect())
    }

    fn next_script(&self) -> Option<PlannerScript> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            None
        } else {
            Some(scripts.remove(0))
        }
    }

    fn serve(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<ToolCall> {
        if ctx.is_cancelled() {
            anyhow::bail!("planner request aborted: context cancelled");
        }
        *self.last_history.lock().unwrap() = Some(history.to_vec());
        *self.request_count.lock().unwrap() += 1;
        match self.next_script() {
            Some(PlannerScript::Call { deltas, call }) => {
                for d in &deltas {
                    on_delta(d);
                }
                Ok(call)
            }
            Some(PlannerScript::Error(msg)) => anyhow::bail!("{msg}"),
            None => anyhow::bail!("scripted planner exhausted"),
        }
    }
}

#[async_trait]
impl PlannerClient for ScriptedPlanner {
    async fn request_plan(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
    ) -> anyhow::Result<ToolCall> {
        self.serve(ctx, history, &mut |_| {})
    }

    async fn request_plan_streaming(
        &self,
        ctx: &CancellationToken,
        history: &[ChatMessage],
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<ToolCall> {
        self.serve(ctx, history, on_delta)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn scripts_are_served_in_order() {
        let p = ScriptedPlanner::new(vec![
            PlannerScript::plan("{\"plan\":[]}"),
            PlannerScript::Error("boom".into()),
        ]);
        let first = p.request_plan(&ctx(), &[]).await.unwrap();
        assert_eq!(first.arguments, "{\"plan\":[]}");
        let second = p.request_plan(&ctx(), &[]).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn deltas_are_forwarded_before_the_call() {
        let p = ScriptedPlanner::new(vec![PlannerScript::Call {
            deltas: vec!["wor".into(), "king".into()],
            call: ToolCall::new("c1", "open-agent", "{}"),
        }]);
        let mut seen = String::new();
        let call = p
            .request_plan_streaming(&ctx(), &[], &mut |d| seen.push_str(d))
            .await
            .unwrap();
        assert_eq!(seen, "working");
        assert_eq!(call.id, "c1");
    }

    #[tokio::test]
    async fn history_is_captured_per_request() {
        let p = ScriptedPlanner::always("{}");
        let history = vec![ChatMessage::system("seed"), ChatMessage::user("go")];
        p.request_plan(&ctx(), &history).await.unwrap();
        let captured = p.last_history.lock().unwrap().clone().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(*p.request_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_scripts_error() {
        let p = ScriptedPlanner::new(vec![]);
        assert!(p.request_plan(&ctx(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn cancelled_context_aborts_without_consuming_a_script() {
        let p = ScriptedPlanner::new(vec![PlannerScript::plan("{}")]);
        let token = CancellationToken::new();
        token.cancel();
        assert!(p.request_plan(&token, &[]).await.is_err());
        assert_eq!(*p.request_count.lock().unwrap(), 0);
        // The script is still available for the next caller.
        assert!(p.request_plan(&ctx(), &[]).await.is_ok());
    }
}
