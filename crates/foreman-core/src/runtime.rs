// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The orchestrator: owns the pass loop that alternates between planner
//! requests and plan execution.
//!
//! One runtime hosts several concurrent activities — input reader, output
//! forwarder, the pass-loop driver, and a worker pool executing ready plan
//! steps — all coordinated through the bounded `inputs`/`outputs` queues, a
//! `closed` latch, and one cancellable plan context that every worker
//! derives from.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use foreman_config::Config;
use foreman_exec::{CommandRegistry, ExecResult, Executor};
use foreman_model::{Backoff, ChatMessage, PlannerClient, ToolCall};
use foreman_plan::{
    PlanManager, PlanObservationPayload, PlanResponse, PlanValidator, StepObservation,
    PLAN_TOOL_NAME,
};

use crate::events::{InputEvent, OutputEvent, StatusLevel};
use crate::history::{History, HistoryOptions};
use crate::prompts::system_prompt;

/// The agent runtime.  Construct with [`Runtime::new`], take the output
/// receiver (unless output forwarding is enabled), then drive with
/// [`Runtime::run`].
pub struct Runtime {
    id: String,
    config: Config,
    planner: Arc<dyn PlannerClient>,
    plan: Arc<PlanManager>,
    executor: Arc<Executor>,
    validator: PlanValidator,
    history: Arc<History>,
    inputs_tx: mpsc::Sender<InputEvent>,
    inputs_rx: StdMutex<Option<mpsc::Receiver<InputEvent>>>,
    outputs_tx: mpsc::Sender<OutputEvent>,
    outputs_rx: StdMutex<Option<mpsc::Receiver<OutputEvent>>>,
    /// Latched exactly once; emission afterwards is a no-op.
    closed: CancellationToken,
    /// Guards against concurrent prompt handling.
    working: StdMutex<bool>,
    /// Cancellation scope of the plan currently executing, if any.
    active_plan_cancel: StdMutex<Option<CancellationToken>>,
    /// Serializes plan executions; only one plan runs at a time.
    dispatch_lock: tokio::sync::Mutex<()>,
    emit_timeout: Option<Duration>,
}

/// What a finished plan execution reported back to the pass loop.
#[derive(Debug, Default)]
struct ExecutionReport {
    canceled: bool,
}

impl Runtime {
    pub fn new(
        config: Config,
        planner: Arc<dyn PlannerClient>,
        registry: CommandRegistry,
    ) -> anyhow::Result<Arc<Self>> {
        let validator = PlanValidator::new()?;

        let (max_tokens, pct) = config.context_budget();
        let log_path = match config.history.history_log_path.as_deref() {
            None => Some(PathBuf::from("history.json")),
            Some("") => None,
            Some(p) => Some(PathBuf::from(p)),
        };
        let history = Arc::new(History::new(
            system_prompt(config.runtime.system_prompt_augment.as_deref()),
            HistoryOptions {
                amnesia_after_passes: config.history.amnesia_after_passes,
                max_context_tokens: max_tokens,
                compact_when_percent: pct,
                log_path,
            },
        ));

        let (inputs_tx, inputs_rx) = mpsc::channel(config.runtime.input_buffer.max(1));
        let (outputs_tx, outputs_rx) = mpsc::channel(config.runtime.output_buffer.max(1));
        let emit_timeout = match config.runtime.emit_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            executor: Arc::new(Executor::new(Arc::new(registry))),
            plan: Arc::new(PlanManager::new()),
            validator,
            history,
            planner,
            inputs_tx,
            inputs_rx: StdMutex::new(Some(inputs_rx)),
            outputs_tx,
            outputs_rx: StdMutex::new(Some(outputs_rx)),
            closed: CancellationToken::new(),
            working: StdMutex::new(false),
            active_plan_cancel: StdMutex::new(None),
            dispatch_lock: tokio::sync::Mutex::new(()),
            emit_timeout,
            config,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    pub fn plan_manager(&self) -> &Arc<PlanManager> {
        &self.plan
    }

    /// Take the output event receiver.  Call before [`Runtime::run`] when
    /// output forwarding is disabled; returns `None` on the second call.
    pub fn take_outputs(&self) -> Option<mpsc::Receiver<OutputEvent>> {
        self.outputs_rx.lock().unwrap().take()
    }

    /// Queue a user prompt.  Refused with a warning while a prompt is
    /// already being processed.
    pub async fn submit_prompt(&self, text: impl Into<String>) {
        let busy = { *self.working.lock().unwrap() };
        if busy {
            self.emit(OutputEvent::status(
                "a prompt is already being processed",
                StatusLevel::Warn,
            ))
            .await;
            return;
        }
        let _ = self.inputs_tx.send(InputEvent::Prompt(text.into())).await;
    }

    /// Interrupt the currently executing plan and queue a cancel event.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Some(token) = self.active_plan_cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
        let _ = self.inputs_tx.try_send(InputEvent::Cancel(reason.into()));
    }

    /// Request an orderly shutdown.
    pub fn shutdown(&self, reason: impl Into<String>) {
        let _ = self.inputs_tx.try_send(InputEvent::Shutdown(reason.into()));
    }

    /// Latch the runtime closed.  Emission afterwards is a no-op and the
    /// forwarder (when running) drains out.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    // ── Top-level loop ────────────────────────────────────────────────────────

    /// Run the input loop until shutdown, close, or context cancellation.
    pub async fn run(self: &Arc<Self>, ctx: CancellationToken) -> anyhow::Result<()> {
        if !self.config.runtime.disable_output_forwarding {
            self.spawn_output_forwarder();
        }

        if self.config.runtime.hands_free {
            let topic = self
                .config
                .runtime
                .hands_free_topic
                .clone()
                .unwrap_or_else(|| "Continue working autonomously.".into());
            let _ = self.inputs_tx.send(InputEvent::Prompt(topic)).await;
        } else if !self.config.runtime.disable_input_reader {
            self.spawn_input_reader();
        }

        let mut inputs = self
            .inputs_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("runtime already running"))?;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.close();
                    return Err(anyhow!("context cancelled"));
                }
                _ = self.closed.cancelled() => return Ok(()),
                event = inputs.recv() => match event {
                    None => return Ok(()),
                    Some(InputEvent::Shutdown(reason)) => {
                        self.close();
                        return Err(anyhow!("shutdown requested: {reason}"));
                    }
                    Some(InputEvent::Cancel(reason)) => {
                        self.emit(OutputEvent::status(
                            format!("cancel requested: {reason}"),
                            StatusLevel::Warn,
                        ))
                        .await;
                        self.request_input("What should I do instead?").await;
                    }
                    Some(InputEvent::Prompt(text)) => {
                        tokio::select! {
                            biased;
                            _ = ctx.cancelled() => {
                                self.close();
                                return Err(anyhow!("context cancelled"));
                            }
                            _ = self.handle_prompt(&ctx, text) => {}
                        }
                    }
                },
            }
        }
    }

    fn spawn_output_forwarder(self: &Arc<Self>) {
        let Some(mut outputs) = self.take_outputs() else {
            return;
        };
        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    event = outputs.recv() => match event {
                        None => break,
                        Some(event) => print_event(&event),
                    },
                }
            }
        });
    }

    fn spawn_input_reader(self: &Arc<Self>) {
        let tx = self.inputs_tx.clone();
        let closed = self.closed.clone();
        let exit_commands: Vec<String> = self
            .config
            .runtime
            .exit_commands
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                if closed.is_cancelled() {
                    break;
                }
                line.clear();
                match std::io::BufRead::read_line(&mut stdin.lock(), &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let event = if exit_commands.contains(&trimmed.to_ascii_lowercase()) {
                    InputEvent::Shutdown("user exit".into())
                } else if trimmed.eq_ignore_ascii_case("cancel") {
                    InputEvent::Cancel("user cancel".into())
                } else {
                    InputEvent::Prompt(trimmed.to_string())
                };
                let stop = matches!(event, InputEvent::Shutdown(_));
                if tx.blocking_send(event).is_err() || stop {
                    break;
                }
            }
        });
    }

    // ── Prompt handling ───────────────────────────────────────────────────────

    async fn handle_prompt(self: &Arc<Self>, ctx: &CancellationToken, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            self.emit(OutputEvent::status("ignoring empty prompt", StatusLevel::Warn))
                .await;
            return;
        }
        {
            let mut working = self.working.lock().unwrap();
            if *working {
                self.emit_sync(OutputEvent::status(
                    "a prompt is already being processed",
                    StatusLevel::Warn,
                ));
                return;
            }
            *working = true;
        }
        let _guard = WorkingGuard(&self.working);

        self.history.reset_pass();
        self.history.append(ChatMessage::user(text));
        self.pass_loop(ctx).await;
    }

    async fn pass_loop(self: &Arc<Self>, ctx: &CancellationToken) {
        loop {
            if ctx.is_cancelled() || self.is_closed() {
                return;
            }
            let pass = self.history.increment_pass();
            let max_passes = self.config.runtime.max_passes;
            if max_passes > 0 && pass > max_passes {
                self.emit(OutputEvent::Error(format!(
                    "pass limit of {max_passes} reached"
                )))
                .await;
                self.request_input("The pass limit was reached; continue?").await;
                if self.config.runtime.hands_free {
                    self.close();
                }
                return;
            }
            self.emit(OutputEvent::status(
                format!("starting pass {pass}"),
                StatusLevel::Info,
            ))
            .await;

            let (response, call) = match self.request_plan_validated(ctx).await {
                Ok(pair) => pair,
                Err(e) => {
                    self.emit(OutputEvent::Error(format!("planner request failed: {e:#}")))
                        .await;
                    self.request_input("The planner request failed; how should I proceed?")
                        .await;
                    return;
                }
            };

            let executable = self.record_plan_response(&response, &call).await;

            if response.require_human_input {
                self.append_note_observation(&call, "assistant requested input");
                self.request_input(if response.message.is_empty() {
                    "The assistant requested your input.".to_string()
                } else {
                    response.message.clone()
                })
                .await;
                return;
            }

            if executable == 0 {
                self.append_note_observation(&call, "No plan steps were executed.");
                if self.config.runtime.hands_free {
                    self.emit(OutputEvent::status(
                        format!(
                            "Hands-free session complete after {pass} pass(es); {}",
                            if response.message.is_empty() {
                                "no further steps"
                            } else {
                                response.message.as_str()
                            }
                        ),
                        StatusLevel::Info,
                    ))
                    .await;
                    self.close();
                } else {
                    self.request_input(if response.message.is_empty() {
                        "The plan has no executable steps; what next?".to_string()
                    } else {
                        response.message.clone()
                    })
                    .await;
                }
                return;
            }

            let report = self.execute_pending_commands(ctx, &call).await;
            if report.canceled || ctx.is_cancelled() {
                return;
            }
        }
    }

    // ── Planner interaction ───────────────────────────────────────────────────

    /// Request a plan, validating the tool call and feeding corrective
    /// messages back to the planner until a schema-compliant call arrives.
    /// The validation backoff resets on every fresh pass.
    async fn request_plan_validated(
        &self,
        ctx: &CancellationToken,
    ) -> anyhow::Result<(PlanResponse, ToolCall)> {
        let backoff = Backoff::validation();
        let mut attempt = 0u32;
        loop {
            if ctx.is_cancelled() {
                return Err(anyhow!("context cancelled"));
            }
            let snapshot = self.history.planning_history_snapshot();
            let call = if self.config.planner.use_streaming {
                let outputs = self.outputs_tx.clone();
                let closed = self.closed.clone();
                let mut on_delta = move |delta: &str| {
                    if closed.is_cancelled() {
                        return;
                    }
                    // A slow consumer must not stall the stream reader.
                    let _ = outputs.try_send(OutputEvent::AssistantDelta(delta.to_string()));
                };
                self.planner
                    .request_plan_streaming(ctx, &snapshot, &mut on_delta)
                    .await?
            } else {
                self.planner.request_plan(ctx, &snapshot).await?
            };

            match self.validator.validate(&call.arguments) {
                Ok(response) => return Ok((response, call)),
                Err(failure) => {
                    warn!(summary = %failure.summary, "plan validation failed");
                    self.emit(OutputEvent::status(
                        format!("plan rejected: {}", failure.summary),
                        StatusLevel::Warn,
                    ))
                    .await;

                    // The planner must see what it said, the critique, and
                    // an explicit retry instruction, in that order.
                    self.history
                        .append(ChatMessage::assistant_tool_call(String::new(), call.clone()));
                    let payload = failure.to_payload();
                    self.append_tool_payload(&call, &payload);
                    self.history.append(ChatMessage::user(failure.retry_prompt()));

                    let delay = backoff.delay(attempt);
                    attempt += 1;
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(anyhow!("context cancelled")),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Append the assistant turn, install the new plan (dropping completed
    /// echoes and pruning their ids from dependency lists), and report how
    /// many steps can still execute.
    async fn record_plan_response(&self, response: &PlanResponse, call: &ToolCall) -> usize {
        self.history.append(ChatMessage::assistant_tool_call(
            response.message.clone(),
            call.clone(),
        ));

        let completed: HashSet<String> = response
            .plan
            .iter()
            .filter(|s| s.status == foreman_plan::StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        let mut steps: Vec<foreman_plan::PlanStep> = response
            .plan
            .iter()
            .filter(|s| s.status != foreman_plan::StepStatus::Completed)
            .cloned()
            .collect();
        for step in &mut steps {
            step.waiting_for_id.retain(|dep| !completed.contains(dep));
        }
        self.plan.replace(steps);

        let executable = self.plan.executable_count();
        self.emit(OutputEvent::status(
            format!(
                "plan accepted: {} step(s), {executable} executable",
                response.plan.len()
            ),
            StatusLevel::Info,
        ))
        .await;
        self.emit(OutputEvent::AssistantMessage {
            message: response.message.clone(),
            reasoning: response.reasoning.clone(),
        })
        .await;
        executable
    }

    // ── Plan execution ────────────────────────────────────────────────────────

    /// Dispatch ready steps into parallel workers until the plan drains,
    /// a step fails (drain, then halt), or the plan context is cancelled.
    /// Exactly one tool-role observation message is appended per execution.
    async fn execute_pending_commands(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        call: &ToolCall,
    ) -> ExecutionReport {
        let _serial = self.dispatch_lock.lock().await;

        let plan_cancel = ctx.child_token();
        *self.active_plan_cancel.lock().unwrap() = Some(plan_cancel.clone());

        let (done_tx, mut done_rx) = mpsc::channel::<ExecResult>(64);
        let mut executing = 0usize;
        let mut halt = false;
        let mut canceled = false;
        let mut results: Vec<StepObservation> = Vec::new();
        let mut halted_step: Option<String> = None;
        let mut last_error: Option<String> = None;

        loop {
            if !halt && !plan_cancel.is_cancelled() {
                while let Some(step) = self.plan.ready() {
                    executing += 1;
                    self.emit(OutputEvent::status(
                        format!("executing step {}", step.id),
                        StatusLevel::Info,
                    ))
                    .await;
                    let executor = Arc::clone(&self.executor);
                    let token = plan_cancel.clone();
                    let tx = done_tx.clone();
                    tokio::spawn(async move {
                        let result = executor.execute(&step, &token).await;
                        let _ = tx.send(result).await;
                    });
                }
            }

            if executing == 0 {
                break;
            }
            let Some(result) = done_rx.recv().await else {
                break;
            };
            executing -= 1;

            let observation = result.observation.clone();
            if let Err(e) = self.plan.update_status(
                &observation.id,
                observation.status,
                Some(observation.clone()),
            ) {
                self.emit(OutputEvent::Error(format!("plan bookkeeping failed: {e}")))
                    .await;
                halt = true;
            }
            self.emit(OutputEvent::status(
                format!("step {} {}", observation.id, observation.status),
                if result.error.is_none() {
                    StatusLevel::Info
                } else {
                    StatusLevel::Warn
                },
            ))
            .await;

            if result.canceled {
                canceled = true;
            }
            if result.error.is_some() {
                // Stop scheduling new steps; already-dispatched workers are
                // drained and their observations still recorded.
                halt = true;
                if halted_step.is_none() {
                    halted_step = Some(observation.id.clone());
                    last_error = result.error.clone();
                }
            }
            results.push(observation);
        }

        *self.active_plan_cancel.lock().unwrap() = None;
        canceled = canceled || plan_cancel.is_cancelled();

        let mut payload = PlanObservationPayload {
            summary: execution_summary(
                &results,
                last_error.as_deref(),
                halted_step.as_deref(),
                canceled,
            ),
            details: last_error.clone().unwrap_or_default(),
            canceled_by_human: canceled,
            operation_canceled: canceled,
            ..Default::default()
        };
        if let Some(last) = results.last() {
            payload.stdout = last.stdout.clone();
            payload.stderr = last.stderr.clone();
            payload.exit_code = last.exit_code;
            payload.truncated = last.truncated;
        }
        payload.plan_observation = results;
        payload.enforce_limits();

        self.emit(OutputEvent::status(payload.summary.clone(), StatusLevel::Info))
            .await;
        self.append_tool_payload(call, &payload);

        ExecutionReport { canceled }
    }

    // ── History helpers ───────────────────────────────────────────────────────

    fn append_tool_payload(&self, call: &ToolCall, payload: &PlanObservationPayload) {
        let name = if call.name.is_empty() {
            PLAN_TOOL_NAME
        } else {
            call.name.as_str()
        };
        let content = serde_json::to_string(payload).unwrap_or_else(|e| {
            warn!("failed to serialize observation payload: {e}");
            format!("{{\"summary\":\"{}\"}}", payload.summary)
        });
        self.history
            .append(ChatMessage::tool(call.id.clone(), name, content));
    }

    fn append_note_observation(&self, call: &ToolCall, summary: &str) {
        let payload = PlanObservationPayload {
            summary: summary.to_string(),
            ..Default::default()
        };
        self.append_tool_payload(call, &payload);
    }

    // ── Emission ──────────────────────────────────────────────────────────────

    /// Ask the user for input — or, in hands-free mode with an auto-reply
    /// configured, synthesize the user's answer instead.
    async fn request_input(&self, message: impl Into<String>) {
        if self.config.runtime.hands_free {
            if let Some(reply) = &self.config.runtime.hands_free_auto_reply {
                debug!("hands-free auto-reply instead of input request");
                let _ = self.inputs_tx.try_send(InputEvent::Prompt(reply.clone()));
                return;
            }
        }
        self.emit(OutputEvent::RequestInput(message.into())).await;
    }

    /// Emit an output event, honouring the closed latch and the emit
    /// timeout (an undrained queue drops the event rather than stalling the
    /// pass loop).
    async fn emit(&self, event: OutputEvent) {
        if self.is_closed() {
            return;
        }
        match self.emit_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.outputs_tx.send(event))
                    .await
                    .is_err()
                {
                    warn!("output queue full; event dropped after emit timeout");
                }
            }
            None => {
                let _ = self.outputs_tx.send(event).await;
            }
        }
    }

    /// Non-blocking emission for contexts holding a lock.
    fn emit_sync(&self, event: OutputEvent) {
        if self.is_closed() {
            return;
        }
        let _ = self.outputs_tx.try_send(event);
    }
}

struct WorkingGuard<'a>(&'a StdMutex<bool>);

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap() = false;
    }
}

/// Summary line for one plan execution.
fn execution_summary(
    results: &[StepObservation],
    error: Option<&str>,
    halted_step: Option<&str>,
    canceled: bool,
) -> String {
    if canceled {
        return match halted_step {
            Some(id) => format!("Execution canceled during step {id}."),
            None => "Execution canceled.".to_string(),
        };
    }
    match (results.is_empty(), error) {
        (true, None) => "No plan steps were executed.".into(),
        (true, Some(_)) => "Failed before executing plan steps.".into(),
        (false, Some(_)) => format!(
            "Execution halted during step {}.",
            halted_step.unwrap_or("unknown")
        ),
        (false, None) => format!("Executed {} plan step(s).", results.len()),
    }
}

fn print_event(event: &OutputEvent) {
    match event {
        OutputEvent::AssistantDelta(delta) => {
            use std::io::Write;
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        OutputEvent::AssistantMessage { message, .. } => {
            if !message.is_empty() {
                println!("\n{message}");
            }
        }
        OutputEvent::Status { message, level } => eprintln!("[{level}] {message}"),
        OutputEvent::Error(message) => eprintln!("[error] {message}"),
        OutputEvent::RequestInput(message) => println!("\n? {message}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
