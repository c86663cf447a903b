// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use foreman_core::{OutputEvent, Runtime};
use foreman_exec::CommandRegistry;
use foreman_model::{HttpPlannerClient, PlannerClient};
use foreman_plan::plan_tool_spec;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = foreman_config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    let api_key = config.resolve_api_key();
    let planner: Arc<dyn PlannerClient> = Arc::new(HttpPlannerClient::new(
        &config.planner.api_base_url,
        api_key,
        config.planner.model.clone(),
        config.planner.reasoning_effort.clone(),
        plan_tool_spec(),
    ));

    let one_shot = cli.prompt.clone();
    let runtime = Runtime::new(config, planner, CommandRegistry::default())?;

    let ctx = CancellationToken::new();
    spawn_interrupt_handler(&runtime);

    match one_shot {
        Some(prompt) => run_one_shot(&runtime, ctx, prompt).await,
        None => runtime.run(ctx).await,
    }
}

/// Run a single prompt to its first input request, printing events as they
/// arrive, then shut the runtime down.
async fn run_one_shot(
    runtime: &Arc<Runtime>,
    ctx: CancellationToken,
    prompt: String,
) -> anyhow::Result<()> {
    let mut outputs = runtime
        .take_outputs()
        .ok_or_else(|| anyhow::anyhow!("output receiver already taken"))?;

    let driver = tokio::spawn({
        let runtime = Arc::clone(runtime);
        async move { runtime.run(ctx).await }
    });
    runtime.submit_prompt(prompt).await;

    while let Some(event) = outputs.recv().await {
        let done = matches!(event, OutputEvent::RequestInput(_));
        print_event(&event);
        if done {
            break;
        }
    }
    runtime.close();
    match driver.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("runtime task failed: {e}")),
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

fn spawn_interrupt_handler(runtime: &Arc<Runtime>) {
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            runtime.shutdown("interrupted");
        }
    });
}

/// Route tracing to stderr.  Quiet by default so piped output stays clean;
/// `--verbose` (or RUST_LOG) opts in.
fn init_logging(verbose: bool) {
    let default_filter = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
