// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

use foreman_config::Config;

/// An autonomous software-engineering agent runtime.
///
/// Without flags, foreman reads prompts from stdin and streams the
/// assistant's output to stdout until an exit command is entered.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Run a single prompt and exit when the runtime asks for input.
    #[arg(long, short = 'p')]
    pub prompt: Option<String>,

    /// Planner model override.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Run unattended; the initial prompt is synthesized from --topic.
    #[arg(long)]
    pub hands_free: bool,

    /// Topic for the hands-free initial prompt.
    #[arg(long)]
    pub topic: Option<String>,

    /// Reply synthesized whenever the runtime would ask for input.
    #[arg(long)]
    pub auto_reply: Option<String>,

    /// Hard cap on passes per prompt (0 disables).
    #[arg(long)]
    pub max_passes: Option<u32>,

    /// Log to stderr (RUST_LOG still narrows the filter).
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl Cli {
    /// Fold the CLI flags over the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.planner.model = model.clone();
        }
        if self.hands_free {
            config.runtime.hands_free = true;
        }
        if let Some(topic) = &self.topic {
            config.runtime.hands_free_topic = Some(topic.clone());
        }
        if let Some(reply) = &self.auto_reply {
            config.runtime.hands_free_auto_reply = Some(reply.clone());
        }
        if let Some(max) = self.max_passes {
            config.runtime.max_passes = max;
        }
        if self.prompt.is_some() {
            // One-shot mode drives the queues itself.
            config.runtime.disable_input_reader = true;
            config.runtime.disable_output_forwarding = true;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
