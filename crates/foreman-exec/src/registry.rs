// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::builtin::ApplyPatchCommand;
use crate::invocation::Invocation;

/// Execution context handed to every internal command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Effective working directory of the step.
    pub cwd: PathBuf,
    /// Cancellation scope of the active plan; long-running handlers must
    /// observe it.
    pub cancel: CancellationToken,
}

/// Result of one internal-command run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutcome {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }
}

/// An in-process command reachable through the agent-shell sentinel.
#[async_trait]
pub trait InternalCommand: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, invocation: &Invocation, ctx: &CommandContext) -> CommandOutcome;
}

/// Case-insensitive name → handler registry.
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn InternalCommand>>,
}

impl CommandRegistry {
    /// Empty registry; prefer [`CommandRegistry::default`] which carries the
    /// built-in command set.
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn register(&mut self, command: Arc<dyn InternalCommand>) {
        self.commands
            .insert(command.name().to_ascii_lowercase(), command);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InternalCommand>> {
        self.commands.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ApplyPatchCommand));
        registry
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCommand;

    #[async_trait]
    impl InternalCommand for EchoCommand {
        fn name(&self) -> &str {
            "Echo"
        }
        async fn run(&self, invocation: &Invocation, _ctx: &CommandContext) -> CommandOutcome {
            CommandOutcome::success(invocation.rest.clone())
        }
    }

    #[test]
    fn default_registry_includes_apply_patch() {
        let reg = CommandRegistry::default();
        assert!(reg.get("apply_patch").is_some());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut reg = CommandRegistry::empty();
        reg.register(Arc::new(EchoCommand));
        assert!(reg.get("echo").is_some());
        assert!(reg.get("ECHO").is_some());
        assert!(reg.get("Echo").is_some());
    }

    #[test]
    fn unknown_name_returns_none() {
        let reg = CommandRegistry::default();
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn registering_same_name_overwrites() {
        let mut reg = CommandRegistry::empty();
        reg.register(Arc::new(EchoCommand));
        reg.register(Arc::new(EchoCommand));
        assert_eq!(reg.names().len(), 1);
    }

    #[tokio::test]
    async fn registered_command_executes() {
        let mut reg = CommandRegistry::empty();
        reg.register(Arc::new(EchoCommand));
        let inv = crate::invocation::parse_invocation("echo hello").unwrap();
        let ctx = CommandContext {
            cwd: PathBuf::from("."),
            cancel: CancellationToken::new(),
        };
        let out = reg.get("echo").unwrap().run(&inv, &ctx).await;
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.exit_code, 0);
    }
}
