// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Events the host feeds into the runtime.
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// A user instruction; starts a new pass sequence.
    Prompt(String),
    /// Interrupt the currently executing plan.
    Cancel(String),
    /// Stop the runtime.
    Shutdown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusLevel::Info => "info",
            StatusLevel::Warn => "warn",
            StatusLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Events the runtime emits to the host.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Streamed fragment of the assistant's visible text.
    AssistantDelta(String),
    /// The complete assistant turn, with its reasoning trace.
    AssistantMessage {
        message: String,
        reasoning: Vec<String>,
    },
    Status {
        message: String,
        level: StatusLevel,
    },
    Error(String),
    /// The runtime is waiting for the user to answer.
    RequestInput(String),
}

impl OutputEvent {
    pub fn status(message: impl Into<String>, level: StatusLevel) -> Self {
        Self::Status {
            message: message.into(),
            level,
        }
    }
}
