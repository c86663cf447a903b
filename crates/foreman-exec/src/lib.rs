// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod builtin;
mod executor;
mod invocation;
mod registry;

pub use builtin::ApplyPatchCommand;
pub use executor::{ExecResult, Executor, DEFAULT_TIMEOUT_SECS, FAILURE_LOG_DIR};
pub use invocation::{parse_invocation, tokenize, ArgValue, Invocation, InvocationError};
pub use registry::{CommandContext, CommandOutcome, CommandRegistry, InternalCommand};
