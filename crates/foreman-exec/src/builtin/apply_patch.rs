// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use tracing::debug;

use foreman_patch::{apply_patch, FsWorkspace};

use crate::invocation::Invocation;
use crate::registry::{CommandContext, CommandOutcome, InternalCommand};

/// Built-in `apply_patch` command.
///
/// The invocation body is the literal patch payload:
///
/// ```text
/// apply_patch
/// *** Begin Patch
/// *** Update File: src/lib.rs
/// @@
/// -old line
/// +new line
/// *** End Patch
/// ```
///
/// Paths inside the payload resolve against the step's working directory.
/// On success stdout carries one `A/M/D <path>` line per change; failures
/// land on stderr with a non-zero exit code, rendered so the planner can
/// regenerate a matching patch.
pub struct ApplyPatchCommand;

#[async_trait]
impl InternalCommand for ApplyPatchCommand {
    fn name(&self) -> &str {
        "apply_patch"
    }

    async fn run(&self, invocation: &Invocation, ctx: &CommandContext) -> CommandOutcome {
        let payload = invocation.rest.trim();
        if payload.is_empty() {
            return CommandOutcome::failure("apply_patch: missing patch payload", 2);
        }
        debug!(cwd = %ctx.cwd.display(), "applying patch");
        let mut workspace = FsWorkspace::new(&ctx.cwd);
        match apply_patch(&mut workspace, payload) {
            Ok(summary) => CommandOutcome::success(summary),
            Err(e) => CommandOutcome::failure(e.render(), 1),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::invocation::parse_invocation;

    fn ctx(dir: &tempfile::TempDir) -> CommandContext {
        CommandContext {
            cwd: PathBuf::from(dir.path()),
            cancel: CancellationToken::new(),
        }
    }

    fn invocation(patch_body: &str) -> Invocation {
        parse_invocation(&format!("apply_patch\n{patch_body}")).unwrap()
    }

    #[tokio::test]
    async fn applies_an_add_patch() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(
            "*** Begin Patch\n*** Add File: hello.txt\n+hi there\n*** End Patch",
        );
        let out = ApplyPatchCommand.run(&inv, &ctx(&dir)).await;
        assert_eq!(out.exit_code, 0, "{}", out.stderr);
        assert_eq!(out.stdout, "A hello.txt");
        let content = std::fs::read_to_string(dir.path().join("hello.txt")).unwrap();
        assert_eq!(content, "hi there\n");
    }

    #[tokio::test]
    async fn update_and_move_reports_new_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("old")).unwrap();
        std::fs::write(dir.path().join("old/name.txt"), "from\n").unwrap();

        let inv = invocation(
            "*** Begin Patch\n*** Update File: old/name.txt\n\
             *** Move to: renamed/dir/name.txt\n@@\n-from\n+to\n*** End Patch",
        );
        let out = ApplyPatchCommand.run(&inv, &ctx(&dir)).await;
        assert_eq!(out.exit_code, 0, "{}", out.stderr);
        assert!(out.stdout.contains("M renamed/dir/name.txt"));
        assert!(!dir.path().join("old/name.txt").exists());
        let moved = std::fs::read_to_string(dir.path().join("renamed/dir/name.txt")).unwrap();
        assert_eq!(moved, "to\n");
    }

    #[tokio::test]
    async fn hunk_mismatch_renders_full_context_on_stderr() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "actual\n").unwrap();
        let inv = invocation(
            "*** Begin Patch\n*** Update File: f.txt\n@@\n-expected\n+new\n*** End Patch",
        );
        let out = ApplyPatchCommand.run(&inv, &ctx(&dir)).await;
        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.contains("Offending hunk:"));
        assert!(out.stderr.contains("Full content of file: ./f.txt::::"));
    }

    #[tokio::test]
    async fn missing_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let inv = parse_invocation("apply_patch").unwrap();
        let out = ApplyPatchCommand.run(&inv, &ctx(&dir)).await;
        assert_eq!(out.exit_code, 2);
        assert!(out.stderr.contains("missing patch payload"));
    }
}
