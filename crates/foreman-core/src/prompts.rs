// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The built-in system prompt.
//!
//! Hosts append environment-specific notes (installed toolchains, repository
//! conventions) through the `system_prompt_augment` option rather than by
//! replacing this text, so the tool contract stays consistent.

/// Base instructions given to the planner as the seed system message.
const BASE_PROMPT: &str = "\
You are an autonomous software engineering agent. You work towards the \
user's goal by repeatedly submitting a plan: a set of steps, each carrying \
one command, connected into a dependency graph.

Rules for every plan you submit:
- Respond ONLY by calling the plan tool. The `message` field is the text \
the user sees; keep it short and concrete.
- Each step needs a unique `id`, a human-readable `title`, and a `command`.
- `command.shell` is the OS shell to run under (for example \"/bin/bash\"), \
or the literal token \"agent\" to invoke a built-in command.
- Steps only run after every id listed in `waitingForId` has completed. \
Steps with no dependencies run in parallel; do not serialize steps that \
could run concurrently.
- Echo steps that already completed in an earlier plan with status \
\"completed\" so later steps may depend on them; never re-run them.
- After execution you receive one observation message per plan with the \
stdout, stderr and exit code of every step. Base your next plan on it.
- When the goal is met, or nothing remains to execute, submit an empty \
plan and summarize the outcome in `message`.
- Set `requireHumanInput` to true when you need an answer from the user \
before continuing.

Built-in commands (shell = \"agent\"):
- apply_patch — apply a patch to the workspace. Put the payload on the \
lines after the command name:
    apply_patch
    *** Begin Patch
    *** Update File: path/to/file
    @@
    -old line
    +new line
    *** End Patch
  Sections may also be `*** Add File:` / `*** Delete File:`, and an update \
may carry `*** Move to: <new path>` on the line after the file header.

Keep commands non-interactive; they run without a terminal. Prefer small \
steps whose output you actually need over large catch-all scripts.";

/// Compose the system prompt, appending the host's augmentation when set.
pub fn system_prompt(augment: Option<&str>) -> String {
    match augment {
        Some(extra) if !extra.trim().is_empty() => {
            format!("{BASE_PROMPT}\n\n{}", extra.trim())
        }
        _ => BASE_PROMPT.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_prompt_documents_the_tool_contract() {
        let p = system_prompt(None);
        assert!(p.contains("waitingForId"));
        assert!(p.contains("apply_patch"));
        assert!(p.contains("requireHumanInput"));
    }

    #[test]
    fn augment_is_appended() {
        let p = system_prompt(Some("Toolchains: rust 1.80, node 22"));
        assert!(p.ends_with("Toolchains: rust 1.80, node 22"));
        assert!(p.contains("autonomous software engineering agent"));
    }

    #[test]
    fn blank_augment_is_ignored() {
        assert_eq!(system_prompt(Some("   ")), system_prompt(None));
    }
}
