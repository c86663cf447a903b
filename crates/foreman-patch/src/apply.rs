// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hunk matching and patch application.
//!
//! Matching starts at a per-file cursor (0 for the first hunk, else the end
//! of the previous match) so hunks apply in document order; a miss falls
//! back to scanning from the top.  When literal comparison fails, a second
//! pass compares lines with all whitespace removed.

use tracing::debug;

use crate::error::PatchError;
use crate::parser::{parse_patch, Hunk, PatchOp};
use crate::workspace::Workspace;

/// Parse `input` and apply every operation to `ws`.
///
/// Returns the change summary, one `A/M/D <path>` line per operation in
/// patch order.  The first failing operation aborts the walk; operations
/// already applied are not rolled back (the planner sees the summary of the
/// failure and the untouched remainder).
pub fn apply_patch(ws: &mut dyn Workspace, input: &str) -> Result<String, PatchError> {
    let ops = parse_patch(input)?;
    let mut summary = Vec::with_capacity(ops.len());

    for op in ops {
        match op {
            PatchOp::Add { path, hunks } => {
                if ws.exists(&path) {
                    return Err(PatchError::AlreadyExists(path));
                }
                let lines: Vec<&str> = hunks.iter().flat_map(|h| h.after()).collect();
                let mut content = lines.join("\n");
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                ws.write(&path, &content)?;
                debug!(path = %path, "added file");
                summary.push(format!("A {path}"));
            }
            PatchOp::Update {
                path,
                move_to,
                hunks,
            } => {
                if !ws.exists(&path) {
                    return Err(PatchError::NotFound(path));
                }
                let original = ws.read(&path)?;
                let updated = apply_hunks(&path, &original, &hunks)?;
                ws.write(&path, &updated)?;
                let final_path = match move_to {
                    Some(target) => {
                        ws.rename(&path, &target)?;
                        target
                    }
                    None => path,
                };
                debug!(path = %final_path, "updated file");
                summary.push(format!("M {final_path}"));
            }
            PatchOp::Delete { path } => {
                if !ws.exists(&path) {
                    return Err(PatchError::NotFound(path));
                }
                ws.remove(&path)?;
                debug!(path = %path, "deleted file");
                summary.push(format!("D {path}"));
            }
        }
    }

    if summary.is_empty() {
        Ok("(no changes applied)".into())
    } else {
        Ok(summary.join("\n"))
    }
}

/// Apply all hunks of one update operation to `original`.
pub fn apply_hunks(path: &str, original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    let had_newline = original.ends_with('\n');
    let mut cursor = 0usize;
    let mut applied: Vec<usize> = Vec::new();

    for (index, hunk) in hunks.iter().enumerate() {
        let before = hunk.before();
        let after = hunk.after();

        if before.is_empty() {
            // Pure insertion: append at end-of-file, stepping in front of a
            // trailing blank line when one exists.
            let mut pos = lines.len();
            if pos > 0 && lines[pos - 1].is_empty() {
                pos -= 1;
            }
            let insert: Vec<String> = after.iter().map(|s| s.to_string()).collect();
            cursor = pos + insert.len();
            lines.splice(pos..pos, insert);
            applied.push(index + 1);
            continue;
        }

        let Some(pos) = find_match(&lines, &before, cursor, hunk.eof) else {
            return Err(PatchError::HunkNotFound {
                path: path.to_string(),
                original: original.to_string(),
                applied,
                hunk_lines: hunk.raw.clone(),
            });
        };

        // Rebuild the matched region: context lines keep the file's own
        // text (a whitespace-tolerant match must not rewrite indentation),
        // removed lines drop out, added lines come from the hunk.
        let mut replacement: Vec<String> = Vec::with_capacity(after.len());
        let mut orig = pos;
        for line in &hunk.lines {
            match line {
                crate::parser::HunkLine::Context(_) => {
                    replacement.push(lines[orig].clone());
                    orig += 1;
                }
                crate::parser::HunkLine::Remove(_) => {
                    orig += 1;
                }
                crate::parser::HunkLine::Add(s) => replacement.push(s.clone()),
            }
        }
        cursor = pos + replacement.len();
        lines.splice(pos..pos + before.len(), replacement);
        applied.push(index + 1);
    }

    let mut result = lines.join("\n");
    if had_newline {
        if !result.is_empty() && !result.ends_with('\n') {
            result.push('\n');
        }
    } else if result.ends_with('\n') {
        result.pop();
    }
    Ok(result)
}

/// Locate `before` in `lines`.
///
/// Pass order: literal from the cursor, whitespace-stripped from the cursor,
/// then both again from the top of the file.  EOF-flagged hunks only accept
/// positions whose match reaches the file tail (blank lines may follow).
fn find_match(lines: &[String], before: &[&str], cursor: usize, eof: bool) -> Option<usize> {
    scan(lines, before, cursor, eof, literal_eq)
        .or_else(|| scan(lines, before, cursor, eof, loose_eq))
        .or_else(|| (cursor > 0).then(|| scan(lines, before, 0, eof, literal_eq)).flatten())
        .or_else(|| (cursor > 0).then(|| scan(lines, before, 0, eof, loose_eq)).flatten())
}

fn scan(
    lines: &[String],
    before: &[&str],
    from: usize,
    eof: bool,
    eq: fn(&str, &str) -> bool,
) -> Option<usize> {
    if before.len() > lines.len() || from > lines.len() - before.len() {
        return None;
    }
    for i in from..=(lines.len() - before.len()) {
        let matched = before
            .iter()
            .enumerate()
            .all(|(k, expected)| eq(&lines[i + k], expected));
        if !matched {
            continue;
        }
        if eof && !tail_anchored(lines, i + before.len()) {
            continue;
        }
        return Some(i);
    }
    None
}

fn literal_eq(a: &str, b: &str) -> bool {
    a == b
}

/// Compare with every whitespace rune removed from both sides.
fn loose_eq(a: &str, b: &str) -> bool {
    a.chars()
        .filter(|c| !c.is_whitespace())
        .eq(b.chars().filter(|c| !c.is_whitespace()))
}

fn tail_anchored(lines: &[String], end: usize) -> bool {
    lines[end..]
        .iter()
        .all(|l| l.chars().all(char::is_whitespace))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
