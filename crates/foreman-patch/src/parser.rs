// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parser for the patch payload grammar.
//!
//! ```text
//! *** Begin Patch
//! ( *** Add File: <path>        hunks
//! | *** Update File: <path>     [ *** Move to: <path> ]  hunks
//! | *** Delete File: <path>                                 )*
//! *** End Patch
//! ```
//!
//! Parsing is a straight line-walk with explicit early returns; every
//! rejection is a [`PatchError`] value, never control flow by panic.

use crate::error::PatchError;

const BEGIN: &str = "*** Begin Patch";
const END: &str = "*** End Patch";
const ADD: &str = "*** Add File: ";
const UPDATE: &str = "*** Update File: ";
const DELETE: &str = "*** Delete File: ";
const MOVE_TO: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";
const NO_NEWLINE: &str = "\\ No newline at end of file";

/// One line inside a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// A contiguous before/after block within a file operation.
#[derive(Debug, Clone, Default)]
pub struct Hunk {
    /// Free text following `@@` on the header line.
    pub header: String,
    pub lines: Vec<HunkLine>,
    /// Set by `*** End of File`: the match must sit at the file's tail.
    pub eof: bool,
    /// Raw source lines (header included) kept for error reporting.
    pub raw: Vec<String>,
}

impl Hunk {
    /// Lines the file must currently contain at the match site.
    pub fn before(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines that replace the matched span.
    pub fn after(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

/// One file operation in a patch.
#[derive(Debug, Clone)]
pub enum PatchOp {
    Add { path: String, hunks: Vec<Hunk> },
    Update {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
    },
    Delete { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Update { path, .. }
            | PatchOp::Delete { path } => path,
        }
    }
}

/// Parse a full patch payload into its ordered file operations.
pub fn parse_patch(input: &str) -> Result<Vec<PatchOp>, PatchError> {
    let start = input.find(BEGIN).ok_or(PatchError::MissingBegin)?;
    let end = input.find(END).ok_or(PatchError::MissingEnd)?;
    if end <= start {
        return Err(PatchError::Malformed(
            "'*** End Patch' appears before '*** Begin Patch'".into(),
        ));
    }

    let body = &input[start + BEGIN.len()..end];
    let lines: Vec<&str> = body.lines().collect();
    let mut ops = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if line.trim().is_empty() {
            i += 1;
            continue;
        }
        if let Some(path) = line.strip_prefix(ADD) {
            let path = path.trim().to_string();
            if path.is_empty() {
                return Err(PatchError::Malformed("empty path after 'Add File:'".into()));
            }
            let (hunks, next) = collect_hunks(&lines, i + 1)?;
            ops.push(PatchOp::Add { path, hunks });
            i = next;
        } else if let Some(path) = line.strip_prefix(UPDATE) {
            let path = path.trim().to_string();
            if path.is_empty() {
                return Err(PatchError::Malformed(
                    "empty path after 'Update File:'".into(),
                ));
            }
            let mut move_to = None;
            let mut j = i + 1;
            if let Some(next_line) = lines.get(j) {
                if let Some(target) = next_line.strip_prefix(MOVE_TO) {
                    let target = target.trim().to_string();
                    if target.is_empty() {
                        return Err(PatchError::Malformed("empty path after 'Move to:'".into()));
                    }
                    move_to = Some(target);
                    j += 1;
                }
            }
            let (hunks, next) = collect_hunks(&lines, j)?;
            ops.push(PatchOp::Update {
                path,
                move_to,
                hunks,
            });
            i = next;
        } else if let Some(path) = line.strip_prefix(DELETE) {
            let path = path.trim().to_string();
            if path.is_empty() {
                return Err(PatchError::Malformed(
                    "empty path after 'Delete File:'".into(),
                ));
            }
            ops.push(PatchOp::Delete { path });
            i += 1;
        } else {
            return Err(PatchError::Malformed(format!(
                "unexpected line outside a file section: {line:?}"
            )));
        }
    }

    Ok(ops)
}

/// Collect the hunks belonging to one file section, starting at `start`.
/// Returns the hunks and the index of the first line of the next section.
///
/// A leading body without an `@@` header (the common shape of Add sections)
/// is treated as a single headerless hunk.
fn collect_hunks(lines: &[&str], start: usize) -> Result<(Vec<Hunk>, usize), PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut i = start;

    while i < lines.len() {
        let line = lines[i];

        if is_section_start(line) {
            break;
        }

        if let Some(header) = line.strip_prefix("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            current = Some(Hunk {
                header: header.trim().to_string(),
                raw: vec![line.to_string()],
                ..Default::default()
            });
            i += 1;
            continue;
        }

        if line == EOF_MARKER {
            let hunk = current.get_or_insert_with(Hunk::default);
            hunk.eof = true;
            hunk.raw.push(line.to_string());
            i += 1;
            continue;
        }

        if line == NO_NEWLINE {
            // Newline bookkeeping is resolved at commit time from the
            // original content; the marker only needs to survive for error
            // reporting.
            if let Some(hunk) = current.as_mut() {
                hunk.raw.push(line.to_string());
            }
            i += 1;
            continue;
        }

        let parsed = if let Some(rest) = line.strip_prefix('+') {
            HunkLine::Add(rest.to_string())
        } else if let Some(rest) = line.strip_prefix('-') {
            HunkLine::Remove(rest.to_string())
        } else if let Some(rest) = line.strip_prefix(' ') {
            HunkLine::Context(rest.to_string())
        } else if line.is_empty() {
            // An entirely empty source line is a context line for an empty
            // file line.
            HunkLine::Context(String::new())
        } else {
            return Err(PatchError::Malformed(format!(
                "unexpected hunk line: {line:?}"
            )));
        };

        let hunk = current.get_or_insert_with(Hunk::default);
        hunk.raw.push(line.to_string());
        hunk.lines.push(parsed);
        i += 1;
    }

    if let Some(h) = current.take() {
        hunks.push(h);
    }
    Ok((hunks, i))
}

fn is_section_start(line: &str) -> bool {
    line.starts_with(ADD)
        || line.starts_with(UPDATE)
        || line.starts_with(DELETE)
        || line.starts_with(MOVE_TO)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
