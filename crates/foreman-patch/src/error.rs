// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Failure modes of patch parsing and application.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("'*** Begin Patch' not found")]
    MissingBegin,
    #[error("'*** End Patch' not found")]
    MissingEnd,
    #[error("malformed patch: {0}")]
    Malformed(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("hunk did not match {path}")]
    HunkNotFound {
        path: String,
        /// File content at the time matching failed.
        original: String,
        /// 1-based numbers of the hunks already applied to this file.
        applied: Vec<usize>,
        /// Raw lines of the hunk that failed to match.
        hunk_lines: Vec<String>,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            PatchError::MissingBegin | PatchError::MissingEnd | PatchError::Malformed(_) => {
                "MALFORMED_PATCH"
            }
            PatchError::AlreadyExists(_) => "FILE_EXISTS",
            PatchError::NotFound(_) => "FILE_NOT_FOUND",
            PatchError::HunkNotFound { .. } => "HUNK_NOT_FOUND",
            PatchError::Io { .. } => "IO_ERROR",
        }
    }

    /// Render the error for the planner.
    ///
    /// `HUNK_NOT_FOUND` gets the long form: message, which hunks had already
    /// applied, the offending raw hunk, and the full file content so the
    /// planner can regenerate a matching patch.
    pub fn render(&self) -> String {
        match self {
            PatchError::HunkNotFound {
                path,
                original,
                applied,
                hunk_lines,
            } => {
                let applied_summary = if applied.is_empty() {
                    "none".to_string()
                } else {
                    applied
                        .iter()
                        .map(|n| n.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                format!(
                    "{self}\n\nApplied hunks: {applied_summary}\n\nOffending hunk:\n{}\n\n\
                     Full content of file: ./{path}::::\n{original}",
                    hunk_lines.join("\n"),
                )
            }
            other => other.to_string(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
