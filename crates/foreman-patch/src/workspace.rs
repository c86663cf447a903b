// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Storage backends for the patch engine.
//!
//! The apply algorithm is identical against a real directory tree and an
//! in-memory map; only this interface differs.  Paths are workspace-relative
//! strings exactly as they appear in the patch payload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::PatchError;

pub trait Workspace {
    fn exists(&self, path: &str) -> bool;
    fn read(&self, path: &str) -> Result<String, PatchError>;
    /// Write `content`, creating missing parent directories.  Writing over
    /// an existing file must preserve its mode (including setuid/setgid/
    /// sticky bits).
    fn write(&mut self, path: &str, content: &str) -> Result<(), PatchError>;
    /// Move a file, creating missing parent directories at the destination
    /// and preserving the file mode.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), PatchError>;
    fn remove(&mut self, path: &str) -> Result<(), PatchError>;
}

// ─── Filesystem backend ───────────────────────────────────────────────────────

/// Workspace rooted at a directory on disk.
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn ensure_parent(&self, full: &Path, path: &str) -> Result<(), PatchError> {
        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| PatchError::Io {
                    path: path.to_string(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

impl Workspace for FsWorkspace {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn read(&self, path: &str) -> Result<String, PatchError> {
        std::fs::read_to_string(self.resolve(path)).map_err(|source| PatchError::Io {
            path: path.to_string(),
            source,
        })
    }

    fn write(&mut self, path: &str, content: &str) -> Result<(), PatchError> {
        let full = self.resolve(path);
        self.ensure_parent(&full, path)?;
        // An in-place write truncates the existing inode, so the previous
        // mode (setuid bits included) survives untouched.
        std::fs::write(&full, content).map_err(|source| PatchError::Io {
            path: path.to_string(),
            source,
        })
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), PatchError> {
        let dst = self.resolve(to);
        self.ensure_parent(&dst, to)?;
        // rename(2) keeps the inode, so the mode travels with the file.
        std::fs::rename(self.resolve(from), dst).map_err(|source| PatchError::Io {
            path: from.to_string(),
            source,
        })
    }

    fn remove(&mut self, path: &str) -> Result<(), PatchError> {
        std::fs::remove_file(self.resolve(path)).map_err(|source| PatchError::Io {
            path: path.to_string(),
            source,
        })
    }
}

// ─── In-memory backend ────────────────────────────────────────────────────────

/// Workspace over a path→content map, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemWorkspace {
    files: BTreeMap<String, String>,
}

impl MemWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }
}

impl Workspace for MemWorkspace {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn read(&self, path: &str) -> Result<String, PatchError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| PatchError::NotFound(path.to_string()))
    }

    fn write(&mut self, path: &str, content: &str) -> Result<(), PatchError> {
        self.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), PatchError> {
        let content = self
            .files
            .remove(from)
            .ok_or_else(|| PatchError::NotFound(from.to_string()))?;
        self.files.insert(to.to_string(), content);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), PatchError> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| PatchError::NotFound(path.to_string()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
