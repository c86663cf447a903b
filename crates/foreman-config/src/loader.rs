// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Layered configuration loading.
//!
//! Three layers are consulted, lowest precedence first: the system layer
//! (`/etc/foreman`), the user layer (the platform config directory), and the
//! workspace layer (`.foreman/` or a bare `foreman.yaml` in the cwd).  Each
//! layer contributes at most one file — the first spelling that exists —
//! and later layers override earlier ones key by key.  An explicit path
//! (the `--config` flag) is applied on top and, unlike the discovered
//! layers, must exist.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Load the effective configuration.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged: Option<serde_yaml::Value> = None;

    for layer in discovered_layers() {
        let Some(path) = layer.first_existing() else {
            continue;
        };
        let value = read_layer(&path)?;
        debug!(layer = layer.name, path = %path.display(), "applying config layer");
        merged = Some(apply_layer(merged, value));
    }

    if let Some(path) = explicit {
        let value = read_layer(path)?;
        debug!(path = %path.display(), "applying explicit config");
        merged = Some(apply_layer(merged, value));
    }

    match merged {
        None => Ok(Config::default()),
        Some(value) => Ok(serde_yaml::from_value(value).unwrap_or_default()),
    }
}

/// One precedence level with its candidate file spellings.
struct Layer {
    name: &'static str,
    candidates: Vec<PathBuf>,
}

impl Layer {
    fn first_existing(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|p| p.is_file()).cloned()
    }
}

/// Both accepted spellings of a config file in `dir`.
fn spellings(dir: &Path) -> Vec<PathBuf> {
    vec![dir.join("config.yaml"), dir.join("config.yml")]
}

fn discovered_layers() -> Vec<Layer> {
    let mut layers = vec![Layer {
        name: "system",
        candidates: spellings(Path::new("/etc/foreman")),
    }];

    let mut user_candidates = Vec::new();
    if let Some(base) = dirs::config_dir() {
        user_candidates.extend(spellings(&base.join("foreman")));
    }
    if let Some(home) = dirs::home_dir() {
        user_candidates.extend(spellings(&home.join(".config/foreman")));
    }
    layers.push(Layer {
        name: "user",
        candidates: user_candidates,
    });

    layers.push(Layer {
        name: "workspace",
        candidates: vec![
            PathBuf::from(".foreman/config.yaml"),
            PathBuf::from(".foreman/config.yml"),
            PathBuf::from("foreman.yaml"),
            PathBuf::from("foreman.yml"),
        ],
    });

    layers
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn apply_layer(base: Option<serde_yaml::Value>, upper: serde_yaml::Value) -> serde_yaml::Value {
    match base {
        None => upper,
        Some(lower) => overlay(lower, upper),
    }
}

/// Merge `upper` over `lower`.  Mappings combine recursively; any other
/// value pairing resolves to the upper layer's value.
fn overlay(lower: serde_yaml::Value, upper: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (lower, upper) {
        (Value::Mapping(mut lower), Value::Mapping(upper)) => {
            for (key, value) in upper {
                let merged = match lower.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                lower.insert(key, merged);
            }
            Value::Mapping(lower)
        }
        (_, upper) => upper,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    // ── Overlay semantics ─────────────────────────────────────────────────────

    #[test]
    fn upper_scalar_replaces_lower() {
        let merged = overlay(yaml("passes: 1"), yaml("passes: 9"));
        assert_eq!(merged["passes"].as_i64(), Some(9));
    }

    #[test]
    fn keys_absent_from_upper_survive() {
        let merged = overlay(yaml("a: 1\nb: 2"), yaml("b: 3"));
        assert_eq!(merged["a"].as_i64(), Some(1));
        assert_eq!(merged["b"].as_i64(), Some(3));
    }

    #[test]
    fn nested_mappings_merge_key_by_key() {
        let lower = yaml("planner:\n  model: gpt-4o\n  api_base_url: http://lower");
        let upper = yaml("planner:\n  model: gpt-4o-mini");
        let merged = overlay(lower, upper);
        assert_eq!(merged["planner"]["model"].as_str(), Some("gpt-4o-mini"));
        assert_eq!(
            merged["planner"]["api_base_url"].as_str(),
            Some("http://lower")
        );
    }

    #[test]
    fn mapping_over_scalar_takes_the_mapping() {
        let merged = overlay(yaml("x: 5"), yaml("x:\n  nested: true"));
        assert_eq!(merged["x"]["nested"].as_bool(), Some(true));
    }

    #[test]
    fn apply_layer_uses_first_value_as_base() {
        let first = apply_layer(None, yaml("a: 1"));
        let second = apply_layer(Some(first), yaml("b: 2"));
        assert_eq!(second["a"].as_i64(), Some(1));
        assert_eq!(second["b"].as_i64(), Some(2));
    }

    // ── Layer discovery ───────────────────────────────────────────────────────

    #[test]
    fn first_existing_prefers_the_yaml_spelling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "a: 1").unwrap();
        std::fs::write(dir.path().join("config.yml"), "a: 2").unwrap();
        let layer = Layer {
            name: "test",
            candidates: spellings(dir.path()),
        };
        let picked = layer.first_existing().unwrap();
        assert!(picked.ends_with("config.yaml"));
    }

    #[test]
    fn first_existing_falls_back_to_yml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yml"), "a: 2").unwrap();
        let layer = Layer {
            name: "test",
            candidates: spellings(dir.path()),
        };
        let picked = layer.first_existing().unwrap();
        assert!(picked.ends_with("config.yml"));
    }

    #[test]
    fn empty_layer_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layer = Layer {
            name: "test",
            candidates: spellings(dir.path()),
        };
        assert!(layer.first_existing().is_none());
    }

    // ── load() ────────────────────────────────────────────────────────────────

    #[test]
    fn explicit_path_must_exist() {
        let missing = Path::new("/tmp/foreman_no_such_config_file.yaml");
        assert!(load(Some(missing)).is_err());
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "planner:\n  model: layered-model\nruntime:\n  max_passes: 4").unwrap();
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.planner.model, "layered-model");
        assert_eq!(config.runtime.max_passes, 4);
    }

    #[test]
    fn unparseable_explicit_file_is_an_error() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, ": not [ yaml").unwrap();
        assert!(load(Some(file.path())).is_err());
    }
}
