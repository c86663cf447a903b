// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

/// Fallback budget for models not in the table.
const DEFAULT_BUDGET: (usize, f32) = (128_000, 0.85);

/// Per-model (context ceiling, compaction trigger fraction).
///
/// Matched by prefix so dated snapshots ("gpt-4o-2024-11-20") resolve to
/// their family entry.  Longest prefix wins.
const MODEL_BUDGETS: &[(&str, usize, f32)] = &[
    ("gpt-4o-mini", 128_000, 0.85),
    ("gpt-4o", 128_000, 0.85),
    ("gpt-4.1", 1_000_000, 0.90),
    ("gpt-5", 272_000, 0.90),
    ("o3", 200_000, 0.90),
    ("o4-mini", 200_000, 0.90),
];

/// Resolve the (max context tokens, compaction fraction) pair for a model
/// identifier.  Unknown models get the conservative 128 000 × 0.85 default.
pub fn context_budget_for(model: &str) -> (usize, f32) {
    let mut best: Option<(&str, usize, f32)> = None;
    for &(prefix, max, pct) in MODEL_BUDGETS {
        if model.starts_with(prefix) {
            match best {
                Some((p, _, _)) if p.len() >= prefix.len() => {}
                _ => best = Some((prefix, max, pct)),
            }
        }
    }
    best.map(|(_, max, pct)| (max, pct)).unwrap_or(DEFAULT_BUDGET)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
