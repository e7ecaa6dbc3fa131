// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Intelligence side-channels: failure root-cause analysis, predictive
//! health, and shadow learning from user corrections.
//!
//! All of this is advisory.  Every entry point is fail-safe — callers get
//! a neutral empty contribution on any internal miss.

use legate_index::extract_keywords;
use legate_memory::{GlobalStore, ProjectStore};

use crate::validate::Validation;

/// Classify a failed delegation into a coarse root cause and record it.
pub fn analyze_failure(store: &mut ProjectStore, task: &str, validation: &Validation) {
    let root_cause = if validation.truncated {
        "output_budget_exceeded"
    } else if !validation.todos_missing.is_empty() {
        if validation.todos_missing.len() > 3 {
            "template_too_large"
        } else {
            "symbols_dropped"
        }
    } else if validation
        .issues
        .iter()
        .any(|i| i.to_lowercase().contains("innerhtml") || i.contains("const"))
    {
        "style_rule_breach"
    } else {
        "unclassified"
    };

    let description = validation
        .issues
        .first()
        .cloned()
        .unwrap_or_else(|| "validation failed without issues".to_string());
    store.add_failure_analysis(root_cause, &description, task);
    store.save();
}

/// Predicted success probability for a task, from keyword history and mode
/// performance.  Neutral 0.5 when there is no history.
pub fn predict_success(global: &GlobalStore, task: &str, mode: &str) -> f64 {
    let keywords = extract_keywords(task);
    let mut scores: Vec<f64> = Vec::new();

    for kw in &keywords {
        if let Some(stat) = global.data.task_keyword_success.get(kw) {
            if stat.total > 0 {
                scores.push(stat.successes as f64 / stat.total as f64);
            }
        }
    }
    if let Some(mode_stat) = global.data.mode_stats.get(mode) {
        if mode_stat.total >= 2 {
            scores.push(mode_stat.successes as f64 / mode_stat.total as f64);
        }
    }

    if scores.is_empty() {
        return 0.5;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Shadow learning: compare what was generated with what the user kept.
///
/// Only coarse, high-signal patterns are recorded; anything else is
/// ignored rather than guessed at.
pub fn learn_from_diff(store: &mut ProjectStore, generated: &str, corrected: &str) {
    if generated == corrected {
        return;
    }

    let gen_const = generated.matches("const ").count();
    let cor_const = corrected.matches("const ").count();
    let cor_let = corrected.matches("let ").count();
    if gen_const > cor_const && cor_let > 0 {
        store.add_shadow_correction("const_to_let", "el usuario reemplaza const por let");
    }

    if generated.contains("innerHTML") && !corrected.contains("innerHTML") {
        store.add_shadow_correction(
            "innerhtml_removed",
            "el usuario elimina innerHTML del codigo generado",
        );
    }

    let gen_lines = generated.lines().count();
    let cor_lines = corrected.lines().count();
    if cor_lines * 2 < gen_lines && gen_lines > 20 {
        store.add_shadow_correction(
            "heavy_pruning",
            "el usuario recorta mas de la mitad del codigo generado",
        );
    }

    store.save();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
