// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Post-delegation learning for the per-project store.
//!
//! Every completed delegation — success or failure — teaches the store
//! something: failures become error entries and feedback rules keyed to
//! well-known failure patterns; successes yield symbol-level patterns and
//! style conventions inferred from the generated code.

use std::sync::OnceLock;

use regex::Regex;

use legate_index::extract_keywords;

use crate::project::{DelegationRecord, ProjectStore};

/// A compact view of a validation result, decoupled from the validator
/// crate so learning stays at the bottom of the dependency graph.
#[derive(Debug, Clone, Default)]
pub struct ValidationFacts {
    pub truncated: bool,
    pub todos_missing: Vec<String>,
    pub issues: Vec<String>,
}

/// Digest a completed delegation into the project store and persist it.
///
/// Fail-safe by construction: every step only appends to in-memory state,
/// and the final save logs rather than propagates I/O errors.
pub fn learn_from_delegation(
    store: &mut ProjectStore,
    task: &str,
    mode: &str,
    success: bool,
    response: &str,
    validation: Option<&ValidationFacts>,
    duration_s: f64,
) {
    let summary = validation
        .map(|v| {
            let mut parts = Vec::new();
            if v.truncated {
                parts.push("truncated".to_string());
            }
            if !v.todos_missing.is_empty() {
                parts.push(format!("{} todos missing", v.todos_missing.len()));
            }
            parts.extend(v.issues.iter().take(3).cloned());
            parts.join("; ")
        })
        .unwrap_or_default();

    store.add_delegation(DelegationRecord {
        task: task.to_string(),
        mode: mode.to_string(),
        success,
        duration_s,
        validation_summary: summary,
        timestamp: chrono::Utc::now(),
    });

    if let Some(validation) = validation {
        if !success {
            let kind = if validation.truncated {
                "truncation"
            } else if !validation.todos_missing.is_empty() {
                "missing_todos"
            } else {
                "validation"
            };
            let message = validation
                .issues
                .first()
                .cloned()
                .unwrap_or_else(|| "validation failed".to_string());
            store.add_error(kind, &message, extract_keywords(task));
            learn_rules_from_failure(store, task, validation);
        }
    }

    if success && !response.is_empty() {
        learn_patterns_from_success(store, task, response);
        detect_conventions(store, response);
    }

    store.save();
}

/// Turn a failed validation into reusable feedback rules.
fn learn_rules_from_failure(store: &mut ProjectStore, task: &str, validation: &ValidationFacts) {
    let keywords = extract_keywords(task);

    if validation.truncated {
        store.add_feedback_rule(
            "truncation",
            "Este tipo de tarea genera respuestas truncadas. \
             Dividir en 2 delegaciones o simplificar el template.",
            keywords.clone(),
        );
    }

    if validation.todos_missing.len() > 3 {
        store.add_feedback_rule(
            "many_missing_todos",
            &format!(
                "Templates con +{} TODOs tienden a fallar. Dividir en 2 delegaciones.",
                validation.todos_missing.len()
            ),
            keywords.clone(),
        );
    } else {
        for name in validation.todos_missing.iter().take(3) {
            store.add_feedback_rule(
                &format!("missing_todo_{name}"),
                &format!(
                    "La funcion '{name}' tiende a faltar. \
                     Dar mas contexto sobre su API y comportamiento esperado."
                ),
                Vec::new(),
            );
        }
    }

    // Code-specific rules keyed on recognizable issue text.  Each trigger
    // fires at most once per delegation; the store dedupes across runs.
    let mut seen: Vec<&str> = Vec::new();
    for issue in &validation.issues {
        let lower = issue.to_lowercase();
        if lower.contains("innerhtml") && !seen.contains(&"innerHTML_usage") {
            seen.push("innerHTML_usage");
            store.add_feedback_rule(
                "innerHTML_usage",
                "NUNCA usar innerHTML. Usar textContent o createElement.",
                Vec::new(),
            );
        }
        if lower.contains("const") && lower.contains("let") && !seen.contains(&"const_usage") {
            seen.push("const_usage");
            store.add_feedback_rule(
                "const_usage",
                "Usar let en vez de const (regla del proyecto).",
                Vec::new(),
            );
        }
        if lower.contains("save") && lower.contains("restore") && !seen.contains(&"save_restore") {
            seen.push("save_restore");
            store.add_feedback_rule(
                "save_restore_mismatch",
                "ctx.save() y ctx.restore() DEBEN estar en pares.",
                Vec::new(),
            );
        }
        if lower.contains("duplica") && !seen.contains(&"var_duplicate") {
            seen.push("var_duplicate");
            store.add_feedback_rule(
                "quantum_var_duplicate",
                "En modo quantum, cada angulo debe declarar SOLO sus variables \
                 exclusivas. Variables compartidas deben declararse en UN solo angulo.",
                Vec::new(),
            );
        }
    }
}

fn function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"function\s+(\w+)\s*\(([^)]*)\)").unwrap())
}

/// Extract symbol-level patterns from a successful response.
fn learn_patterns_from_success(store: &mut ProjectStore, task: &str, response: &str) {
    let keywords = extract_keywords(task);

    let functions: Vec<(String, String)> = function_re()
        .captures_iter(response)
        .take(10)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    if !functions.is_empty() {
        let signatures: Vec<String> = functions
            .iter()
            .map(|(name, args)| format!("{name}({args})"))
            .collect();
        let pattern_name = keywords
            .first()
            .map(|k| format!("success_{k}"))
            .unwrap_or_else(|| "success_generic".to_string());
        let head: Vec<&str> = signatures.iter().take(5).map(|s| s.as_str()).collect();
        store.add_pattern(
            &pattern_name,
            &format!("Funciones exitosas: {}", head.join(", ")),
            keywords,
            signatures,
        );
    }

    if response.contains("playSound") || response.contains("AudioContext") {
        store.add_pattern(
            "audio_pattern",
            "Implementacion de audio procedural exitosa",
            vec!["audio".into(), "sound".into(), "sonido".into()],
            Vec::new(),
        );
    }
}

/// Infer code-style conventions from generated code.
fn detect_conventions(store: &mut ProjectStore, response: &str) {
    static CAMEL: OnceLock<Regex> = OnceLock::new();
    static SNAKE: OnceLock<Regex> = OnceLock::new();
    static LET: OnceLock<Regex> = OnceLock::new();
    static CONST: OnceLock<Regex> = OnceLock::new();
    let camel = CAMEL.get_or_init(|| Regex::new(r"\b[a-z]+[A-Z]\w+\b").unwrap());
    let snake = SNAKE.get_or_init(|| Regex::new(r"\b[a-z]+_[a-z]+\b").unwrap());
    let let_re = LET.get_or_init(|| Regex::new(r"\blet\b").unwrap());
    let const_re = CONST.get_or_init(|| Regex::new(r"\bconst\b").unwrap());

    let camel_count = camel.find_iter(response).count();
    let snake_count = snake.find_iter(response).count();
    if camel_count > snake_count * 2 {
        store.data.conventions.naming = "camelCase".to_string();
    } else if snake_count > camel_count * 2 {
        store.data.conventions.naming = "snake_case".to_string();
    }

    let let_count = let_re.find_iter(response).count();
    let const_count = const_re.find_iter(response).count();
    if let_count > 0 && const_count == 0 {
        store.data.conventions.patterns = "let-only (no const)".to_string();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> ProjectStore {
        ProjectStore::load(tmp.path(), Path::new("/work/proj"))
    }

    #[test]
    fn every_delegation_is_recorded() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        learn_from_delegation(&mut s, "build a game", "delegate", true, "function f() {}", None, 3.0);
        assert_eq!(s.data.delegation_history.len(), 1);
        assert!(s.data.delegation_history[0].success);
    }

    #[test]
    fn truncation_failure_creates_rule_and_error() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        let facts = ValidationFacts {
            truncated: true,
            ..Default::default()
        };
        learn_from_delegation(&mut s, "big game task", "delegate", false, "", Some(&facts), 10.0);
        assert_eq!(s.data.error_log.len(), 1);
        assert!(s.data.feedback_rules.iter().any(|r| r.trigger == "truncation"));
    }

    #[test]
    fn many_missing_todos_creates_split_rule() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        let facts = ValidationFacts {
            todos_missing: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            ..Default::default()
        };
        learn_from_delegation(&mut s, "task", "delegate", false, "", Some(&facts), 1.0);
        assert!(s
            .data
            .feedback_rules
            .iter()
            .any(|r| r.trigger == "many_missing_todos"));
    }

    #[test]
    fn few_missing_todos_create_per_symbol_rules() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        let facts = ValidationFacts {
            todos_missing: vec!["renderHud".into()],
            ..Default::default()
        };
        learn_from_delegation(&mut s, "task", "delegate", false, "", Some(&facts), 1.0);
        assert!(s
            .data
            .feedback_rules
            .iter()
            .any(|r| r.trigger == "missing_todo_renderHud"));
    }

    #[test]
    fn issue_keyed_rules_fire_once_per_delegation() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        let facts = ValidationFacts {
            issues: vec![
                "Usa innerHTML (prohibido)".into(),
                "mas innerHTML aqui".into(),
                "ctx.save() sin restore".into(),
            ],
            ..Default::default()
        };
        learn_from_delegation(&mut s, "task", "delegate", false, "", Some(&facts), 1.0);
        let inner: Vec<_> = s
            .data
            .feedback_rules
            .iter()
            .filter(|r| r.trigger == "innerHTML_usage")
            .collect();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].occurrences, 1);
        assert!(s
            .data
            .feedback_rules
            .iter()
            .any(|r| r.trigger == "save_restore_mismatch"));
    }

    #[test]
    fn success_extracts_function_patterns() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        let code = "function spawnEnemy(type, x) {}\nfunction updateWorld(dt) {}";
        learn_from_delegation(&mut s, "spawn enemies in the world", "delegate", true, code, None, 1.0);
        assert_eq!(s.data.patterns.len(), 1);
        assert!(s.data.patterns[0]
            .function_signatures
            .contains(&"spawnEnemy(type, x)".to_string()));
    }

    #[test]
    fn audio_usage_becomes_audio_pattern() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        learn_from_delegation(
            &mut s,
            "sound effects",
            "delegate",
            true,
            "let ctx = new AudioContext();",
            None,
            1.0,
        );
        assert!(s.data.patterns.iter().any(|p| p.name == "audio_pattern"));
    }

    #[test]
    fn conventions_detected_from_code_style() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        let code = "let playerSpeed = 1; let enemyCount = 2; let gameState = {}; \
                    function updateWorld() { let frameTime = 0; }";
        learn_from_delegation(&mut s, "task", "delegate", true, code, None, 1.0);
        assert_eq!(s.data.conventions.naming, "camelCase");
        assert_eq!(s.data.conventions.patterns, "let-only (no const)");
    }
}
