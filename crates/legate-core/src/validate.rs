// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Response validation: truncation signs, marker coverage and
//! category-specific style hooks.
//!
//! Validation failure is data, not an error — the result feeds the
//! feedback-driven retry loops and the memory learners.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Validation outcome for one response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub truncated: bool,
    pub issues: Vec<String>,
    pub todos_found: Vec<String>,
    pub todos_missing: Vec<String>,
    pub stats: ResponseStats,
    /// Retry message for the review loop, when invalid or truncated.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseStats {
    pub lines: usize,
    pub chars: usize,
    pub functions: usize,
    pub todos_total: usize,
    pub estimated_tokens: usize,
}

/// Template sizing info for split/chunk decisions.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateEstimate {
    pub chars: usize,
    pub estimated_tokens: usize,
    pub todos: Vec<String>,
    pub recommended_split: bool,
    /// Two marker halves when a split is recommended.
    pub suggested_splits: Vec<Vec<String>>,
}

fn todo_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TODO\s+[\dA-Za-z]+\s*:\s*(\w+)").unwrap())
}

fn todo_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/\*\s*TODO:\s*(\w+)\s*\*/").unwrap())
}

// Section-title words that follow a TODO id but are not symbols.
const MARKER_NOISE: &[&str] = &[
    "datos", "rendering", "audio", "ui", "efectos", "logica", "sistema", "con", "del", "ctx",
];

/// Extract marker symbol names from a template, order-preserving, deduped.
pub fn extract_todos_from_template(template: &str) -> Vec<String> {
    let mut todos: Vec<String> = todo_marker_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .filter(|name| !MARKER_NOISE.contains(&name.to_lowercase().as_str()))
        .collect();
    if todos.is_empty() {
        todos = todo_comment_re()
            .captures_iter(template)
            .map(|c| c[1].to_string())
            .collect();
    }
    let mut seen = HashSet::new();
    todos.retain(|t| seen.insert(t.clone()));
    todos
}

/// Symbols the response actually defines: functions plus uppercase or
/// underscored let/var bindings (constants and data objects).
pub fn extract_todos_from_response(response: &str) -> Vec<String> {
    static FN_RE: OnceLock<Regex> = OnceLock::new();
    static VAR_RE: OnceLock<Regex> = OnceLock::new();
    let fn_re = FN_RE.get_or_init(|| Regex::new(r"function\s+(\w+)").unwrap());
    let var_re = VAR_RE.get_or_init(|| Regex::new(r"(?:let|var)\s+(\w+)\s*=").unwrap());

    let mut found: Vec<String> = fn_re
        .captures_iter(response)
        .map(|c| c[1].to_string())
        .collect();
    for cap in var_re.captures_iter(response) {
        let name = cap[1].to_string();
        if name.chars().next().is_some_and(|c| c.is_uppercase()) || name.contains('_') {
            found.push(name);
        }
    }
    let mut seen = HashSet::new();
    found.retain(|f| seen.insert(f.clone()));
    found
}

/// Detect signs of a truncated generation.
fn detect_truncation(response: &str) -> Vec<String> {
    let mut signs = Vec::new();
    let trimmed = response.trim();
    let Some(last_line) = trimmed.lines().last().map(str::trim) else {
        return vec!["Respuesta vacia".to_string()];
    };

    static CLOSER_RE: OnceLock<Regex> = OnceLock::new();
    let closer = CLOSER_RE.get_or_init(|| Regex::new(r#"[;}\)\]'"/]$"#).unwrap());
    if !last_line.is_empty()
        && !closer.is_match(last_line)
        && !last_line.starts_with("//")
        && !last_line.starts_with("/*")
    {
        let head: String = last_line.chars().take(60).collect();
        signs.push(format!("Ultima linea incompleta: '{head}...'"));
    }

    let open_braces =
        response.matches('{').count() as i64 - response.matches('}').count() as i64;
    if open_braces > 2 {
        signs.push(format!("Llaves sin cerrar: {open_braces} abiertas"));
    }
    let open_parens =
        response.matches('(').count() as i64 - response.matches(')').count() as i64;
    if open_parens > 2 {
        signs.push(format!("Parentesis sin cerrar: {open_parens} abiertos"));
    }

    static OPEN_FN_RE: OnceLock<Regex> = OnceLock::new();
    let open_fn =
        OPEN_FN_RE.get_or_init(|| Regex::new(r"function\s+\w+\s*\([^)]*\)\s*\{[^}]*$").unwrap());
    let tail: String = response
        .chars()
        .rev()
        .take(200)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if open_fn.is_match(&tail) {
        signs.push("Ultima funcion parece truncada".to_string());
    }

    signs
}

/// Canvas-family style hooks.
fn detect_canvas_errors(response: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let saves = response.matches("ctx.save()").count();
    let restores = response.matches("ctx.restore()").count();
    if saves > restores + 1 {
        errors.push(format!(
            "Posible ctx.save() sin restore ({saves} saves, {restores} restores)"
        ));
    }

    if response.contains("innerHTML") {
        errors.push("Usa innerHTML (prohibido por reglas de seguridad)".to_string());
    }

    static CONST_RE: OnceLock<Regex> = OnceLock::new();
    let const_re = CONST_RE.get_or_init(|| Regex::new(r"\bconst\b").unwrap());
    let consts = const_re.find_iter(response).count();
    if consts > 3 {
        errors.push(format!("Usa 'const' {consts} veces (debe usar 'let')"));
    }

    // Declared-but-unused let bindings.
    static LET_DECL_RE: OnceLock<Regex> = OnceLock::new();
    let let_decl = LET_DECL_RE.get_or_init(|| Regex::new(r"let\s+(\w+)\s*=").unwrap());
    for cap in let_decl.captures_iter(response) {
        let var = &cap[1];
        if matches!(var, "_" | "i" | "j" | "k") {
            continue;
        }
        let mentions = Regex::new(&format!(r"\b{}\b", regex::escape(var)))
            .map(|re| re.find_iter(response).count())
            .unwrap_or(0);
        if mentions <= 1 {
            errors.push(format!("Variable '{var}' declarada pero nunca usada"));
        }
    }

    // speed: 0 combined with movement through e.speed never moves.
    if response.contains("speed: 0") || response.contains("speed:0") {
        static SPEED_RE: OnceLock<Regex> = OnceLock::new();
        let speed_re = SPEED_RE.get_or_init(|| Regex::new(r"e\.vy\s*=\s*e\.speed").unwrap());
        if speed_re.is_match(response) {
            errors.push(
                "Enemigo con speed:0 usa e.speed para moverse (sera 0, nunca se movera)"
                    .to_string(),
            );
        }
    }

    errors
}

fn build_feedback(result: &Validation) -> Option<String> {
    let mut parts = Vec::new();
    if result.truncated {
        parts.push(
            "Tu respuesta fue TRUNCADA (cortada). Se mas CONCISO: funciones mas cortas, \
             sin comentarios largos, sin repetir codigo del template."
                .to_string(),
        );
    }
    if !result.todos_missing.is_empty() {
        parts.push(format!(
            "Te faltan estos TODOs: {}. Implementalos TODOS.",
            result.todos_missing.join(", ")
        ));
    }
    let other: Vec<&String> = result
        .issues
        .iter()
        .filter(|i| !i.contains("TODO") && !i.to_lowercase().contains("trunca"))
        .collect();
    if !other.is_empty() {
        parts.push(format!(
            "Errores detectados: {}",
            other
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Validate a response against an optional marker template.
pub fn validate_response(response: &str, template: Option<&str>) -> Validation {
    let mut result = Validation {
        valid: true,
        ..Default::default()
    };

    if response.trim().len() < 20 {
        result.valid = false;
        result.issues.push("Respuesta vacia o demasiado corta".to_string());
        result.feedback = Some("Tu respuesta fue vacia. Genera todo el codigo.".to_string());
        return result;
    }

    let truncation_signs = detect_truncation(response);
    if !truncation_signs.is_empty() {
        result.truncated = true;
        result.issues.extend(truncation_signs);
    }

    if let Some(template) = template {
        let expected = extract_todos_from_template(template);
        let found = extract_todos_from_response(response);
        result.todos_missing = expected
            .iter()
            .filter(|t| !found.contains(t))
            .cloned()
            .collect();
        result.todos_found = found;
        if !result.todos_missing.is_empty() {
            result.valid = false;
            result
                .issues
                .push(format!("TODOs faltantes: {}", result.todos_missing.join(", ")));
        }
    }

    result.issues.extend(detect_canvas_errors(response));

    static FN_RE: OnceLock<Regex> = OnceLock::new();
    let fn_re = FN_RE.get_or_init(|| Regex::new(r"function\s+\w+").unwrap());
    result.stats = ResponseStats {
        lines: response.trim().lines().count(),
        chars: response.len(),
        functions: fn_re.find_iter(response).count(),
        todos_total: result.todos_found.len(),
        estimated_tokens: response.len() / 4,
    };

    if !result.valid || result.truncated {
        result.feedback = build_feedback(&result);
    }
    result
}

/// Whether the merged/joined text balances braces.
pub fn braces_balanced(text: &str) -> bool {
    text.matches('{').count() == text.matches('}').count()
}

/// Estimate a template's size and recommend a split when it carries more
/// than 8 markers or more than 3000 chars.
pub fn estimate_template(template: &str) -> TemplateEstimate {
    let chars = template.len();
    let todos = extract_todos_from_template(template);
    let recommended_split = todos.len() > 8 || chars > 3_000;
    let suggested_splits = if recommended_split && todos.len() >= 4 {
        let mid = todos.len() / 2;
        vec![todos[..mid].to_vec(), todos[mid..].to_vec()]
    } else {
        Vec::new()
    };
    TemplateEstimate {
        chars,
        estimated_tokens: chars / 4,
        todos,
        recommended_split,
        suggested_splits,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
