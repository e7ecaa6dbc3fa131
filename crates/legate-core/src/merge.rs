// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Merge engine for dual ("quantum") responses.
//!
//! Three strategies in cascade:
//! 1. Template-guided — marker-keyed blocks from both sides, ordered by the
//!    template, conflicts resolved by quality score.  Accepted iff marker
//!    coverage ≥ 60% and braces balance.
//! 2. Symbol-based — top-level variables, classes and functions deduped by
//!    name; emitted vars → classes → functions.
//! 3. Raw — banner-separated concatenation (always succeeds).

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::validate::extract_todos_from_template;

/// Minimum marker coverage for the template-guided strategy.
const MIN_COVERAGE: f64 = 0.6;

/// Outcome of a merge attempt.
#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub merged: String,
    pub success: bool,
    pub strategy: String,
    pub conflicts: Vec<String>,
    pub coverage: Option<f64>,
    pub braces_balanced: bool,
}

// ─── Extraction helpers ──────────────────────────────────────────────────────

fn todo_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)//\s*={2,}\s*TODO\s+[\dA-Za-z]+\s*:\s*(\w+)").unwrap())
}

/// Extract marker-keyed code blocks: each block runs from its `// === TODO
/// id: name ===` header to the next header (or end of text).
pub fn extract_todo_blocks(response: &str) -> Vec<(String, String)> {
    let matches: Vec<(usize, String)> = todo_header_re()
        .captures_iter(response)
        .map(|c| (c.get(0).unwrap().start(), c[1].to_string()))
        .collect();
    let mut blocks = Vec::new();
    for (i, (start, name)) in matches.iter().enumerate() {
        let end = matches
            .get(i + 1)
            .map(|(next, _)| *next)
            .unwrap_or(response.len());
        blocks.push((name.clone(), response[*start..end].trim().to_string()));
    }
    blocks
}

/// Extract complete `function name(...) { ... }` definitions, closing by
/// brace counting (bounded at 300 lines per function).
pub fn extract_functions(response: &str) -> Vec<(String, String)> {
    static START_RE: OnceLock<Regex> = OnceLock::new();
    let start_re =
        START_RE.get_or_init(|| Regex::new(r"^(?:async\s+)?function\s+(\w+)\s*\(").unwrap());
    extract_braced(response, start_re)
}

/// Extract `class Name { ... }` definitions.
pub fn extract_classes(response: &str) -> Vec<(String, String)> {
    static START_RE: OnceLock<Regex> = OnceLock::new();
    let start_re =
        START_RE.get_or_init(|| Regex::new(r"^class\s+(\w+)[\s{]").unwrap());
    extract_braced(response, start_re)
}

fn extract_braced(response: &str, start_re: &Regex) -> Vec<(String, String)> {
    let lines: Vec<&str> = response.lines().collect();
    let mut out: Vec<(String, String)> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let Some(cap) = start_re.captures(lines[i].trim_start()) else {
            i += 1;
            continue;
        };
        let name = cap[1].to_string();
        let mut brace_count: i64 = 0;
        let mut found_open = false;
        let mut body: Vec<&str> = Vec::new();
        let end = (i + 300).min(lines.len());
        for line in &lines[i..end] {
            body.push(line);
            for ch in line.chars() {
                match ch {
                    '{' => {
                        brace_count += 1;
                        found_open = true;
                    }
                    '}' => brace_count -= 1,
                    _ => {}
                }
            }
            if found_open && brace_count <= 0 {
                break;
            }
        }
        let consumed = body.len();
        if !out.iter().any(|(n, _)| *n == name) {
            out.push((name, body.join("\n")));
        }
        i += consumed.max(1);
    }
    out
}

/// Extract top-level `let`/`var` declarations (indent 0, outside functions),
/// capturing multi-line object/array initializers whole.
pub fn extract_variables(response: &str) -> Vec<(String, String)> {
    static DECL_RE: OnceLock<Regex> = OnceLock::new();
    let decl_re = DECL_RE.get_or_init(|| Regex::new(r"^(?:let|var)\s+(\w+)\s*=").unwrap());
    static FN_RE: OnceLock<Regex> = OnceLock::new();
    let fn_re = FN_RE.get_or_init(|| Regex::new(r"^(?:async\s+)?function\s+\w+\s*\(").unwrap());

    let lines: Vec<&str> = response.lines().collect();
    let mut out: Vec<(String, String)> = Vec::new();
    let mut depth: i64 = 0;
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let stripped = line.trim();
        let at_top = depth == 0 && !line.starts_with(' ') && !line.starts_with('\t');

        if at_top && !fn_re.is_match(stripped) {
            if let Some(cap) = decl_re.captures(line) {
                let name = cap[1].to_string();
                let value = if line.contains('{') || line.contains('[') {
                    let mut brackets: i64 = 0;
                    let mut body: Vec<&str> = Vec::new();
                    let end = (i + 100).min(lines.len());
                    for (j, inner) in lines[i..end].iter().enumerate() {
                        body.push(inner);
                        for ch in inner.chars() {
                            match ch {
                                '{' | '[' => brackets += 1,
                                '}' | ']' => brackets -= 1,
                                _ => {}
                            }
                        }
                        if brackets <= 0 && j > 0 {
                            break;
                        }
                        if brackets == 0 && inner.contains(';') {
                            break;
                        }
                    }
                    let joined = body.join("\n");
                    i += body.len().saturating_sub(1);
                    joined
                } else {
                    line.to_string()
                };
                if !out.iter().any(|(n, _)| *n == name) {
                    out.push((name, value));
                }
                // Track depth contributed by the consumed lines.
                i += 1;
                continue;
            }
        }

        for ch in line.chars() {
            match ch {
                '{' => depth += 1,
                '}' => depth = (depth - 1).max(0),
                _ => {}
            }
        }
        i += 1;
    }
    out
}

// ─── Quality scoring ─────────────────────────────────────────────────────────

/// Score an implementation: real code lines weigh most; control flow,
/// error handling and input validation earn bonuses; very long single
/// lines (probable compressed concatenation) are penalized.
pub fn score_implementation(code: &str) -> f64 {
    static CONTROL_RE: OnceLock<Regex> = OnceLock::new();
    static ERROR_RE: OnceLock<Regex> = OnceLock::new();
    static VALIDATION_RE: OnceLock<Regex> = OnceLock::new();
    let control =
        CONTROL_RE.get_or_init(|| Regex::new(r"\b(if|else|for|while|switch|case)\b").unwrap());
    let error = ERROR_RE.get_or_init(|| Regex::new(r"\b(try|catch|throw|Error)\b").unwrap());
    let validation = VALIDATION_RE
        .get_or_init(|| Regex::new(r"(Math\.(min|max|floor|ceil)|\.length|typeof|===|!==)").unwrap());

    let lines: Vec<&str> = code.trim().lines().collect();
    if lines.is_empty() {
        return 0.0;
    }
    let non_empty = lines.iter().filter(|l| !l.trim().is_empty()).count() as f64;
    let comment_only = lines.iter().filter(|l| l.trim().starts_with("//")).count() as f64;
    let code_lines = non_empty - comment_only;
    let control_flow = lines.iter().filter(|l| control.is_match(l)).count() as f64;
    let error_handling = lines.iter().filter(|l| error.is_match(l)).count() as f64;
    let validations = lines.iter().filter(|l| validation.is_match(l)).count() as f64;
    let long_lines = lines.iter().filter(|l| l.len() > 120).count() as f64;

    code_lines + non_empty * 0.1 - comment_only * 0.05 + control_flow * 0.3
        + error_handling * 0.5
        + validations * 0.2
        - long_lines * 0.1
}

/// Pick the higher-scoring of two implementations (ties favor `a`).
pub fn pick_better<'a>(a: &'a str, b: &'a str) -> &'a str {
    if score_implementation(a) >= score_implementation(b) {
        a
    } else {
        b
    }
}

fn brace_diff(code: &str) -> i64 {
    code.matches('{').count() as i64 - code.matches('}').count() as i64
}

/// Collapse duplicated variable declarations, consecutive repeated blocks
/// of 3+ lines, and runs of blank lines.
pub fn deduplicate_lines(text: &str) -> String {
    static DECL_RE: OnceLock<Regex> = OnceLock::new();
    let decl_re = DECL_RE.get_or_init(|| Regex::new(r"^(?:let|var)\s+(\w+)\s*=").unwrap());

    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 4 {
        return text.to_string();
    }

    // Phase 1: drop re-declarations of the same top-level variable.
    let mut seen_vars: HashSet<String> = HashSet::new();
    let mut keep: Vec<&str> = Vec::new();
    let mut skip_until_balance: i64 = 0;
    for line in &lines {
        if skip_until_balance > 0 {
            for ch in line.chars() {
                match ch {
                    '{' | '[' => skip_until_balance += 1,
                    '}' | ']' => skip_until_balance -= 1,
                    _ => {}
                }
            }
            continue;
        }
        if let Some(cap) = decl_re.captures(line.trim()) {
            let name = cap[1].to_string();
            if !seen_vars.insert(name) {
                let opens = line.matches(['{', '[']).count() as i64
                    - line.matches(['}', ']']).count() as i64;
                if opens > 0 {
                    skip_until_balance = opens;
                }
                continue;
            }
        }
        keep.push(line);
    }

    // Phase 2: collapse consecutive repeated blocks (3–20 lines).
    let mut result: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < keep.len() {
        let mut found = false;
        let max_block = ((keep.len() - i) / 2).min(20);
        for size in 3..=max_block.max(2) {
            if size < 3 || i + 2 * size > keep.len() {
                continue;
            }
            if keep[i..i + size] == keep[i + size..i + 2 * size] {
                result.extend(&keep[i..i + size]);
                i += 2 * size;
                found = true;
                break;
            }
        }
        if !found {
            result.push(keep[i]);
            i += 1;
        }
    }

    // Phase 3: at most two consecutive blank lines.
    let mut final_lines: Vec<&str> = Vec::new();
    let mut empties = 0;
    for line in result {
        if line.trim().is_empty() {
            empties += 1;
            if empties <= 2 {
                final_lines.push(line);
            }
        } else {
            empties = 0;
            final_lines.push(line);
        }
    }
    final_lines.join("\n")
}

// ─── Strategies ──────────────────────────────────────────────────────────────

fn strip_markdown_fences(text: &str) -> String {
    static OPEN_RE: OnceLock<Regex> = OnceLock::new();
    static CLOSE_RE: OnceLock<Regex> = OnceLock::new();
    let open = OPEN_RE.get_or_init(|| Regex::new(r"^```\w*\n?").unwrap());
    let close = CLOSE_RE.get_or_init(|| Regex::new(r"\n?```\s*$").unwrap());
    let trimmed = text.trim();
    let without_open = open.replace(trimmed, "");
    close.replace(without_open.trim(), "").trim().to_string()
}

fn merge_by_todos(a: &str, b: &str, template: &str) -> MergeResult {
    let blocks_a = extract_todo_blocks(a);
    let blocks_b = extract_todo_blocks(b);
    if blocks_a.is_empty() && blocks_b.is_empty() {
        return MergeResult {
            merged: String::new(),
            success: false,
            strategy: "todos_failed".into(),
            conflicts: Vec::new(),
            coverage: None,
            braces_balanced: false,
        };
    }

    let template_order = extract_todos_from_template(template);
    let mut conflicts = Vec::new();

    // Union of both sides; collisions resolved by quality score.
    let mut merged_blocks: Vec<(String, String)> = blocks_a.clone();
    for (name, block_b) in &blocks_b {
        match merged_blocks.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => {
                let better = pick_better(existing, block_b).to_string();
                *existing = better;
                conflicts.push(format!("Duplicado '{name}': resuelto por score"));
            }
            None => merged_blocks.push((name.clone(), block_b.clone())),
        }
    }

    // Template order first, then any extra blocks.
    let mut ordered: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for name in &template_order {
        if let Some((_, block)) = merged_blocks.iter().find(|(n, _)| n == name) {
            ordered.push(block);
            seen.insert(name);
        }
    }
    for (name, block) in &merged_blocks {
        if !seen.contains(name.as_str()) {
            ordered.push(block);
        }
    }

    let merged = ordered
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("\n\n");

    let diff = brace_diff(&merged);
    if diff != 0 {
        conflicts.push(format!("Llaves desbalanceadas ({diff:+})"));
    }
    let coverage = seen.len() as f64 / template_order.len().max(1) as f64;
    MergeResult {
        success: coverage >= MIN_COVERAGE && diff == 0,
        merged,
        strategy: "template_guided".into(),
        conflicts,
        coverage: Some((coverage * 100.0).round() / 100.0),
        braces_balanced: diff == 0,
    }
}

fn merge_by_symbols(a: &str, b: &str) -> MergeResult {
    let funcs_a = extract_functions(a);
    let funcs_b = extract_functions(b);
    let classes_a = extract_classes(a);
    let classes_b = extract_classes(b);
    let vars_a = extract_variables(a);
    let vars_b = extract_variables(b);

    let total = funcs_a.len() + funcs_b.len() + classes_a.len() + classes_b.len() + vars_a.len()
        + vars_b.len();
    if total < 2 {
        return MergeResult {
            merged: String::new(),
            success: false,
            strategy: "functions_failed".into(),
            conflicts: Vec::new(),
            coverage: None,
            braces_balanced: false,
        };
    }

    let mut conflicts = Vec::new();
    let merge_section = |side_a: &[(String, String)],
                         side_b: &[(String, String)],
                         label: &str,
                         conflicts: &mut Vec<String>|
     -> Vec<(String, String)> {
        let mut merged: Vec<(String, String)> = side_a.to_vec();
        for (name, code_b) in side_b {
            match merged.iter_mut().find(|(n, _)| n == name) {
                Some((_, existing)) => {
                    *existing = pick_better(existing, code_b).to_string();
                    conflicts.push(format!("{label} duplicada: {name}"));
                }
                None => merged.push((name.clone(), code_b.clone())),
            }
        }
        merged
    };

    let vars = merge_section(&vars_a, &vars_b, "Variable", &mut conflicts);
    let classes = merge_section(&classes_a, &classes_b, "Clase", &mut conflicts);
    let funcs = merge_section(&funcs_a, &funcs_b, "Funcion", &mut conflicts);

    let mut parts: Vec<String> = Vec::new();
    parts.extend(vars.iter().map(|(_, c)| c.clone()));
    if !vars.is_empty() && (!classes.is_empty() || !funcs.is_empty()) {
        parts.push(String::new());
    }
    parts.extend(classes.iter().map(|(_, c)| c.clone()));
    if !classes.is_empty() && !funcs.is_empty() {
        parts.push(String::new());
    }
    parts.extend(funcs.iter().map(|(_, c)| c.clone()));

    let merged = deduplicate_lines(&parts.join("\n\n"));
    let diff = brace_diff(&merged);
    let symbol_count = funcs.len() + classes.len();
    MergeResult {
        success: diff == 0 && symbol_count >= 1,
        merged,
        strategy: "function_based".into(),
        conflicts,
        coverage: None,
        braces_balanced: diff == 0,
    }
}

fn merge_raw(a: &str, b: &str, label_a: &str, label_b: &str) -> MergeResult {
    let merged = format!(
        "// ========== Angulo {label_a} ==========\n\n{a}\n\n// ========== Angulo {label_b} ==========\n\n{b}"
    );
    let merged = deduplicate_lines(&merged);
    let diff = brace_diff(&merged);
    MergeResult {
        success: true,
        conflicts: if diff != 0 {
            vec![format!("Llaves desbalanceadas ({diff:+})")]
        } else {
            Vec::new()
        },
        merged,
        strategy: "raw_concatenation".into(),
        coverage: None,
        braces_balanced: diff == 0,
    }
}

/// Fuse two complementary responses into one.
pub fn merge_responses(
    response_a: &str,
    response_b: &str,
    template: Option<&str>,
    label_a: &str,
    label_b: &str,
) -> MergeResult {
    let a = strip_markdown_fences(response_a);
    let b = strip_markdown_fences(response_b);

    if let Some(template) = template {
        let result = merge_by_todos(&a, &b, template);
        if result.success {
            return result;
        }
    }
    let result = merge_by_symbols(&a, &b);
    if result.success {
        return result;
    }
    merge_raw(&a, &b, label_a, label_b)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
