// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Chunked execution for oversized templates.
//!
//! Upstream quality degrades on very large contexts, so templates above
//! the configured threshold are split at marker boundaries into ≤5K-token
//! chunks and run sequentially, each chunk carrying the tail of the prior
//! chunk's output for continuity.

use std::sync::OnceLock;

use regex::Regex;

use legate_index::estimate_tokens;

/// Default chunking threshold in estimated tokens.
pub const CHUNK_THRESHOLD_TOKENS: usize = 30_000;

/// Per-chunk token budget.
pub const MAX_TOKENS_PER_CHUNK: usize = 5_000;

/// Lines of prior output carried into the next chunk prompt.
const CONTEXT_TAIL_LINES: usize = 20;

/// One logical fragment of a large template.
#[derive(Debug, Clone)]
pub struct TemplateChunk {
    pub content: String,
    pub todo_names: Vec<String>,
    pub label: String,
}

impl TemplateChunk {
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Whether a template needs chunked execution.
pub fn should_chunk(template: &str, threshold_tokens: usize) -> bool {
    estimate_tokens(template) > threshold_tokens
}

fn todo_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:TODO\s+[\dA-Za-z]+\s*:|/\*\s*TODO:)").unwrap())
}

fn todo_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TODO\s+[\dA-Za-z]+\s*:\s*(\w+)|/\*\s*TODO:\s*(\w+)").unwrap())
}

/// Split a template at marker boundaries, each chunk up to the token cap.
/// Falls back to line-count chunks when the template carries no markers.
pub fn chunk_by_todos(template: &str, max_tokens_per_chunk: usize) -> Vec<TemplateChunk> {
    let lines: Vec<&str> = template.lines().collect();
    let marker_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| todo_line_re().is_match(l))
        .map(|(i, _)| i)
        .collect();
    if marker_lines.is_empty() {
        return chunk_by_lines(template, max_tokens_per_chunk);
    }

    let mut chunks = Vec::new();
    let mut current_lines: Vec<&str> = Vec::new();
    let mut current_todos: Vec<String> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let is_boundary = marker_lines.contains(&i) && !current_lines.is_empty();
        if is_boundary {
            let text = current_lines.join("\n");
            if estimate_tokens(&text) >= max_tokens_per_chunk {
                chunks.push(TemplateChunk {
                    label: if current_todos.is_empty() {
                        String::new()
                    } else {
                        format!("TODOs: {}", current_todos.join(", "))
                    },
                    content: text,
                    todo_names: std::mem::take(&mut current_todos),
                });
                current_lines.clear();
            }
        }
        current_lines.push(line);
        if marker_lines.contains(&i) {
            if let Some(cap) = todo_name_re().captures(line) {
                let name = cap.get(1).or_else(|| cap.get(2));
                if let Some(name) = name {
                    current_todos.push(name.as_str().to_string());
                }
            }
        }
    }
    if !current_lines.is_empty() {
        chunks.push(TemplateChunk {
            label: if current_todos.is_empty() {
                "final".to_string()
            } else {
                format!("TODOs: {}", current_todos.join(", "))
            },
            content: current_lines.join("\n"),
            todo_names: current_todos,
        });
    }
    chunks
}

/// Marker-free fallback: fixed line windows sized by an ~80 chars/line
/// estimate.
pub fn chunk_by_lines(template: &str, max_tokens_per_chunk: usize) -> Vec<TemplateChunk> {
    let lines: Vec<&str> = template.lines().collect();
    let max_lines = ((max_tokens_per_chunk * 4) / 80).max(10);
    lines
        .chunks(max_lines)
        .enumerate()
        .map(|(i, window)| TemplateChunk {
            content: window.join("\n"),
            todo_names: Vec::new(),
            label: format!(
                "lineas {}-{}",
                i * max_lines + 1,
                i * max_lines + window.len()
            ),
        })
        .collect()
}

/// Build the prompt for one chunk, carrying continuity context.
pub fn build_chunk_prompt(
    chunk: &TemplateChunk,
    total_chunks: usize,
    chunk_index: usize,
    task: &str,
    previous_output: &str,
) -> String {
    let mut parts = vec![format!(
        "[CHUNK {}/{}] {}",
        chunk_index + 1,
        total_chunks,
        chunk.label
    )];

    if chunk_index > 0 {
        parts.push(
            "IMPORTANTE: Este es un chunk de continuacion. \
             El codigo anterior ya fue generado. \
             Solo implementa los TODOs de ESTE chunk."
                .to_string(),
        );
    }
    if !previous_output.is_empty() {
        let tail: Vec<&str> = previous_output.trim().lines().collect();
        let tail = if tail.len() > CONTEXT_TAIL_LINES {
            &tail[tail.len() - CONTEXT_TAIL_LINES..]
        } else {
            &tail[..]
        };
        parts.push(format!(
            "CONTEXTO (ultimas lineas del chunk anterior):\n```\n{}\n```",
            tail.join("\n")
        ));
    }
    if !task.is_empty() {
        parts.push(format!("TAREA: {task}"));
    }
    parts.push(format!(
        "TEMPLATE (chunk {}):\n```\n{}\n```",
        chunk_index + 1,
        chunk.content
    ));
    if !chunk.todo_names.is_empty() {
        parts.push(format!(
            "TODOs a implementar en este chunk: {}",
            chunk.todo_names.join(", ")
        ));
    }
    parts.join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
