// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Requirements-document parsing: turn a markdown requirements doc into a
//! multi-step plan.
//!
//! Heuristic, not semantic: numbered list items and second-level headings
//! become steps; a `depende: <id>` line inside a section threads the named
//! step's output in as context.  The resulting plan either prints for
//! review or runs directly under `--auto-execute`.

use crate::modes::plan::{Plan, StepSpec};

fn is_step_heading(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("## ") {
        return Some(rest.trim().to_string());
    }
    // Numbered item: "1. do the thing" / "2) other thing".
    let mut chars = trimmed.chars();
    let digits: String = chars.by_ref().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = trimmed[digits.len()..].trim_start();
    rest.strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

fn dependency_of(line: &str) -> Option<String> {
    let trimmed = line.trim().trim_start_matches('-').trim();
    let lower = trimmed.to_lowercase();
    let rest = lower
        .strip_prefix("depende:")
        .or_else(|| lower.strip_prefix("depends:"))?;
    let id = rest.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Parse a requirements document into an executable plan.
///
/// Returns `None` when no step-shaped structure is found — the caller
/// should fall back to treating the whole doc as one delegation.
pub fn parse_requirements(doc: &str) -> Option<Plan> {
    let mut steps: Vec<StepSpec> = Vec::new();
    let mut current: Option<(String, Vec<String>, Vec<String>)> = None;

    let flush = |current: &mut Option<(String, Vec<String>, Vec<String>)>,
                 steps: &mut Vec<StepSpec>| {
        if let Some((title, body, deps)) = current.take() {
            let id = format!("step_{}", steps.len() + 1);
            let mut task = title;
            let body_text = body.join("\n").trim().to_string();
            if !body_text.is_empty() {
                task.push('\n');
                task.push_str(&body_text);
            }
            steps.push(StepSpec {
                id,
                task,
                template: None,
                context_from: deps,
                max_retries: 1,
                validate: true,
                feedback: None,
                parallel_group: None,
                dual_mode: false,
            });
        }
    };

    for line in doc.lines() {
        if let Some(title) = is_step_heading(line) {
            flush(&mut current, &mut steps);
            current = Some((title, Vec::new(), Vec::new()));
            continue;
        }
        if let Some((_, body, deps)) = current.as_mut() {
            if let Some(dep) = dependency_of(line) {
                deps.push(dep);
            } else if !line.trim().is_empty() {
                body.push(line.trim().to_string());
            }
        }
    }
    flush(&mut current, &mut steps);

    if steps.is_empty() {
        None
    } else {
        Some(Plan { steps })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_items_become_steps() {
        let doc = "\
Requisitos del proyecto:
1. Crear el modelo de datos
2. Implementar la API REST
3) Escribir los tests de integracion
";
        let plan = parse_requirements(doc).unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].id, "step_1");
        assert!(plan.steps[0].task.contains("modelo de datos"));
        assert!(plan.steps[2].task.contains("tests de integracion"));
    }

    #[test]
    fn headings_become_steps_with_bodies() {
        let doc = "\
# Proyecto

## Backend
Endpoints CRUD para usuarios.
Validacion de entrada.

## Frontend
Formulario de registro.
";
        let plan = parse_requirements(doc).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0].task.starts_with("Backend"));
        assert!(plan.steps[0].task.contains("Endpoints CRUD"));
        assert!(plan.steps[1].task.contains("Formulario"));
    }

    #[test]
    fn dependencies_thread_context() {
        let doc = "\
1. Crear la base de datos
2. Implementar la API
- depende: step_1
";
        let plan = parse_requirements(doc).unwrap();
        assert_eq!(plan.steps[1].context_from, vec!["step_1"]);
        assert!(plan.steps[0].context_from.is_empty());
    }

    #[test]
    fn prose_without_structure_yields_none() {
        assert!(parse_requirements("solo un parrafo de texto sin pasos").is_none());
    }

    #[test]
    fn dependency_lines_do_not_leak_into_tasks() {
        let doc = "1. Primero\n2. Segundo\n- depende: step_1\n";
        let plan = parse_requirements(doc).unwrap();
        assert!(!plan.steps[1].task.contains("depende"));
    }
}
