// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt assembly: system-prompt blocks, per-type acknowledgments and the
//! ultra-compact AI-to-AI operation prompts.
//!
//! The prompt shape adapts to the classified task: a chat turn gets the
//! base block only, while a delegation composes code rules, advanced
//! guidance and the block matching the work shape (todo template, surgical
//! patch, multi-file or plain generation).

use legate_model::TaskLevel;

// ─── System prompt blocks ────────────────────────────────────────────────────

pub const BASE_BLOCK: &str = "\
Eres un asistente de programacion que ejecuta tareas delegadas. \
Trabajas con precision: respondes exactamente lo que se pide, sin relleno.";

pub const CODE_RULES_BLOCK: &str = "\
REGLAS DE CODIGO:
- Genera codigo COMPLETO y funcional. Nunca stubs ni placeholders.
- Respeta las convenciones del proyecto indicadas en la memoria.
- No repitas codigo del template: implementa solo lo marcado.
- Sin comentarios largos; el codigo se explica solo.";

pub const ADVANCED_BLOCK: &str = "\
GUIA AVANZADA:
- Disena antes de escribir: identifica los modulos y sus contratos.
- Maneja errores en cada frontera de I/O.
- Prefiere funciones puras; aisla el estado mutable.";

pub const TODO_BLOCK: &str = "\
MODO TEMPLATE:
- El template define marcadores TODO con los simbolos a implementar.
- Implementa CADA marcador. Deja intactos los que no te correspondan.
- Manten el orden de los marcadores del template.";

pub const SURGICAL_BLOCK: &str = "\
MODO QUIRURGICO:
- Es un parche sobre codigo existente: toca lo minimo.
- Devuelve solo las funciones modificadas, completas.";

pub const MULTI_FILE_BLOCK: &str = "\
MODO MULTI-ARCHIVO:
- La tarea abarca varios archivos. Indica cada ruta antes de su contenido.
- Un bloque de codigo por archivo.";

pub const GENERATION_BLOCK: &str = "\
MODO GENERACION:
- Genera la solucion completa de una vez, lista para usar.";

/// Heavy identity prompt for the goal-directed agent loop (Phase 1).
pub const AGENT_SYSTEM_PROMPT: &str = "\
Eres un agente autonomo de programacion con acceso a herramientas del sistema. \
Trabajas paso a paso hacia un objetivo: analizas, ejecutas herramientas, \
verificas resultados y continuas hasta completar el objetivo. \
NUNCA describes acciones sin ejecutarlas: toda accion pasa por una herramienta.";

/// Literal acknowledgment the agent Phase 1 expects.
pub const AGENT_ACK: &str = "DEEPSEEK CODE ACTIVADO";

/// Phase-1 closing instruction for regular sessions.
pub const SESSION_ACK_INSTRUCTION: &str =
    "\n\nResponde UNICAMENTE 'OK' para confirmar que entendiste tus instrucciones y herramientas.";

/// The shape of the work, driving which block closes the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkShape {
    /// A marker template is present.
    Todo,
    /// The task is a patch over existing code.
    Surgical,
    /// Many files expected.
    MultiFile,
    /// Plain generation.
    Generation,
}

/// Detect the work shape from the task text and template presence.
pub fn detect_work_shape(task: &str, has_template: bool, expects_many_files: bool) -> WorkShape {
    if has_template {
        return WorkShape::Todo;
    }
    let lower = task.to_lowercase();
    let patchy = ["arregla", "corrige", "fix", "parche", "modifica", "ajusta"]
        .iter()
        .any(|kw| lower.contains(kw));
    if patchy {
        WorkShape::Surgical
    } else if expects_many_files {
        WorkShape::MultiFile
    } else {
        WorkShape::Generation
    }
}

/// Compose the system prompt for a task level and work shape.
pub fn assemble_system_prompt(level: TaskLevel, shape: WorkShape) -> String {
    let mut blocks: Vec<&str> = vec![BASE_BLOCK];
    if level >= TaskLevel::CodeSimple {
        blocks.push(CODE_RULES_BLOCK);
    }
    if level >= TaskLevel::CodeComplex {
        blocks.push(ADVANCED_BLOCK);
    }
    if level >= TaskLevel::CodeSimple {
        blocks.push(match shape {
            WorkShape::Todo => TODO_BLOCK,
            WorkShape::Surgical => SURGICAL_BLOCK,
            WorkShape::MultiFile => MULTI_FILE_BLOCK,
            WorkShape::Generation => GENERATION_BLOCK,
        });
    }
    blocks.join("\n\n")
}

// ─── Phase-2 acknowledgments ─────────────────────────────────────────────────

/// The expected reply for one injection type.
pub fn injection_ack(injection_type: &str, name: &str) -> String {
    match injection_type {
        "skill" => format!("Skill {name} aceptada"),
        "memory" => format!("Memoria {name} integrada"),
        "global" => format!("Perfil {name} integrado"),
        "error" => format!("Errores de {name} registrados"),
        "knowledge" => format!("Conocimiento de {name} integrado"),
        other => format!("{} {name} aceptada", capitalize(other)),
    }
}

/// Frame one Phase-2 injection message.
pub fn injection_prompt(injection_type: &str, name: &str, content: &str) -> String {
    let upper = injection_type.to_uppercase();
    let ack = injection_ack(injection_type, name);
    format!("== {upper}: {name} ==\n\n{content}\n\n== FIN {upper} ==\n\nResponde UNICAMENTE: '{ack}'")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ─── AI-to-AI operation prompts ──────────────────────────────────────────────

pub const BRIEFING_SYSTEM: &str = "You are reviewing a project brief before coding. \
Read the project info and confirm understanding. \
Respond with a very short confirmation (1-3 sentences) \
and note any potential issues you foresee.";

pub const REVIEW_SYSTEM: &str = "You are reviewing code for issues. \
Given code and a list of problems, fix ALL issues and return \
the COMPLETE corrected code. Do not explain, just code.";

pub const STRATEGY_SYSTEM: &str = "You are a task analysis expert. \
Given a task description, recommend the optimal execution mode: \
delegate (single shot), quantum (dual parallel), \
multi-session (N instances with roles), or converse (iterative). \
Respond with: MODE: <mode>\nREASON: <one sentence>";

pub fn build_briefing_prompt(project_info: &str, task: &str, conventions: &str) -> String {
    let mut parts = vec![format!("PROJECT BRIEF:\n{}", truncate(project_info, 20_000))];
    if !conventions.is_empty() {
        parts.push(format!("\nCONVENTIONS:\n{}", truncate(conventions, 5_000)));
    }
    parts.push(format!("\nTASK: {}", truncate(task, 5_000)));
    parts.push("\nConfirm understanding and note any concerns:".to_string());
    parts.join("\n")
}

pub fn build_review_prompt(code: &str, issues: &[String]) -> String {
    let issues_text: Vec<String> = issues.iter().take(10).map(|i| format!("- {i}")).collect();
    format!(
        "CODE WITH ISSUES:\n```\n{}\n```\n\nPROBLEMS FOUND:\n{}\n\nFix ALL issues. Return COMPLETE corrected code:",
        truncate(code, 80_000),
        issues_text.join("\n")
    )
}

pub fn build_strategy_prompt(task: &str, template_info: &str, project_info: &str) -> String {
    let mut parts = vec![format!("TASK: {}", truncate(task, 5_000))];
    if !template_info.is_empty() {
        parts.push(format!("TEMPLATE: {}", truncate(template_info, 5_000)));
    }
    if !project_info.is_empty() {
        parts.push(format!("PROJECT: {}", truncate(project_info, 5_000)));
    }
    parts.push(
        "\nModes available: delegate (single, fast), quantum (dual parallel, complex), \
         multi-session (N instances, very complex), converse (iterative dialogue, refinement). \
         \nRecommend:"
            .to_string(),
    );
    parts.join("\n")
}

/// Parse a strategy recommendation: `MODE:` / `REASON:` lines, with an
/// invalid or missing mode falling back to `delegate`.
pub fn parse_strategy_response(response: &str) -> (String, String) {
    let mut mode = "delegate".to_string();
    let mut reason = String::new();
    for line in response.lines() {
        let line = line.trim();
        let upper = line.to_uppercase();
        if upper.starts_with("MODE:") {
            mode = line[5..].trim().to_lowercase();
        } else if upper.starts_with("REASON:") {
            reason = line[7..].trim().to_string();
        }
    }
    const VALID: &[&str] = &["delegate", "quantum", "multi-session", "converse"];
    if !VALID.contains(&mode.as_str()) {
        mode = "delegate".to_string();
    }
    (mode, reason)
}

fn truncate(s: &str, max: usize) -> &str {
    legate_index::clip(s, max)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
