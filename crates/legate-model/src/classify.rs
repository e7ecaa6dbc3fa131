// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Coarse task-complexity classifier.
//!
//! Pattern heuristics only — no model call.  The bias is conservative: when
//! in doubt, classify one level up, because under-provisioning a complex
//! task costs a failed delegation while over-provisioning only costs a few
//! thousand context tokens.

use legate_index::normalize;
use serde::{Deserialize, Serialize};

/// Task complexity, ordered.  Drives model selection, output budgets and
/// skill-injection budgets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskLevel {
    #[default]
    Chat,
    Simple,
    CodeSimple,
    CodeComplex,
    Delegation,
}

impl TaskLevel {
    /// Stable lowercase name, used as a key into budget tables.
    pub fn name(&self) -> &'static str {
        match self {
            TaskLevel::Chat => "chat",
            TaskLevel::Simple => "simple",
            TaskLevel::CodeSimple => "code_simple",
            TaskLevel::CodeComplex => "code_complex",
            TaskLevel::Delegation => "delegation",
        }
    }
}

// Greetings, thanks, confirmations — Spanish and English.
const CHAT_PATTERNS: &[&str] = &[
    "hola",
    "hey",
    "hello",
    "hi",
    "buenas",
    "buenos dias",
    "buenas tardes",
    "buenas noches",
    "que tal",
    "como estas",
    "como andas",
    "que onda",
    "gracias",
    "muchas gracias",
    "thanks",
    "thank you",
    "adios",
    "chao",
    "bye",
    "nos vemos",
    "ok",
    "vale",
    "perfecto",
    "genial",
    "listo",
    "entendido",
    "si",
    "no",
    "claro",
    "dale",
    "de acuerdo",
];

const CODE_INDICATORS: &[&str] = &[
    // Code actions
    "crea",
    "crear",
    "implementa",
    "implementar",
    "programa",
    "programar",
    "arregla",
    "arreglar",
    "fix",
    "corrige",
    "corregir",
    "modifica",
    "modificar",
    "agrega",
    "agregar",
    "add",
    "elimina",
    "refactoriza",
    "optimiza",
    "escribe",
    "escribir",
    "genera",
    "generar",
    "build",
    // Code concepts
    "funcion",
    "function",
    "clase",
    "class",
    "variable",
    "metodo",
    "method",
    "archivo",
    "file",
    "modulo",
    "module",
    "componente",
    "endpoint",
    "api",
    "ruta",
    "route",
    "test",
    "debug",
    // Languages and stacks
    "javascript",
    "python",
    "typescript",
    "html",
    "css",
    "sql",
    "react",
    "node",
    "express",
    "canvas",
];

const COMPLEXITY_INDICATORS: &[&str] = &[
    // Scale
    "sistema",
    "system",
    "arquitectura",
    "architecture",
    "patron",
    "pattern",
    "modular",
    "framework",
    "pipeline",
    "workflow",
    // Multi-component
    "servidor",
    "server",
    "cliente",
    "client",
    "base de datos",
    "database",
    "autenticacion",
    "authentication",
    "deploy",
    // Broad scope
    "completo",
    "full",
    "entero",
    "proyecto",
    "project",
    "aplicacion",
    "application",
    "juego",
    "game",
    "refactorizar todo",
    "migrar",
    "migrate",
];

const QUESTION_STARTS: &[&str] = &[
    "que", "como", "por que", "cuando", "donde", "cual", "cuanto", "what", "how", "why", "when",
    "where", "which",
];

fn count_matches(text: &str, patterns: &[&str]) -> usize {
    patterns.iter().filter(|p| text.contains(**p)).count()
}

fn starts_with_question(text: &str) -> bool {
    QUESTION_STARTS.iter().any(|q| {
        text.strip_prefix(q)
            .map(|rest| rest.is_empty() || rest.starts_with(|c: char| !c.is_alphanumeric()))
            .unwrap_or(false)
    })
}

/// Classify a user message into its complexity level.
///
/// `is_delegation` forces the top level regardless of the text (the
/// delegate/quantum entry points always carry full context).
pub fn classify_task(message: &str, is_delegation: bool) -> TaskLevel {
    if is_delegation {
        return TaskLevel::Delegation;
    }
    if message.trim().is_empty() {
        return TaskLevel::Chat;
    }

    let normalized = normalize(message);
    let word_count = normalized.split_whitespace().count();

    // Short greetings / confirmations.
    if word_count <= 5 {
        let clean: String = normalized
            .chars()
            .map(|c| if "!?.,;:".contains(c) { ' ' } else { c })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if CHAT_PATTERNS.contains(&clean.as_str())
            || CHAT_PATTERNS.iter().any(|p| clean.contains(p))
        {
            return TaskLevel::Chat;
        }
    }
    let code_score = count_matches(&normalized, CODE_INDICATORS);
    if word_count <= 3 && code_score == 0 {
        return TaskLevel::Chat;
    }

    // Complex before simple so multi-indicator tasks are never
    // under-classified.
    let complexity_score = count_matches(&normalized, COMPLEXITY_INDICATORS);
    if complexity_score >= 2 {
        return TaskLevel::CodeComplex;
    }
    if complexity_score >= 1 && code_score >= 2 {
        return TaskLevel::CodeComplex;
    }
    if word_count > 50 && code_score >= 1 {
        return TaskLevel::CodeComplex;
    }

    // At least two code indicators — one alone ("file", "test") is not
    // enough to justify loading skills.
    if code_score >= 2 {
        return TaskLevel::CodeSimple;
    }

    if starts_with_question(&normalized) {
        return TaskLevel::Simple;
    }
    if code_score == 1 {
        return TaskLevel::Simple;
    }
    if word_count > 5 {
        return TaskLevel::Simple;
    }
    TaskLevel::Chat
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(TaskLevel::Chat < TaskLevel::Simple);
        assert!(TaskLevel::Simple < TaskLevel::CodeSimple);
        assert!(TaskLevel::CodeSimple < TaskLevel::CodeComplex);
        assert!(TaskLevel::CodeComplex < TaskLevel::Delegation);
    }

    #[test]
    fn greeting_is_chat() {
        assert_eq!(classify_task("hola", false), TaskLevel::Chat);
        assert_eq!(classify_task("gracias!", false), TaskLevel::Chat);
    }

    #[test]
    fn conceptual_question_is_simple() {
        assert_eq!(classify_task("que es una promise?", false), TaskLevel::Simple);
    }

    #[test]
    fn small_code_task_is_code_simple() {
        assert_eq!(
            classify_task("crea una funcion que ordene un array", false),
            TaskLevel::CodeSimple
        );
    }

    #[test]
    fn system_task_is_code_complex() {
        assert_eq!(
            classify_task(
                "implementa un sistema de autenticacion JWT con refresh tokens y rate limiting",
                false
            ),
            TaskLevel::CodeComplex
        );
    }

    #[test]
    fn delegation_flag_forces_top_level() {
        assert_eq!(classify_task("hola", true), TaskLevel::Delegation);
    }

    #[test]
    fn empty_message_is_chat() {
        assert_eq!(classify_task("   ", false), TaskLevel::Chat);
    }

    #[test]
    fn accented_text_classifies_like_ascii() {
        assert_eq!(
            classify_task("implementá una función que ordene un array", false),
            TaskLevel::CodeSimple
        );
    }

    #[test]
    fn long_prose_without_code_terms_is_simple() {
        let msg = "me gustaria entender mejor la diferencia entre los dos enfoques \
                   que discutimos ayer en la reunion del equipo";
        assert_eq!(classify_task(msg, false), TaskLevel::Simple);
    }

    #[test]
    fn level_names_are_stable() {
        assert_eq!(TaskLevel::CodeComplex.name(), "code_complex");
        assert_eq!(TaskLevel::Delegation.name(), "delegation");
    }
}
