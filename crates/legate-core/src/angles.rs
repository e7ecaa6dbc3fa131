// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Complementary-angle detection for dual ("quantum") execution.
//!
//! Priority: an oversized template splits by markers into two halves;
//! otherwise task keywords pick a named preset; otherwise the game preset
//! (the most common delegation shape) is the fallback.

use legate_index::slugify;

use crate::validate::{estimate_template, TemplateEstimate};

/// One work perspective of a dual execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleSpec {
    pub name: String,
    pub label: String,
    pub focus: String,
    /// Extra system-prompt text constraining this angle's scope.
    pub system_extra: String,
    /// When non-empty, only these template markers belong to the angle.
    pub todos_filter: Vec<String>,
}

impl AngleSpec {
    fn preset(name: &str, label: &str, focus: &str, system_extra: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            focus: focus.to_string(),
            system_extra: system_extra.to_string(),
            todos_filter: Vec::new(),
        }
    }
}

fn game_pair() -> (AngleSpec, AngleSpec) {
    (
        AngleSpec::preset(
            "logic_data",
            "Logica y Datos",
            "datos, constantes, logica de juego, colisiones, spawning, estado",
            "Tu responsabilidad: SOLO las funciones de DATOS y LOGICA.\n\
             Incluye: constantes/objetos de configuracion, funciones de inicializacion, \
             logica de colisiones, spawning de entidades, actualizacion de estado.\n\
             NO implementes: funciones de dibujo/render, efectos visuales, HUD, \
             ni nada que use ctx.fillRect/drawImage/stroke.",
        ),
        AngleSpec::preset(
            "ui_render",
            "UI y Renderizado",
            "renderizado, dibujo, efectos visuales, HUD, particulas, audio",
            "Tu responsabilidad: SOLO las funciones de RENDERIZADO y UI.\n\
             Incluye: funciones de dibujo (draw*), efectos visuales, particulas, \
             HUD/interfaz, animaciones, audio, game loop principal.\n\
             NO implementes: constantes de datos, logica de colisiones, spawning. \
             ASUME que las funciones de logica ya existen y usalas por nombre.",
        ),
    )
}

fn fullstack_pair() -> (AngleSpec, AngleSpec) {
    (
        AngleSpec::preset(
            "backend",
            "Backend",
            "servidor, API endpoints, base de datos, logica de negocio",
            "Tu responsabilidad: SOLO el codigo del BACKEND.\n\
             Incluye: endpoints API, modelos de datos, validacion, \
             logica de negocio, middleware, autenticacion.",
        ),
        AngleSpec::preset(
            "frontend",
            "Frontend",
            "interfaz, componentes, estilos, interaccion de usuario",
            "Tu responsabilidad: SOLO el codigo del FRONTEND.\n\
             Incluye: componentes UI, estilos, manejo de eventos, \
             llamadas a API, estado del cliente, renderizado.",
        ),
    )
}

fn refactor_pair() -> (AngleSpec, AngleSpec) {
    (
        AngleSpec::preset(
            "structure",
            "Estructura",
            "tipos, interfaces, modulos, organizacion de archivos",
            "Tu responsabilidad: ESTRUCTURA del codigo.\n\
             Incluye: definir tipos/interfaces, organizar modulos, \
             establecer imports, crear esqueletos de clases/funciones.",
        ),
        AngleSpec::preset(
            "implementation",
            "Implementacion",
            "logica interna, algoritmos, optimizacion de funciones",
            "Tu responsabilidad: IMPLEMENTACION interna.\n\
             Incluye: cuerpo de funciones, algoritmos, optimizaciones, \
             manejo de errores, logica de negocio detallada.",
        ),
    )
}

const GAME_KEYWORDS: &[&str] = &["game", "juego", "shooter", "shmup", "plataformas", "rpg"];
const FULLSTACK_KEYWORDS: &[&str] =
    &["fullstack", "servidor", "server", "api", "frontend", "backend"];
const REFACTOR_KEYWORDS: &[&str] = &["refactor", "refactorizar", "reestructurar", "optimizar"];

/// Split a large template's markers into two angle halves.
fn template_split_angles(estimate: &TemplateEstimate) -> (AngleSpec, AngleSpec) {
    let first = estimate.suggested_splits.first().cloned().unwrap_or_default();
    let second = estimate.suggested_splits.get(1).cloned().unwrap_or_default();

    let describe = |half: &[String]| {
        let head: Vec<&str> = half.iter().take(5).map(|s| s.as_str()).collect();
        let ellipsis = if half.len() > 5 { "..." } else { "" };
        format!("Implementar: {}{ellipsis}", head.join(", "))
    };
    let constrain = |half: &[String]| {
        format!(
            "Implementa SOLAMENTE estos TODOs: {}\n\
             NO implementes los demas TODOs del template. \
             Para las funciones que NO te corresponden, deja el marcador TODO intacto.",
            half.join(", ")
        )
    };

    let angle_a = AngleSpec {
        name: "todos_first_half".into(),
        label: format!("TODOs 1-{}", first.len()),
        focus: describe(&first),
        system_extra: constrain(&first),
        todos_filter: first.clone(),
    };
    let angle_b = AngleSpec {
        name: "todos_second_half".into(),
        label: format!("TODOs {}-{}", first.len() + 1, first.len() + second.len()),
        focus: describe(&second),
        system_extra: constrain(&second),
        todos_filter: second,
    };
    (angle_a, angle_b)
}

/// Auto-detect the complementary angles for a task (and template).
pub fn detect_angles(task: &str, template: Option<&str>) -> (AngleSpec, AngleSpec) {
    if let Some(template) = template {
        let estimate = estimate_template(template);
        if estimate.recommended_split && !estimate.suggested_splits.is_empty() {
            return template_split_angles(&estimate);
        }
    }

    let task_lower = task.to_lowercase();
    if GAME_KEYWORDS.iter().any(|kw| task_lower.contains(kw)) {
        return game_pair();
    }
    if FULLSTACK_KEYWORDS.iter().any(|kw| task_lower.contains(kw)) {
        return fullstack_pair();
    }
    if REFACTOR_KEYWORDS.iter().any(|kw| task_lower.contains(kw)) {
        return refactor_pair();
    }
    game_pair()
}

/// Manually labelled angles from `--quantum-angles "a,b"`.
pub fn manual_angles(label_a: &str, label_b: &str) -> (AngleSpec, AngleSpec) {
    let build = |label: &str| AngleSpec {
        name: slugify(label, 40),
        label: label.to_string(),
        focus: label.to_string(),
        system_extra: format!(
            "Tu responsabilidad: {label}. Implementa SOLO lo relacionado con este aspecto."
        ),
        todos_filter: Vec::new(),
    };
    (build(label_a), build(label_b))
}

/// Enrich a base system prompt with one angle's constraints.
pub fn build_angle_system_prompt(base_system: &str, angle: &AngleSpec) -> String {
    let mut parts = vec![base_system.to_string()];
    parts.push(format!("\n\n== MODO QUANTUM: ANGULO '{}' ==", angle.label.to_uppercase()));
    parts.push(format!("Focus: {}", angle.focus));
    if !angle.system_extra.is_empty() {
        parts.push(format!("\n{}", angle.system_extra));
    }
    if !angle.todos_filter.is_empty() {
        parts.push(format!("\nTODOs asignados a ti: {}", angle.todos_filter.join(", ")));
    }
    parts.push(
        "\nIMPORTANTE: Tu respuesta sera FUSIONADA con la de otro angulo. \
         Asegurate de que tu codigo sea modular y las funciones tengan \
         nombres claros para facilitar la fusion."
            .to_string(),
    );
    parts.push("== FIN INSTRUCCIONES QUANTUM ==\n".to_string());
    parts.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_keywords_pick_game_pair() {
        let (a, b) = detect_angles("crea un juego shooter", None);
        assert_eq!(a.name, "logic_data");
        assert_eq!(b.name, "ui_render");
    }

    #[test]
    fn fullstack_keywords_pick_backend_frontend() {
        let (a, b) = detect_angles("api con frontend y servidor", None);
        assert_eq!(a.name, "backend");
        assert_eq!(b.name, "frontend");
    }

    #[test]
    fn refactor_keywords_pick_structure_implementation() {
        let (a, b) = detect_angles("refactorizar el modulo de pagos", None);
        assert_eq!(a.name, "structure");
        assert_eq!(b.name, "implementation");
    }

    #[test]
    fn no_keywords_fall_back_to_game_pair() {
        let (a, _) = detect_angles("algo generico sin pistas", None);
        assert_eq!(a.name, "logic_data");
    }

    #[test]
    fn big_template_splits_markers_in_halves() {
        let template: String = (0..10)
            .map(|i| format!("// === TODO {i}: func{i} ===\n"))
            .collect();
        let (a, b) = detect_angles("whatever", Some(&template));
        assert_eq!(a.name, "todos_first_half");
        assert_eq!(a.todos_filter.len(), 5);
        assert_eq!(b.todos_filter.len(), 5);
        assert!(a.system_extra.contains("func0"));
        assert!(b.system_extra.contains("func5"));
    }

    #[test]
    fn small_template_does_not_split() {
        let template = "// === TODO 1: alpha ===\n// === TODO 2: beta ===";
        let (a, _) = detect_angles("crea un juego", Some(template));
        assert_eq!(a.name, "logic_data");
    }

    #[test]
    fn manual_angles_slugify_names() {
        let (a, b) = manual_angles("Red Neuronal", "Visualizacion 3D");
        assert_eq!(a.name, "red-neuronal");
        assert_eq!(b.name, "visualizacion-3d");
        assert!(a.system_extra.contains("Red Neuronal"));
    }

    #[test]
    fn angle_prompt_embeds_constraints() {
        let (a, _) = detect_angles("juego", None);
        let prompt = build_angle_system_prompt("BASE", &a);
        assert!(prompt.starts_with("BASE"));
        assert!(prompt.contains("ANGULO 'LOGICA Y DATOS'"));
        assert!(prompt.contains("sera FUSIONADA"));
    }

    #[test]
    fn split_angle_prompt_lists_markers() {
        let template: String = (0..10)
            .map(|i| format!("// === TODO {i}: f{i} ===\n"))
            .collect();
        let (a, _) = detect_angles("x", Some(&template));
        let prompt = build_angle_system_prompt("BASE", &a);
        assert!(prompt.contains("TODOs asignados a ti:"));
    }
}
