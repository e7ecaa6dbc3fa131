// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Briefing builders: compact context blocks injected once per session.
//!
//! Two flavors: the per-project briefing (architecture, conventions,
//! relevant history — up to ~15K tokens) and the cross-project developer
//! profile (≤2K tokens, fixed priority order).  Both degrade to an empty
//! string when the store has nothing worth saying; both are budget-gated
//! section by section.

use legate_index::estimate_tokens;

use crate::global::GlobalMemory;
use crate::project::{find_relevant, ProjectMemory};

/// Default token budget for the per-project briefing.
pub const PROJECT_BRIEFING_BUDGET: usize = 15_000;

/// Default / clamp bounds for the global profile briefing.
pub const GLOBAL_BRIEFING_BUDGET: usize = 2_000;
const GLOBAL_BUDGET_MIN: usize = 500;
const GLOBAL_BUDGET_MAX: usize = 3_000;

/// Minimum injections for a skill to be statistically interesting.
const MIN_SKILL_SAMPLES: u32 = 3;

fn push_within_budget(sections: &mut Vec<String>, used: &mut usize, budget: usize, text: String) {
    if text.is_empty() {
        return;
    }
    let tokens = estimate_tokens(&text);
    if *used + tokens <= budget {
        *used += tokens;
        sections.push(text);
    }
}

// ─── Per-project briefing ────────────────────────────────────────────────────

/// Build the project briefing for a task.
///
/// Sections in order: architecture → conventions → relevant errors →
/// relevant patterns → reinforced feedback rules.  Empty store → empty
/// string (the orchestrator then skips the injection entirely).
pub fn build_project_briefing(memory: &ProjectMemory, task: &str, token_budget: usize) -> String {
    let mut sections: Vec<String> = Vec::new();
    let mut used = 0usize;

    let header = format!(
        "== MEMORIA DEL PROYECTO: {} ==\n",
        if memory.project_name.is_empty() {
            "(sin nombre)"
        } else {
            &memory.project_name
        }
    );
    used += estimate_tokens(&header);

    if !memory.architecture.description.is_empty() || !memory.architecture.structure.is_empty() {
        let mut text = String::from("ARQUITECTURA:\n");
        if !memory.architecture.description.is_empty() {
            text.push_str(&format!("- {}\n", memory.architecture.description));
        }
        if !memory.architecture.structure.is_empty() {
            text.push_str(&format!("- Estructura: {}\n", memory.architecture.structure));
        }
        for decision in memory.architecture.key_decisions.iter().take(5) {
            text.push_str(&format!("- Decision: {decision}\n"));
        }
        push_within_budget(&mut sections, &mut used, token_budget, text);
    }

    {
        let conv = &memory.conventions;
        let mut lines = Vec::new();
        if !conv.naming.is_empty() {
            lines.push(format!("- Naming: {}", conv.naming));
        }
        if !conv.imports.is_empty() {
            lines.push(format!("- Imports: {}", conv.imports));
        }
        if !conv.patterns.is_empty() {
            lines.push(format!("- Patrones: {}", conv.patterns));
        }
        for rule in conv.custom_rules.iter().take(5) {
            lines.push(format!("- Regla: {rule}"));
        }
        if !lines.is_empty() {
            push_within_budget(
                &mut sections,
                &mut used,
                token_budget,
                format!("CONVENCIONES:\n{}\n", lines.join("\n")),
            );
        }
    }

    {
        let errors = find_relevant(&memory.error_log, task, 5);
        if !errors.is_empty() {
            let mut text = String::from("ERRORES PREVIOS RELEVANTES:\n");
            for e in errors {
                text.push_str(&format!("- [{}] {}\n", e.kind, e.message));
            }
            push_within_budget(&mut sections, &mut used, token_budget, text);
        }
    }

    {
        let patterns = find_relevant(&memory.patterns, task, 5);
        if !patterns.is_empty() {
            let mut text = String::from("PATRONES EXITOSOS:\n");
            for p in patterns {
                text.push_str(&format!("- {} ({}x): {}\n", p.name, p.use_count, p.description));
            }
            push_within_budget(&mut sections, &mut used, token_budget, text);
        }
    }

    {
        let mut rules: Vec<_> = memory
            .feedback_rules
            .iter()
            .filter(|r| r.occurrences >= 2)
            .collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.occurrences));
        if !rules.is_empty() {
            let mut text = String::from("REGLAS APRENDIDAS:\n");
            for r in rules.iter().take(8) {
                text.push_str(&format!("- ({}x) {}\n", r.occurrences, r.action));
            }
            push_within_budget(&mut sections, &mut used, token_budget, text);
        }
    }

    if sections.is_empty() {
        return String::new();
    }
    format!("{header}{}\n== FIN MEMORIA ==\n", sections.join("\n"))
}

// ─── Cross-project briefing ──────────────────────────────────────────────────

/// Build the developer-profile briefing.
///
/// Fixed priority order: code style → recommended/avoid skills →
/// cross-project recurring errors → complexity sweet spots → mode
/// performance.  Requires at least two delegations of history.
pub fn build_global_briefing(memory: &GlobalMemory, token_budget: usize) -> String {
    if memory.total_delegations < 2 {
        return String::new();
    }
    let budget = token_budget.clamp(GLOBAL_BUDGET_MIN, GLOBAL_BUDGET_MAX);
    let mut sections: Vec<String> = Vec::new();
    let mut used = 0usize;

    let header = "\n\n== PERFIL PERSONAL DEL DESARROLLADOR ==\n";
    used += estimate_tokens(header);

    push_within_budget(&mut sections, &mut used, budget, format_code_style(memory));
    push_within_budget(&mut sections, &mut used, budget, format_skill_recommendations(memory));
    push_within_budget(&mut sections, &mut used, budget, format_cross_errors(memory));
    push_within_budget(&mut sections, &mut used, budget, format_complexity(memory));
    push_within_budget(&mut sections, &mut used, budget, format_mode_performance(memory));

    if sections.is_empty() {
        return String::new();
    }
    format!("{header}{}\n== FIN PERFIL PERSONAL ==\n", sections.join("\n"))
}

fn format_code_style(memory: &GlobalMemory) -> String {
    let style = &memory.code_style;
    let total_vars = style.let_count + style.const_count;
    if total_vars < 5 {
        return String::new();
    }
    let mut parts = vec!["ESTILO DE CODIGO:".to_string()];
    if style.let_preference {
        let pct = style.let_count * 100 / total_vars;
        parts.push(format!("- Usar let (no const) — {pct}% de preferencia historica"));
    } else {
        let pct = style.const_count * 100 / total_vars;
        parts.push(format!("- Usar const — {pct}% de preferencia historica"));
    }
    if !style.naming_preference.is_empty() {
        parts.push(format!("- Naming: {}", style.naming_preference));
    }
    if !style.comment_lang.is_empty() {
        let lang = if style.comment_lang == "es" { "espanol" } else { "ingles" };
        parts.push(format!("- Comentarios en {lang}"));
    }
    parts.join("\n") + "\n"
}

fn format_skill_recommendations(memory: &GlobalMemory) -> String {
    let significant: Vec<(&String, &crate::global::SkillStat)> = memory
        .skill_stats
        .iter()
        .filter(|(_, st)| st.injected >= MIN_SKILL_SAMPLES)
        .collect();
    if significant.is_empty() {
        return String::new();
    }

    let mut top = significant.clone();
    top.sort_by(|a, b| {
        b.1.success_rate
            .partial_cmp(&a.1.success_rate)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Avoid list: success < 40% or truncation rate > 50%.
    let mut avoid: Vec<(&String, f64, f64)> = significant
        .iter()
        .filter_map(|(name, st)| {
            let trunc_rate = st.with_truncation as f64 / st.injected.max(1) as f64;
            if st.success_rate < 0.4 || trunc_rate > 0.5 {
                Some((*name, st.success_rate, trunc_rate))
            } else {
                None
            }
        })
        .collect();
    avoid.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut parts = vec!["SKILLS RECOMENDADAS (por tasa de exito real):".to_string()];
    for (name, st) in top.iter().take(5) {
        parts.push(format!(
            "- {name}: {:.0}% exito ({} usos)",
            st.success_rate * 100.0,
            st.injected
        ));
    }
    if !avoid.is_empty() {
        parts.push("EVITAR:".to_string());
        for (name, rate, trunc) in avoid.iter().take(3) {
            let mut reason = format!("{:.0}% exito", rate * 100.0);
            if *trunc > 0.3 {
                reason.push_str(&format!(", trunca {:.0}%", trunc * 100.0));
            }
            parts.push(format!("- {name} ({reason})"));
        }
    }
    parts.join("\n") + "\n"
}

fn format_cross_errors(memory: &GlobalMemory) -> String {
    let mut significant: Vec<&crate::global::CrossError> = memory
        .cross_project_errors
        .iter()
        .filter(|e| e.projects.len() >= 2 || e.count >= 3)
        .collect();
    if significant.is_empty() {
        return String::new();
    }
    significant.sort_by_key(|e| std::cmp::Reverse(e.count));
    let mut parts = vec!["ERRORES RECURRENTES (cross-proyecto):".to_string()];
    for err in significant.iter().take(5) {
        parts.push(format!(
            "- {}: {}x en {} proyecto(s)",
            err.kind,
            err.count,
            err.projects.len()
        ));
    }
    parts.join("\n") + "\n"
}

fn format_complexity(memory: &GlobalMemory) -> String {
    let comp = &memory.complexity_stats;
    if comp.successful_samples < 3 {
        return String::new();
    }
    format!(
        "COMPLEJIDAD OPTIMA:\n- TODOs por template: {} (sweet spot historico)\n- Input tokens optimo: ~{}\n",
        comp.sweet_spot_todos, comp.sweet_spot_input_tokens
    )
}

fn format_mode_performance(memory: &GlobalMemory) -> String {
    let mut significant: Vec<(&String, &crate::global::ModeStat)> = memory
        .mode_stats
        .iter()
        .filter(|(_, st)| st.total >= 2)
        .collect();
    if significant.is_empty() {
        return String::new();
    }
    significant.sort_by(|a, b| {
        let ra = a.1.successes as f64 / a.1.total.max(1) as f64;
        let rb = b.1.successes as f64 / b.1.total.max(1) as f64;
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut parts = vec!["RENDIMIENTO POR MODO:".to_string()];
    for (name, st) in significant {
        let rate = st.successes as f64 / st.total.max(1) as f64;
        parts.push(format!(
            "- {name}: {:.0}% exito ({} usos, ~{:.0}s promedio)",
            rate * 100.0,
            st.total,
            st.avg_duration
        ));
    }
    parts.join("\n") + "\n"
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::GlobalStore;
    use crate::project::ProjectStore;
    use std::path::Path;
    use tempfile::TempDir;

    // ── project briefing ──────────────────────────────────────────────────────

    #[test]
    fn empty_project_store_yields_empty_briefing() {
        let tmp = TempDir::new().unwrap();
        let s = ProjectStore::load(tmp.path(), Path::new("/work/p"));
        assert_eq!(build_project_briefing(&s.data, "task", PROJECT_BRIEFING_BUDGET), "");
    }

    #[test]
    fn project_briefing_includes_relevant_sections() {
        let tmp = TempDir::new().unwrap();
        let mut s = ProjectStore::load(tmp.path(), Path::new("/work/p"));
        s.data.architecture.description = "SPA with canvas game loop".into();
        s.data.conventions.naming = "camelCase".into();
        s.add_error("truncation", "canvas loop cut", vec!["canvas".into()]);
        s.add_feedback_rule("truncation", "Dividir en 2 delegaciones", vec![]);
        s.add_feedback_rule("truncation", "Dividir en 2 delegaciones", vec![]);

        let briefing = build_project_briefing(&s.data, "canvas render", PROJECT_BRIEFING_BUDGET);
        assert!(briefing.contains("ARQUITECTURA:"));
        assert!(briefing.contains("CONVENCIONES:"));
        assert!(briefing.contains("ERRORES PREVIOS RELEVANTES:"));
        assert!(briefing.contains("REGLAS APRENDIDAS:"));
        assert!(briefing.ends_with("== FIN MEMORIA ==\n"));
    }

    #[test]
    fn project_briefing_respects_budget() {
        let tmp = TempDir::new().unwrap();
        let mut s = ProjectStore::load(tmp.path(), Path::new("/work/p"));
        s.data.architecture.description = "d".repeat(4000);
        let briefing = build_project_briefing(&s.data, "task", 100);
        // Architecture alone exceeds 100 tokens → dropped → empty briefing.
        assert!(briefing.is_empty());
    }

    #[test]
    fn single_occurrence_rules_are_not_briefed() {
        let tmp = TempDir::new().unwrap();
        let mut s = ProjectStore::load(tmp.path(), Path::new("/work/p"));
        s.add_feedback_rule("once", "only happened once", vec![]);
        let briefing = build_project_briefing(&s.data, "task", PROJECT_BRIEFING_BUDGET);
        assert!(!briefing.contains("only happened once"));
    }

    // ── global briefing ───────────────────────────────────────────────────────

    fn seeded_global(tmp: &TempDir) -> GlobalStore {
        let mut s = GlobalStore::load(tmp.path());
        s.data.total_delegations = 10;
        s.data.code_style.let_count = 80;
        s.data.code_style.const_count = 20;
        for _ in 0..4 {
            s.update_skill_stat("good-skill", true, false);
        }
        for _ in 0..4 {
            s.update_skill_stat("bad-skill", false, true);
        }
        s.record_mode("delegate", true, 12.0);
        s.record_mode("delegate", true, 14.0);
        s
    }

    #[test]
    fn fresh_global_store_yields_empty_briefing() {
        let tmp = TempDir::new().unwrap();
        let s = GlobalStore::load(tmp.path());
        assert_eq!(build_global_briefing(&s.data, GLOBAL_BRIEFING_BUDGET), "");
    }

    #[test]
    fn global_briefing_priority_order() {
        let tmp = TempDir::new().unwrap();
        let s = seeded_global(&tmp);
        let briefing = build_global_briefing(&s.data, GLOBAL_BRIEFING_BUDGET);
        let style = briefing.find("ESTILO DE CODIGO:").unwrap();
        let skills = briefing.find("SKILLS RECOMENDADAS").unwrap();
        let modes = briefing.find("RENDIMIENTO POR MODO:").unwrap();
        assert!(style < skills && skills < modes);
    }

    #[test]
    fn bad_skills_land_in_avoid_list() {
        let tmp = TempDir::new().unwrap();
        let s = seeded_global(&tmp);
        let briefing = build_global_briefing(&s.data, GLOBAL_BRIEFING_BUDGET);
        assert!(briefing.contains("EVITAR:"));
        let avoid_pos = briefing.find("EVITAR:").unwrap();
        let bad_pos = briefing.rfind("bad-skill").unwrap();
        assert!(bad_pos > avoid_pos);
    }

    #[test]
    fn under_sampled_skills_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut s = GlobalStore::load(tmp.path());
        s.data.total_delegations = 5;
        s.update_skill_stat("once-used", true, false);
        let briefing = build_global_briefing(&s.data, GLOBAL_BRIEFING_BUDGET);
        assert!(!briefing.contains("once-used"));
    }

    #[test]
    fn budget_is_clamped() {
        let tmp = TempDir::new().unwrap();
        let s = seeded_global(&tmp);
        // Absurd budgets still produce a sane briefing.
        let tiny = build_global_briefing(&s.data, 1);
        let huge = build_global_briefing(&s.data, 1_000_000);
        assert!(estimate_tokens(&tiny) <= GLOBAL_BUDGET_MIN + 50);
        assert!(estimate_tokens(&huge) <= GLOBAL_BUDGET_MAX + 50);
    }

    #[test]
    fn cross_errors_need_significance() {
        let tmp = TempDir::new().unwrap();
        let mut s = GlobalStore::load(tmp.path());
        s.data.total_delegations = 5;
        s.data.code_style.let_count = 10;
        s.add_cross_error("one-off oddity", "p");
        let briefing = build_global_briefing(&s.data, GLOBAL_BRIEFING_BUDGET);
        assert!(!briefing.contains("one-off oddity"));

        s.add_cross_error("one-off oddity", "p");
        s.add_cross_error("one-off oddity", "p");
        let briefing = build_global_briefing(&s.data, GLOBAL_BRIEFING_BUDGET);
        assert!(briefing.contains("one-off oddity"));
    }
}
