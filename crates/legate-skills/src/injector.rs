// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hybrid skill relevance scoring and budget-gated context assembly.
//!
//! Two scorers feed a combined rank: keyword substring matching (longer
//! keyword hits weigh more) and TF-IDF cosine against each skill's keyword
//! bag.  Cross-project memory can further boost skills that have earned a
//! good Bayesian success posterior.
//!
//! Budgets adapt to task level — a chat turn injects nothing, a full
//! delegation may carry 80K tokens of domain knowledge.

use std::collections::HashMap;

use legate_index::{cosine, estimate_tokens, normalize};
use legate_model::TaskLevel;

use crate::catalog::{SkillCatalog, ERROR_REFERENCE_SKILL, GAME_KEYWORDS, GAME_SKILLS};

/// Flat score bonus for game skills when the task mentions a game domain.
const GAME_BONUS: f64 = 20.0;

/// Reserved budget for the common-errors reference skill.
const ERROR_REFERENCE_BUDGET: usize = 5_000;

/// Token budgets per task level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub total: usize,
    pub domain: usize,
    pub specialist: usize,
}

/// Adaptive budget table.  Split: ~55-60% domain skills, ~25% specialist
/// overflow; the remainder absorbs headers and the error reference.
pub fn budget_for(level: TaskLevel) -> Budget {
    match level {
        TaskLevel::Chat | TaskLevel::Simple => Budget {
            total: 0,
            domain: 0,
            specialist: 0,
        },
        TaskLevel::CodeSimple => Budget {
            total: 10_000,
            domain: 6_000,
            specialist: 2_500,
        },
        TaskLevel::CodeComplex => Budget {
            total: 40_000,
            domain: 24_000,
            specialist: 10_000,
        },
        TaskLevel::Delegation => Budget {
            total: 80_000,
            domain: 45_000,
            specialist: 20_000,
        },
    }
}

/// Keyword score: sum of the lengths of keywords that substring-match the
/// normalized task text, plus the game bonus where applicable.
fn score_keywords(catalog: &SkillCatalog, task_norm: &str) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for skill in catalog.iter() {
        let mut score = 0.0;
        for kw in &skill.keywords {
            let kw_norm = normalize(kw);
            if !kw_norm.is_empty() && task_norm.contains(&kw_norm) {
                score += kw_norm.len() as f64;
            }
        }
        if score > 0.0 {
            scores.insert(skill.name.clone(), score);
        }
    }
    let is_game_context = GAME_KEYWORDS.iter().any(|kw| task_norm.contains(kw));
    if is_game_context {
        for name in GAME_SKILLS {
            if catalog.get(name).is_some() {
                *scores.entry((*name).to_string()).or_insert(0.0) += GAME_BONUS;
            }
        }
    }
    scores
}

/// Combined relevance ranking for a task.
///
/// `0.6 * normalized_keyword + 0.4 * tfidf_cosine`, optionally multiplied
/// by `0.5 + bayesian_mean` when the caller supplies per-skill posterior
/// means from cross-project memory.
pub fn rank_skills(
    catalog: &SkillCatalog,
    task: &str,
    effectiveness: Option<&HashMap<String, f64>>,
) -> Vec<(String, f64)> {
    if catalog.is_empty() || task.trim().is_empty() {
        return Vec::new();
    }
    let task_norm = normalize(task);
    let kw_scores = score_keywords(catalog, &task_norm);
    let kw_max = kw_scores.values().cloned().fold(0.0_f64, f64::max);
    let task_vec = catalog.index().vector(task);

    let mut ranked: Vec<(String, f64)> = catalog
        .iter()
        .filter_map(|skill| {
            let kw = kw_scores.get(&skill.name).copied().unwrap_or(0.0);
            let kw_norm = if kw_max > 0.0 { kw / kw_max } else { 0.0 };
            let tfidf = cosine(&task_vec, &catalog.index().vector(&skill.keyword_bag()));
            let mut combined = 0.6 * kw_norm + 0.4 * tfidf;
            if combined <= 0.0 {
                return None;
            }
            if let Some(eff) = effectiveness {
                if let Some(mean) = eff.get(&skill.name) {
                    combined *= 0.5 + mean;
                }
            }
            Some((skill.name.clone(), combined))
        })
        .collect();

    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// Top relevant skill names for a task, capped by level.
pub fn detect_relevant_skills(
    catalog: &SkillCatalog,
    task: &str,
    max_skills: usize,
    exclude: &[String],
    effectiveness: Option<&HashMap<String, f64>>,
) -> Vec<String> {
    rank_skills(catalog, task, effectiveness)
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| !exclude.contains(name))
        .take(max_skills)
        .collect()
}

/// Load skills into a formatted block while respecting a token budget.
///
/// Whole skills only — a skill that does not fit is skipped, except that
/// the very first skill may be partially included when at least 500 chars
/// of headroom remain.
fn load_with_budget(
    catalog: &SkillCatalog,
    names: &[String],
    token_budget: usize,
    header: &str,
) -> (String, usize, Vec<String>) {
    if names.is_empty() || token_budget == 0 {
        return (String::new(), 0, Vec::new());
    }
    let mut parts: Vec<String> = Vec::new();
    let mut loaded: Vec<String> = Vec::new();
    let mut used = estimate_tokens(header);

    for name in names {
        let Some(skill) = catalog.get(name) else {
            continue;
        };
        let tokens = skill.estimated_tokens();
        if used + tokens > token_budget {
            if parts.is_empty() {
                let remaining_chars = (token_budget.saturating_sub(used)) * 4;
                if remaining_chars > 500 {
                    let partial = legate_index::clip(&skill.content, remaining_chars);
                    parts.push(format!("\n--- {} ---\n{}\n", skill.name, partial));
                    loaded.push(skill.name.clone());
                    used += remaining_chars / 4;
                }
            }
            continue;
        }
        parts.push(format!("\n--- {} ---\n{}\n", skill.name, skill.content));
        loaded.push(skill.name.clone());
        used += tokens;
    }

    if loaded.is_empty() {
        return (String::new(), 0, Vec::new());
    }
    let mut out = String::from(header);
    out.push_str(&parts.concat());
    (out, used, loaded)
}

/// Result of assembling a skill context block.
#[derive(Debug, Clone, Default)]
pub struct SkillContext {
    pub content: String,
    pub tokens_used: usize,
    pub loaded: Vec<String>,
}

/// Build the full delegation skill context for a task.
///
/// Tiers: conditional error reference → domain skills by relevance →
/// specialist overflow when headroom remains.
pub fn build_skill_context(
    catalog: &SkillCatalog,
    task: &str,
    level: TaskLevel,
    has_recurring_errors: bool,
    effectiveness: Option<&HashMap<String, f64>>,
) -> SkillContext {
    let budget = budget_for(level);
    if budget.total == 0 || catalog.is_empty() {
        return SkillContext::default();
    }

    let mut parts: Vec<String> = Vec::new();
    let mut all_loaded: Vec<String> = Vec::new();
    let mut total_used = 0usize;

    if has_recurring_errors {
        let (ctx, used, loaded) = load_with_budget(
            catalog,
            &[ERROR_REFERENCE_SKILL.to_string()],
            ERROR_REFERENCE_BUDGET,
            "\n\n== ERRORES FRECUENTES (de tu historial) ==\n",
        );
        if !ctx.is_empty() {
            parts.push(ctx);
            all_loaded.extend(loaded);
            total_used += used;
        }
    }

    let max_domain = if level == TaskLevel::CodeSimple { 2 } else { 5 };
    let relevant = detect_relevant_skills(catalog, task, max_domain, &all_loaded, effectiveness);
    if !relevant.is_empty() {
        let domain_budget = budget.domain.min(budget.total.saturating_sub(total_used));
        let (ctx, used, loaded) = load_with_budget(
            catalog,
            &relevant,
            domain_budget,
            "\n\n== CONOCIMIENTO DE DOMINIO (por relevancia) ==\n",
        );
        if !ctx.is_empty() {
            parts.push(ctx);
            all_loaded.extend(loaded);
            total_used += used;
        }
    }

    // Specialist overflow only when real headroom remains.
    let remaining = budget.total.saturating_sub(total_used);
    if remaining > 2_000 && !relevant.is_empty() {
        let extra = detect_relevant_skills(catalog, task, max_domain + 5, &all_loaded, effectiveness);
        if !extra.is_empty() {
            let spec_budget = budget.specialist.min(remaining);
            let extra: Vec<String> = extra.into_iter().take(3).collect();
            let (ctx, used, loaded) = load_with_budget(
                catalog,
                &extra,
                spec_budget,
                "\n== REFERENCIA COMPLEMENTARIA ==\n",
            );
            if !ctx.is_empty() {
                parts.push(ctx);
                all_loaded.extend(loaded);
                total_used += used;
            }
        }
    }

    if parts.is_empty() {
        return SkillContext::default();
    }
    let mut content = parts.concat();
    content.push_str("\n== FIN CONOCIMIENTO ==\n");
    SkillContext {
        content,
        tokens_used: total_used,
        loaded: all_loaded,
    }
}

/// Load exactly the named skills (negotiation phase 2), in catalogue order,
/// within the level budget.  Skills that do not fit are omitted whole.
pub fn load_requested_skills(
    catalog: &SkillCatalog,
    requested: &[String],
    token_budget: usize,
) -> SkillContext {
    if requested.is_empty() {
        return SkillContext::default();
    }
    // Catalogue order, not request order.
    let ordered: Vec<String> = catalog
        .iter()
        .filter(|s| requested.contains(&s.name))
        .map(|s| s.name.clone())
        .collect();

    let mut parts = vec!["== SKILLS SOLICITADAS ==".to_string()];
    let mut used = 10usize; // header overhead
    let mut loaded = Vec::new();
    for name in &ordered {
        let Some(skill) = catalog.get(name) else {
            continue;
        };
        let tokens = skill.estimated_tokens();
        if used + tokens > token_budget {
            continue;
        }
        parts.push(format!("\n--- {} ---\n{}\n", skill.name, skill.content));
        used += tokens;
        loaded.push(skill.name.clone());
    }
    if loaded.is_empty() {
        return SkillContext::default();
    }
    parts.push("== FIN SKILLS ==".to_string());
    SkillContext {
        content: parts.join("\n"),
        tokens_used: used,
        loaded,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SkillAsset;

    fn skill(name: &str, description: &str, keywords: &[&str], content_len: usize) -> SkillAsset {
        SkillAsset {
            name: name.into(),
            description: description.into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            content: "x".repeat(content_len),
        }
    }

    fn catalog() -> SkillCatalog {
        SkillCatalog::for_tests(vec![
            skill("jwt-patterns", "JWT auth token flows", &["jwt", "token", "login", "auth"], 4000),
            skill("canvas-patterns", "Canvas 2D rendering", &["canvas", "render", "draw"], 4000),
            skill("sql-schema", "Relational schema design", &["sql", "schema", "database"], 4000),
        ])
    }

    // ── budgets ───────────────────────────────────────────────────────────────

    #[test]
    fn budgets_scale_with_level() {
        assert_eq!(budget_for(TaskLevel::Chat).total, 0);
        assert_eq!(budget_for(TaskLevel::Simple).total, 0);
        assert_eq!(budget_for(TaskLevel::CodeSimple).total, 10_000);
        assert_eq!(budget_for(TaskLevel::CodeComplex).total, 40_000);
        assert_eq!(budget_for(TaskLevel::Delegation).total, 80_000);
    }

    // ── ranking ───────────────────────────────────────────────────────────────

    #[test]
    fn keyword_hits_rank_first() {
        let ranked = rank_skills(&catalog(), "implementa login con jwt token", None);
        assert_eq!(ranked[0].0, "jwt-patterns");
    }

    #[test]
    fn unrelated_task_yields_empty() {
        let ranked = rank_skills(&catalog(), "hola", None);
        assert!(ranked.is_empty());
    }

    #[test]
    fn effectiveness_boost_reorders() {
        // Equal keyword scores: the Bayesian posterior decides the order.
        let cat = SkillCatalog::for_tests(vec![
            skill("strong", "widget building", &["widget"], 100),
            skill("weak", "widget helper", &["widget"], 100),
        ]);
        let base = rank_skills(&cat, "build a widget", None);
        assert_eq!(base[0].0, "strong", "tie resolves in catalogue order");

        let mut eff = HashMap::new();
        eff.insert("weak".to_string(), 0.95);
        eff.insert("strong".to_string(), 0.05);
        let boosted = rank_skills(&cat, "build a widget", Some(&eff));
        assert_eq!(boosted[0].0, "weak");
    }

    #[test]
    fn detect_respects_exclude_and_cap() {
        let cat = catalog();
        let found = detect_relevant_skills(
            &cat,
            "jwt token login canvas render sql database",
            2,
            &["jwt-patterns".to_string()],
            None,
        );
        assert_eq!(found.len(), 2);
        assert!(!found.contains(&"jwt-patterns".to_string()));
    }

    // ── context assembly ──────────────────────────────────────────────────────

    #[test]
    fn chat_level_injects_nothing() {
        let ctx = build_skill_context(&catalog(), "hola jwt", TaskLevel::Chat, false, None);
        assert!(ctx.content.is_empty());
        assert!(ctx.loaded.is_empty());
    }

    #[test]
    fn delegation_level_loads_relevant_skills() {
        let ctx = build_skill_context(
            &catalog(),
            "implementa login con jwt y token refresh",
            TaskLevel::Delegation,
            false,
            None,
        );
        assert!(ctx.loaded.contains(&"jwt-patterns".to_string()));
        assert!(ctx.content.contains("--- jwt-patterns ---"));
        assert!(ctx.content.ends_with("== FIN CONOCIMIENTO ==\n"));
        assert!(ctx.tokens_used > 0);
    }

    #[test]
    fn code_simple_caps_at_two_domain_skills() {
        let ctx = build_skill_context(
            &catalog(),
            "jwt token login canvas render sql database schema",
            TaskLevel::CodeSimple,
            false,
            None,
        );
        let domain_count = ctx
            .loaded
            .iter()
            .filter(|n| n.as_str() != ERROR_REFERENCE_SKILL)
            .count();
        assert!(domain_count <= 2 + 3, "domain {domain_count}");
    }

    #[test]
    fn error_reference_only_with_recurring_errors() {
        let mut assets = vec![skill("jwt-patterns", "JWT flows", &["jwt"], 1000)];
        assets.push(skill(ERROR_REFERENCE_SKILL, "Common failures", &[], 1000));
        let cat = SkillCatalog::for_tests(assets);

        let without = build_skill_context(&cat, "jwt login", TaskLevel::Delegation, false, None);
        assert!(!without.loaded.contains(&ERROR_REFERENCE_SKILL.to_string()));

        let with = build_skill_context(&cat, "jwt login", TaskLevel::Delegation, true, None);
        assert!(with.loaded.contains(&ERROR_REFERENCE_SKILL.to_string()));
        assert!(with.content.contains("ERRORES FRECUENTES"));
    }

    #[test]
    fn budget_skips_whole_skills_that_do_not_fit() {
        // 8000-token skills cannot both fit a CodeSimple domain budget.
        let cat = SkillCatalog::for_tests(vec![
            skill("big-one", "jwt stuff", &["jwt"], 8_000 * 4),
            skill("big-two", "jwt more", &["jwt"], 8_000 * 4),
        ]);
        let ctx = build_skill_context(&cat, "jwt login", TaskLevel::CodeSimple, false, None);
        // First skill partially included (first-skill allowance); second skipped whole.
        assert!(ctx.tokens_used <= budget_for(TaskLevel::CodeSimple).total);
    }

    // ── load_requested_skills ─────────────────────────────────────────────────

    #[test]
    fn requested_skills_load_in_catalog_order() {
        let cat = catalog();
        let ctx = load_requested_skills(
            &cat,
            &["sql-schema".to_string(), "canvas-patterns".to_string()],
            80_000,
        );
        let canvas_pos = ctx.content.find("--- canvas-patterns ---").unwrap();
        let sql_pos = ctx.content.find("--- sql-schema ---").unwrap();
        assert!(canvas_pos < sql_pos, "catalogue order, not request order");
        assert_eq!(ctx.loaded.len(), 2);
    }

    #[test]
    fn requested_skills_respect_budget_without_truncation() {
        let cat = catalog();
        // Budget fits one 1000-token skill only.
        let ctx = load_requested_skills(
            &cat,
            &["jwt-patterns".to_string(), "sql-schema".to_string()],
            1_100,
        );
        assert_eq!(ctx.loaded.len(), 1);
    }

    #[test]
    fn unknown_requested_names_are_ignored() {
        let ctx = load_requested_skills(&catalog(), &["no-such-skill".to_string()], 10_000);
        assert!(ctx.loaded.is_empty());
        assert!(ctx.content.is_empty());
    }
}
