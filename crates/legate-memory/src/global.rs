// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cross-project ("global") memory: the user-wide learned profile.
//!
//! One JSON file for everything the runtime knows about the user across
//! projects: code style counters, per-skill effectiveness with a Beta
//! posterior, skill combinations, complexity sweet spots, per-mode
//! performance with EMA durations, and clustered cross-project errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use legate_index::{beta_posterior, ema, jaccard};

pub const MAX_SKILL_COMBOS: usize = 30;
pub const MAX_CROSS_ERRORS: usize = 20;
pub const MAX_TASK_KEYWORDS: usize = 50;

/// EMA smoothing for mode durations.
pub const DURATION_EMA_ALPHA: f64 = 0.15;

/// Two error-type strings this similar are the same cluster.
const ERROR_CLUSTER_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeStyle {
    pub let_count: u64,
    pub const_count: u64,
    pub let_preference: bool,
    pub camel_count: u64,
    pub snake_count: u64,
    pub naming_preference: String,
    pub comment_es: u64,
    pub comment_en: u64,
    pub comment_lang: String,
}

impl Default for CodeStyle {
    fn default() -> Self {
        Self {
            let_count: 0,
            const_count: 0,
            let_preference: true,
            camel_count: 0,
            snake_count: 0,
            naming_preference: "camelCase".to_string(),
            comment_es: 0,
            comment_en: 0,
            comment_lang: "es".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillStat {
    pub injected: u32,
    pub with_success: u32,
    pub with_truncation: u32,
    pub success_rate: f64,
    /// Beta-posterior mean of the success rate (α = 1 prior).
    pub bayesian_mean: f64,
    pub bayesian_ci_low: f64,
    pub bayesian_ci_high: f64,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCombo {
    /// Sorted skill names (2–4).
    pub skills: Vec<String>,
    pub count: u32,
    pub successes: u32,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityStats {
    pub avg_input_tokens: f64,
    pub avg_todos: f64,
    pub sweet_spot_todos: u32,
    pub sweet_spot_input_tokens: u32,
    pub successful_samples: u32,
}

impl Default for ComplexityStats {
    fn default() -> Self {
        Self {
            avg_input_tokens: 0.0,
            avg_todos: 0.0,
            sweet_spot_todos: 5,
            sweet_spot_input_tokens: 40_000,
            successful_samples: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeStat {
    pub total: u32,
    pub successes: u32,
    /// EMA-smoothed duration in seconds (α = 0.15).
    pub avg_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossError {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: u32,
    pub projects: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordStat {
    pub total: u32,
    pub successes: u32,
}

/// The persisted global profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMemory {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_delegations: u64,
    #[serde(default)]
    pub code_style: CodeStyle,
    #[serde(default)]
    pub skill_stats: HashMap<String, SkillStat>,
    #[serde(default)]
    pub skill_combos: Vec<SkillCombo>,
    #[serde(default)]
    pub complexity_stats: ComplexityStats,
    #[serde(default)]
    pub mode_stats: HashMap<String, ModeStat>,
    #[serde(default)]
    pub cross_project_errors: Vec<CrossError>,
    #[serde(default)]
    pub task_keyword_success: HashMap<String, KeywordStat>,
}

impl Default for GlobalMemory {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            created_at: now,
            updated_at: now,
            total_delegations: 0,
            code_style: CodeStyle::default(),
            skill_stats: HashMap::new(),
            skill_combos: Vec::new(),
            complexity_stats: ComplexityStats::default(),
            mode_stats: HashMap::new(),
            cross_project_errors: Vec::new(),
            task_keyword_success: HashMap::new(),
        }
    }
}

pub struct GlobalStore {
    path: PathBuf,
    pub data: GlobalMemory,
}

impl GlobalStore {
    pub fn load(base_dir: &Path) -> Self {
        let path = base_dir.join("global_memory.json");
        let data = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, data }
    }

    /// Compact and persist.  Failures are logged, never fatal.
    pub fn save(&mut self) {
        self.data.updated_at = Utc::now();
        self.compact();
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "could not create global memory dir");
                return;
            }
        }
        match serde_json::to_string_pretty(&self.data) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!(path = %self.path.display(), error = %e, "could not persist global memory");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize global memory"),
        }
    }

    /// Enforce section caps with priority eviction.
    pub fn compact(&mut self) {
        if self.data.skill_combos.len() > MAX_SKILL_COMBOS {
            self.data
                .skill_combos
                .sort_by_key(|c| std::cmp::Reverse(c.count));
            self.data.skill_combos.truncate(MAX_SKILL_COMBOS);
        }
        if self.data.cross_project_errors.len() > MAX_CROSS_ERRORS {
            self.data
                .cross_project_errors
                .sort_by_key(|e| std::cmp::Reverse(e.count));
            self.data.cross_project_errors.truncate(MAX_CROSS_ERRORS);
        }
        if self.data.task_keyword_success.len() > MAX_TASK_KEYWORDS {
            let mut sorted: Vec<(String, KeywordStat)> =
                self.data.task_keyword_success.drain().collect();
            sorted.sort_by_key(|(_, s)| std::cmp::Reverse(s.total));
            sorted.truncate(MAX_TASK_KEYWORDS);
            self.data.task_keyword_success = sorted.into_iter().collect();
        }
        self.purge_stale_skills();
    }

    /// Drop skills with under 2 injections and over 90 days of disuse, but
    /// only once the table has grown past 30 entries.
    fn purge_stale_skills(&mut self) {
        if self.data.skill_stats.len() <= 30 {
            return;
        }
        let now = Utc::now();
        self.data.skill_stats.retain(|_, st| {
            if st.injected >= 2 {
                return true;
            }
            match st.last_used {
                Some(last) => (now - last).num_days() <= 90,
                None => false,
            }
        });
    }

    /// Update one skill's counters and refresh its Beta posterior.
    pub fn update_skill_stat(&mut self, skill: &str, success: bool, truncated: bool) {
        let st = self.data.skill_stats.entry(skill.to_string()).or_default();
        st.injected += 1;
        if success {
            st.with_success += 1;
        }
        if truncated {
            st.with_truncation += 1;
        }
        st.success_rate = st.with_success as f64 / st.injected as f64;
        let est = beta_posterior(st.with_success, st.injected - st.with_success);
        st.bayesian_mean = est.mean;
        st.bayesian_ci_low = est.ci_low;
        st.bayesian_ci_high = est.ci_high;
        st.last_used = Some(Utc::now());
    }

    /// Record a combination of 2–4 skills injected together.
    pub fn update_skill_combo(&mut self, skills: &[String], success: bool) {
        if skills.len() < 2 {
            return;
        }
        let mut key: Vec<String> = skills.iter().take(4).cloned().collect();
        key.sort();
        if let Some(combo) = self.data.skill_combos.iter_mut().find(|c| c.skills == key) {
            combo.count += 1;
            if success {
                combo.successes += 1;
            }
            combo.success_rate = combo.successes as f64 / combo.count as f64;
            return;
        }
        self.data.skill_combos.push(SkillCombo {
            skills: key,
            count: 1,
            successes: if success { 1 } else { 0 },
            success_rate: if success { 1.0 } else { 0.0 },
        });
    }

    /// Record a cross-project error, clustering semantically: a new type
    /// string similar enough to an existing cluster increments it instead
    /// of appending.
    pub fn add_cross_error(&mut self, error_type: &str, project_name: &str) {
        let existing = self.data.cross_project_errors.iter_mut().find(|e| {
            e.kind == error_type || jaccard(&e.kind, error_type) >= ERROR_CLUSTER_THRESHOLD
        });
        if let Some(err) = existing {
            err.count += 1;
            if !err.projects.iter().any(|p| p == project_name) {
                err.projects.push(project_name.to_string());
            }
            err.last_seen = Utc::now();
            return;
        }
        self.data.cross_project_errors.push(CrossError {
            kind: error_type.to_string(),
            count: 1,
            projects: vec![project_name.to_string()],
            last_seen: Utc::now(),
        });
    }

    pub fn update_task_keyword(&mut self, keyword: &str, success: bool) {
        let kw = self
            .data
            .task_keyword_success
            .entry(keyword.to_string())
            .or_default();
        kw.total += 1;
        if success {
            kw.successes += 1;
        }
    }

    /// Record one mode execution with EMA duration smoothing.
    pub fn record_mode(&mut self, mode: &str, success: bool, duration_s: f64) {
        let st = self.data.mode_stats.entry(mode.to_string()).or_default();
        st.total += 1;
        if success {
            st.successes += 1;
        }
        st.avg_duration = ema(st.avg_duration, duration_s, DURATION_EMA_ALPHA);
    }

    /// Bayesian effectiveness means for the skill injector's boost.
    pub fn skill_effectiveness(&self) -> HashMap<String, f64> {
        self.data
            .skill_stats
            .iter()
            .map(|(name, st)| (name.clone(), st.bayesian_mean))
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
