// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-project ("surgical") memory store.
//!
//! One JSON file per project under `<data>/surgical_memory/`, with
//! structured sections and hard caps per section.  Compaction keeps the
//! top-relevance subset, where relevance is
//! `decay(age, 30d half-life) * (1 + 0.1*(freq-1))`.
//!
//! Writes are logged-never-fatal: the in-memory state stays the source of
//! truth for the running process even when the disk write fails.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use legate_index::{cosine, jaccard, relevance, TfIdf};

pub const MAX_ERROR_LOG: usize = 30;
pub const MAX_DELEGATION_HISTORY: usize = 20;
pub const MAX_PATTERNS: usize = 15;
pub const MAX_FEEDBACK_RULES: usize = 20;
pub const MAX_SHADOW_CORRECTIONS: usize = 20;
pub const MAX_FAILURE_ANALYSES: usize = 15;

/// Files that mark a project root when walking upward from the CWD.
const ROOT_MARKERS: &[&str] = &[".git", "Cargo.toml", "package.json", "pyproject.toml"];

/// Find the project root containing `start`, walking up through parents.
pub fn infer_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start.to_path_buf());
    while let Some(dir) = current {
        if ROOT_MARKERS.iter().any(|m| dir.join(m).exists()) {
            return Some(dir);
        }
        current = dir.parent().map(|p| p.to_path_buf());
    }
    None
}

/// Stable project id: `{basename}_{8 hex of sha256(normalized path)}`.
pub fn project_id(project_path: &Path) -> String {
    let normalized = project_path.to_string_lossy().to_lowercase();
    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
    let name = project_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    format!("{name}_{}", &digest[..8])
}

// ─── Entry types ─────────────────────────────────────────────────────────────

/// Uniform access for relevance scoring and retrieval.
pub trait MemoryEntry {
    /// Text representation used for semantic retrieval.
    fn text(&self) -> String;
    /// Use/occurrence counter feeding the relevance frequency bonus.
    fn frequency(&self) -> u32 {
        1
    }
    fn timestamp(&self) -> DateTime<Utc>;

    fn relevance(&self, now: DateTime<Utc>) -> f64 {
        let age_days = (now - self.timestamp()).num_seconds().max(0) as f64 / 86_400.0;
        relevance(age_days, self.frequency())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub task_keywords: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry for ErrorEntry {
    fn text(&self) -> String {
        format!("{} {} {}", self.kind, self.message, self.task_keywords.join(" "))
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub task: String,
    pub mode: String,
    pub success: bool,
    pub duration_s: f64,
    #[serde(default)]
    pub validation_summary: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry for DelegationRecord {
    fn text(&self) -> String {
        format!("{} {} {}", self.task, self.mode, self.validation_summary)
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEntry {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub function_signatures: Vec<String>,
    pub use_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl MemoryEntry for PatternEntry {
    fn text(&self) -> String {
        format!("{} {} {}", self.name, self.description, self.keywords.join(" "))
    }
    fn frequency(&self) -> u32 {
        self.use_count
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.last_used
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRule {
    pub trigger: String,
    pub action: String,
    #[serde(default)]
    pub task_keywords: Vec<String>,
    pub occurrences: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl MemoryEntry for FeedbackRule {
    fn text(&self) -> String {
        format!("{} {} {}", self.trigger, self.action, self.task_keywords.join(" "))
    }
    fn frequency(&self) -> u32 {
        self.occurrences
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowCorrection {
    pub pattern_type: String,
    pub description: String,
    pub frequency: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl MemoryEntry for ShadowCorrection {
    fn text(&self) -> String {
        format!("{} {}", self.pattern_type, self.description)
    }
    fn frequency(&self) -> u32 {
        self.frequency
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub root_cause: String,
    pub description: String,
    #[serde(default)]
    pub task: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry for FailureAnalysis {
    fn text(&self) -> String {
        format!("{} {} {}", self.root_cause, self.description, self.task)
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Architecture {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub structure: String,
    #[serde(default)]
    pub key_decisions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conventions {
    #[serde(default)]
    pub naming: String,
    #[serde(default)]
    pub imports: String,
    #[serde(default)]
    pub patterns: String,
    #[serde(default)]
    pub custom_rules: Vec<String>,
}

/// The persisted shape of one project's memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMemory {
    pub version: u32,
    pub project_id: String,
    pub project_path: String,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default)]
    pub conventions: Conventions,
    #[serde(default)]
    pub error_log: Vec<ErrorEntry>,
    #[serde(default)]
    pub delegation_history: Vec<DelegationRecord>,
    #[serde(default)]
    pub patterns: Vec<PatternEntry>,
    #[serde(default)]
    pub feedback_rules: Vec<FeedbackRule>,
    #[serde(default)]
    pub shadow_corrections: Vec<ShadowCorrection>,
    #[serde(default)]
    pub failure_analyses: Vec<FailureAnalysis>,
}

impl ProjectMemory {
    fn new(project_path: &Path) -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            project_id: project_id(project_path),
            project_path: project_path.to_string_lossy().to_string(),
            project_name: project_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            created_at: now,
            updated_at: now,
            architecture: Architecture::default(),
            conventions: Conventions::default(),
            error_log: Vec::new(),
            delegation_history: Vec::new(),
            patterns: Vec::new(),
            feedback_rules: Vec::new(),
            shadow_corrections: Vec::new(),
            failure_analyses: Vec::new(),
        }
    }

    /// True when failure-derived feedback keeps recurring — the signal that
    /// makes the skill injector load the error reference.
    pub fn has_recurring_errors(&self) -> bool {
        self.feedback_rules.iter().any(|r| r.occurrences >= 2) || self.error_log.len() >= 3
    }
}

/// Keep the `cap` most relevant entries of a section.
fn compact_by_relevance<T: MemoryEntry + Clone>(entries: &mut Vec<T>, cap: usize) {
    if entries.len() <= cap {
        return;
    }
    let now = Utc::now();
    let mut scored: Vec<(T, f64)> = entries
        .drain(..)
        .map(|e| {
            let score = e.relevance(now);
            (e, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(cap);
    *entries = scored.into_iter().map(|(e, _)| e).collect();
}

/// Keep the `cap` entries with the highest counter.
fn compact_by_counter<T: Clone>(entries: &mut Vec<T>, cap: usize, counter: impl Fn(&T) -> u32) {
    if entries.len() <= cap {
        return;
    }
    entries.sort_by_key(|e| std::cmp::Reverse(counter(e)));
    entries.truncate(cap);
}

/// Project memory with its disk location.
pub struct ProjectStore {
    path: PathBuf,
    pub data: ProjectMemory,
}

impl ProjectStore {
    /// Load (or initialize) the store for a project.  A missing or corrupt
    /// file starts empty.
    pub fn load(base_dir: &Path, project_path: &Path) -> Self {
        let dir = base_dir.join("surgical_memory");
        let path = dir.join(format!("{}.json", project_id(project_path)));
        let data = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| ProjectMemory::new(project_path));
        Self { path, data }
    }

    /// Compact and persist.  Failures are logged, never fatal.
    pub fn save(&mut self) {
        self.data.updated_at = Utc::now();
        self.compact();
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "could not create memory dir");
                return;
            }
        }
        match serde_json::to_string_pretty(&self.data) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!(path = %self.path.display(), error = %e, "could not persist project memory");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize project memory"),
        }
    }

    /// Enforce every section cap.  Idempotent.
    pub fn compact(&mut self) {
        compact_by_relevance(&mut self.data.error_log, MAX_ERROR_LOG);
        compact_by_relevance(&mut self.data.delegation_history, MAX_DELEGATION_HISTORY);
        compact_by_counter(&mut self.data.patterns, MAX_PATTERNS, |p| p.use_count);
        compact_by_counter(&mut self.data.feedback_rules, MAX_FEEDBACK_RULES, |r| {
            r.occurrences
        });
        compact_by_counter(&mut self.data.shadow_corrections, MAX_SHADOW_CORRECTIONS, |s| {
            s.frequency
        });
        compact_by_relevance(&mut self.data.failure_analyses, MAX_FAILURE_ANALYSES);
    }

    pub fn add_error(&mut self, kind: &str, message: &str, task_keywords: Vec<String>) {
        self.data.error_log.push(ErrorEntry {
            kind: kind.to_string(),
            message: message.to_string(),
            task_keywords,
            timestamp: Utc::now(),
        });
    }

    pub fn add_delegation(&mut self, record: DelegationRecord) {
        self.data.delegation_history.push(record);
    }

    /// Add a pattern, or bump its use count when the name already exists.
    pub fn add_pattern(&mut self, name: &str, description: &str, keywords: Vec<String>, signatures: Vec<String>) {
        let now = Utc::now();
        if let Some(existing) = self.data.patterns.iter_mut().find(|p| p.name == name) {
            existing.use_count += 1;
            existing.last_used = now;
            return;
        }
        self.data.patterns.push(PatternEntry {
            name: name.to_string(),
            description: description.to_string(),
            keywords,
            function_signatures: signatures,
            use_count: 1,
            created_at: now,
            last_used: now,
        });
    }

    /// Add a feedback rule, or reinforce it when the trigger already exists.
    pub fn add_feedback_rule(&mut self, trigger: &str, action: &str, task_keywords: Vec<String>) {
        let now = Utc::now();
        if let Some(existing) = self
            .data
            .feedback_rules
            .iter_mut()
            .find(|r| r.trigger == trigger)
        {
            existing.occurrences += 1;
            existing.last_seen = now;
            return;
        }
        self.data.feedback_rules.push(FeedbackRule {
            trigger: trigger.to_string(),
            action: action.to_string(),
            task_keywords,
            occurrences: 1,
            created_at: now,
            last_seen: now,
        });
    }

    /// Record a shadow-learning correction, deduplicated by pattern type.
    pub fn add_shadow_correction(&mut self, pattern_type: &str, description: &str) {
        let now = Utc::now();
        if let Some(existing) = self
            .data
            .shadow_corrections
            .iter_mut()
            .find(|c| c.pattern_type == pattern_type)
        {
            existing.frequency += 1;
            existing.last_seen = now;
            if !description.is_empty() {
                existing.description = description.to_string();
            }
            return;
        }
        self.data.shadow_corrections.push(ShadowCorrection {
            pattern_type: pattern_type.to_string(),
            description: description.to_string(),
            frequency: 1,
            first_seen: now,
            last_seen: now,
        });
    }

    pub fn add_failure_analysis(&mut self, root_cause: &str, description: &str, task: &str) {
        self.data.failure_analyses.push(FailureAnalysis {
            root_cause: root_cause.to_string(),
            description: description.to_string(),
            task: task.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Rank a section's entries against a query: TF-IDF cosine × relevance,
/// falling back to Jaccard token overlap when IDF zeroes out the corpus
/// (which it does for very small corpora).
pub fn find_relevant<'a, T: MemoryEntry>(
    entries: &'a [T],
    query: &str,
    top_k: usize,
) -> Vec<&'a T> {
    if query.trim().is_empty() || entries.is_empty() {
        return Vec::new();
    }
    let now = Utc::now();
    let texts: Vec<String> = entries.iter().map(|e| e.text()).collect();
    let mut corpus: Vec<String> = texts.clone();
    corpus.push(query.to_string());
    let index = TfIdf::fit(&corpus);
    let query_vec = index.vector(query);

    let mut scored: Vec<(&T, f64)> = entries
        .iter()
        .zip(&texts)
        .filter_map(|(entry, text)| {
            let sim = cosine(&query_vec, &index.vector(text));
            if sim > 0.0 {
                Some((entry, sim * entry.relevance(now)))
            } else {
                None
            }
        })
        .collect();

    if scored.is_empty() {
        scored = entries
            .iter()
            .zip(&texts)
            .filter_map(|(entry, text)| {
                let overlap = jaccard(query, text);
                if overlap > 0.0 {
                    Some((entry, overlap * entry.relevance(now)))
                } else {
                    None
                }
            })
            .collect();
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(top_k).map(|(e, _)| e).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> ProjectStore {
        ProjectStore::load(tmp.path(), Path::new("/work/myproj"))
    }

    // ── identity ──────────────────────────────────────────────────────────────

    #[test]
    fn project_id_is_stable_and_named() {
        let a = project_id(Path::new("/work/myproj"));
        let b = project_id(Path::new("/work/myproj"));
        assert_eq!(a, b);
        assert!(a.starts_with("myproj_"));
        assert_eq!(a.len(), "myproj_".len() + 8);
    }

    #[test]
    fn different_paths_get_different_ids() {
        assert_ne!(
            project_id(Path::new("/work/a")),
            project_id(Path::new("/work/b"))
        );
    }

    #[test]
    fn infer_project_root_finds_marker() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        let nested = root.join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(infer_project_root(&nested).unwrap(), root);
    }

    // ── persistence ───────────────────────────────────────────────────────────

    #[test]
    fn load_save_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        s.add_error("truncation", "response cut off", vec!["game".into()]);
        s.save();

        let s2 = store(&tmp);
        assert_eq!(s2.data.error_log.len(), 1);
        assert_eq!(s2.data.error_log[0].kind, "truncation");
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("surgical_memory");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.json", project_id(Path::new("/work/myproj"))));
        std::fs::write(&path, "{broken").unwrap();
        let s = store(&tmp);
        assert!(s.data.error_log.is_empty());
    }

    // ── compaction bounds ─────────────────────────────────────────────────────

    #[test]
    fn compaction_enforces_all_caps() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        for i in 0..60 {
            s.add_error("e", &format!("m{i}"), vec![]);
            s.add_delegation(DelegationRecord {
                task: format!("t{i}"),
                mode: "delegate".into(),
                success: true,
                duration_s: 1.0,
                validation_summary: String::new(),
                timestamp: Utc::now(),
            });
            s.add_pattern(&format!("p{i}"), "d", vec![], vec![]);
            s.add_feedback_rule(&format!("trig{i}"), "a", vec![]);
            s.add_shadow_correction(&format!("pt{i}"), "d");
            s.add_failure_analysis("rc", "d", "t");
        }
        s.save();
        assert!(s.data.error_log.len() <= MAX_ERROR_LOG);
        assert!(s.data.delegation_history.len() <= MAX_DELEGATION_HISTORY);
        assert!(s.data.patterns.len() <= MAX_PATTERNS);
        assert!(s.data.feedback_rules.len() <= MAX_FEEDBACK_RULES);
        assert!(s.data.shadow_corrections.len() <= MAX_SHADOW_CORRECTIONS);
        assert!(s.data.failure_analyses.len() <= MAX_FAILURE_ANALYSES);
    }

    #[test]
    fn compaction_keeps_highest_frequency_rules() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        for i in 0..(MAX_FEEDBACK_RULES + 5) {
            s.add_feedback_rule(&format!("trig{i}"), "a", vec![]);
        }
        // Reinforce one rule heavily; it must survive compaction.
        for _ in 0..10 {
            s.add_feedback_rule("trig3", "a", vec![]);
        }
        s.compact();
        assert!(s.data.feedback_rules.iter().any(|r| r.trigger == "trig3"));
        assert_eq!(s.data.feedback_rules[0].trigger, "trig3");
    }

    #[test]
    fn compaction_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        for i in 0..40 {
            s.add_error("e", &format!("m{i}"), vec![]);
        }
        s.compact();
        let after_first: Vec<String> =
            s.data.error_log.iter().map(|e| e.message.clone()).collect();
        s.compact();
        let after_second: Vec<String> =
            s.data.error_log.iter().map(|e| e.message.clone()).collect();
        assert_eq!(after_first, after_second);
    }

    // ── refcounted sections ───────────────────────────────────────────────────

    #[test]
    fn feedback_rules_dedupe_on_trigger() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        s.add_feedback_rule("truncation", "split the task", vec![]);
        s.add_feedback_rule("truncation", "split the task", vec![]);
        assert_eq!(s.data.feedback_rules.len(), 1);
        assert_eq!(s.data.feedback_rules[0].occurrences, 2);
    }

    #[test]
    fn patterns_dedupe_on_name() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        s.add_pattern("audio_pattern", "procedural audio", vec![], vec![]);
        s.add_pattern("audio_pattern", "procedural audio", vec![], vec![]);
        assert_eq!(s.data.patterns.len(), 1);
        assert_eq!(s.data.patterns[0].use_count, 2);
    }

    #[test]
    fn shadow_corrections_dedupe_on_pattern_type() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        s.add_shadow_correction("const_to_let", "user flips const to let");
        s.add_shadow_correction("const_to_let", "");
        assert_eq!(s.data.shadow_corrections.len(), 1);
        assert_eq!(s.data.shadow_corrections[0].frequency, 2);
        // Empty description does not clobber the existing one.
        assert!(!s.data.shadow_corrections[0].description.is_empty());
    }

    // ── retrieval ─────────────────────────────────────────────────────────────

    #[test]
    fn find_relevant_prefers_matching_entries() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        s.add_error("truncation", "canvas render loop was cut", vec!["canvas".into()]);
        s.add_error("syntax", "database migration failed", vec!["sql".into()]);
        s.add_error("logic", "audio mixer clipping", vec!["audio".into()]);

        let hits = find_relevant(&s.data.error_log, "canvas rendering issue", 2);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].kind, "truncation");
    }

    #[test]
    fn find_relevant_small_corpus_uses_jaccard_fallback() {
        // A single entry: IDF of every term is ln(1) = 0, so cosine scoring
        // yields nothing and the Jaccard path must kick in.
        let entries = vec![ErrorEntry {
            kind: "truncation".into(),
            message: "render loop truncated".into(),
            task_keywords: vec![],
            timestamp: Utc::now(),
        }];
        let hits = find_relevant(&entries, "truncated render", 5);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn find_relevant_empty_query_is_empty() {
        let entries: Vec<ErrorEntry> = Vec::new();
        assert!(find_relevant(&entries, "", 5).is_empty());
    }

    // ── recurring errors signal ───────────────────────────────────────────────

    #[test]
    fn recurring_errors_signal() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp);
        assert!(!s.data.has_recurring_errors());
        s.add_feedback_rule("truncation", "a", vec![]);
        s.add_feedback_rule("truncation", "a", vec![]);
        assert!(s.data.has_recurring_errors());
    }
}
