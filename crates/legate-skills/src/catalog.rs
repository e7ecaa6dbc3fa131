// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skill assets: discovery, parsing and the compact catalogue.
//!
//! A skill is a markdown file in the skills directory with YAML
//! frontmatter:
//!
//! ```markdown
//! ---
//! description: Patterns for JWT auth flows.
//! keywords: [jwt, token, refresh, login]
//! ---
//!
//! # Body injected into the session…
//! ```
//!
//! The file stem is the skill name.  Files without a usable description
//! are skipped with a warning.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use legate_index::{estimate_tokens, TfIdf};

/// Skill files above this size are skipped.
const MAX_SKILL_FILE_BYTES: u64 = 256 * 1024;

/// The conditional common-errors reference skill (§ injector).
pub const ERROR_REFERENCE_SKILL: &str = "common-errors-reference";

/// Skills that get the flat game-context bonus.
pub const GAME_SKILLS: &[&str] = &[
    "canvas-patterns",
    "game-loop-architecture",
    "collision-systems",
    "procedural-audio",
];

/// Task keywords that signal a game-domain context.
pub const GAME_KEYWORDS: &[&str] = &[
    "game", "juego", "shooter", "shmup", "plataformas", "rpg", "arcade", "sprite",
];

#[derive(Debug, Deserialize)]
pub struct Frontmatter {
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// One loaded skill.
#[derive(Debug, Clone)]
pub struct SkillAsset {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    /// Body after the closing frontmatter fence.
    pub content: String,
}

impl SkillAsset {
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }

    /// Text bag used for the TF-IDF corpus: keywords plus description.
    pub fn keyword_bag(&self) -> String {
        let mut bag = self.keywords.join(" ");
        bag.push(' ');
        bag.push_str(&self.description);
        bag
    }
}

/// Parse a raw skill file into frontmatter fields and body.
pub fn parse_skill_file(raw: &str) -> Option<(Frontmatter, String)> {
    let rest = raw.trim_start_matches('\n');
    let after_open = rest.strip_prefix("---")?;
    let close = after_open.find("\n---")?;
    let yaml_block = &after_open[..close];
    let body = after_open[close + 4..].trim_start_matches('\n').to_string();
    let fm: Frontmatter = serde_yaml::from_str(yaml_block).ok()?;
    if fm.description.trim().is_empty() {
        return None;
    }
    Some((fm, body))
}

/// All skills in a directory plus the TF-IDF index over their bags.
///
/// Built once at startup; rebuilt only when the skill set changes.
pub struct SkillCatalog {
    skills: BTreeMap<String, SkillAsset>,
    index: TfIdf,
}

impl SkillCatalog {
    pub fn empty() -> Self {
        Self {
            skills: BTreeMap::new(),
            index: TfIdf::fit::<&str>(&[]),
        }
    }

    /// Scan `dir` non-recursively for `*.md` skill files.
    pub fn load(dir: &Path) -> Self {
        let mut skills = BTreeMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Self::empty(),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_md = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("md"))
                .unwrap_or(false);
            if !path.is_file() || !is_md {
                continue;
            }
            if path.metadata().map(|m| m.len()).unwrap_or(0) > MAX_SKILL_FILE_BYTES {
                warn!(path = %path.display(), "skipping oversized skill file");
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let raw = match std::fs::read_to_string(&path) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read skill file");
                    continue;
                }
            };
            let Some((fm, body)) = parse_skill_file(&raw) else {
                warn!(path = %path.display(), "skill frontmatter missing or invalid — skipping");
                continue;
            };
            skills.insert(
                name.clone(),
                SkillAsset {
                    name,
                    description: fm.description.trim().to_string(),
                    keywords: fm.keywords,
                    content: body,
                },
            );
        }
        Self::from_skills(skills)
    }

    fn from_skills(skills: BTreeMap<String, SkillAsset>) -> Self {
        let bags: Vec<String> = skills.values().map(|s| s.keyword_bag()).collect();
        let index = TfIdf::fit(&bags);
        Self { skills, index }
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SkillAsset> {
        self.skills.get(name)
    }

    /// Name-ordered iteration (catalogue order).
    pub fn iter(&self) -> impl Iterator<Item = &SkillAsset> {
        self.skills.values()
    }

    pub fn index(&self) -> &TfIdf {
        &self.index
    }

    /// Compact catalogue text for the negotiation protocol:
    /// one `name: description` line per skill.
    pub fn catalog_text(&self) -> String {
        if self.skills.is_empty() {
            return String::new();
        }
        let mut lines = vec![format!("SKILLS DISPONIBLES ({}):", self.skills.len())];
        for skill in self.skills.values() {
            let desc: String = skill.description.replace('\n', " ");
            lines.push(format!("  {}: {}", skill.name, legate_index::clip(&desc, 500)));
        }
        lines.join("\n")
    }

    #[cfg(test)]
    pub(crate) fn for_tests(assets: Vec<SkillAsset>) -> Self {
        Self::from_skills(assets.into_iter().map(|s| (s.name.clone(), s)).collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
