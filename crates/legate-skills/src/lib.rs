// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skill injection for the legate runtime.
//!
//! Skills are markdown knowledge assets injected into upstream sessions —
//! at most once per session each, tracked by the session ledger.  Selection
//! is either negotiated (the backend picks from a compact catalogue) or
//! scored locally with a keyword + TF-IDF hybrid, under budgets that adapt
//! to task complexity.

pub mod catalog;
pub mod injector;
pub mod negotiate;

pub use catalog::{SkillAsset, SkillCatalog, ERROR_REFERENCE_SKILL};
pub use injector::{
    budget_for, build_skill_context, detect_relevant_skills, load_requested_skills, rank_skills,
    Budget, SkillContext,
};
pub use negotiate::{
    build_negotiate_prompt, parse_skill_response, NEGOTIATE_SYSTEM, NEGOTIATE_TIMEOUT_SECS,
};
