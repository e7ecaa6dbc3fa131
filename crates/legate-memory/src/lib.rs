// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Learned memory for the legate runtime.
//!
//! Two stores with the same persistence discipline (JSON on disk, capped
//! sections, logged-never-fatal writes):
//! - [`project::ProjectStore`] — per-project rules, errors, conventions
//!   and patterns ("surgical" memory), compacted by decay-weighted
//!   relevance.
//! - [`global::GlobalStore`] — the cross-project developer profile with
//!   Bayesian skill effectiveness and per-mode performance.
//!
//! Learners and briefing builders are fail-safe: an internal error
//! degrades to an empty contribution, never a failed delegation.

pub mod briefing;
pub mod global;
pub mod learner;
pub mod project;

pub use briefing::{
    build_global_briefing, build_project_briefing, GLOBAL_BRIEFING_BUDGET, PROJECT_BRIEFING_BUDGET,
};
pub use global::{GlobalMemory, GlobalStore, ModeStat, SkillStat};
pub use learner::{learn_from_delegation, ValidationFacts};
pub use project::{
    find_relevant, infer_project_root, project_id, DelegationRecord, MemoryEntry, ProjectMemory,
    ProjectStore,
};
