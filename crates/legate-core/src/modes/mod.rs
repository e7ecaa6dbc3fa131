// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Execution modes: the strategies that turn a controller request into one
//! or more orchestrated session exchanges.
//!
//! - [`delegate`] — single-shot delegation with validation, review loop
//!   and chunked execution for oversized templates.
//! - [`quantum`] — two complementary angles in parallel, fused by the
//!   merge engine.
//! - [`multi`] — N role-differentiated instances, parallel or pipelined.
//! - [`converse`] — sequential multi-turn conversation in one session.
//! - [`plan`] — multi-step plans with context threading and retries.
//! - [`agent`] — the goal-directed tool loop with stall/hallucination
//!   recovery.

pub mod agent;
pub mod converse;
pub mod delegate;
pub mod multi;
pub mod plan;
pub mod quantum;

use std::path::PathBuf;

use legate_model::ChatBackend;
use legate_skills::SkillCatalog;
use legate_tools::ToolRegistry;

use crate::store::SessionStore;

/// Everything a mode runner needs to reach the outside world.
pub struct ModeContext<'a> {
    pub backend: &'a dyn ChatBackend,
    pub tools: &'a ToolRegistry,
    pub store: &'a tokio::sync::Mutex<SessionStore>,
    pub skills: Option<&'a SkillCatalog>,
    pub data_dir: Option<PathBuf>,
    pub thinking_enabled: bool,
    /// Templates above this estimate run chunked.
    pub chunk_threshold_tokens: usize,
}

impl<'a> ModeContext<'a> {
    pub fn new(
        backend: &'a dyn ChatBackend,
        tools: &'a ToolRegistry,
        store: &'a tokio::sync::Mutex<SessionStore>,
    ) -> Self {
        Self {
            backend,
            tools,
            store,
            skills: None,
            data_dir: None,
            thinking_enabled: true,
            chunk_threshold_tokens: crate::chunker::CHUNK_THRESHOLD_TOKENS,
        }
    }
}
