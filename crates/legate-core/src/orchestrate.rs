// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session orchestrator: decides, per call, what must be sent for the
//! first time.
//!
//! Given a mode, an identifier and the task text, it produces a
//! [`CallPlan`]: the system prompt (only when the session has never seen
//! one) and the context blocks whose ledger ids are not yet recorded.
//! This is the component that turns a ~90K-token session bootstrap into a
//! ~200-token follow-up.
//!
//! Every detection phase is fail-safe: an error contributes nothing.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use legate_index::estimate_tokens_chat;
use legate_memory::{
    build_global_briefing, build_project_briefing, infer_project_root, GlobalStore, ProjectStore,
    GLOBAL_BRIEFING_BUDGET, PROJECT_BRIEFING_BUDGET,
};
use legate_model::{classify_task, TaskLevel};
use legate_skills::{detect_relevant_skills, SkillCatalog};

use crate::protocol::{Injection, InjectionKind};
use crate::store::{build_session_name, SessionStore};

/// Ready-to-run plan for one session exchange.
#[derive(Debug)]
pub struct CallPlan {
    pub session_name: String,
    pub mode: String,
    pub level: TaskLevel,
    /// Non-empty iff the session does not exist or has not seen a system
    /// prompt yet.
    pub system_prompt: Option<String>,
    pub system_prompt_tokens: usize,
    pub pending_injections: Vec<Injection>,
    pub user_message: String,
}

/// Memory handles loaded during planning, handed back for post-delegation
/// learning.
#[derive(Default)]
pub struct MemoryHandles {
    pub project: Option<ProjectStore>,
    pub global: Option<GlobalStore>,
}

pub struct Orchestrator<'a> {
    pub skills: Option<&'a SkillCatalog>,
    /// Data directory for the memory stores.  `None` disables both
    /// memory phases.
    pub data_dir: Option<PathBuf>,
    /// Working directory used to infer the project root.
    pub project_dir: Option<PathBuf>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(skills: Option<&'a SkillCatalog>, data_dir: Option<PathBuf>) -> Self {
        Self {
            skills,
            data_dir,
            project_dir: std::env::current_dir().ok(),
        }
    }

    /// Build the call plan for one exchange.
    ///
    /// `system_prompt_builder` is only invoked when Phase 1 is actually
    /// needed, so heavy prompt assembly is skipped on session reuse.
    #[allow(clippy::too_many_arguments)]
    pub async fn prepare_session_call(
        &self,
        store: &tokio::sync::Mutex<SessionStore>,
        mode: &str,
        identifier: &str,
        user_message: &str,
        system_prompt_builder: Option<&(dyn Fn() -> String + Sync)>,
        task_text: &str,
        is_delegation: bool,
        extra_injections: Vec<Injection>,
    ) -> (CallPlan, MemoryHandles) {
        let session_name = build_session_name(mode, identifier, "");
        let detection_text = if task_text.is_empty() {
            user_message
        } else {
            task_text
        };
        let level = classify_task(detection_text, is_delegation);

        let (needs_system, already): (bool, Vec<String>) = {
            let store = store.lock().await;
            match store.get(&session_name) {
                Some(session) => (!session.system_prompt_sent, session.injected_contexts.clone()),
                None => (true, Vec::new()),
            }
        };

        let system_prompt = if needs_system {
            system_prompt_builder.map(|b| b())
        } else {
            None
        };
        let system_prompt_tokens = system_prompt
            .as_deref()
            .map(estimate_tokens_chat)
            .unwrap_or(0);

        let mut handles = MemoryHandles::default();
        // The global store loads first: skill scoring consumes its
        // Bayesian effectiveness table.
        if let Some(data_dir) = &self.data_dir {
            handles.global = Some(GlobalStore::load(data_dir));
        }
        let mut pending: Vec<Injection> = Vec::new();

        // 1. Skills — only for code-level tasks, ledger-deduped.
        pending.extend(self.detect_skill_injections(detection_text, level, &already, &handles));

        // 2. Per-project memory briefing.
        if let Some(injection) = self.detect_project_injection(detection_text, &already, &mut handles)
        {
            pending.push(injection);
        }

        // 3. Cross-project profile briefing.
        if let Some(injection) = self.detect_global_injection(&already, &mut handles) {
            pending.push(injection);
        }

        // 4. Extra injections (knowledge transfers), deduped last.
        for injection in extra_injections {
            if !already.contains(&injection.context_id())
                && !pending.iter().any(|p| p.context_id() == injection.context_id())
            {
                pending.push(injection);
            }
        }

        debug!(
            session = %session_name,
            level = level.name(),
            system = system_prompt.is_some(),
            injections = pending.len(),
            "call plan ready"
        );

        (
            CallPlan {
                session_name,
                mode: mode.to_string(),
                level,
                system_prompt,
                system_prompt_tokens,
                pending_injections: pending,
                user_message: user_message.to_string(),
            },
            handles,
        )
    }

    fn detect_skill_injections(
        &self,
        task_text: &str,
        level: TaskLevel,
        already: &[String],
        handles: &MemoryHandles,
    ) -> Vec<Injection> {
        let Some(catalog) = self.skills else {
            return Vec::new();
        };
        if level <= TaskLevel::Simple {
            return Vec::new();
        }
        let max_skills = if level == TaskLevel::CodeSimple { 2 } else { 5 };
        let effectiveness: Option<HashMap<String, f64>> =
            handles.global.as_ref().map(|g| g.skill_effectiveness());

        detect_relevant_skills(catalog, task_text, max_skills, &[], effectiveness.as_ref())
            .into_iter()
            .filter(|name| !already.contains(&format!("skill:{name}")))
            .filter_map(|name| {
                catalog
                    .get(&name)
                    .map(|skill| Injection::new(InjectionKind::Skill, name, skill.content.clone()))
            })
            .collect()
    }

    fn detect_project_injection(
        &self,
        task_text: &str,
        already: &[String],
        handles: &mut MemoryHandles,
    ) -> Option<Injection> {
        if already.iter().any(|c| c == "memory:surgical-project") {
            return None;
        }
        let data_dir = self.data_dir.as_ref()?;
        let project_root = infer_project_root(self.project_dir.as_ref()?)?;
        let store = ProjectStore::load(data_dir, &project_root);
        let briefing = build_project_briefing(&store.data, task_text, PROJECT_BRIEFING_BUDGET);
        handles.project = Some(store);
        if briefing.trim().is_empty() {
            return None;
        }
        Some(Injection::new(
            InjectionKind::Memory,
            "surgical-project",
            briefing,
        ))
    }

    fn detect_global_injection(
        &self,
        already: &[String],
        handles: &mut MemoryHandles,
    ) -> Option<Injection> {
        if already.iter().any(|c| c == "global:developer-profile") {
            return None;
        }
        let store = handles.global.as_ref()?;
        let briefing = build_global_briefing(&store.data, GLOBAL_BRIEFING_BUDGET);
        if briefing.trim().is_empty() {
            return None;
        }
        Some(Injection::new(
            InjectionKind::Global,
            "developer-profile",
            briefing,
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
