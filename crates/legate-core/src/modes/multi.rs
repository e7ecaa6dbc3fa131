// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-session mode: N instances with differentiated roles.
//!
//! Generalizes the dual strategy to any number of backends, each carrying
//! a role-specific system-prompt suffix and a priority.  `parallel_execute`
//! fans out and joins; `sequential_pipeline` runs by descending priority,
//! feeding each output forward as `PREVIOUS OUTPUT:`.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use legate_model::{ChatBackend, TransportError};

/// Context carried into the next pipeline stage is capped here.
const PIPELINE_CONTEXT_CAP: usize = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Generator,
    Reviewer,
    Tester,
    Specialist,
    Merger,
}

/// One instance's role definition.
#[derive(Debug, Clone)]
pub struct SessionRole {
    pub role_type: RoleType,
    pub label: String,
    /// Appended to the base system prompt.
    pub system_suffix: String,
    pub max_steps: u32,
    /// Higher runs earlier in the pipeline.
    pub priority: i32,
}

const GENERATOR_SUFFIX: &str = "\n\nROLE: GENERATOR\n\
You are the primary code generator. Create COMPLETE, functional code. \
Follow all TODO markers if a template is provided. \
Never leave stubs or placeholders.";

const REVIEWER_SUFFIX: &str = "\n\nROLE: REVIEWER\n\
You are reviewing code for correctness. \
List ONLY real bugs and issues (max 10). \
Format: ISSUE N: [file/function] description\n\
Do NOT suggest style changes. Focus on logic errors, \
missing implementations, and runtime failures.";

const TESTER_SUFFIX: &str = "\n\nROLE: TESTER\n\
You generate comprehensive tests for the given code. \
Cover edge cases, error paths, and integration points. \
Use the testing framework appropriate for the language.";

const SPECIALIST_SUFFIX: &str = "\n\nROLE: SPECIALIST\n\
You are a domain specialist. Focus on your area of expertise \
and provide the most technically accurate implementation possible. \
Your domain: {domain}";

const MERGER_SUFFIX: &str = "\n\nROLE: MERGER\n\
You combine outputs from multiple code generators into one \
cohesive, complete implementation. Resolve conflicts by choosing \
the more complete or correct version. Output ONLY the final merged code.";

/// Build a configured role.
pub fn build_role(role_type: RoleType, label: &str, domain: &str, max_steps: u32) -> SessionRole {
    let system_suffix = match role_type {
        RoleType::Generator => GENERATOR_SUFFIX.to_string(),
        RoleType::Reviewer => REVIEWER_SUFFIX.to_string(),
        RoleType::Tester => TESTER_SUFFIX.to_string(),
        RoleType::Specialist => SPECIALIST_SUFFIX.replace("{domain}", domain),
        RoleType::Merger => MERGER_SUFFIX.to_string(),
    };
    let priority = match role_type {
        RoleType::Generator => 10,
        RoleType::Specialist => 8,
        RoleType::Reviewer | RoleType::Tester => 5,
        RoleType::Merger => 0,
    };
    SessionRole {
        role_type,
        label: if label.is_empty() {
            format!("{role_type:?}").to_lowercase()
        } else {
            label.to_string()
        },
        system_suffix,
        max_steps,
        priority,
    }
}

/// Named role presets for the CLI.
pub fn preset_roles(name: &str, instances: usize) -> Vec<SessionRole> {
    let roles = match name {
        "dual-generator" => vec![
            build_role(RoleType::Generator, "gen-A", "", 10),
            build_role(RoleType::Generator, "gen-B", "", 10),
        ],
        "full-pipeline" => vec![
            build_role(RoleType::Generator, "gen", "", 10),
            build_role(RoleType::Reviewer, "review", "", 3),
            build_role(RoleType::Tester, "test", "", 3),
        ],
        "specialist-pair" => vec![
            build_role(RoleType::Specialist, "spec-frontend", "frontend", 10),
            build_role(RoleType::Specialist, "spec-backend", "backend", 10),
        ],
        // Default: generator + reviewer.
        _ => vec![
            build_role(RoleType::Generator, "gen", "", 10),
            build_role(RoleType::Reviewer, "review", "", 3),
        ],
    };
    roles.into_iter().take(instances.max(1)).collect()
}

#[derive(Debug, Serialize)]
pub struct InstanceResult {
    pub role_label: String,
    pub role_type: RoleType,
    pub response: String,
    pub duration_s: f64,
    pub error: Option<String>,
}

impl InstanceResult {
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.response.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct MultiResult {
    pub results: Vec<InstanceResult>,
    pub total_duration_s: f64,
}

impl MultiResult {
    pub fn all_success(&self) -> bool {
        self.results.iter().all(|r| r.success())
    }

    pub fn get_by_role(&self, role_type: RoleType) -> Option<&InstanceResult> {
        self.results.iter().find(|r| r.role_type == role_type)
    }
}

/// N backends with their roles.
pub struct MultiSession<'a> {
    pub instances: Vec<(&'a dyn ChatBackend, SessionRole)>,
}

impl<'a> MultiSession<'a> {
    pub fn new(instances: Vec<(&'a dyn ChatBackend, SessionRole)>) -> Self {
        Self { instances }
    }

    async fn run_instance(
        backend: &dyn ChatBackend,
        role: &SessionRole,
        system: &str,
        task: &str,
    ) -> InstanceResult {
        let started = Instant::now();
        let prompt = format!("{system}{}\n\nTAREA:\n{task}", role.system_suffix);
        match backend.chat(&prompt, true, None, 3).await {
            Ok(response) => {
                info!(role = %role.label, chars = response.len(), "instance complete");
                InstanceResult {
                    role_label: role.label.clone(),
                    role_type: role.role_type,
                    response,
                    duration_s: started.elapsed().as_secs_f64(),
                    error: None,
                }
            }
            Err(e) => {
                warn!(role = %role.label, error = %e, "instance failed");
                InstanceResult {
                    role_label: role.label.clone(),
                    role_type: role.role_type,
                    response: String::new(),
                    duration_s: started.elapsed().as_secs_f64(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Fan out all instances concurrently and join.
    pub async fn parallel_execute(&self, task: &str, base_system: &str) -> MultiResult {
        let started = Instant::now();
        info!(instances = self.instances.len(), "parallel execution");
        let futures = self
            .instances
            .iter()
            .map(|(backend, role)| Self::run_instance(*backend, role, base_system, task));
        let results = futures::future::join_all(futures).await;
        MultiResult {
            results,
            total_duration_s: started.elapsed().as_secs_f64(),
        }
    }

    /// Run instances by descending priority, feeding each successful
    /// output into the next stage.
    pub async fn sequential_pipeline(&self, task: &str, base_system: &str) -> MultiResult {
        let started = Instant::now();
        let mut order: Vec<&(&dyn ChatBackend, SessionRole)> = self.instances.iter().collect();
        order.sort_by_key(|(_, role)| std::cmp::Reverse(role.priority));
        info!(
            pipeline = %order
                .iter()
                .map(|(_, r)| r.label.as_str())
                .collect::<Vec<_>>()
                .join(" -> "),
            "sequential pipeline"
        );

        let mut results = Vec::new();
        let mut accumulated = String::new();
        for (backend, role) in order {
            let mut system = base_system.to_string();
            if !accumulated.is_empty() {
                let context = legate_index::clip(&accumulated, PIPELINE_CONTEXT_CAP);
                system.push_str(&format!("\n\nPREVIOUS OUTPUT:\n{context}"));
            }
            let result = Self::run_instance(*backend, role, &system, task).await;
            if result.success() {
                accumulated = result.response.clone();
            }
            results.push(result);
        }
        MultiResult {
            results,
            total_duration_s: started.elapsed().as_secs_f64(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
