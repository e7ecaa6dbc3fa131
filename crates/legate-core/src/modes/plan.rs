// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-step plan execution.
//!
//! A plan is an ordered list of steps; consecutive steps sharing a
//! `parallel_group` label run concurrently (across the available backend
//! pool), others run sequentially.  Each step can inline the final
//! responses of earlier steps as context and retries on validation
//! feedback.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use legate_model::{ChatBackend, TaskLevel, TransportError};

use crate::modes::quantum::{run_quantum, QuantumOptions};
use crate::modes::ModeContext;
use crate::prompts::{assemble_system_prompt, detect_work_shape};
use crate::protocol::{chat_in_session, SessionCall};
use crate::store::build_session_name;
use crate::validate::{validate_response, Validation};

/// Per-step context inlined from a previous step is capped here.
const STEP_CONTEXT_CAP: usize = 4_000;

fn default_max_retries() -> u32 {
    1
}

fn default_validate() -> bool {
    true
}

/// One step of a plan, as parsed from the controller's JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub context_from: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_validate")]
    pub validate: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub dual_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct Plan {
    pub steps: Vec<StepSpec>,
}

impl Plan {
    pub fn parse(json: &str) -> anyhow::Result<Self> {
        let plan: Plan = serde_json::from_str(json)?;
        anyhow::ensure!(!plan.steps.is_empty(), "plan contains no steps");
        Ok(plan)
    }
}

#[derive(Debug, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub response: String,
    pub duration_s: f64,
    pub validation: Option<Validation>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlanResult {
    pub results: Vec<StepResult>,
    pub total_duration_s: f64,
}

impl PlanResult {
    pub fn all_success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Inline prior step outputs named by `context_from`, capped per step.
fn build_step_context(context_from: &[String], completed: &HashMap<String, StepResult>) -> String {
    let mut parts = Vec::new();
    for id in context_from {
        let Some(prev) = completed.get(id) else {
            continue;
        };
        if !prev.success {
            continue;
        }
        let mut response = legate_index::clip(&prev.response, STEP_CONTEXT_CAP).to_string();
        if response.len() < prev.response.len() {
            response.push_str("\n\n[... respuesta truncada ...]");
        }
        parts.push(format!("\n--- Resultado de '{id}' ---\n{response}\n"));
    }
    if parts.is_empty() {
        return String::new();
    }
    format!("\n== CONTEXTO DE PASOS PREVIOS ==\n{}\n== FIN CONTEXTO ==\n", parts.concat())
}

async fn execute_step(
    ctx: &ModeContext<'_>,
    backend: &dyn ChatBackend,
    plan_id: &str,
    step: &StepSpec,
    prior_context: String,
) -> StepResult {
    let started = Instant::now();
    let session_name = build_session_name("multi-step", plan_id, &step.id);

    let mut user_message = step.task.clone();
    if !prior_context.is_empty() {
        user_message.push_str(&prior_context);
    }
    if let Some(template) = &step.template {
        user_message.push_str(&format!("\n\nTEMPLATE:\n```\n{template}\n```"));
    }
    if let Some(feedback) = &step.feedback {
        user_message.push_str(&format!("\n\nFEEDBACK PREVIO:\n{feedback}"));
    }

    let system = assemble_system_prompt(
        TaskLevel::Delegation,
        detect_work_shape(&step.task, step.template.is_some(), false),
    );

    let mut response = String::new();
    let mut validation: Option<Validation> = None;
    let mut error: Option<String> = None;
    let mut attempt = 0u32;

    loop {
        let mut message = user_message.clone();
        if attempt > 0 {
            if let Some(feedback) = validation.as_ref().and_then(|v| v.feedback.clone()) {
                message.push_str(&format!("\n\nFEEDBACK DEL INTENTO ANTERIOR:\n{feedback}"));
            }
        }
        let call = SessionCall {
            system_prompt: Some(system.clone()),
            thinking_enabled: ctx.thinking_enabled,
            ..SessionCall::new(session_name.clone(), message)
        };
        match chat_in_session(backend, ctx.tools, ctx.store, call).await {
            Ok(text) => {
                response = text;
                error = None;
            }
            Err(e) => {
                warn!(step = %step.id, error = %e, "step attempt failed");
                error = Some(e.to_string());
            }
        }

        if error.is_none() && step.validate {
            validation = Some(validate_response(&response, step.template.as_deref()));
        }
        let ok = error.is_none()
            && validation
                .as_ref()
                .map(|v| v.valid && !v.truncated)
                .unwrap_or(true);
        if ok || attempt >= step.max_retries {
            let duration_s = started.elapsed().as_secs_f64();
            info!(step = %step.id, success = ok, attempts = attempt + 1, "step finished");
            return StepResult {
                step_id: step.id.clone(),
                success: ok,
                response,
                duration_s,
                validation,
                error,
            };
        }
        attempt += 1;
    }
}

/// Run one dual-mode step through the quantum strategy.
async fn execute_step_dual(
    ctx: &ModeContext<'_>,
    backend_b: &dyn ChatBackend,
    step: &StepSpec,
    prior_context: String,
) -> StepResult {
    let started = Instant::now();
    let mut task = step.task.clone();
    if !prior_context.is_empty() {
        task.push_str(&prior_context);
    }
    let options = QuantumOptions {
        task,
        template: step.template.clone(),
        angles: None,
    };
    match run_quantum(ctx, backend_b, options).await {
        Ok(result) => {
            let validation = step
                .validate
                .then(|| validate_response(&result.merged, step.template.as_deref()));
            let success = validation
                .as_ref()
                .map(|v| v.valid && !v.truncated)
                .unwrap_or(true);
            StepResult {
                step_id: step.id.clone(),
                success,
                response: result.merged,
                duration_s: started.elapsed().as_secs_f64(),
                validation,
                error: None,
            }
        }
        Err(e) => StepResult {
            step_id: step.id.clone(),
            success: false,
            response: String::new(),
            duration_s: started.elapsed().as_secs_f64(),
            validation: None,
            error: Some(e.to_string()),
        },
    }
}

/// Split the step list into runs: consecutive steps sharing a
/// `parallel_group` label form one concurrent group.
fn group_steps(steps: &[StepSpec]) -> Vec<Vec<&StepSpec>> {
    let mut groups: Vec<Vec<&StepSpec>> = Vec::new();
    for step in steps {
        match (&step.parallel_group, groups.last_mut()) {
            (Some(label), Some(last))
                if last
                    .first()
                    .and_then(|s| s.parallel_group.as_ref())
                    .is_some_and(|l| l == label) =>
            {
                last.push(step);
            }
            _ => groups.push(vec![step]),
        }
    }
    groups
}

/// Execute a plan over a pool of backends.
///
/// Parallel groups fan out across the pool round-robin; with a single
/// backend they degrade to sequential execution.
pub async fn run_plan(
    ctx: &ModeContext<'_>,
    pool: &[&dyn ChatBackend],
    plan_id: &str,
    plan: &Plan,
) -> Result<PlanResult, TransportError> {
    let started = Instant::now();
    let mut completed: HashMap<String, StepResult> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for group in group_steps(&plan.steps) {
        let concurrent = group.len() > 1 && pool.len() > 1;
        if concurrent {
            info!(group = group.len(), "running parallel group");
            let futures = group.iter().enumerate().map(|(i, step)| {
                let backend = pool[i % pool.len()];
                let context = build_step_context(&step.context_from, &completed);
                execute_step(ctx, backend, plan_id, step, context)
            });
            for result in futures::future::join_all(futures).await {
                order.push(result.step_id.clone());
                completed.insert(result.step_id.clone(), result);
            }
        } else {
            for step in group {
                let backend = pool.first().copied().unwrap_or(ctx.backend);
                let context = build_step_context(&step.context_from, &completed);
                let result = if step.dual_mode && pool.len() >= 2 {
                    execute_step_dual(ctx, pool[1], step, context).await
                } else {
                    execute_step(ctx, backend, plan_id, step, context).await
                };
                order.push(result.step_id.clone());
                completed.insert(result.step_id.clone(), result);
            }
        }
    }

    let results: Vec<StepResult> = order
        .into_iter()
        .filter_map(|id| completed.remove(&id))
        .collect();
    Ok(PlanResult {
        results,
        total_duration_s: started.elapsed().as_secs_f64(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use crate::testutil::ScriptedBackend;
    use legate_tools::ToolRegistry;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    #[test]
    fn plan_parses_from_json() {
        let plan = Plan::parse(
            r#"{"steps": [
                {"id": "s1", "task": "first"},
                {"id": "s2", "task": "second", "context_from": ["s1"], "max_retries": 2}
            ]}"#,
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].max_retries, 1);
        assert!(plan.steps[0].validate);
        assert_eq!(plan.steps[1].context_from, vec!["s1"]);
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert!(Plan::parse(r#"{"steps": []}"#).is_err());
    }

    #[test]
    fn grouping_joins_consecutive_labels_only() {
        let plan = Plan::parse(
            r#"{"steps": [
                {"id": "a", "task": "t"},
                {"id": "b", "task": "t", "parallel_group": "g1"},
                {"id": "c", "task": "t", "parallel_group": "g1"},
                {"id": "d", "task": "t"},
                {"id": "e", "task": "t", "parallel_group": "g1"}
            ]}"#,
        )
        .unwrap();
        let groups = group_steps(&plan.steps);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![1, 2, 1, 1]);
    }

    #[tokio::test]
    async fn steps_thread_context_forward() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = ToolRegistry::new();
        let backend = ScriptedBackend::replying(&[
            "OK",
            "function base() { return 'foundation'; }",
            "OK",
            "function ontop() { return base(); }",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);

        let plan = Plan::parse(
            r#"{"steps": [
                {"id": "s1", "task": "crea la base", "validate": false},
                {"id": "s2", "task": "construye encima", "context_from": ["s1"], "validate": false}
            ]}"#,
        )
        .unwrap();
        let result = run_plan(&ctx, &[&backend], "p1", &plan).await.unwrap();
        assert!(result.all_success());
        assert_eq!(result.results.len(), 2);

        let sent = backend.sent_messages().await;
        // Step 2's task message inlines step 1's response.
        let step2_msg = &sent[3];
        assert!(step2_msg.contains("CONTEXTO DE PASOS PREVIOS"));
        assert!(step2_msg.contains("foundation"));
    }

    #[tokio::test]
    async fn retries_consume_validator_feedback() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = ToolRegistry::new();
        // First attempt misses the marker; retry succeeds.
        let backend = ScriptedBackend::replying(&[
            "OK",
            "let nada = true;",
            "function objetivo() { return 1; }",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let plan = Plan::parse(
            r#"{"steps": [
                {"id": "s1", "task": "implementa", "template": "// === TODO 1: objetivo ===", "max_retries": 1}
            ]}"#,
        )
        .unwrap();
        let result = run_plan(&ctx, &[&backend], "p2", &plan).await.unwrap();
        assert!(result.all_success());

        let sent = backend.sent_messages().await;
        // Phase1, attempt 1, attempt 2 (with feedback).
        assert_eq!(sent.len(), 3);
        assert!(sent[2].contains("FEEDBACK DEL INTENTO ANTERIOR"));
        assert!(sent[2].contains("objetivo"));
    }

    #[tokio::test]
    async fn dual_mode_step_runs_both_angles() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = ToolRegistry::new();
        let backend_a = ScriptedBackend::replying(&["OK", "function fa() { return 1; }"]);
        let backend_b = ScriptedBackend::replying(&["OK", "function fb() { return 2; }"]);
        let ctx = ModeContext::new(&backend_a, &tools, &store);
        let plan = Plan::parse(
            r#"{"steps": [
                {"id": "dual", "task": "crea un juego", "dual_mode": true, "validate": false}
            ]}"#,
        )
        .unwrap();
        let result = run_plan(&ctx, &[&backend_a, &backend_b], "p4", &plan)
            .await
            .unwrap();
        assert!(result.all_success());
        assert!(result.results[0].response.contains("fa"));
        assert!(result.results[0].response.contains("fb"));
        // Both backends actually ran an angle.
        assert_eq!(backend_b.sent_messages().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_step_does_not_poison_the_plan() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = ToolRegistry::new();
        let backend = ScriptedBackend::replying(&[
            "OK",
            "let incompleto = {",
            "let incompleto = {",
            "OK",
            "function fine() { return 2; }",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let plan = Plan::parse(
            r#"{"steps": [
                {"id": "bad", "task": "algo", "template": "// === TODO 1: imposible ===", "max_retries": 1},
                {"id": "good", "task": "otra cosa", "context_from": ["bad"], "validate": false}
            ]}"#,
        )
        .unwrap();
        let result = run_plan(&ctx, &[&backend], "p3", &plan).await.unwrap();
        assert!(!result.results[0].success);
        assert!(result.results[1].success);
        // Failed steps contribute no context.
        let sent = backend.sent_messages().await;
        assert!(!sent.last().unwrap().contains("CONTEXTO DE PASOS PREVIOS"));
    }
}
