// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single-shot delegation with validation, feedback-driven review and
//! chunked execution for oversized templates.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use legate_index::{estimate_tokens, slugify};
use legate_memory::{learn_from_delegation, ValidationFacts};
use legate_model::{TaskLevel, TransportError};
use legate_tools::tools_prompt;

use crate::chunker::{build_chunk_prompt, chunk_by_todos, should_chunk, MAX_TOKENS_PER_CHUNK};
use crate::modes::ModeContext;
use crate::orchestrate::{MemoryHandles, Orchestrator};
use crate::prompts::{assemble_system_prompt, build_briefing_prompt, detect_work_shape};
use crate::protocol::{chat_in_session, SessionCall};
use crate::validate::{validate_response, Validation};

/// Options for one delegation.
#[derive(Debug, Clone, Default)]
pub struct DelegateOptions {
    pub task: String,
    pub template: Option<String>,
    pub context: Option<String>,
    /// Extra feedback pre-seeded into the first attempt.
    pub feedback: Option<String>,
    /// Project summary for the optional pre-task briefing turn.
    pub project_brief: Option<String>,
    /// Review rounds after a failed validation.
    pub max_retries: u32,
    pub validate: bool,
    /// Session identifier override; derived from the task when empty.
    pub session: Option<String>,
    /// Pre-resolved injections (e.g. negotiated skills) appended to the
    /// plan after ledger dedup.
    pub extra_injections: Vec<crate::protocol::Injection>,
}

#[derive(Debug, Serialize)]
pub struct DelegateResult {
    pub response: String,
    pub validation: Option<Validation>,
    pub success: bool,
    pub duration_s: f64,
    pub chunked: bool,
    pub session_name: String,
}

fn validation_facts(v: &Validation) -> ValidationFacts {
    ValidationFacts {
        truncated: v.truncated,
        todos_missing: v.todos_missing.clone(),
        issues: v.issues.clone(),
    }
}

/// Digest the outcome into both memory stores.  Fail-safe by design.
fn learn(
    handles: &mut MemoryHandles,
    task: &str,
    mode: &str,
    success: bool,
    response: &str,
    validation: Option<&Validation>,
    duration_s: f64,
    injected_skills: &[String],
) {
    if let Some(project) = handles.project.as_mut() {
        let facts = validation.map(validation_facts);
        learn_from_delegation(project, task, mode, success, response, facts.as_ref(), duration_s);
    }
    if let Some(global) = handles.global.as_mut() {
        global.data.total_delegations += 1;
        let truncated = validation.map(|v| v.truncated).unwrap_or(false);
        for skill in injected_skills {
            global.update_skill_stat(skill, success, truncated);
        }
        if injected_skills.len() >= 2 {
            global.update_skill_combo(injected_skills, success);
        }
        for kw in legate_index::extract_keywords(task) {
            global.update_task_keyword(&kw, success);
        }
        global.record_mode(mode, success, duration_s);
        global.save();
    }
}

/// Run one delegation end to end.
pub async fn run_delegate(
    ctx: &ModeContext<'_>,
    options: DelegateOptions,
) -> Result<DelegateResult, TransportError> {
    let started = Instant::now();
    let identifier = options
        .session
        .clone()
        .unwrap_or_else(|| slugify(&options.task, 30));

    let orchestrator = Orchestrator::new(ctx.skills, ctx.data_dir.clone());
    let shape = detect_work_shape(&options.task, options.template.is_some(), false);
    let builder = move || assemble_system_prompt(TaskLevel::Delegation, shape);
    let (plan, mut handles) = orchestrator
        .prepare_session_call(
            ctx.store,
            "delegate",
            &identifier,
            &options.task,
            Some(&builder),
            &options.task,
            true,
            options.extra_injections.clone(),
        )
        .await;
    let session_name = plan.session_name.clone();
    let injected_skills: Vec<String> = plan
        .pending_injections
        .iter()
        .filter(|i| i.kind == crate::protocol::InjectionKind::Skill)
        .map(|i| i.name.clone())
        .collect();

    // Oversized templates run chunked instead of single-shot.
    if let Some(template) = &options.template {
        if should_chunk(template, ctx.chunk_threshold_tokens) {
            info!(
                tokens = estimate_tokens(template),
                threshold = ctx.chunk_threshold_tokens,
                "template over threshold, running chunked"
            );
            return run_chunked(ctx, &options, plan, handles, template, started).await;
        }
    }

    // Optional pre-task briefing turn: short confirmation expected.
    if let Some(brief) = &options.project_brief {
        let conventions = handles
            .project
            .as_ref()
            .map(|p| p.data.conventions.naming.clone())
            .unwrap_or_default();
        let briefing_call = SessionCall {
            tools_prompt: tools_prompt(&ctx.tools.descriptors()),
            system_prompt: plan.system_prompt.clone(),
            pending_injections: plan.pending_injections.clone(),
            thinking_enabled: ctx.thinking_enabled,
            ..SessionCall::new(
                session_name.clone(),
                build_briefing_prompt(brief, &options.task, &conventions),
            )
        };
        let ack = chat_in_session(ctx.backend, ctx.tools, ctx.store, briefing_call).await?;
        info!(ack = %ack.chars().take(80).collect::<String>(), "briefing acknowledged");
    }

    // The task itself.
    let mut user_message = options.task.clone();
    if let Some(context) = &options.context {
        user_message.push_str(&format!("\n\nCONTEXTO:\n{context}"));
    }
    if let Some(template) = &options.template {
        user_message.push_str(&format!("\n\nTEMPLATE:\n```\n{template}\n```"));
    }
    if let Some(feedback) = &options.feedback {
        user_message.push_str(&format!("\n\nFEEDBACK PREVIO:\n{feedback}"));
    }

    let call = SessionCall {
        system_prompt: plan.system_prompt.clone(),
        tools_prompt: tools_prompt(&ctx.tools.descriptors()),
        pending_injections: plan.pending_injections.clone(),
        thinking_enabled: ctx.thinking_enabled,
        ..SessionCall::new(session_name.clone(), user_message)
    };
    let mut response = chat_in_session(ctx.backend, ctx.tools, ctx.store, call).await?;

    // Review loop: hand the validator's findings back and retry.
    let mut validation = options
        .validate
        .then(|| validate_response(&response, options.template.as_deref()));
    if options.validate {
        let mut rounds = 0;
        while rounds < options.max_retries {
            let Some(current) = validation.as_ref() else {
                break;
            };
            if current.valid && !current.truncated {
                break;
            }
            let Some(feedback) = current.feedback.clone() else {
                break;
            };
            rounds += 1;
            warn!(round = rounds, "validation failed, sending review feedback");
            let review_call = SessionCall {
                thinking_enabled: ctx.thinking_enabled,
                ..SessionCall::new(session_name.clone(), feedback)
            };
            response = chat_in_session(ctx.backend, ctx.tools, ctx.store, review_call).await?;
            validation = Some(validate_response(&response, options.template.as_deref()));
        }
    }

    let success = validation
        .as_ref()
        .map(|v| v.valid && !v.truncated)
        .unwrap_or(true);
    let duration_s = started.elapsed().as_secs_f64();
    learn(
        &mut handles,
        &options.task,
        "delegate",
        success,
        &response,
        validation.as_ref(),
        duration_s,
        &injected_skills,
    );

    Ok(DelegateResult {
        response,
        validation,
        success,
        duration_s,
        chunked: false,
        session_name,
    })
}

/// Sequential chunked execution of an oversized template.
async fn run_chunked(
    ctx: &ModeContext<'_>,
    options: &DelegateOptions,
    plan: crate::orchestrate::CallPlan,
    mut handles: MemoryHandles,
    template: &str,
    started: Instant,
) -> Result<DelegateResult, TransportError> {
    let chunks = chunk_by_todos(template, MAX_TOKENS_PER_CHUNK);
    let total = chunks.len();
    let session_name = plan.session_name.clone();
    let mut parts: Vec<String> = Vec::new();
    let mut system_prompt = plan.system_prompt.clone();
    let mut injections = plan.pending_injections.clone();

    for (index, chunk) in chunks.iter().enumerate() {
        let previous = parts.last().map(|s| s.as_str()).unwrap_or("");
        let prompt = build_chunk_prompt(chunk, total, index, &options.task, previous);
        let call = SessionCall {
            // Phase 1/2 only ride the first chunk; the ledger would
            // suppress them later anyway.
            system_prompt: system_prompt.take(),
            pending_injections: std::mem::take(&mut injections),
            tools_prompt: if index == 0 {
                tools_prompt(&ctx.tools.descriptors())
            } else {
                String::new()
            },
            thinking_enabled: ctx.thinking_enabled,
            ..SessionCall::new(session_name.clone(), prompt)
        };
        let part = chat_in_session(ctx.backend, ctx.tools, ctx.store, call).await?;
        info!(chunk = index + 1, total, chars = part.len(), "chunk complete");
        parts.push(part);
    }

    let response = parts.join("\n\n");
    let validation = options
        .validate
        .then(|| validate_response(&response, Some(template)));
    let success = validation
        .as_ref()
        .map(|v| v.valid && !v.truncated)
        .unwrap_or(true);
    let duration_s = started.elapsed().as_secs_f64();
    learn(
        &mut handles,
        &options.task,
        "delegate",
        success,
        &response,
        validation.as_ref(),
        duration_s,
        &[],
    );

    Ok(DelegateResult {
        response,
        validation,
        success,
        duration_s,
        chunked: true,
        session_name,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
