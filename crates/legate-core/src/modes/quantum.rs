// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Quantum mode: two complementary angles executed in parallel, fused by
//! the merge engine.
//!
//! Each angle runs in its own named session (`quantum:{slug}:A` / `:B`)
//! against its own backend so the two upstream conversations are truly
//! independent.  On a failed merge validation the mode falls back to one
//! sequential call with both responses inlined as context.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use legate_index::slugify;
use legate_model::{ChatBackend, TaskLevel, TransportError};

use crate::angles::{build_angle_system_prompt, detect_angles, manual_angles, AngleSpec};
use crate::merge::{merge_responses, MergeResult};
use crate::modes::ModeContext;
use crate::prompts::{assemble_system_prompt, detect_work_shape};
use crate::protocol::{chat_in_session, SessionCall};
use crate::store::build_session_name;
use crate::validate::validate_response;

#[derive(Debug, Clone, Default)]
pub struct QuantumOptions {
    pub task: String,
    pub template: Option<String>,
    /// Manual angle labels from `--quantum-angles "a,b"`.
    pub angles: Option<(String, String)>,
}

#[derive(Debug, Serialize)]
pub struct QuantumResult {
    pub merged: String,
    pub strategy: String,
    pub conflicts: Vec<String>,
    pub angle_a: String,
    pub angle_b: String,
    pub duration_s: f64,
    /// True when the sequential fallback had to run.
    pub fallback_used: bool,
}

fn angle_task(task: &str, template: Option<&str>, angle: &AngleSpec) -> String {
    let mut message = format!("TAREA ({}): {task}", angle.label);
    if let Some(template) = template {
        message.push_str(&format!("\n\nTEMPLATE:\n```\n{template}\n```"));
    }
    message
}

/// Run one angle in its own session.
async fn run_angle(
    ctx: &ModeContext<'_>,
    backend: &dyn ChatBackend,
    slug: &str,
    sub: &str,
    angle: &AngleSpec,
    task: &str,
    template: Option<&str>,
) -> Result<String, TransportError> {
    let base = assemble_system_prompt(
        TaskLevel::Delegation,
        detect_work_shape(task, template.is_some(), false),
    );
    let call = SessionCall {
        system_prompt: Some(build_angle_system_prompt(&base, angle)),
        thinking_enabled: ctx.thinking_enabled,
        ..SessionCall::new(
            build_session_name("quantum", slug, sub),
            angle_task(task, template, angle),
        )
    };
    chat_in_session(backend, ctx.tools, ctx.store, call).await
}

/// Execute the dual strategy.
///
/// `backend_b` carries the second angle; the two sessions share the tool
/// dispatch and the session store but nothing upstream.
pub async fn run_quantum(
    ctx: &ModeContext<'_>,
    backend_b: &dyn ChatBackend,
    options: QuantumOptions,
) -> Result<QuantumResult, TransportError> {
    let started = Instant::now();
    let slug = slugify(&options.task, 30);
    let (angle_a, angle_b) = match &options.angles {
        Some((a, b)) => manual_angles(a, b),
        None => detect_angles(&options.task, options.template.as_deref()),
    };
    info!(a = %angle_a.label, b = %angle_b.label, "quantum angles selected");

    let (response_a, response_b) = tokio::join!(
        run_angle(
            ctx,
            ctx.backend,
            &slug,
            "A",
            &angle_a,
            &options.task,
            options.template.as_deref()
        ),
        run_angle(
            ctx,
            backend_b,
            &slug,
            "B",
            &angle_b,
            &options.task,
            options.template.as_deref()
        ),
    );
    let response_a = response_a?;
    let response_b = response_b?;

    let merge = merge_responses(
        &response_a,
        &response_b,
        options.template.as_deref(),
        &angle_a.label,
        &angle_b.label,
    );
    info!(strategy = %merge.strategy, conflicts = merge.conflicts.len(), "merge complete");

    // Accept the merge when it carries a usable result; otherwise one
    // sequential call fuses both responses with full context.
    let merged_validation = validate_response(&merge.merged, options.template.as_deref());
    let needs_fallback = !merge.success || (options.template.is_some() && !merged_validation.valid);

    if !needs_fallback {
        return Ok(QuantumResult {
            merged: merge.merged,
            strategy: merge.strategy,
            conflicts: merge.conflicts,
            angle_a: angle_a.label,
            angle_b: angle_b.label,
            duration_s: started.elapsed().as_secs_f64(),
            fallback_used: false,
        });
    }

    warn!("merge rejected, running sequential fallback");
    let fallback = run_sequential_fallback(ctx, &options, &response_a, &response_b, &slug).await?;
    Ok(QuantumResult {
        merged: fallback,
        strategy: "sequential_fallback".into(),
        conflicts: merge.conflicts,
        angle_a: angle_a.label,
        angle_b: angle_b.label,
        duration_s: started.elapsed().as_secs_f64(),
        fallback_used: true,
    })
}

async fn run_sequential_fallback(
    ctx: &ModeContext<'_>,
    options: &QuantumOptions,
    response_a: &str,
    response_b: &str,
    slug: &str,
) -> Result<String, TransportError> {
    let mut prompt = format!(
        "Dos implementaciones parciales de la misma tarea deben fusionarse en UNA.\n\n\
         TAREA: {}\n\n=== PARCIAL A ===\n{}\n\n=== PARCIAL B ===\n{}\n\n\
         Devuelve la implementacion COMPLETA fusionada.",
        options.task, response_a, response_b
    );
    if let Some(template) = &options.template {
        prompt.push_str(&format!("\n\nTEMPLATE DE REFERENCIA:\n```\n{template}\n```"));
    }
    let call = SessionCall {
        system_prompt: Some(assemble_system_prompt(
            TaskLevel::Delegation,
            detect_work_shape(&options.task, options.template.is_some(), false),
        )),
        thinking_enabled: ctx.thinking_enabled,
        ..SessionCall::new(build_session_name("quantum", slug, "merge"), prompt)
    };
    chat_in_session(ctx.backend, ctx.tools, ctx.store, call).await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
