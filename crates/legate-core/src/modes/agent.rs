// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The goal-directed agent loop.
//!
//! Phase 1 sends the heavy identity prompt plus the tool catalogue once
//! and expects a literal acknowledgment; every further step chains via the
//! parent message id with a minimal follow-up rather than re-serializing
//! history.  The loop defends itself against the backend's failure modes:
//! empty responses, silent stalls, completion claims without executed
//! writes, and repeating errors.
//!
//! Stall policy: the parent id is preserved across stalls (the upstream
//! session still holds the context); only a dead session resets it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use legate_model::TransportError;
use legate_tools::{
    extract_tool_calls, format_tool_result, is_write_tool, tools_prompt, ToolCall,
};

use crate::modes::ModeContext;
use crate::prompts::{AGENT_ACK, AGENT_SYSTEM_PROMPT};

/// Default and absolute step caps.
pub const DEFAULT_MAX_STEPS: u32 = 50;
pub const ABSOLUTE_MAX_STEPS: u32 = 200;

/// Tools executed per iteration; the excess is carried as pending.
const MAX_TOOLS_PER_ITER: usize = 5;
/// Empty-response nudges before giving up.
const MAX_EMPTY_RETRIES: u32 = 2;
/// Write-one-at-a-time nudges after a read-only stall.
const MAX_STALL_NUDGES: u32 = 2;
/// Occurrences before an error pattern triggers a strategy change.
const MAX_REPEAT_ERRORS: u32 = 3;

/// Completion-claim keywords for the hallucination detector.
const COMPLETION_KEYWORDS: &[&str] = &[
    "completado",
    "exitosa",
    "sin errores",
    "correctamente",
    "he creado",
    "he replicado",
    "he copiado",
    "he ejecutado",
    "npm install",
    "npm run build",
    "npm run dev",
];

#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub goal: String,
    pub max_steps: u32,
    /// Resume an established agent session instead of running Phase 1.
    pub continue_parent_id: Option<String>,
    /// Directory for per-run JSON step traces.  `None` disables tracing.
    pub trace_dir: Option<PathBuf>,
}

impl AgentOptions {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            max_steps: DEFAULT_MAX_STEPS,
            continue_parent_id: None,
            trace_dir: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct StepTrace {
    step: u32,
    tools_executed: Vec<String>,
    tool_errors: u32,
    response_chars: usize,
    note: String,
}

#[derive(Debug, Serialize)]
pub struct AgentResult {
    pub output: String,
    pub steps_taken: u32,
    pub tools_executed: u32,
    pub duration_s: f64,
    /// Set when the loop ended through a recovery path rather than a
    /// normal final response.
    pub recovery: Option<String>,
}

/// Normalize an error message for repetition tracking: paths collapse so
/// the same failure in different files counts as one pattern.
fn normalize_error(message: &str) -> String {
    static WIN_PATH: OnceLock<Regex> = OnceLock::new();
    static UNIX_PATH: OnceLock<Regex> = OnceLock::new();
    let win = WIN_PATH.get_or_init(|| Regex::new(r"[A-Z]:\\[^\s]+").unwrap());
    let unix = UNIX_PATH.get_or_init(|| Regex::new(r"/[^\s]+/").unwrap());
    let normalized = win.replace_all(message, "<path>");
    let normalized = unix.replace_all(&normalized, "<path>/");
    normalized.chars().take(80).collect()
}

fn claims_completion(response: &str) -> bool {
    let lower = response.to_lowercase();
    COMPLETION_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn write_trace(trace_dir: &Option<PathBuf>, run_id: &str, traces: &[StepTrace]) {
    let Some(dir) = trace_dir else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(error = %e, "could not create trace dir");
        return;
    }
    let path = dir.join(format!("agent-{run_id}.json"));
    match serde_json::to_string_pretty(traces) {
        Ok(text) => {
            if let Err(e) = std::fs::write(&path, text) {
                warn!(path = %path.display(), error = %e, "could not write step trace");
            }
        }
        Err(e) => warn!(error = %e, "could not serialize step trace"),
    }
}

/// Run the agent loop toward a goal.
///
/// `interrupted` is a cooperative flag (set by the signal handler) checked
/// between steps.
pub async fn run_agent(
    ctx: &ModeContext<'_>,
    options: AgentOptions,
    interrupted: Arc<AtomicBool>,
) -> Result<AgentResult, TransportError> {
    let started = Instant::now();
    let max_steps = options.max_steps.clamp(1, ABSOLUTE_MAX_STEPS);
    let run_id = uuid::Uuid::new_v4().to_string();
    let mut traces: Vec<StepTrace> = Vec::new();

    // ── Phase 1: identity + tools, unless resuming ──────────────────────────
    let mut parent: Option<String> = match &options.continue_parent_id {
        Some(id) => {
            info!(parent = %id, "continuing established agent session");
            Some(id.clone())
        }
        None => {
            let session_id = ctx.backend.create_session().await?;
            ctx.backend.use_session(&session_id).await;
            let init_prompt = format!(
                "{AGENT_SYSTEM_PROMPT}{}\n\nResponde UNICAMENTE '{AGENT_ACK}' para confirmar \
                 que entendiste tu identidad y herramientas.",
                tools_prompt(&ctx.tools.descriptors())
            );
            info!("agent phase 1: sending identity + tools");
            ctx.backend
                .chat(&init_prompt, true, None, 3)
                .await?;
            ctx.backend.last_message_id().await
        }
    };

    let mut prompt = options.goal.clone();
    let mut empty_retries = 0u32;
    let mut stall_nudges = 0u32;
    let mut error_tracker: HashMap<String, u32> = HashMap::new();
    let mut last_successful_tools: Vec<(String, String)> = Vec::new();
    let mut total_tools = 0u32;
    let mut pending_calls: Vec<legate_tools::ParsedCall> = Vec::new();

    for step in 0..max_steps {
        if interrupted.load(Ordering::SeqCst) {
            write_trace(&options.trace_dir, &run_id, &traces);
            return Ok(AgentResult {
                output: "Agente interrumpido por el usuario.".into(),
                steps_taken: step,
                tools_executed: total_tools,
                duration_s: started.elapsed().as_secs_f64(),
                recovery: Some("interrupted".into()),
            });
        }

        // max_stall_retries = 0: recovery belongs to this loop, not to the
        // transport (a fresh upstream session would lose the agent state).
        let response = match ctx.backend.chat(&prompt, true, parent.clone(), 0).await {
            Ok(text) => text,
            Err(TransportError::TokenExpired(e)) => {
                return Err(TransportError::TokenExpired(e));
            }
            Err(TransportError::StallDetected(reason)) => {
                // Preserve the parent: the upstream session still holds
                // everything that was streamed before the stall.
                if let Some(id) = ctx.backend.last_message_id().await {
                    parent = Some(id);
                }
                let had_writes = last_successful_tools.iter().any(|(t, _)| is_write_tool(t));
                if !had_writes && stall_nudges < MAX_STALL_NUDGES {
                    stall_nudges += 1;
                    warn!(
                        nudge = stall_nudges,
                        reads = last_successful_tools.len(),
                        "stall after reads, nudging one write at a time"
                    );
                    prompt = "Tu respuesta anterior se corto (el stream termino sin contenido). \
                              Los archivos que leiste ya estan en tu contexto de conversacion. \
                              Para evitar sobrecarga, escribe los archivos DE A UNO. \
                              Genera un bloque ```tool_call``` con UN SOLO write_file."
                        .to_string();
                    continue;
                }
                if !last_successful_tools.is_empty() {
                    let summary: Vec<String> = last_successful_tools
                        .iter()
                        .map(|(name, result)| format!("- {name}: {result}"))
                        .collect();
                    warn!(step = step + 1, "stall after successful tools, returning synthetic summary");
                    write_trace(&options.trace_dir, &run_id, &traces);
                    return Ok(AgentResult {
                        output: format!(
                            "Herramientas ejecutadas en esta sesion:\n{}\n\nResumen de progreso parcial.",
                            summary.join("\n")
                        ),
                        steps_taken: step + 1,
                        tools_executed: total_tools,
                        duration_s: started.elapsed().as_secs_f64(),
                        recovery: Some("stall_synthetic_summary".into()),
                    });
                }
                write_trace(&options.trace_dir, &run_id, &traces);
                return Ok(AgentResult {
                    output: format!(
                        "[Error] El backend se congelo en la iteracion {} ({reason}). \
                         Ejecuta el comando de nuevo.",
                        step + 1
                    ),
                    steps_taken: step + 1,
                    tools_executed: total_tools,
                    duration_s: started.elapsed().as_secs_f64(),
                    recovery: Some("stall_exhausted".into()),
                });
            }
            Err(other) => return Err(other),
        };
        parent = ctx.backend.last_message_id().await;

        // Empty response: nudge, then declare the conversation dead.
        if response.trim().is_empty() {
            empty_retries += 1;
            if empty_retries <= MAX_EMPTY_RETRIES {
                warn!(retry = empty_retries, "empty response, nudging");
                prompt = "Tu respuesta anterior llego vacia. \
                          Continua con la tarea. Usa herramientas si las necesitas."
                    .to_string();
                continue;
            }
            write_trace(&options.trace_dir, &run_id, &traces);
            return Ok(AgentResult {
                output: format!(
                    "[Error] El backend dejo de responder ({MAX_EMPTY_RETRIES} respuestas \
                     vacias consecutivas). Ejecuta el comando de nuevo."
                ),
                steps_taken: step + 1,
                tools_executed: total_tools,
                duration_s: started.elapsed().as_secs_f64(),
                recovery: Some("empty_exhausted".into()),
            });
        }
        empty_retries = 0;
        stall_nudges = 0;

        let (mut calls, _clean) = extract_tool_calls(&response);
        // Pending tools from the previous iteration run first.
        if !pending_calls.is_empty() && calls.is_empty() {
            calls = std::mem::take(&mut pending_calls);
        }

        if calls.is_empty() {
            // Hallucination detector: completion claims with zero executed
            // writes early in the run are descriptions, not actions.
            let had_writes = last_successful_tools.iter().any(|(t, _)| is_write_tool(t));
            if claims_completion(&response) && !had_writes && step < 3 {
                warn!(step = step + 1, "completion claim without writes, forcing correction");
                prompt = "ATENCION: Tu respuesta anterior DESCRIBIO acciones pero NO las ejecutaste. \
                          No creaste ningun archivo ni ejecutaste ningun comando. \
                          DEBES usar herramientas (write_file, run_command, etc.) para realizar \
                          las acciones. NO describas lo que harias — HAZLO con tool_call. \
                          Continua con la tarea ahora."
                    .to_string();
                continue;
            }

            write_trace(&options.trace_dir, &run_id, &traces);
            let output = if step > 0 {
                legate_tools::clean_final_response(&response)
            } else {
                response
            };
            return Ok(AgentResult {
                output,
                steps_taken: step + 1,
                tools_executed: total_tools,
                duration_s: started.elapsed().as_secs_f64(),
                recovery: None,
            });
        }

        // Per-iteration tool cap; the excess waits for the next prompt.
        let mut deferred: Vec<legate_tools::ParsedCall> = Vec::new();
        if calls.len() > MAX_TOOLS_PER_ITER {
            deferred = calls.split_off(MAX_TOOLS_PER_ITER);
            info!(
                executing = MAX_TOOLS_PER_ITER,
                pending = deferred.len(),
                "capping tools this iteration"
            );
        }

        let mut results = Vec::with_capacity(calls.len());
        let mut iter_errors = 0u32;
        let mut executed_names = Vec::new();
        last_successful_tools.clear();
        for (idx, parsed) in calls.iter().enumerate() {
            let call = ToolCall {
                id: format!("agent_{step}_{idx}_{}", parsed.tool),
                name: parsed.tool.clone(),
                args: parsed.args.clone(),
            };
            let output = ctx.tools.execute(&call).await;
            total_tools += 1;
            executed_names.push(parsed.tool.clone());
            if output.is_error {
                iter_errors += 1;
                *error_tracker
                    .entry(normalize_error(&output.content))
                    .or_insert(0) += 1;
            } else {
                let mut summary: String = output.content.chars().take(100).collect();
                if output.content.len() > 100 {
                    summary.push_str("...");
                }
                last_successful_tools.push((parsed.tool.clone(), summary));
            }
            info!(
                iter = step + 1,
                max = max_steps,
                tool = %parsed.tool,
                chars = output.content.len(),
                "tool executed"
            );
            results.push(format_tool_result(&parsed.tool, &output.content));
        }
        traces.push(StepTrace {
            step: step + 1,
            tools_executed: executed_names,
            tool_errors: iter_errors,
            response_chars: response.len(),
            note: String::new(),
        });

        prompt = results.join("\n");
        if !deferred.is_empty() {
            let names: Vec<&str> = deferred.iter().map(|c| c.tool.as_str()).collect();
            prompt.push_str(&format!(
                "\n\nNOTA: Se ejecutaron {} de {} herramientas. Pendientes: {}. \
                 Genera las pendientes en tu siguiente respuesta.",
                calls.len(),
                calls.len() + deferred.len(),
                names.join(", ")
            ));
            pending_calls = deferred;
        }

        // Repeating errors demand a strategy change, not more repetition.
        let repeated: Vec<(&String, &u32)> = error_tracker
            .iter()
            .filter(|(_, count)| **count >= MAX_REPEAT_ERRORS)
            .collect();
        if !repeated.is_empty() {
            let mut correction = String::from("\n\nADVERTENCIA — Errores repetitivos detectados:\n");
            for (pattern, count) in &repeated {
                correction.push_str(&format!("  - ({count}x) {pattern}\n"));
                warn!(pattern = %pattern, count, "repeated error pattern");
            }
            correction.push_str(
                "CAMBIA DE ESTRATEGIA. No repitas la misma operacion que falla. \
                 Si necesitas crear un directorio, usa make_directory primero. \
                 Si un archivo no existe, verifica con list_directory antes de operar.",
            );
            prompt.push_str(&correction);
        }
    }

    write_trace(&options.trace_dir, &run_id, &traces);
    Ok(AgentResult {
        output: "Se alcanzo el numero maximo de iteraciones en modo agente.".into(),
        steps_taken: max_steps,
        tools_executed: total_tools,
        duration_s: started.elapsed().as_secs_f64(),
        recovery: Some("max_steps".into()),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use crate::testutil::{Script, ScriptedBackend};
    use async_trait::async_trait;
    use legate_tools::{Tool, ToolOutput, ToolRegistry};
    use serde_json::{json, Value};
    use std::sync::Arc as StdArc;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    struct RecordingTool {
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            if self.fail {
                ToolOutput::err(&call.id, "Error: ENOENT no such file /tmp/x/y")
            } else {
                ToolOutput::ok(&call.id, "done")
            }
        }
    }

    fn registry(fail: bool) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(StdArc::new(RecordingTool {
            name: "write_file",
            fail,
        }));
        reg.register(StdArc::new(RecordingTool {
            name: "read_file",
            fail,
        }));
        reg
    }

    fn not_interrupted() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn tool_call_block(tool: &str) -> String {
        format!("```tool_call\n{{\"tool\": \"{tool}\", \"args\": {{\"n\": 1}}}}\n```")
    }

    #[tokio::test]
    async fn phase_one_sends_identity_and_ack_request() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::replying(&[AGENT_ACK, "objetivo cumplido sin tools"]);
        let ctx = ModeContext::new(&backend, &tools, &store);

        let result = run_agent(&ctx, AgentOptions::new("haz algo"), not_interrupted())
            .await
            .unwrap();
        assert_eq!(result.output, "objetivo cumplido sin tools");
        assert!(result.recovery.is_none());

        let sent = backend.sent_messages().await;
        assert!(sent[0].contains("HERRAMIENTAS DISPONIBLES"));
        assert!(sent[0].contains(&format!("Responde UNICAMENTE '{AGENT_ACK}'")));
        assert_eq!(sent[1], "haz algo");
    }

    #[tokio::test]
    async fn continue_parent_skips_phase_one() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::replying(&["listo"]);
        let ctx = ModeContext::new(&backend, &tools, &store);

        let mut options = AgentOptions::new("continua el objetivo");
        options.continue_parent_id = Some("msg-prev".into());
        let result = run_agent(&ctx, options, not_interrupted()).await.unwrap();
        assert_eq!(result.output, "listo");
        // Only the goal was sent, chained to the provided parent.
        let parents = backend.sent_parents().await;
        assert_eq!(parents, vec![Some("msg-prev".to_string())]);
    }

    #[tokio::test]
    async fn tool_steps_chain_until_final_response() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::replying(&[
            AGENT_ACK,
            &tool_call_block("write_file"),
            "Archivo escrito, objetivo completado correctamente.",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);

        let result = run_agent(&ctx, AgentOptions::new("crea el archivo"), not_interrupted())
            .await
            .unwrap();
        assert_eq!(result.tools_executed, 1);
        assert_eq!(result.steps_taken, 2);

        let sent = backend.sent_messages().await;
        assert!(sent[2].starts_with("Resultado de `write_file`:"));
    }

    // ── hallucination detector (scenario S6) ──────────────────────────────────

    #[tokio::test]
    async fn completion_claim_without_writes_is_corrected() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::replying(&[
            AGENT_ACK,
            // Claims completion, zero tools executed.
            "He creado todos los archivos, build completado sin errores.",
            // After the correction the agent actually works.
            &tool_call_block("write_file"),
            "Ahora si esta completado.",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);

        let result = run_agent(&ctx, AgentOptions::new("replica el proyecto"), not_interrupted())
            .await
            .unwrap();
        assert_eq!(result.tools_executed, 1);

        let sent = backend.sent_messages().await;
        // The loop did not terminate on the claim; it sent the correction.
        assert!(sent[2].starts_with("ATENCION: Tu respuesta anterior DESCRIBIO acciones pero NO las ejecutaste."));
    }

    #[tokio::test]
    async fn late_completion_claims_are_accepted() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        // Steps 1-3 execute tools; step 4 claims completion without writes
        // in its own iteration — but step >= 3, so it is accepted.
        let wf = tool_call_block("write_file");
        let backend = ScriptedBackend::replying(&[
            AGENT_ACK,
            &wf,
            &wf,
            &wf,
            "Todo completado correctamente.",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let result = run_agent(&ctx, AgentOptions::new("meta"), not_interrupted())
            .await
            .unwrap();
        assert_eq!(result.output, "Todo completado correctamente.");
        assert!(result.recovery.is_none());
    }

    // ── empty-response nudges ─────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_responses_get_nudged_then_fail() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::replying(&[AGENT_ACK, "", "", ""]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let result = run_agent(&ctx, AgentOptions::new("meta"), not_interrupted())
            .await
            .unwrap();
        assert_eq!(result.recovery.as_deref(), Some("empty_exhausted"));

        let sent = backend.sent_messages().await;
        // Goal, nudge, nudge.
        assert!(sent[2].contains("llego vacia"));
        assert!(sent[3].contains("llego vacia"));
    }

    // ── stall recovery ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stall_after_reads_nudges_single_writes() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let rf = tool_call_block("read_file");
        let backend = ScriptedBackend::new(vec![
            Script::Reply(AGENT_ACK.into()),
            Script::Reply(rf),
            Script::Stall,
            Script::Reply(tool_call_block("write_file")),
            Script::Reply("terminado.".into()),
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let result = run_agent(&ctx, AgentOptions::new("meta"), not_interrupted())
            .await
            .unwrap();
        assert_eq!(result.output, "terminado.");
        assert_eq!(result.tools_executed, 2);

        let sent = backend.sent_messages().await;
        assert!(sent
            .iter()
            .any(|m| m.contains("escribe los archivos DE A UNO")));
    }

    #[tokio::test]
    async fn stall_after_writes_returns_synthetic_summary() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::new(vec![
            Script::Reply(AGENT_ACK.into()),
            Script::Reply(tool_call_block("write_file")),
            Script::Stall,
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let result = run_agent(&ctx, AgentOptions::new("meta"), not_interrupted())
            .await
            .unwrap();
        assert_eq!(result.recovery.as_deref(), Some("stall_synthetic_summary"));
        assert!(result.output.contains("write_file"));
        assert!(result.output.contains("Resumen de progreso parcial."));
    }

    // ── repeated errors ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn repeated_errors_trigger_strategy_change() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(true); // every tool call fails identically
        let wf = tool_call_block("write_file");
        let backend = ScriptedBackend::replying(&[AGENT_ACK, &wf, &wf, &wf, "me rindo"]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        run_agent(&ctx, AgentOptions::new("meta"), not_interrupted())
            .await
            .unwrap();

        let sent = backend.sent_messages().await;
        assert!(sent.iter().any(|m| m.contains("CAMBIA DE ESTRATEGIA")));
    }

    // ── tool cap ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn excess_tools_are_deferred_with_notice() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        // Seven distinct calls in one block; only five run this iteration.
        let calls: Vec<String> = (0..7)
            .map(|i| format!("{{\"tool\": \"write_file\", \"args\": {{\"n\": {i}}}}}"))
            .collect();
        let block = format!("```tool_call\n[{}]\n```", calls.join(","));
        let backend = ScriptedBackend::replying(&[AGENT_ACK, &block, "sigo", "fin."]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let result = run_agent(&ctx, AgentOptions::new("meta"), not_interrupted())
            .await
            .unwrap();

        let sent = backend.sent_messages().await;
        let after_tools = sent
            .iter()
            .find(|m| m.contains("NOTA: Se ejecutaron"))
            .expect("pending notice present");
        assert!(after_tools.contains("5 de 7"));
        // The deferred two run on the following iteration.
        assert_eq!(result.tools_executed, 7);
    }

    // ── caps and interruption ─────────────────────────────────────────────────

    #[tokio::test]
    async fn step_cap_is_enforced() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let wf = tool_call_block("write_file");
        let script: Vec<&str> = std::iter::once(AGENT_ACK)
            .chain(std::iter::repeat(wf.as_str()).take(10))
            .collect();
        let backend = ScriptedBackend::replying(&script);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let mut options = AgentOptions::new("meta");
        options.max_steps = 3;
        let result = run_agent(&ctx, options, not_interrupted()).await.unwrap();
        assert_eq!(result.recovery.as_deref(), Some("max_steps"));
        assert_eq!(result.steps_taken, 3);
    }

    #[tokio::test]
    async fn interruption_stops_between_steps() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::replying(&[AGENT_ACK, "never read"]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let flag = Arc::new(AtomicBool::new(true));
        let result = run_agent(&ctx, AgentOptions::new("meta"), flag).await.unwrap();
        assert_eq!(result.recovery.as_deref(), Some("interrupted"));
        assert_eq!(result.steps_taken, 0);
    }

    #[tokio::test]
    async fn step_traces_are_written() {
        let tmp = TempDir::new().unwrap();
        let traces = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = registry(false);
        let backend = ScriptedBackend::replying(&[
            AGENT_ACK,
            &tool_call_block("write_file"),
            "terminado.",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let mut options = AgentOptions::new("meta");
        options.trace_dir = Some(traces.path().to_path_buf());
        run_agent(&ctx, options, not_interrupted()).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(traces.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content =
            std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("write_file"));
    }
}
