// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The three-phase session protocol.
//!
//! Every exchange with a named session runs exactly three phases, each
//! independently deduplicated against the session ledger:
//!
//! 1. **Identity** — the system prompt plus tool catalogue, sent once per
//!    session lifetime, acknowledged with a bare `OK`.
//! 2. **Injections** — pending context blocks (skills, memory briefings,
//!    transferred knowledge), each sent at most once and recorded in the
//!    ledger.
//! 3. **Task** — the sanitized user message, driving the tool-calling loop
//!    until a terminal response.
//!
//! Within a session all messages are strictly serialized; the parent
//! message id chains forward after every successful turn.

use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use legate_index::estimate_tokens_chat;
use legate_model::{ChatBackend, TransportError};
use legate_tools::{clean_final_response, extract_tool_calls, format_tool_result, ToolCall, ToolRegistry};

use crate::store::{SessionStore, SESSION_MAX_AGE_HOURS};
use crate::summary::update_session_summary;
use crate::validate::validate_response;

/// A context block pending Phase-2 injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub kind: InjectionKind,
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionKind {
    Skill,
    Memory,
    Global,
    Error,
    Knowledge,
}

impl InjectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionKind::Skill => "skill",
            InjectionKind::Memory => "memory",
            InjectionKind::Global => "global",
            InjectionKind::Error => "error",
            InjectionKind::Knowledge => "knowledge",
        }
    }
}

impl Injection {
    pub fn new(kind: InjectionKind, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            content: content.into(),
        }
    }

    /// Ledger id: `type:name`.
    pub fn context_id(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.name)
    }
}

/// Options for one session exchange.
pub struct SessionCall {
    pub session_name: String,
    pub user_message: String,
    /// Sent only when the session has not yet seen its system prompt.
    pub system_prompt: Option<String>,
    /// Tool catalogue block appended to the Phase-1 prompt.
    pub tools_prompt: String,
    pub pending_injections: Vec<Injection>,
    pub max_steps: u32,
    pub thinking_enabled: bool,
    pub max_stall_retries: u32,
}

impl SessionCall {
    pub fn new(session_name: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            user_message: user_message.into(),
            system_prompt: None,
            tools_prompt: String::new(),
            pending_injections: Vec::new(),
            max_steps: 10,
            thinking_enabled: true,
            max_stall_retries: 3,
        }
    }
}

// Acknowledgment instructions that belong to Phase 1/2 only.  A controller
// sometimes appends them to the task; the backend would then literally
// reply "OK" instead of working.
fn phase3_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let patterns = [
            r#",?\s*(?:di|responde|contesta|dime)\s+(?:solo|solamente|unicamente)\s+["']?OK["']?\.?"#,
            r#",?\s*responde\s+unicamente\s*:?\s*["']?OK["']?\.?"#,
            r#",?\s*solo\s+(?:di|responde|contesta)\s+["']?OK["']?\.?"#,
            r#",?\s*(?:just\s+)?(?:say|respond|reply)\s+(?:only\s+)?["']?OK["']?\.?"#,
            r#",?\s+(?:solo|only)\s+["']?OK["']?\s*\.?\s*$"#,
        ];
        Regex::new(&format!("(?i)(?:{})", patterns.join("|"))).expect("static regex")
    })
}

/// Strip acknowledgment suffixes from a Phase-3 task message.  When
/// stripping would empty the message, the original is kept.
pub fn sanitize_task(message: &str) -> String {
    let cleaned = phase3_strip_re().replace_all(message, "").trim().to_string();
    if cleaned.is_empty() {
        message.to_string()
    } else {
        cleaned
    }
}

/// Drive one user turn through the three-phase protocol.
///
/// The store mutex serializes all session mutations; the caller guarantees
/// at most one in-flight exchange per session.
pub async fn chat_in_session(
    backend: &dyn ChatBackend,
    tools: &ToolRegistry,
    store: &tokio::sync::Mutex<SessionStore>,
    call: SessionCall,
) -> Result<String, TransportError> {
    let session_name = call.session_name.clone();

    // Sweep expired sessions, then bind (or create) ours.
    let (upstream_id, mut parent, system_pending) = {
        let mut store = store.lock().await;
        store.cleanup_old(SESSION_MAX_AGE_HOURS);
        match store.get(&session_name) {
            Some(session) => {
                info!(
                    session = %session_name,
                    messages = session.message_count,
                    "resuming session"
                );
                (
                    session.chat_session_id.clone(),
                    session.parent_message_id.clone(),
                    !session.system_prompt_sent,
                )
            }
            None => {
                let upstream_id = backend.create_session().await?;
                store.create(&session_name, &upstream_id);
                info!(session = %session_name, "new session created");
                (upstream_id, None, true)
            }
        }
    };
    backend.use_session(&upstream_id).await;

    // ── Phase 1: identity ────────────────────────────────────────────────────
    if system_pending {
        if let Some(system_prompt) = &call.system_prompt {
            let init_prompt = format!(
                "{system_prompt}{}{}",
                call.tools_prompt,
                crate::prompts::SESSION_ACK_INSTRUCTION
            );
            let _ack = backend
                .chat(&init_prompt, call.thinking_enabled, parent.clone(), call.max_stall_retries)
                .await?;
            parent = backend.last_message_id().await;
            let mut store = store.lock().await;
            store.update(&session_name, parent.clone(), None);
            store.set_system_prompt_tokens(
                &session_name,
                estimate_tokens_chat(&init_prompt) as u64,
            );
            info!(
                session = %session_name,
                tokens = estimate_tokens_chat(&init_prompt),
                "system prompt accepted"
            );
        }
    }

    // ── Phase 2: injections ──────────────────────────────────────────────────
    let mut injected_tokens = 0u64;
    for injection in &call.pending_injections {
        let ctx_id = injection.context_id();
        {
            let store = store.lock().await;
            if store
                .get(&session_name)
                .is_some_and(|s| s.has_context(&ctx_id))
            {
                continue;
            }
        }
        let prompt =
            crate::prompts::injection_prompt(injection.kind.as_str(), &injection.name, &injection.content);
        info!(session = %session_name, context = %ctx_id, "injecting context");
        let _ack = backend
            .chat(&prompt, call.thinking_enabled, parent.clone(), call.max_stall_retries)
            .await?;
        parent = backend.last_message_id().await;
        injected_tokens += estimate_tokens_chat(&injection.content) as u64;
        let mut store = store.lock().await;
        store.update(&session_name, parent.clone(), Some(&ctx_id));
    }
    if injected_tokens > 0 {
        store.lock().await.add_injected_tokens(&session_name, injected_tokens);
    }

    // ── Phase 3: the task ────────────────────────────────────────────────────
    let mut prompt = sanitize_task(&call.user_message);
    for step in 0..call.max_steps {
        let response = backend
            .chat(&prompt, call.thinking_enabled, parent.clone(), call.max_stall_retries)
            .await?;
        let msg_id = backend.last_message_id().await;

        let (calls, _clean_text) = extract_tool_calls(&response);
        if calls.is_empty() {
            let mut store = store.lock().await;
            store.update(&session_name, msg_id, None);
            let cleaned = if step > 0 {
                clean_final_response(&response)
            } else {
                response
            };
            update_session_summary(&mut store, &session_name, &call.user_message, &cleaned);
            return Ok(cleaned);
        }

        let mut results = Vec::with_capacity(calls.len());
        for (idx, parsed) in calls.iter().enumerate() {
            let tool_call = ToolCall {
                id: format!("session_{session_name}_{step}_{idx}_{}", parsed.tool),
                name: parsed.tool.clone(),
                args: parsed.args.clone(),
            };
            let output = tools.execute(&tool_call).await;
            info!(
                session = %session_name,
                tool = %parsed.tool,
                chars = output.content.len(),
                error = output.is_error,
                "tool executed"
            );
            results.push(format_tool_result(&parsed.tool, &output.content));
        }

        {
            let mut store = store.lock().await;
            store.update(&session_name, msg_id.clone(), None);
        }
        parent = msg_id;
        prompt = results.join("\n");
    }

    Ok("Se alcanzo el maximo de iteraciones en la sesion.".to_string())
}

/// Drive a Phase-3 exchange with truncation continuation.
///
/// When the final response shows truncation signs, a continuation request
/// is issued (up to `max_continuations` times) and the parts are
/// concatenated.
pub async fn chat_with_continuation(
    backend: &dyn ChatBackend,
    tools: &ToolRegistry,
    store: &tokio::sync::Mutex<SessionStore>,
    call: SessionCall,
    max_continuations: u32,
) -> Result<String, TransportError> {
    let session_name = call.session_name.clone();
    let thinking = call.thinking_enabled;
    let stall_retries = call.max_stall_retries;
    let mut full = chat_in_session(backend, tools, store, call).await?;

    for _ in 0..max_continuations {
        if !validate_response(&full, None).truncated {
            break;
        }
        let parent = {
            let store = store.lock().await;
            store
                .get(&session_name)
                .and_then(|s| s.parent_message_id.clone())
        };
        let part = backend
            .chat(
                "Continue exactly where you stopped. Do not repeat prior code.",
                thinking,
                parent,
                stall_retries,
            )
            .await?;
        let msg_id = backend.last_message_id().await;
        store.lock().await.update(&session_name, msg_id, None);
        full.push_str(&part);
    }
    Ok(full)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedBackend;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn empty_tools() -> ToolRegistry {
        ToolRegistry::new()
    }

    // ── sanitization ──────────────────────────────────────────────────────────

    #[test]
    fn sanitize_strips_spanish_ack_suffix() {
        assert_eq!(sanitize_task("crea el login, di solo OK"), "crea el login");
        assert_eq!(
            sanitize_task("implementa el modulo. Responde unicamente: OK"),
            "implementa el modulo."
        );
    }

    #[test]
    fn sanitize_strips_english_ack_suffix() {
        assert_eq!(sanitize_task("build the parser, reply only OK"), "build the parser");
        assert_eq!(sanitize_task("do the thing, just say OK."), "do the thing");
    }

    #[test]
    fn sanitize_keeps_clean_messages() {
        assert_eq!(sanitize_task("crea el login"), "crea el login");
    }

    #[test]
    fn sanitize_never_empties_the_message() {
        assert_eq!(sanitize_task("di solo OK"), "di solo OK");
    }

    // ── protocol phases (scenario S1) ─────────────────────────────────────────

    #[tokio::test]
    async fn first_exchange_runs_three_phases() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let backend = ScriptedBackend::replying(&["OK", "Skill jwt-patterns aceptada", "login code here;"]);
        let tools = empty_tools();

        let mut call = SessionCall::new("delegate:auth", "create login");
        call.system_prompt = Some("SYSTEM PROMPT".into());
        call.pending_injections = vec![Injection::new(
            InjectionKind::Skill,
            "jwt-patterns",
            "use refresh tokens",
        )];

        let response = chat_in_session(&backend, &tools, &store, call).await.unwrap();
        assert_eq!(response, "login code here;");

        // Exactly three upstream sends: Phase 1, Phase 2, Phase 3.
        let sent = backend.sent_messages().await;
        assert_eq!(sent.len(), 3);
        assert!(sent[0].starts_with("SYSTEM PROMPT"));
        assert!(sent[0].contains("Responde UNICAMENTE 'OK'"));
        assert!(sent[1].contains("== SKILL: jwt-patterns =="));
        assert_eq!(sent[2], "create login");

        let store = store.lock().await;
        let session = store.get("delegate:auth").unwrap();
        assert!(session.system_prompt_sent);
        assert!(session.has_context("skill:jwt-patterns"));
        assert!(session.system_prompt_tokens > 0);
        assert!(session.total_injected_tokens > 0);
    }

    #[tokio::test]
    async fn second_exchange_sends_task_only() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = empty_tools();

        // First exchange establishes the session.
        let backend = ScriptedBackend::replying(&["OK", "Skill jwt-patterns aceptada", "done;"]);
        let mut call = SessionCall::new("delegate:auth", "create login");
        call.system_prompt = Some("SYSTEM PROMPT".into());
        call.pending_injections = vec![Injection::new(
            InjectionKind::Skill,
            "jwt-patterns",
            "content",
        )];
        chat_in_session(&backend, &tools, &store, call).await.unwrap();

        // Second exchange in the same session: the plan still offers the
        // system prompt and the skill, but the ledger suppresses both.
        let backend2 = ScriptedBackend::replying(&["reset code;"]);
        let mut call2 = SessionCall::new("delegate:auth", "add password reset");
        call2.system_prompt = Some("SYSTEM PROMPT".into());
        call2.pending_injections = vec![Injection::new(
            InjectionKind::Skill,
            "jwt-patterns",
            "content",
        )];
        let response = chat_in_session(&backend2, &tools, &store, call2).await.unwrap();
        assert_eq!(response, "reset code;");

        // Exactly one upstream send: Phase 3 only.
        let sent = backend2.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], "add password reset");

        let store = store.lock().await;
        let session = store.get("delegate:auth").unwrap();
        assert!(session.system_prompt_sent);
        assert_eq!(
            session
                .injected_contexts
                .iter()
                .filter(|c| c.as_str() == "skill:jwt-patterns")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn parent_message_id_chains_forward() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = empty_tools();

        let backend = ScriptedBackend::replying(&["OK", "answer;"]);
        let mut call = SessionCall::new("converse:topic", "first question");
        call.system_prompt = Some("SYS".into());
        chat_in_session(&backend, &tools, &store, call).await.unwrap();

        let recorded = {
            let store = store.lock().await;
            store
                .get("converse:topic")
                .unwrap()
                .parent_message_id
                .clone()
        };
        // The store carries the backend's latest id…
        assert_eq!(recorded, backend.last_message_id().await);

        // …and the next exchange sends exactly that id as the parent.
        let backend2 = ScriptedBackend::replying(&["second;"]);
        let call2 = SessionCall::new("converse:topic", "second question");
        chat_in_session(&backend2, &tools, &store, call2).await.unwrap();
        let parents = backend2.sent_parents().await;
        assert_eq!(parents, vec![recorded]);
    }

    #[tokio::test]
    async fn no_system_prompt_skips_phase_one() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = empty_tools();
        let backend = ScriptedBackend::replying(&["plain answer;"]);
        let call = SessionCall::new("oneshot", "quick question");
        let response = chat_in_session(&backend, &tools, &store, call).await.unwrap();
        assert_eq!(response, "plain answer;");
        assert_eq!(backend.sent_messages().await.len(), 1);
    }

    // ── tool loop ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_calls_loop_back_into_the_session() {
        use async_trait::async_trait;
        use legate_tools::{Tool, ToolOutput};
        use serde_json::{json, Value};
        use std::sync::Arc;

        struct ListTool;
        #[async_trait]
        impl Tool for ListTool {
            fn name(&self) -> &str {
                "list_directory"
            }
            fn description(&self) -> &str {
                "lists a directory"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, call: &ToolCall) -> ToolOutput {
                ToolOutput::ok(&call.id, "a.txt\nb.txt")
            }
        }

        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(ListTool));

        let with_tool_call =
            "```tool_call\n{\"tool\": \"list_directory\", \"args\": {\"path\": \".\"}}\n```";
        let backend = ScriptedBackend::replying(&[with_tool_call, "Two files present;"]);
        let call = SessionCall::new("oneshot", "what files are there");
        let response = chat_in_session(&backend, &tools, &store, call).await.unwrap();
        assert!(response.contains("Two files present"));

        let sent = backend.sent_messages().await;
        assert_eq!(sent.len(), 2);
        assert!(sent[1].starts_with("Resultado de `list_directory`:"));
        assert!(sent[1].contains("a.txt"));
    }

    #[tokio::test]
    async fn max_steps_terminates_tool_loop() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = empty_tools();

        // Backend always asks for an (unknown) tool.
        let loop_reply = "```tool_call\n{\"tool\": \"missing\", \"args\": {}}\n```";
        let backend = ScriptedBackend::replying(&[loop_reply; 8]);
        let mut call = SessionCall::new("oneshot", "loop forever");
        call.max_steps = 3;
        let response = chat_in_session(&backend, &tools, &store, call).await.unwrap();
        assert!(response.contains("maximo de iteraciones"));
        assert_eq!(backend.sent_messages().await.len(), 3);
    }

    // ── continuation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn truncated_response_is_continued() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = empty_tools();

        // First part clearly truncated (unbalanced braces, open tail),
        // second part closes it.
        let part1 = "function a() { if (x) { while (y) { start(";
        let part2 = ") } } }";
        let backend = ScriptedBackend::replying(&[part1, part2]);
        let call = SessionCall::new("delegate:big", "generate it");
        let full = chat_with_continuation(&backend, &tools, &store, call, 2)
            .await
            .unwrap();
        assert_eq!(full, format!("{part1}{part2}"));

        let sent = backend.sent_messages().await;
        assert_eq!(sent.len(), 2);
        assert!(sent[1].starts_with("Continue exactly where you stopped."));
    }

    #[tokio::test]
    async fn complete_response_is_not_continued() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = empty_tools();
        let backend = ScriptedBackend::replying(&["function a() { return 1; }"]);
        let call = SessionCall::new("delegate:ok", "generate it");
        let full = chat_with_continuation(&backend, &tools, &store, call, 2)
            .await
            .unwrap();
        assert_eq!(full, "function a() { return 1; }");
        assert_eq!(backend.sent_messages().await.len(), 1);
    }
}
