// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Converse mode: an ordered list of user messages fed sequentially into
//! one named session, with an optional knowledge transfer from a prior
//! session.

use std::time::Instant;

use serde::Serialize;

use legate_model::{TaskLevel, TransportError};
use legate_tools::tools_prompt;

use crate::knowledge::{build_knowledge_injection, record_transfer};
use crate::modes::ModeContext;
use crate::orchestrate::Orchestrator;
use crate::prompts::{assemble_system_prompt, WorkShape};
use crate::protocol::{chat_in_session, SessionCall};
use crate::store::build_session_name;

#[derive(Debug, Clone, Default)]
pub struct ConverseOptions {
    pub topic: String,
    pub messages: Vec<String>,
    /// Session to transfer knowledge from before the first turn.
    pub transfer_from: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TurnTrace {
    pub message: String,
    pub response: String,
    pub duration_s: f64,
}

#[derive(Debug, Serialize)]
pub struct ConverseResult {
    pub final_response: String,
    pub turns: Vec<TurnTrace>,
    pub session_name: String,
}

/// Feed the messages through the session in order; return the last
/// response with a per-turn trace.
pub async fn run_converse(
    ctx: &ModeContext<'_>,
    options: ConverseOptions,
) -> Result<ConverseResult, TransportError> {
    let session_name = build_session_name("converse", &options.topic, "");
    let orchestrator = Orchestrator::new(ctx.skills, ctx.data_dir.clone());

    // Knowledge transfer rides the first exchange as a regular injection.
    let transfer = match &options.transfer_from {
        Some(source) => {
            let store = ctx.store.lock().await;
            build_knowledge_injection(&store, source)
        }
        None => None,
    };

    let mut turns: Vec<TurnTrace> = Vec::new();
    let mut final_response = String::new();

    for (index, message) in options.messages.iter().enumerate() {
        let extras = if index == 0 {
            transfer.clone().into_iter().collect()
        } else {
            Vec::new()
        };
        let builder = || assemble_system_prompt(TaskLevel::CodeSimple, WorkShape::Generation);
        let (plan, _) = orchestrator
            .prepare_session_call(
                ctx.store,
                "converse",
                &options.topic,
                message,
                Some(&builder),
                "",
                false,
                extras,
            )
            .await;

        let call = SessionCall {
            system_prompt: plan.system_prompt,
            tools_prompt: if plan.system_prompt_tokens > 0 {
                tools_prompt(&ctx.tools.descriptors())
            } else {
                String::new()
            },
            pending_injections: plan.pending_injections,
            thinking_enabled: ctx.thinking_enabled,
            ..SessionCall::new(session_name.clone(), message.clone())
        };
        let started = Instant::now();
        let response = chat_in_session(ctx.backend, ctx.tools, ctx.store, call).await?;
        final_response = response.clone();
        turns.push(TurnTrace {
            message: message.clone(),
            response,
            duration_s: started.elapsed().as_secs_f64(),
        });
    }

    if let Some(source) = &options.transfer_from {
        if transfer.is_some() {
            let mut store = ctx.store.lock().await;
            record_transfer(&mut store, source, &session_name);
        }
    }

    Ok(ConverseResult {
        final_response,
        turns,
        session_name,
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

    #[tokio::test]
    async fn messages_run_sequentially_in_one_session() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = ToolRegistry::new();
        let backend = ScriptedBackend::replying(&["OK", "first answer", "second answer"]);
        let ctx = ModeContext::new(&backend, &tools, &store);

        let result = run_converse(
            &ctx,
            ConverseOptions {
                topic: "auth".into(),
                messages: vec!["primera pregunta".into(), "segunda pregunta".into()],
                transfer_from: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.final_response, "second answer");
        assert_eq!(result.turns.len(), 2);
        assert_eq!(result.session_name, "converse:auth");

        // Phase 1 once, then one send per turn.
        let sent = backend.sent_messages().await;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1], "primera pregunta");
        assert_eq!(sent[2], "segunda pregunta");

        let store = store.lock().await;
        assert_eq!(store.get("converse:auth").unwrap().message_count, 3);
    }

    #[tokio::test]
    async fn knowledge_transfer_rides_first_turn() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        {
            let mut s = store.lock().await;
            s.create("converse:source", "up-0");
            s.update_summary("converse:source", "motor de juego", "- sprites listos");
        }
        let tools = ToolRegistry::new();
        let backend = ScriptedBackend::replying(&[
            "OK",
            "Conocimiento de converse-source integrado",
            "respuesta con contexto",
        ]);
        let ctx = ModeContext::new(&backend, &tools, &store);

        let result = run_converse(
            &ctx,
            ConverseOptions {
                topic: "secuela".into(),
                messages: vec!["continua el motor".into()],
                transfer_from: Some("converse:source".into()),
            },
        )
        .await
        .unwrap();

        assert_eq!(result.final_response, "respuesta con contexto");
        let sent = backend.sent_messages().await;
        assert_eq!(sent.len(), 3);
        assert!(sent[1].contains("== KNOWLEDGE: converse-source =="));
        assert!(sent[1].contains("motor de juego"));

        let store = store.lock().await;
        assert!(store
            .get("converse:secuela")
            .unwrap()
            .has_context("knowledge:converse-source"));
        assert!(!store
            .get("converse:source")
            .unwrap()
            .knowledge_sent_to
            .is_empty());
    }

    #[tokio::test]
    async fn empty_message_list_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let store = Mutex::new(SessionStore::load(&tmp.path().join("sessions.json")));
        let tools = ToolRegistry::new();
        let backend = ScriptedBackend::replying(&[]);
        let ctx = ModeContext::new(&backend, &tools, &store);
        let result = run_converse(
            &ctx,
            ConverseOptions {
                topic: "vacio".into(),
                messages: Vec::new(),
                transfer_from: None,
            },
        )
        .await
        .unwrap();
        assert!(result.final_response.is_empty());
        assert!(result.turns.is_empty());
    }
}
