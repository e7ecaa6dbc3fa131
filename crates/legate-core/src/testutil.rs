// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scripted [`ChatBackend`] for protocol and mode tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use legate_model::{ChatBackend, TransportError};

/// One scripted turn outcome.
pub enum Script {
    Reply(String),
    Stall,
    Empty,
    TokenExpired,
}

/// A backend that replays a fixed script and records everything sent.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Script>>,
    sent: Mutex<Vec<(String, Option<String>)>>,
    last_id: Mutex<Option<String>>,
    id_counter: AtomicU64,
    sessions_created: AtomicU64,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
            last_id: Mutex::new(None),
            id_counter: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
        }
    }

    /// Convenience: a script of plain replies.
    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Script::Reply(r.to_string())).collect())
    }

    /// Messages sent so far, in order.
    pub async fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|(m, _)| m.clone()).collect()
    }

    /// Parent ids carried by each sent message.
    pub async fn sent_parents(&self) -> Vec<Option<String>> {
        self.sent.lock().await.iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn create_session(&self) -> Result<String, TransportError> {
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("upstream-{n}"))
    }

    async fn use_session(&self, _session_id: &str) {}

    async fn chat(
        &self,
        message: &str,
        _thinking_enabled: bool,
        parent_message_id: Option<String>,
        max_stall_retries: u32,
    ) -> Result<String, TransportError> {
        // Emulate the transport's auto-recovery budget: stalls and empties
        // consume retries; a reply within budget succeeds.
        let mut retries_left = max_stall_retries;
        loop {
            let step = self.script.lock().await.pop_front();
            match step {
                Some(Script::Reply(text)) => {
                    self.sent
                        .lock()
                        .await
                        .push((message.to_string(), parent_message_id.clone()));
                    let id = format!("msg-{}", self.id_counter.fetch_add(1, Ordering::SeqCst));
                    *self.last_id.lock().await = Some(id);
                    return Ok(text);
                }
                Some(Script::Stall) | Some(Script::Empty) => {
                    if retries_left == 0 {
                        return Err(TransportError::StallDetected("scripted stall".into()));
                    }
                    retries_left -= 1;
                    self.sessions_created.fetch_add(1, Ordering::SeqCst);
                }
                Some(Script::TokenExpired) => {
                    return Err(TransportError::TokenExpired("scripted expiry".into()));
                }
                None => {
                    return Err(TransportError::Protocol("script exhausted".into()));
                }
            }
        }
    }

    async fn last_message_id(&self) -> Option<String> {
        self.last_id.lock().await.clone()
    }
}
