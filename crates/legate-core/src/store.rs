// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistent store of named upstream conversations.
//!
//! Each named session maps to one upstream chat thread and carries the
//! state that makes token-efficient reuse possible: the parent message id
//! for chaining, the `system_prompt_sent` flag, and the insertion-ordered
//! ledger of injected context ids (`type:name`).
//!
//! Persistence is an atomic whole-map JSON write on every mutation.  The
//! store is single-writer; callers serialize mutations behind a lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Session TTL used by the cleanup sweep.
pub const SESSION_MAX_AGE_HOURS: i64 = 48;

/// Valid session-name mode prefixes.
pub const VALID_MODES: &[&str] = &["chat", "oneshot", "delegate", "converse", "quantum", "multi-step"];

/// Build a namespaced session name: `mode[:identifier[:sub]]`.
pub fn build_session_name(mode: &str, identifier: &str, sub: &str) -> String {
    let mut name = mode.to_string();
    if !identifier.is_empty() {
        name.push(':');
        name.push_str(identifier);
    }
    if !sub.is_empty() {
        name.push(':');
        name.push_str(sub);
    }
    name
}

/// Split a session name into `(mode, identifier, sub)`.
pub fn parse_session_name(name: &str) -> (&str, &str, &str) {
    let mut parts = name.splitn(3, ':');
    (
        parts.next().unwrap_or(""),
        parts.next().unwrap_or(""),
        parts.next().unwrap_or(""),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Closed,
    Expired,
}

/// One persistent conversation with the upstream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub name: String,
    /// Upstream conversation id.
    pub chat_session_id: String,
    /// Id of the most recent assistant message actually returned by the
    /// backend for this session.  Always chained into the next request.
    pub parent_message_id: Option<String>,
    pub system_prompt_sent: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: u64,
    pub status: SessionStatus,
    /// Namespace prefix: chat, oneshot, delegate, converse, quantum, multi-step.
    pub mode: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub summary_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub knowledge_received_from: Vec<String>,
    #[serde(default)]
    pub knowledge_sent_to: Vec<String>,
    /// Insertion-ordered set of `type:name` context ids already sent.
    #[serde(default)]
    pub injected_contexts: Vec<String>,
    /// Estimated token cost of the Phase-1 system prompt.
    #[serde(default)]
    pub system_prompt_tokens: u64,
    /// Running estimated total of Phase-2 injection tokens.
    #[serde(default)]
    pub total_injected_tokens: u64,
}

impl ChatSession {
    fn new(name: &str, chat_session_id: &str) -> Self {
        let mode = {
            let (prefix, _, _) = parse_session_name(name);
            if VALID_MODES.contains(&prefix) {
                prefix.to_string()
            } else {
                "chat".to_string()
            }
        };
        let now = Utc::now();
        Self {
            name: name.to_string(),
            chat_session_id: chat_session_id.to_string(),
            parent_message_id: None,
            system_prompt_sent: false,
            created_at: now,
            last_active: now,
            message_count: 0,
            status: SessionStatus::Active,
            mode,
            topic: String::new(),
            summary: String::new(),
            summary_updated_at: None,
            knowledge_received_from: Vec::new(),
            knowledge_sent_to: Vec::new(),
            injected_contexts: Vec::new(),
            system_prompt_tokens: 0,
            total_injected_tokens: 0,
        }
    }

    pub fn has_context(&self, context_id: &str) -> bool {
        self.injected_contexts.iter().any(|c| c == context_id)
    }

    /// Skill names recorded in the ledger.
    pub fn injected_skills(&self) -> Vec<String> {
        self.injected_contexts
            .iter()
            .filter_map(|c| c.strip_prefix("skill:"))
            .map(String::from)
            .collect()
    }

    pub fn tokens_invested(&self) -> u64 {
        self.system_prompt_tokens + self.total_injected_tokens
    }
}

/// Compact per-session view for routing decisions and `--session-digest`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDigest {
    pub name: String,
    pub mode: String,
    pub topic: String,
    pub summary: String,
    pub messages: u64,
    pub skills: Vec<String>,
    pub contexts: Vec<String>,
    pub last_active: DateTime<Utc>,
    pub tokens_invested: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    sessions: BTreeMap<String, ChatSession>,
}

/// The on-disk session map.  Single-writer.
pub struct SessionStore {
    path: PathBuf,
    sessions: BTreeMap<String, ChatSession>,
}

impl SessionStore {
    /// Load the store, tolerating a missing or corrupt file.
    pub fn load(path: &Path) -> Self {
        let sessions = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<StoreFile>(&raw).ok())
            .map(|f| f.sessions)
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            sessions,
        }
    }

    /// Atomic whole-map write: temp file in the same directory, then rename.
    pub fn save(&self) {
        let file = StoreFile {
            sessions: self.sessions.clone(),
        };
        let text = match serde_json::to_string_pretty(&file) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "could not serialize session store");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "could not create session store dir");
                return;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, &text).and_then(|_| std::fs::rename(&tmp, &self.path))
        {
            warn!(path = %self.path.display(), error = %e, "could not persist session store");
        }
    }

    /// Create a named session bound to an upstream id.
    pub fn create(&mut self, name: &str, chat_session_id: &str) -> &ChatSession {
        let session = ChatSession::new(name, chat_session_id);
        self.sessions.insert(name.to_string(), session);
        self.save();
        &self.sessions[name]
    }

    /// Look up an *active* session.  Closed and expired sessions are never
    /// reused, so they are invisible here.
    pub fn get(&self, name: &str) -> Option<&ChatSession> {
        self.sessions
            .get(name)
            .filter(|s| s.status == SessionStatus::Active)
    }

    /// Return the existing active session, or create one with a fresh
    /// upstream id from `create_fn`.
    pub fn get_or_create(
        &mut self,
        name: &str,
        create_fn: impl FnOnce() -> anyhow::Result<String>,
    ) -> anyhow::Result<&ChatSession> {
        if self.get(name).is_none() {
            let chat_session_id = create_fn()?;
            self.create(name, &chat_session_id);
        }
        self.sessions
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("session '{name}' vanished during creation"))
    }

    /// Record a completed exchange: chain the parent id, optionally add a
    /// ledger entry, bump counters, mark the system prompt sent.
    pub fn update(&mut self, name: &str, parent_message_id: Option<String>, add_context: Option<&str>) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        if let Some(id) = parent_message_id {
            session.parent_message_id = Some(id);
        }
        if let Some(ctx) = add_context {
            if !session.injected_contexts.iter().any(|c| c == ctx) {
                session.injected_contexts.push(ctx.to_string());
            }
        }
        session.message_count += 1;
        session.last_active = Utc::now();
        session.system_prompt_sent = true;
        self.save();
    }

    /// Record the estimated Phase-1 cost.
    pub fn set_system_prompt_tokens(&mut self, name: &str, tokens: u64) {
        if let Some(session) = self.sessions.get_mut(name) {
            session.system_prompt_tokens = tokens;
            self.save();
        }
    }

    /// Accumulate estimated Phase-2 cost.
    pub fn add_injected_tokens(&mut self, name: &str, tokens: u64) {
        if let Some(session) = self.sessions.get_mut(name) {
            session.total_injected_tokens += tokens;
            self.save();
        }
    }

    pub fn close(&mut self, name: &str) -> bool {
        match self.sessions.get_mut(name) {
            Some(session) => {
                session.status = SessionStatus::Closed;
                self.save();
                true
            }
            None => false,
        }
    }

    /// Close every active session; returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let mut count = 0;
        for session in self.sessions.values_mut() {
            if session.status == SessionStatus::Active {
                session.status = SessionStatus::Closed;
                count += 1;
            }
        }
        if count > 0 {
            self.save();
        }
        count
    }

    /// Expire active sessions idle longer than `max_age_hours`.
    pub fn cleanup_old(&mut self, max_age_hours: i64) {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut changed = false;
        for session in self.sessions.values_mut() {
            if session.status == SessionStatus::Active && session.last_active < cutoff {
                session.status = SessionStatus::Expired;
                changed = true;
            }
        }
        if changed {
            self.save();
        }
    }

    /// Active sessions, most recently active first.
    pub fn list_active(&self) -> Vec<&ChatSession> {
        let mut active: Vec<&ChatSession> = self
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .collect();
        active.sort_by_key(|s| std::cmp::Reverse(s.last_active));
        active
    }

    pub fn list_by_mode(&self, mode: &str) -> Vec<&ChatSession> {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.mode == mode)
            .collect()
    }

    pub fn digest(&self, name: &str) -> Option<SessionDigest> {
        let s = self.get(name)?;
        Some(SessionDigest {
            name: s.name.clone(),
            mode: s.mode.clone(),
            topic: s.topic.clone(),
            summary: s.summary.clone(),
            messages: s.message_count,
            skills: s.injected_skills(),
            contexts: s.injected_contexts.clone(),
            last_active: s.last_active,
            tokens_invested: s.tokens_invested(),
        })
    }

    pub fn update_summary(&mut self, name: &str, topic: &str, summary: &str) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        if !topic.is_empty() {
            session.topic = topic.to_string();
        }
        if !summary.is_empty() {
            session.summary = summary.to_string();
            session.summary_updated_at = Some(Utc::now());
        }
        self.save();
    }

    pub fn record_knowledge_transfer(&mut self, from: &str, to: &str) {
        if let Some(src) = self.sessions.get_mut(from) {
            src.knowledge_sent_to.push(to.to_string());
        }
        if let Some(dst) = self.sessions.get_mut(to) {
            dst.knowledge_received_from.push(from.to_string());
        }
        self.save();
    }

    /// JSON-friendly overview for `--session-list`.
    pub fn summary(&self) -> serde_json::Value {
        let active = self.list_active();
        serde_json::json!({
            "total_sessions": self.sessions.len(),
            "active_sessions": active.len(),
            "sessions": active.iter().map(|s| serde_json::json!({
                "name": s.name,
                "mode": s.mode,
                "topic": s.topic,
                "summary": s.summary,
                "messages": s.message_count,
                "created": s.created_at.to_rfc3339(),
                "last_active": s.last_active.to_rfc3339(),
                "system_sent": s.system_prompt_sent,
                "skills": s.injected_skills(),
                "tokens_invested": s.tokens_invested(),
            })).collect::<Vec<_>>(),
        })
    }

    #[cfg(test)]
    pub(crate) fn get_any_status(&self, name: &str) -> Option<&ChatSession> {
        self.sessions.get(name)
    }

    #[cfg(test)]
    pub(crate) fn force_last_active(&mut self, name: &str, at: DateTime<Utc>) {
        if let Some(s) = self.sessions.get_mut(name) {
            s.last_active = at;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
