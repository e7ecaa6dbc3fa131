// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TransportError;

/// A single message in a direct-API conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Native tool calls on an assistant message (direct API only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ApiToolCall>,
    /// Id of the tool call this message answers (`role = tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Native tool-call structure of the direct API, mapped 1:1 from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub kind: String,
    pub function: ApiFunctionCall,
}

fn default_function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// A tool schema advertised to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// One user turn against a session-oriented backend.
///
/// The web transport implements this over the browser-session protocol;
/// tests substitute a scripted mock.  Within one backend instance, calls are
/// strictly serialized by the caller (one in-flight exchange per upstream
/// session).
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Create a fresh upstream conversation, returning its id.
    async fn create_session(&self) -> Result<String, TransportError>;

    /// Point subsequent `chat` calls at the given upstream session.
    async fn use_session(&self, session_id: &str);

    /// Drive one user turn, returning the full assistant text.
    async fn chat(
        &self,
        message: &str,
        thinking_enabled: bool,
        parent_message_id: Option<String>,
        max_stall_retries: u32,
    ) -> Result<String, TransportError>;

    /// Id of the most recent assistant message for the current session.
    async fn last_message_id(&self) -> Option<String>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
