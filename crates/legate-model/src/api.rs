// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Direct paid API transport (OpenAI-style chat completions).
//!
//! Unlike the web transport this one has native tool calling: a completion
//! either terminates with `choices[0].message.content` or continues with
//! `choices[0].message.tool_calls`.  The tool-dispatch loop itself lives in
//! `legate-core`; this module does one round trip and the model/budget
//! selection.

use serde_json::{json, Value};
use tracing::debug;

use crate::classify::TaskLevel;
use crate::types::{ApiToolCall, ChatMessage, ToolSchema};
use crate::TransportError;

pub const MODEL_CHAT: &str = "deepseek-chat";
pub const MODEL_REASONER: &str = "deepseek-reasoner";
pub const DEFAULT_API_BASE: &str = "https://api.deepseek.com";

/// Adaptive output budget per task level.
pub fn max_tokens_for(level: TaskLevel) -> u32 {
    match level {
        TaskLevel::Chat => 1024,
        TaskLevel::Simple => 2048,
        TaskLevel::CodeSimple => 4096,
        TaskLevel::CodeComplex => 8192,
        TaskLevel::Delegation => 16384,
    }
}

/// Effective max_tokens: the config value acts as a floor, never lowering
/// the adaptive default.
pub fn effective_max_tokens(level: TaskLevel, config_max: Option<u32>) -> u32 {
    let default = max_tokens_for(level);
    match config_max {
        Some(m) if m > 0 => default.max(m),
        _ => default,
    }
}

/// Auto-select the model for a task level.
///
/// Complex tasks are promoted to the reasoning variant (much larger output
/// cap, chain-of-thought).  Only applies when the configured base model is
/// the stock default — an explicit custom model is always respected.
pub fn select_model(base_model: &str, level: TaskLevel, auto_select: bool) -> String {
    if !auto_select || base_model != MODEL_CHAT {
        return base_model.to_string();
    }
    if level >= TaskLevel::CodeComplex {
        MODEL_REASONER.to_string()
    } else {
        MODEL_CHAT.to_string()
    }
}

/// Outcome of one completion round.
#[derive(Debug, Clone)]
pub enum ApiOutcome {
    /// Terminal text response.
    Content(String),
    /// The model wants tools executed; iterate over exactly this list.
    ToolCalls(Vec<ApiToolCall>),
}

pub struct ApiTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    base_model: String,
    auto_select_model: bool,
    config_max_tokens: Option<u32>,
}

impl ApiTransport {
    pub fn new(
        api_key: &str,
        base_model: &str,
        auto_select_model: bool,
        config_max_tokens: Option<u32>,
        base_url: Option<&str>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            base_model: base_model.to_string(),
            auto_select_model,
            config_max_tokens,
        }
    }

    /// One round of chat completion.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        level: TaskLevel,
    ) -> Result<ApiOutcome, TransportError> {
        let model = select_model(&self.base_model, level, self.auto_select_model);
        let max_tokens = effective_max_tokens(level, self.config_max_tokens);
        if model != self.base_model {
            debug!(from = %self.base_model, to = %model, level = level.name(), max_tokens, "model auto-selected");
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
        });
        if !tools.is_empty() {
            let tool_specs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tool_specs);
            body["tool_choice"] = json!("auto");
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if resp.status().as_u16() == 401 {
            return Err(TransportError::TokenExpired("api key rejected".into()));
        }
        let body: Value = resp.error_for_status()?.json().await?;

        let message = body
            .pointer("/choices/0/message")
            .ok_or_else(|| TransportError::Protocol(format!("no choices in response: {body}")))?;

        // Tool iteration is over the *last assistant message's* tool_calls
        // only; earlier messages never re-trigger dispatch.
        if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
            if !calls.is_empty() {
                let parsed: Vec<ApiToolCall> = calls
                    .iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect();
                if !parsed.is_empty() {
                    return Ok(ApiOutcome::ToolCalls(parsed));
                }
            }
        }
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        Ok(ApiOutcome::Content(content))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
