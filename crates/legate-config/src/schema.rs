// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should default to enabled need a named function.
fn default_true() -> bool {
    true
}

fn default_summary_threshold() -> u32 {
    80
}

fn default_pool_size() -> u32 {
    5
}

fn default_chunk_threshold() -> u32 {
    30_000
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

/// Runtime configuration, deserialized from `config.json`.
///
/// Credential fields (`bearer_token`, `cookies`, `api_key`) may arrive
/// encrypted with the `DPAPI:` prefix; [`crate::load_config`] decrypts them
/// transparently and [`crate::save_config`] re-encrypts on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem roots the tool dispatcher may touch.  Empty = unrestricted.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Shell commands the `run_command` tool may execute.  Empty = none.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Base model for the direct API transport.  Auto-selection only kicks
    /// in when this is the stock default.
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional floor for the adaptive per-level `max_tokens` table.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub memory_path: Option<String>,
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: u32,
    #[serde(default)]
    pub skills_dir: Option<String>,
    /// Path to the PoW solver module.  Downloaded on demand when absent.
    #[serde(default)]
    pub wasm_path: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Cookie header value captured from the browser login.
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    /// Promote to the reasoning model for complex tasks.
    #[serde(default = "default_true")]
    pub auto_select_model: bool,
    #[serde(default = "default_true")]
    pub thinking_enabled: bool,
    /// Worker pool size for multi-instance execution.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Templates above this token estimate run chunked.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold_tokens: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            allowed_commands: Vec::new(),
            model: default_model(),
            max_tokens: None,
            memory_path: None,
            summary_threshold: default_summary_threshold(),
            skills_dir: None,
            wasm_path: None,
            bearer_token: None,
            cookies: None,
            api_key: None,
            lang: None,
            auto_select_model: true,
            thinking_enabled: true,
            pool_size: default_pool_size(),
            chunk_threshold_tokens: default_chunk_threshold(),
        }
    }
}

impl Config {
    /// Resolve the effective API key: environment variable wins over config.
    pub fn effective_api_key(&self) -> Option<String> {
        std::env::var(crate::API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }

    /// True when web-mode credentials (bearer + cookies) are present.
    pub fn has_web_credentials(&self) -> bool {
        self.bearer_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.cookies.as_deref().is_some_and(|c| !c.is_empty())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
