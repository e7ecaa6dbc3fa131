// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier (forwarded verbatim in API mode, synthesized in
    /// web mode).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when the tool execution failed non-fatally.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Tool names that mutate the world.
///
/// The agent loop's hallucination and stall detectors key off this set: a
/// "task complete" claim with zero write-class executions is treated as a
/// description, not an action.
pub const WRITE_TOOLS: &[&str] = &[
    "write_file",
    "run_command",
    "make_directory",
    "move_file",
    "copy_file",
];

pub fn is_write_tool(name: &str) -> bool {
    WRITE_TOOLS.contains(&name)
}

/// Trait every dispatchable tool implements.
///
/// The filesystem/shell tool implementations live outside this crate; the
/// runtime only depends on this contract.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Execute the tool.  Failures should come back as [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
