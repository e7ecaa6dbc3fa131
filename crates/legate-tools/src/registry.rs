// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolOutput};

/// A tool schema as advertised to the backend (both transports).
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Registry of dispatchable tools, keyed by name.
///
/// Iteration order is name-sorted so the tool catalogue block is stable
/// across runs (and across the session ledger).
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Descriptors for every registered tool, name-sorted.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Execute one call.  Unknown tools yield an error output rather than
    /// failing the exchange.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutput::err(&call.id, format!("unknown tool '{}'", call.name));
        };
        debug!(tool = %call.name, "dispatching tool call");
        tool.execute(call).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
