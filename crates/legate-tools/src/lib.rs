// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool dispatch for the legate runtime.
//!
//! This crate defines the *contract*: the [`Tool`] trait, the registry, and
//! the textual tool-call protocol used by the web transport (fenced
//! `tool_call` blocks, canonical dedup, result framing).  Concrete
//! filesystem/shell tools are external collaborators registered at startup.

pub mod parse;
mod registry;
mod tool;

pub use parse::{
    clean_final_response, extract_tool_calls, format_tool_result, tools_prompt, ParsedCall,
    MAX_RESULT_CHARS,
};
pub use registry::{ToolDescriptor, ToolRegistry};
pub use tool::{is_write_tool, Tool, ToolCall, ToolOutput, WRITE_TOOLS};
