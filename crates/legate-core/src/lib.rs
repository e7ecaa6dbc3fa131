// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session orchestration core for legate.
//!
//! Ties the transports, tools, skills and memory together: the persistent
//! session store with its injected-context ledger, the orchestrator that
//! plans what must be sent for the first time, the three-phase exchange
//! protocol, the response validator, the quantum merge engine, and the
//! execution modes.

pub mod angles;
pub mod chunker;
pub mod intel;
pub mod knowledge;
pub mod merge;
pub mod modes;
pub mod orchestrate;
pub mod prompts;
pub mod protocol;
pub mod requirements;
pub mod store;
pub mod summary;
pub mod validate;

#[cfg(test)]
mod testutil;

pub use orchestrate::{CallPlan, MemoryHandles, Orchestrator};
pub use protocol::{
    chat_in_session, chat_with_continuation, sanitize_task, Injection, InjectionKind, SessionCall,
};
pub use store::{
    build_session_name, parse_session_name, ChatSession, SessionStore, SessionStatus,
    SESSION_MAX_AGE_HOURS,
};
pub use validate::{validate_response, Validation};
