// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;

/// Controller surface of the legate runtime.
///
/// Exactly one entry flag selects the execution mode; with none given, a
/// bare `QUERY` runs as a one-shot exchange.  Session-management flags
/// operate on the persistent store without touching the upstream.
#[derive(Parser, Debug)]
#[command(
    name = "legate",
    about = "Delegation and session orchestration for conversational LLM backends",
    version,
    long_about = None,
)]
pub struct Cli {
    /// One-shot query (default mode when no entry flag is given).
    #[arg(value_name = "QUERY")]
    pub query: Option<String>,

    // ── Entry modes (mutually exclusive) ─────────────────────────────────────
    /// Run a single-shot delegation with validation and review.
    #[arg(long, value_name = "TASK", group = "entry")]
    pub delegate: Option<String>,

    /// Run the dual-angle parallel strategy.
    #[arg(long, value_name = "TASK", group = "entry")]
    pub quantum: Option<String>,

    /// Manual angle labels for --quantum, comma-separated ("a,b").
    #[arg(long, value_name = "A,B", requires = "quantum")]
    pub quantum_angles: Option<String>,

    /// Run N role-differentiated instances.
    #[arg(long, value_name = "TASK", group = "entry")]
    pub multi: Option<String>,

    /// Role preset for --multi: generate-review | dual-generator |
    /// full-pipeline | specialist-pair.
    #[arg(long, default_value = "generate-review", requires = "multi")]
    pub roles: String,

    /// Instance count for --multi.
    #[arg(long, default_value_t = 2, requires = "multi")]
    pub instances: usize,

    /// Run --multi as a sequential pipeline instead of parallel.
    #[arg(long, requires = "multi")]
    pub pipeline: bool,

    /// Iterative conversation: comma-separated messages.
    #[arg(long, value_name = "MSGS", group = "entry")]
    pub converse: Option<String>,

    /// Iterative conversation: one message per line from a file.
    #[arg(long, value_name = "FILE", group = "entry")]
    pub converse_file: Option<String>,

    /// Execute a multi-step plan from a JSON file.
    #[arg(long, value_name = "PLAN.JSON", group = "entry")]
    pub multi_step: Option<String>,

    /// Execute a multi-step plan from inline JSON.
    #[arg(long, value_name = "JSON", group = "entry")]
    pub multi_step_inline: Option<String>,

    /// Run the goal-directed agent loop.
    #[arg(long, value_name = "GOAL", group = "entry")]
    pub agent: Option<String>,

    /// Parse a requirements document into a multi-step plan.
    #[arg(long, value_name = "DOC", group = "entry")]
    pub requirements: Option<String>,

    /// Execute the parsed requirements plan instead of printing it.
    #[arg(long, requires = "requirements")]
    pub auto_execute: bool,

    /// Print the session-health report and exit.
    #[arg(long, group = "entry")]
    pub health_report: bool,

    // ── Session management ───────────────────────────────────────────────────
    /// Named session to use (overrides the task-derived identifier).
    #[arg(long, value_name = "NAME")]
    pub session: Option<String>,

    /// List active sessions and exit.
    #[arg(long, group = "entry")]
    pub session_list: bool,

    /// Close one session and exit.
    #[arg(long, value_name = "NAME", group = "entry")]
    pub session_close: Option<String>,

    /// Close all active sessions and exit.
    #[arg(long, group = "entry")]
    pub session_close_all: bool,

    /// Print one session's digest and exit.
    #[arg(long, value_name = "NAME", group = "entry")]
    pub session_digest: Option<String>,

    /// Transfer knowledge from a named session before the first turn.
    #[arg(long, value_name = "NAME")]
    pub transfer_from: Option<String>,

    // ── Tuning ───────────────────────────────────────────────────────────────
    /// Marker template file for delegation/quantum.
    #[arg(long, value_name = "FILE")]
    pub template: Option<String>,

    /// Extra context file inlined into the task.
    #[arg(long, value_name = "FILE")]
    pub context: Option<String>,

    /// Feedback pre-seeded into the first attempt.
    #[arg(long, value_name = "TEXT")]
    pub feedback: Option<String>,

    /// Review rounds after a failed validation.
    #[arg(long, default_value_t = 1)]
    pub max_retries: u32,

    /// Skip response validation.
    #[arg(long)]
    pub no_validate: bool,

    /// Project summary file for the pre-task briefing turn.
    #[arg(long, value_name = "FILE")]
    pub project_context: Option<String>,

    /// Let the backend pick its own skills from the catalogue.
    #[arg(long)]
    pub negotiate_skills: bool,

    /// Emit a structured JSON result instead of plain text.
    #[arg(long)]
    pub json: bool,

    /// Path to the config file (defaults to the per-user data directory).
    #[arg(long, value_name = "FILE")]
    pub config: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
