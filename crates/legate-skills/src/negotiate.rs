// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skill negotiation: let the backend pick its own knowledge.
//!
//! Phase 1 sends the compact catalogue plus the task under an ultra-short
//! system prompt; the backend answers with the skill names it wants (or
//! `NONE`).  Phase 2 loads exactly those skills within budget.  The caller
//! drives the actual upstream call with a timeout and falls back to the
//! hybrid scorer transparently on failure — this module owns the prompt
//! shapes and the tolerant response parser.

/// System prompt for the negotiation turn (~60 tokens).
pub const NEGOTIATE_SYSTEM: &str = "You are a code expert choosing knowledge resources. \
Given a task and a catalog of available skills, respond ONLY with \
the skill names you need (one per line). \
If you don't need any, respond with: NONE. \
Choose only what's truly useful — you already know most programming concepts.";

/// Default negotiation timeout.
pub const NEGOTIATE_TIMEOUT_SECS: u64 = 15;

/// Build the negotiation user prompt: task plus catalogue.
pub fn build_negotiate_prompt(task: &str, catalog_text: &str) -> String {
    let task = legate_index::clip(task, 5_000);
    format!("TASK: {task}\n\n{catalog_text}\n\nList ONLY the skill names you need (one per line), or NONE:")
}

/// Parse the backend's negotiation reply into skill names.
///
/// Tolerates numbering, bullets, backticks and stray capitalization; a
/// `NONE` anywhere means no skills.  Lines that do not look like skill
/// names (too long, internal spaces with no hyphens) are discarded.
pub fn parse_skill_response(response: &str) -> Vec<String> {
    if response.trim().is_empty() || response.to_uppercase().contains("NONE") {
        return Vec::new();
    }
    let mut names = Vec::new();
    for line in response.lines() {
        let line = line
            .trim()
            .trim_start_matches(['0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '.', '-', '*', ')', ' '])
            .trim()
            .trim_matches('`')
            .trim();
        if line.is_empty() || line.len() >= 60 {
            continue;
        }
        // Accept single tokens and hyphenated names; reject prose.
        if line.contains(' ') && !line.contains('-') {
            continue;
        }
        let clean = line.to_lowercase().replace(' ', "-");
        if clean.len() >= 3 {
            names.push(clean);
        }
    }
    names
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
