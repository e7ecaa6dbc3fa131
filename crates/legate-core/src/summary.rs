// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local-heuristic session summaries.
//!
//! Zero upstream tokens: the topic and running summary are derived from
//! the exchanged text itself, opportunistically after each Phase-3
//! exchange.  Summaries feed the routing digest and knowledge transfer.

use legate_index::extract_keywords;

use crate::store::SessionStore;

/// Hard cap on the running summary.
const MAX_SUMMARY_CHARS: usize = 600;

/// Derive a one-line topic from the first user message of a session.
pub fn derive_topic(user_message: &str) -> String {
    let keywords = extract_keywords(user_message);
    if keywords.is_empty() {
        let mut topic: String = user_message.trim().chars().take(50).collect();
        if topic.len() < user_message.trim().len() {
            topic.push_str("...");
        }
        return topic;
    }
    keywords.join(" ")
}

/// One-line digest of an exchange appended to the running summary.
fn exchange_line(user_message: &str, response: &str) -> String {
    let ask: String = user_message.trim().chars().take(60).collect();
    let functions = response.matches("function ").count();
    let outcome = if functions > 0 {
        format!("{functions} funciones")
    } else {
        format!("{} chars", response.len())
    };
    format!("- {ask} → {outcome}")
}

/// Opportunistic post-exchange update: set the topic on first contact,
/// append an exchange line, trim the oldest lines past the cap.
pub fn update_session_summary(
    store: &mut SessionStore,
    session_name: &str,
    user_message: &str,
    response: &str,
) {
    let Some(session) = store.get(session_name) else {
        return;
    };
    let topic = if session.topic.is_empty() {
        derive_topic(user_message)
    } else {
        String::new()
    };

    let mut summary = session.summary.clone();
    if !summary.is_empty() {
        summary.push('\n');
    }
    summary.push_str(&exchange_line(user_message, response));
    while summary.len() > MAX_SUMMARY_CHARS {
        match summary.find('\n') {
            Some(pos) => summary.drain(..=pos),
            None => {
                summary = legate_index::clip(&summary, MAX_SUMMARY_CHARS).to_string();
                break;
            }
        };
    }

    store.update_summary(session_name, &topic, &summary);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
