// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Knowledge transfer between named sessions.
//!
//! A target session can receive a compact digest of what another session
//! already knows (topic, summary, injected skills) as a `knowledge:`
//! injection, instead of replaying the source conversation.

use tracing::warn;

use crate::protocol::{Injection, InjectionKind};
use crate::store::SessionStore;

/// Build a `knowledge` injection from a source session's digest.
///
/// Returns `None` when the source session does not exist or has nothing
/// worth transferring yet.
pub fn build_knowledge_injection(store: &SessionStore, source: &str) -> Option<Injection> {
    let digest = store.digest(source)?;
    if digest.summary.is_empty() && digest.skills.is_empty() && digest.topic.is_empty() {
        warn!(source, "source session has no transferable knowledge yet");
        return None;
    }

    let mut lines = vec![format!("Conocimiento transferido de la sesion '{source}':")];
    if !digest.topic.is_empty() {
        lines.push(format!("TEMA: {}", digest.topic));
    }
    if !digest.summary.is_empty() {
        lines.push(format!("RESUMEN:\n{}", digest.summary));
    }
    if !digest.skills.is_empty() {
        lines.push(format!("SKILLS YA CARGADAS ALLI: {}", digest.skills.join(", ")));
    }
    lines.push(format!("({} mensajes intercambiados)", digest.messages));

    Some(Injection::new(
        InjectionKind::Knowledge,
        source.replace(':', "-"),
        lines.join("\n"),
    ))
}

/// Record a completed transfer on both sessions.
pub fn record_transfer(store: &mut SessionStore, source: &str, target: &str) {
    store.record_knowledge_transfer(source, target);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
