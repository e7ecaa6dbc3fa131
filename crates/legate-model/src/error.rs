// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Categorical transport failures.
///
/// The retry policy keys off the variant, not the message:
/// - `TokenExpired` is never retried inside the transport layer — it
///   propagates so the caller can surface "re-login required".
/// - `SessionDead` is retried once after recreating the upstream session id.
/// - `StallDetected` is retried with a fresh session id up to the configured
///   stall budget; the parent message id is preserved across stalls.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("token expired: {0}")]
    TokenExpired(String),

    #[error("upstream session dead: {0}")]
    SessionDead(String),

    #[error("stream stalled: {0}")]
    StallDetected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("pow solver error: {0}")]
    Pow(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors that auto-recovery may retry with a fresh session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::StallDetected(_) | TransportError::SessionDead(_)
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expired_is_not_retryable() {
        assert!(!TransportError::TokenExpired("401".into()).is_retryable());
    }

    #[test]
    fn stall_and_session_dead_are_retryable() {
        assert!(TransportError::StallDetected("90s".into()).is_retryable());
        assert!(TransportError::SessionDead("rejected".into()).is_retryable());
    }

    #[test]
    fn protocol_errors_are_not_retryable() {
        assert!(!TransportError::Protocol("bad json".into()).is_retryable());
    }
}
