// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Encrypted-at-rest codec for credential fields.
//!
//! Values are stored as `DPAPI:<base64>`.  The actual OS keystore binding
//! lives behind [`SecretCipher`]; this crate ships the prefix codec and a
//! pass-through cipher so the rest of the system is oblivious to whether a
//! platform wrapper is wired in.  A value without the prefix is treated as
//! plaintext and returned as-is, which keeps hand-edited config files
//! working.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

/// Storage prefix marking an encrypted value.
pub const SECRET_PREFIX: &str = "DPAPI:";

/// Names of config fields that are encrypted at rest.
pub const SENSITIVE_FIELDS: &[&str] = &["bearer_token", "cookies", "api_key"];

/// Seam for the platform secret-protection primitive.
///
/// Implementations must be deterministic per user+machine so that a value
/// written by one process run decrypts in the next.
pub trait SecretCipher: Send + Sync {
    fn protect(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn unprotect(&self, cipher: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Identity cipher used where no platform keystore is wired in.
///
/// Still valuable: the `DPAPI:` + base64 framing keeps tokens out of casual
/// greps and keeps the on-disk format identical across platforms.
#[derive(Debug, Default)]
pub struct PassthroughCipher;

impl SecretCipher for PassthroughCipher {
    fn protect(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn unprotect(&self, cipher: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(cipher.to_vec())
    }
}

/// Encrypt a credential value for storage.
pub fn seal(cipher: &dyn SecretCipher, value: &str) -> anyhow::Result<String> {
    let protected = cipher.protect(value.as_bytes())?;
    Ok(format!("{SECRET_PREFIX}{}", B64.encode(protected)))
}

/// Decrypt a stored credential value.
///
/// Values without the prefix pass through unchanged.  Returns `None` when
/// the value carries the prefix but cannot be decoded (e.g. written by a
/// different user account) so the caller can fall back to re-login.
pub fn open(cipher: &dyn SecretCipher, value: &str) -> Option<String> {
    let Some(encoded) = value.strip_prefix(SECRET_PREFIX) else {
        return Some(value.to_string());
    };
    let raw = B64.decode(encoded).ok()?;
    let plain = cipher.unprotect(&raw).ok()?;
    String::from_utf8(plain).ok()
}

/// Mask a token for display, keeping the first and last few characters.
pub fn mask_token(token: &str, visible: usize) -> String {
    if token.len() < visible * 2 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..visible], &token[token.len() - visible..])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
