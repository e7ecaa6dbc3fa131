// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Config file location, load and save.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use tracing::warn;

use crate::secrets::{open, seal, PassthroughCipher, SecretCipher, SENSITIVE_FIELDS};
use crate::Config;

/// Per-user data directory for all persisted legate state.
///
/// `<platform data dir>/legate`, e.g. `~/.local/share/legate` on Linux or
/// `%APPDATA%\legate` on Windows.  Falls back to `.legate` in the home
/// directory when the platform dir cannot be resolved.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("legate")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Load the config, decrypting credential fields.
///
/// A missing or corrupt file yields the default config — startup never
/// fails on state files.
pub fn load_config(path: &Path) -> Config {
    load_config_with(path, &PassthroughCipher)
}

pub fn load_config_with(path: &Path, cipher: &dyn SecretCipher) -> Config {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return Config::default(),
    };
    let mut value: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt config file, starting with defaults");
            return Config::default();
        }
    };
    if let Some(map) = value.as_object_mut() {
        for field in SENSITIVE_FIELDS {
            if let Some(Value::String(s)) = map.get(*field) {
                match open(cipher, s) {
                    Some(plain) => {
                        map.insert((*field).to_string(), Value::String(plain));
                    }
                    None => {
                        warn!(field, "could not decrypt credential, dropping it");
                        map.insert((*field).to_string(), Value::Null);
                    }
                }
            }
        }
    }
    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "config did not match schema, starting with defaults");
        Config::default()
    })
}

/// Save the config, encrypting credential fields.
pub fn save_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    save_config_with(config, path, &PassthroughCipher)
}

pub fn save_config_with(
    config: &Config,
    path: &Path,
    cipher: &dyn SecretCipher,
) -> anyhow::Result<()> {
    let mut value = serde_json::to_value(config).context("serialize config")?;
    if let Some(map) = value.as_object_mut() {
        for field in SENSITIVE_FIELDS {
            if let Some(Value::String(s)) = map.get(*field) {
                let sealed = seal(cipher, s)?;
                map.insert((*field).to_string(), Value::String(sealed));
            }
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config dir {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(&value).context("render config")?;
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
