// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration for the legate runtime.
//!
//! A single JSON config file per account lives in the platform data
//! directory (`<data_dir>/legate/config.json`).  Credential fields are
//! stored at rest behind a `DPAPI:` prefix — see [`secrets`] for the
//! cipher seam.

mod loader;
mod schema;
pub mod secrets;

pub use loader::{config_path, data_dir, load_config, save_config};
pub use schema::Config;
pub use secrets::mask_token;

/// Environment variable that overrides the configured API key.
pub const API_KEY_ENV: &str = "LEGATE_API_KEY";
