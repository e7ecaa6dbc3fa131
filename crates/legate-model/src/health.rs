// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session-health manager: validity cache, refresh-on-failure, hot reload.
//!
//! Sits between the runners and the web transport.  Before each upstream
//! operation, callers ask `ensure_valid()`; the answer is cached for five
//! minutes so a burst of exchanges pays for one probe.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use legate_config::{load_config, Config};

/// How long a positive health check stays fresh.
pub const HEALTH_CACHE: Duration = Duration::from_secs(300);
/// Consecutive failures before requiring a manual re-login.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Exponential backoff base / ceiling between refresh attempts.
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Which credential set the runtime is operating with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    Web,
    Api,
    None,
}

/// Detect the operating mode from the config: web wins when both bearer
/// token and cookies are present; an API key (config or env) means api.
pub fn detect_mode(config: &Config) -> CredentialMode {
    if config.has_web_credentials() {
        CredentialMode::Web
    } else if config.effective_api_key().is_some() {
        CredentialMode::Api
    } else {
        CredentialMode::None
    }
}

/// A cheap upstream validity probe.  The web transport implements this by
/// obtaining and solving a PoW challenge without sending a message.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub mode: CredentialMode,
    pub valid: Option<bool>,
    pub last_check_seconds_ago: Option<u64>,
    pub consecutive_failures: u32,
    pub has_bearer: bool,
    pub has_cookies: bool,
    pub has_api_key: bool,
}

struct HealthState {
    valid: Option<bool>,
    last_check: Option<Instant>,
    consecutive_failures: u32,
}

pub struct SessionHealth {
    config: Mutex<Config>,
    config_path: std::path::PathBuf,
    mode: Mutex<CredentialMode>,
    state: Mutex<HealthState>,
}

impl SessionHealth {
    pub fn new(config: Config, config_path: &Path) -> Self {
        let mode = detect_mode(&config);
        Self {
            config: Mutex::new(config),
            config_path: config_path.to_path_buf(),
            mode: Mutex::new(mode),
            state: Mutex::new(HealthState {
                valid: None,
                last_check: None,
                consecutive_failures: 0,
            }),
        }
    }

    pub async fn mode(&self) -> CredentialMode {
        *self.mode.lock().await
    }

    /// Verify the session before an upstream operation.
    ///
    /// API mode is assumed valid (keys rarely expire and there is no cheap
    /// probe).  Web mode consults the cache, then probes; failures trigger
    /// bounded backoff with a silent credential refresh from the secret
    /// store; after [`MAX_CONSECUTIVE_FAILURES`] the caller must re-login.
    pub async fn ensure_valid(&self, probe: &dyn HealthProbe) -> bool {
        if *self.mode.lock().await != CredentialMode::Web {
            return true;
        }

        {
            let state = self.state.lock().await;
            if state.valid == Some(true) {
                if let Some(at) = state.last_check {
                    if at.elapsed() < HEALTH_CACHE {
                        return true;
                    }
                }
            }
        }

        if probe.probe().await {
            let mut state = self.state.lock().await;
            state.valid = Some(true);
            state.last_check = Some(Instant::now());
            state.consecutive_failures = 0;
            return true;
        }

        let failures = {
            let mut state = self.state.lock().await;
            state.valid = Some(false);
            state.consecutive_failures += 1;
            state.consecutive_failures
        };

        if failures < MAX_CONSECUTIVE_FAILURES {
            let backoff =
                Duration::from_secs(BACKOFF_BASE_SECS.saturating_pow(failures)).min(BACKOFF_CAP);
            tokio::time::sleep(backoff).await;

            if self.refresh().await && probe.probe().await {
                let mut state = self.state.lock().await;
                state.valid = Some(true);
                state.last_check = Some(Instant::now());
                state.consecutive_failures = 0;
                return true;
            }
        }

        warn!("session expired, re-login required");
        false
    }

    /// Silent refresh: re-read credentials from the secret store.  Only
    /// helps when the on-disk credentials are newer than the in-memory ones.
    async fn refresh(&self) -> bool {
        let fresh = load_config(&self.config_path);
        if !fresh.has_web_credentials() {
            return false;
        }
        let mut config = self.config.lock().await;
        config.bearer_token = fresh.bearer_token;
        config.cookies = fresh.cookies;
        info!("credentials re-read from secret store");
        true
    }

    /// Replace credentials without a restart and force a fresh check on the
    /// next operation.
    pub async fn hot_reload(&self, new_config: Config) {
        let mode = detect_mode(&new_config);
        *self.config.lock().await = new_config;
        *self.mode.lock().await = mode;
        let mut state = self.state.lock().await;
        state.valid = None;
        state.last_check = None;
        state.consecutive_failures = 0;
    }

    pub async fn status(&self) -> HealthStatus {
        let config = self.config.lock().await;
        let state = self.state.lock().await;
        HealthStatus {
            mode: *self.mode.lock().await,
            valid: state.valid,
            last_check_seconds_ago: state.last_check.map(|t| t.elapsed().as_secs()),
            consecutive_failures: state.consecutive_failures,
            has_bearer: config.bearer_token.is_some(),
            has_cookies: config.cookies.is_some(),
            has_api_key: config.effective_api_key().is_some(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProbe {
        calls: AtomicU32,
        ok_after: u32,
    }

    impl ScriptedProbe {
        fn always_ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                ok_after: 0,
            }
        }
        fn never_ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                ok_after: u32::MAX,
            }
        }
        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            n >= self.ok_after
        }
    }

    fn web_config() -> Config {
        Config {
            bearer_token: Some("tok".into()),
            cookies: Some("c=1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn mode_detection_priorities() {
        assert_eq!(detect_mode(&web_config()), CredentialMode::Web);
        let api = Config {
            api_key: Some("key".into()),
            ..Default::default()
        };
        assert_eq!(detect_mode(&api), CredentialMode::Api);
        assert_eq!(detect_mode(&Config::default()), CredentialMode::None);
    }

    #[tokio::test]
    async fn api_mode_is_always_valid_without_probing() {
        let config = Config {
            api_key: Some("key".into()),
            ..Default::default()
        };
        let health = SessionHealth::new(config, Path::new("/tmp/none.json"));
        let probe = ScriptedProbe::never_ok();
        assert!(health.ensure_valid(&probe).await);
        assert_eq!(probe.call_count(), 0);
    }

    #[tokio::test]
    async fn positive_result_is_cached() {
        let health = SessionHealth::new(web_config(), Path::new("/tmp/none.json"));
        let probe = ScriptedProbe::always_ok();
        assert!(health.ensure_valid(&probe).await);
        assert!(health.ensure_valid(&probe).await);
        // Second call served from cache.
        assert_eq!(probe.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_accumulate_and_surface_relogin() {
        let health = SessionHealth::new(web_config(), Path::new("/nonexistent/cfg.json"));
        let probe = ScriptedProbe::never_ok();
        assert!(!health.ensure_valid(&probe).await);
        let status = health.status().await;
        assert_eq!(status.valid, Some(false));
        assert!(status.consecutive_failures >= 1);
    }

    #[tokio::test]
    async fn hot_reload_resets_cache_and_mode() {
        let health = SessionHealth::new(web_config(), Path::new("/tmp/none.json"));
        let probe = ScriptedProbe::always_ok();
        assert!(health.ensure_valid(&probe).await);

        let api_only = Config {
            api_key: Some("key".into()),
            ..Default::default()
        };
        health.hot_reload(api_only).await;
        assert_eq!(health.mode().await, CredentialMode::Api);
        let status = health.status().await;
        assert_eq!(status.valid, None);
        assert_eq!(status.consecutive_failures, 0);
    }
}
