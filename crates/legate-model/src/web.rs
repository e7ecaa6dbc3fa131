// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Browser-session transport: PoW-guarded streaming completions.
//!
//! One `WebTransport` owns one upstream credential set, one PoW solver
//! instance, and at most one "current" upstream chat session.  All messages
//! within a session are serialized by the caller; the transport itself only
//! guards its interior mutability.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::pow::{pow_header, PowChallenge, PowSolver, WasmPowSolver};
use crate::stream::{SseDecoder, SseEvent};
use crate::{ChatBackend, TransportError};

/// Default upstream origin.
pub const DEFAULT_BASE_URL: &str = "https://chat.deepseek.com";

/// Seconds without a single SSE chunk before the stream is declared stalled.
/// The backend can think for a long time, but it always emits thinking
/// chunks while doing so; 90s of total silence means the connection died.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(90);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);
const THINKING_HEARTBEAT: Duration = Duration::from_secs(10);

/// Result of driving one streamed completion to termination.
struct StreamOutcome {
    text: String,
    message_id: Option<String>,
}

pub struct WebTransport {
    client: reqwest::Client,
    base_url: String,
    cookies: String,
    solver: Arc<dyn PowSolver>,
    chat_session_id: Mutex<Option<String>>,
    last_message_id: Mutex<Option<String>>,
}

impl WebTransport {
    /// Build a transport from credentials and a solver module on disk.
    pub fn new(
        bearer_token: &str,
        cookies: &str,
        wasm_path: &Path,
        base_url: Option<&str>,
    ) -> Result<Self, TransportError> {
        let solver = Arc::new(WasmPowSolver::load(wasm_path)?);
        Ok(Self::with_solver(bearer_token, cookies, solver, base_url))
    }

    /// Build a transport with an explicit solver (tests use a stub).
    pub fn with_solver(
        bearer_token: &str,
        cookies: &str,
        solver: Arc<dyn PowSolver>,
        base_url: Option<&str>,
    ) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(v) = format!("Bearer {bearer_token}").parse() {
            headers.insert(reqwest::header::AUTHORIZATION, v);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            cookies: cookies.to_string(),
            solver,
            chat_session_id: Mutex::new(None),
            last_message_id: Mutex::new(None),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::COOKIE, &self.cookies)
            .header(reqwest::header::ORIGIN, self.base_url.clone())
            .header(reqwest::header::REFERER, format!("{}/", self.base_url))
    }

    /// Obtain a fresh PoW challenge for the completion endpoint.
    pub async fn get_challenge(&self) -> Result<PowChallenge, TransportError> {
        let resp = self
            .post("/api/v0/chat/create_pow_challenge")
            .timeout(CHALLENGE_TIMEOUT)
            .json(&json!({ "target_path": "/api/v0/chat/completion" }))
            .send()
            .await?;
        match resp.status().as_u16() {
            401 => {
                return Err(TransportError::TokenExpired(
                    "bearer token expired while fetching challenge".into(),
                ))
            }
            403 => {
                return Err(TransportError::TokenExpired(
                    "access denied: token invalid or account blocked".into(),
                ))
            }
            _ => {}
        }
        let body: Value = resp.error_for_status()?.json().await?;
        if body.get("code").and_then(|c| c.as_i64()) != Some(0) {
            return Err(TransportError::Protocol(format!(
                "challenge endpoint returned error: {body}"
            )));
        }
        let challenge = body
            .pointer("/data/biz_data/challenge")
            .cloned()
            .ok_or_else(|| TransportError::Protocol("challenge missing from response".into()))?;
        serde_json::from_value(challenge)
            .map_err(|e| TransportError::Protocol(format!("malformed challenge: {e}")))
    }

    /// Solve a challenge off the async runtime (the solver is CPU-bound).
    pub async fn solve_challenge(&self, challenge: &PowChallenge) -> Result<u64, TransportError> {
        let solver = Arc::clone(&self.solver);
        let challenge = challenge.clone();
        tokio::task::spawn_blocking(move || solver.solve(&challenge))
            .await
            .map_err(|e| TransportError::Pow(format!("solver task panicked: {e}")))?
    }

    /// Health probe: obtain and solve a challenge without sending a message.
    pub async fn probe(&self) -> Result<(), TransportError> {
        let challenge = self.get_challenge().await?;
        self.solve_challenge(&challenge).await?;
        Ok(())
    }

    /// Drive one completion request through the SSE decoder.
    ///
    /// Returns the collected content and the captured message id.  Raises
    /// `StallDetected` on a 90s chunk gap or a mid-stream connection error,
    /// dumping the SSE diagnostics to stderr first.
    async fn stream_completion(
        &self,
        message: &str,
        pow: &str,
        chat_session_id: &str,
        thinking_enabled: bool,
        parent_message_id: Option<&str>,
    ) -> Result<StreamOutcome, TransportError> {
        let payload = json!({
            "chat_session_id": chat_session_id,
            "parent_message_id": parent_message_id,
            "prompt": message,
            "ref_file_ids": [],
            "thinking_enabled": thinking_enabled,
            "search_enabled": true,
        });

        let resp = self
            .post("/api/v0/chat/completion")
            .header("x-ds-pow-response", pow)
            .json(&payload)
            .send()
            .await?;

        let mut decoder = SseDecoder::new();
        decoder.diag.http_status = Some(resp.status().as_u16());
        match resp.status().as_u16() {
            401 => {
                return Err(TransportError::TokenExpired(
                    "bearer token expired during send".into(),
                ))
            }
            403 => {
                return Err(TransportError::TokenExpired(
                    "access denied during send".into(),
                ))
            }
            _ => {}
        }
        let resp = resp.error_for_status()?;

        let mut body = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut text = String::new();
        let mut message_id: Option<String> = None;
        let started = Instant::now();
        let mut last_heartbeat = Instant::now();
        let mut finished = false;

        'stream: loop {
            let chunk = match tokio::time::timeout(STALL_TIMEOUT, body.next()).await {
                Err(_) => {
                    decoder.diag.finish_reason = Some("timeout".into());
                    decoder.diag.push_event("TIMEOUT", "90s without data");
                    decoder.diag.dump("STALL (timeout)");
                    return Err(TransportError::StallDetected(format!(
                        "no SSE chunk for {}s, connection silently frozen",
                        STALL_TIMEOUT.as_secs()
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    decoder.diag.finish_reason = Some("connection_error".into());
                    decoder.diag.push_event("CONN_ERROR", &e.to_string());
                    decoder.diag.dump("STALL (connection lost)");
                    return Err(TransportError::StallDetected(format!(
                        "connection lost mid-stream: {e}"
                    )));
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            line_buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                for event in decoder.feed_line(line.trim_end_matches(['\n', '\r'])) {
                    match event {
                        SseEvent::Content(delta) => text.push_str(&delta),
                        SseEvent::MessageId(id) => message_id = Some(id),
                        SseEvent::ThinkingTick => {
                            if last_heartbeat.elapsed() >= THINKING_HEARTBEAT {
                                eprintln!(
                                    "  [thinking] {:.1}s... ({} chunks)",
                                    started.elapsed().as_secs_f64(),
                                    decoder.diag.thinking_chunks
                                );
                                last_heartbeat = Instant::now();
                            }
                        }
                        SseEvent::Finish => {
                            finished = true;
                            break 'stream;
                        }
                        SseEvent::Done => {}
                    }
                }
            }
        }

        if !finished && decoder.diag.finish_reason.is_none() {
            decoder.diag.finish_reason = Some("stream_end".into());
        }
        if text.is_empty() {
            decoder.diag.dump("EMPTY RESPONSE");
        }
        debug!(
            chars = text.len(),
            chunks = decoder.diag.content_chunks,
            reason = ?decoder.diag.finish_reason,
            "stream complete"
        );
        Ok(StreamOutcome { text, message_id })
    }

    /// One full turn: challenge → solve → stream, against the current
    /// upstream session (created lazily).
    async fn chat_once(
        &self,
        message: &str,
        thinking_enabled: bool,
        parent_message_id: Option<&str>,
    ) -> Result<String, TransportError> {
        let challenge = self.get_challenge().await?;
        let answer = self.solve_challenge(&challenge).await?;
        let pow = pow_header(&challenge, answer);

        let session_id = {
            let mut guard = self.chat_session_id.lock().await;
            match guard.as_ref() {
                Some(id) => id.clone(),
                None => {
                    let id = self.create_session().await?;
                    *guard = Some(id.clone());
                    id
                }
            }
        };

        let outcome = self
            .stream_completion(message, &pow, &session_id, thinking_enabled, parent_message_id)
            .await?;
        if outcome.message_id.is_some() {
            *self.last_message_id.lock().await = outcome.message_id;
        }
        Ok(outcome.text)
    }

    /// Discard the current upstream session so the next call creates one.
    async fn reset_session(&self) -> Result<(), TransportError> {
        let fresh = self.create_session().await?;
        *self.chat_session_id.lock().await = Some(fresh);
        *self.last_message_id.lock().await = None;
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for WebTransport {
    async fn create_session(&self) -> Result<String, TransportError> {
        let resp = self
            .post("/api/v0/chat_session/create")
            .json(&json!({}))
            .send()
            .await?;
        if resp.status().as_u16() == 401 {
            return Err(TransportError::TokenExpired(
                "bearer token expired while creating session".into(),
            ));
        }
        let body: Value = resp.error_for_status()?.json().await?;
        if body.get("code").and_then(|c| c.as_i64()) != Some(0) {
            return Err(TransportError::SessionDead(format!(
                "session create rejected: {body}"
            )));
        }
        body.pointer("/data/biz_data/id")
            .and_then(|id| id.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| TransportError::Protocol("session id missing from response".into()))
    }

    async fn use_session(&self, session_id: &str) {
        let mut guard = self.chat_session_id.lock().await;
        if guard.as_deref() != Some(session_id) {
            *guard = Some(session_id.to_string());
            *self.last_message_id.lock().await = None;
        }
    }

    /// High-level turn with auto-recovery.
    ///
    /// Retries stalls and empty responses up to `max_stall_retries` times,
    /// each retry on a freshly created upstream session.  A dead session is
    /// recreated and retried once.  `TokenExpired` always propagates.
    async fn chat(
        &self,
        message: &str,
        thinking_enabled: bool,
        parent_message_id: Option<String>,
        max_stall_retries: u32,
    ) -> Result<String, TransportError> {
        let mut attempts = 0u32;
        let mut parent = parent_message_id;
        let mut session_retried = false;

        loop {
            match self.chat_once(message, thinking_enabled, parent.as_deref()).await {
                Ok(text) if text.trim().is_empty() => {
                    attempts += 1;
                    if attempts > max_stall_retries {
                        return Err(TransportError::StallDetected(format!(
                            "empty response after {max_stall_retries} retries"
                        )));
                    }
                    warn!(attempt = attempts, max = max_stall_retries, "empty response, retrying with fresh session");
                    self.reset_session().await?;
                    parent = None;
                }
                Ok(text) => return Ok(text),
                Err(TransportError::StallDetected(reason)) => {
                    attempts += 1;
                    if attempts > max_stall_retries {
                        return Err(TransportError::StallDetected(reason));
                    }
                    warn!(attempt = attempts, max = max_stall_retries, %reason, "stall detected, retrying with fresh session");
                    self.reset_session().await?;
                    parent = None;
                }
                Err(TransportError::SessionDead(reason)) => {
                    if session_retried {
                        return Err(TransportError::SessionDead(reason));
                    }
                    session_retried = true;
                    info!(%reason, "upstream session dead, recreating");
                    self.reset_session().await?;
                    parent = None;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn last_message_id(&self) -> Option<String> {
        self.last_message_id.lock().await.clone()
    }
}
