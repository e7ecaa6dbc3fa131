// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Decoder for the newline-delimited event stream of the web backend.
//!
//! The decoder is a pure state machine over complete lines: the transport
//! feeds it `event:` / `data:` lines and receives typed [`SseEvent`]s plus
//! a running [`SseDiag`] capture.  Keeping it I/O-free makes the protocol
//! testable against literal stream transcripts.
//!
//! Stream grammar (observed from the browser client):
//! - `event: finish` terminates the response.
//! - `data: [DONE]` marks completion but the stream keeps draining.
//! - `data: {json}` chunks carry `p` (path) and `v` (value).  Content lives
//!   under `p = "response/content"`; thinking under
//!   `p = "response/thinking_content"`; chunks with an empty path belong to
//!   whatever mode the stream is currently in.
//! - The assistant message id arrives either as a top-level
//!   `response_message_id` or nested as `v.response.message_id`.

use serde_json::Value;

/// Maximum events retained in the diagnostic ring.
const DIAG_RING_CAP: usize = 30;

/// Decoder output for one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Assistant message id for parent chaining.
    MessageId(String),
    /// A content text delta.
    Content(String),
    /// A thinking chunk arrived (no text surfaced).
    ThinkingTick,
    /// `event: finish` — stop reading.
    Finish,
    /// `data: [DONE]` — completion marked, keep draining.
    Done,
}

/// Stream mode: `Init → Thinking ⇄ Content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Init,
    Thinking,
    Content,
}

impl StreamMode {
    fn label(&self) -> &'static str {
        match self {
            StreamMode::Init => "init",
            StreamMode::Thinking => "thinking",
            StreamMode::Content => "content",
        }
    }
}

/// Diagnostic capture of one streaming exchange, dumped to stderr when the
/// stream stalls or ends empty.
#[derive(Debug, Default, Clone)]
pub struct SseDiag {
    pub http_status: Option<u16>,
    pub total_lines: u64,
    pub total_data_chunks: u64,
    pub thinking_chunks: u64,
    pub content_chunks: u64,
    pub content_chars: u64,
    pub parse_errors: u64,
    pub mode_transitions: Vec<String>,
    pub finish_reason: Option<String>,
    /// Last [`DIAG_RING_CAP`] events, oldest first.
    pub events: Vec<String>,
}

impl SseDiag {
    pub fn push_event(&mut self, kind: &str, detail: &str) {
        let line = format!("{kind}: {detail}");
        self.events.push(legate_index::clip(&line, 200).to_string());
        if self.events.len() > DIAG_RING_CAP {
            self.events.remove(0);
        }
    }

    /// Dump the capture to stderr, framed like a console trace.
    pub fn dump(&self, label: &str) {
        eprintln!("  ╔══ SSE DIAG [{label}] ══════════════════════");
        eprintln!(
            "  ║ HTTP: {:?} | Lines: {} | Data chunks: {}",
            self.http_status, self.total_lines, self.total_data_chunks
        );
        eprintln!(
            "  ║ Thinking: {} | Content: {} ({} chars) | Parse errors: {}",
            self.thinking_chunks, self.content_chunks, self.content_chars, self.parse_errors
        );
        eprintln!("  ║ Finish: {:?}", self.finish_reason);
        if !self.mode_transitions.is_empty() {
            eprintln!("  ║ Transitions: {}", self.mode_transitions.join(" → "));
        }
        for ev in self.events.iter().rev().take(10).rev() {
            eprintln!("  ║   {ev}");
        }
        eprintln!("  ╚═══════════════════════════════════════════");
    }
}

/// Line-by-line decoder for one streamed response.
#[derive(Debug)]
pub struct SseDecoder {
    mode: StreamMode,
    pub diag: SseDiag,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            mode: StreamMode::Init,
            diag: SseDiag::default(),
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    fn transition(&mut self, to: StreamMode) {
        if self.mode != to {
            let label = format!("{}→{}", self.mode.label(), to.label());
            self.diag.push_event("mode", &label);
            self.diag.mode_transitions.push(label);
            self.mode = to;
        }
    }

    /// Decode one complete line.  Empty lines yield nothing.
    pub fn feed_line(&mut self, line: &str) -> Vec<SseEvent> {
        if line.is_empty() {
            return Vec::new();
        }
        self.diag.total_lines += 1;

        if let Some(event) = line.strip_prefix("event: ") {
            let event = event.trim();
            self.diag.push_event("event", event);
            if event == "finish" {
                self.diag.finish_reason = Some("event:finish".into());
                return vec![SseEvent::Finish];
            }
            return Vec::new();
        }

        let Some(raw) = line.strip_prefix("data: ") else {
            return Vec::new();
        };
        if raw == "[DONE]" {
            self.diag.push_event("data", "[DONE]");
            self.diag.finish_reason = Some("done".into());
            return vec![SseEvent::Done];
        }
        if raw == "{}" {
            return Vec::new();
        }

        let chunk: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.diag.parse_errors += 1;
                let detail = format!("{e} — raw: {raw}");
                self.diag
                    .push_event("parse_error", legate_index::clip(&detail, 150));
                return Vec::new();
            }
        };
        self.diag.total_data_chunks += 1;

        let mut out = Vec::new();

        if let Some(id) = chunk.get("response_message_id") {
            let id = value_to_id(id);
            self.diag.push_event("metadata", &format!("response_msg_id={id}"));
            out.push(SseEvent::MessageId(id));
        }

        let Some(val) = chunk.get("v") else {
            return out;
        };

        // Initial response object carries the message id nested.
        if let Some(resp) = val.get("response") {
            if let Some(id) = resp.get("message_id") {
                let id = value_to_id(id);
                self.diag.push_event("response_obj", &format!("msg_id={id}"));
                out.push(SseEvent::MessageId(id));
            }
            return out;
        }

        let path = chunk.get("p").and_then(|p| p.as_str()).unwrap_or("");
        match path {
            "response/thinking_content" => {
                self.transition(StreamMode::Thinking);
                self.diag.thinking_chunks += 1;
                out.push(SseEvent::ThinkingTick);
            }
            "response/content" => {
                self.transition(StreamMode::Content);
                if let Some(text) = val.as_str() {
                    self.diag.content_chunks += 1;
                    self.diag.content_chars += text.len() as u64;
                    out.push(SseEvent::Content(text.to_string()));
                }
            }
            "" => match self.mode {
                StreamMode::Thinking => {
                    self.diag.thinking_chunks += 1;
                    out.push(SseEvent::ThinkingTick);
                }
                StreamMode::Content => {
                    if let Some(text) = val.as_str() {
                        self.diag.content_chunks += 1;
                        self.diag.content_chars += text.len() as u64;
                        out.push(SseEvent::Content(text.to_string()));
                    } else if let Some(text) = val.get("content").and_then(|c| c.as_str()) {
                        if !text.is_empty() {
                            self.diag.content_chunks += 1;
                            self.diag.content_chars += text.len() as u64;
                            out.push(SseEvent::Content(text.to_string()));
                        }
                    }
                }
                StreamMode::Init => {}
            },
            other => {
                self.diag.push_event("unknown_path", &format!("p={other}"));
            }
        }
        out
    }
}

/// Message ids arrive both as strings and as integers on the wire.
fn value_to_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(lines: &[&str]) -> (Vec<SseEvent>, SseDecoder) {
        let mut dec = SseDecoder::new();
        let mut events = Vec::new();
        for line in lines {
            events.extend(dec.feed_line(line));
        }
        (events, dec)
    }

    fn content_text(events: &[SseEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                SseEvent::Content(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    // ── Basic decoding ────────────────────────────────────────────────────────

    #[test]
    fn decodes_simple_content_stream() {
        let (events, dec) = decode_all(&[
            r#"data: {"response_message_id": 7}"#,
            r#"data: {"p": "response/content", "v": "Hello "}"#,
            r#"data: {"p": "response/content", "v": "world"}"#,
            "event: finish",
        ]);
        assert_eq!(content_text(&events), "Hello world");
        assert!(events.contains(&SseEvent::MessageId("7".into())));
        assert!(events.contains(&SseEvent::Finish));
        assert_eq!(dec.diag.finish_reason.as_deref(), Some("event:finish"));
    }

    #[test]
    fn thinking_then_content_transitions() {
        let (events, dec) = decode_all(&[
            r#"data: {"p": "response/thinking_content", "v": "hmm"}"#,
            r#"data: {"p": "response/thinking_content", "v": "hmm more"}"#,
            r#"data: {"p": "response/content", "v": "answer"}"#,
        ]);
        assert_eq!(content_text(&events), "answer");
        assert_eq!(dec.diag.thinking_chunks, 2);
        assert_eq!(
            dec.diag.mode_transitions,
            vec!["init→thinking".to_string(), "thinking→content".to_string()]
        );
    }

    #[test]
    fn empty_path_is_content_delta_in_content_mode() {
        let (events, _) = decode_all(&[
            r#"data: {"p": "response/content", "v": "a"}"#,
            r#"data: {"v": "b"}"#,
            r#"data: {"v": "c"}"#,
        ]);
        assert_eq!(content_text(&events), "abc");
    }

    #[test]
    fn empty_path_in_thinking_mode_is_a_tick() {
        let (events, dec) = decode_all(&[
            r#"data: {"p": "response/thinking_content", "v": "x"}"#,
            r#"data: {"v": "y"}"#,
        ]);
        assert_eq!(content_text(&events), "");
        assert_eq!(dec.diag.thinking_chunks, 2);
        assert_eq!(
            events.iter().filter(|e| **e == SseEvent::ThinkingTick).count(),
            2
        );
    }

    #[test]
    fn empty_path_in_init_mode_is_ignored() {
        let (events, _) = decode_all(&[r#"data: {"v": "stray"}"#]);
        assert!(events.is_empty());
    }

    // ── Message ids ───────────────────────────────────────────────────────────

    #[test]
    fn nested_response_object_carries_message_id() {
        let (events, _) =
            decode_all(&[r#"data: {"v": {"response": {"message_id": "m-42"}}}"#]);
        assert_eq!(events, vec![SseEvent::MessageId("m-42".into())]);
    }

    #[test]
    fn string_and_integer_ids_both_decode() {
        let (events, _) = decode_all(&[
            r#"data: {"response_message_id": "abc"}"#,
            r#"data: {"response_message_id": 99}"#,
        ]);
        assert_eq!(
            events,
            vec![
                SseEvent::MessageId("abc".into()),
                SseEvent::MessageId("99".into())
            ]
        );
    }

    // ── Termination markers ───────────────────────────────────────────────────

    #[test]
    fn done_marker_sets_reason_but_does_not_finish() {
        let (events, dec) = decode_all(&[
            "data: [DONE]",
            r#"data: {"p": "response/content", "v": "tail"}"#,
        ]);
        assert!(events.contains(&SseEvent::Done));
        // Stream keeps draining after [DONE].
        assert_eq!(content_text(&events), "tail");
        assert_eq!(dec.diag.finish_reason.as_deref(), Some("done"));
    }

    // ── Robustness ────────────────────────────────────────────────────────────

    #[test]
    fn malformed_json_is_counted_not_fatal() {
        let (events, dec) = decode_all(&[
            "data: {broken",
            r#"data: {"p": "response/content", "v": "ok"}"#,
        ]);
        assert_eq!(content_text(&events), "ok");
        assert_eq!(dec.diag.parse_errors, 1);
    }

    #[test]
    fn diag_ring_is_bounded() {
        let mut dec = SseDecoder::new();
        for i in 0..100 {
            dec.feed_line(&format!("event: ev{i}"));
        }
        assert!(dec.diag.events.len() <= 30);
        // Oldest events were evicted.
        assert!(dec.diag.events[0].contains("ev70"));
    }

    #[test]
    fn empty_object_chunks_are_skipped() {
        let (events, dec) = decode_all(&["data: {}"]);
        assert!(events.is_empty());
        assert_eq!(dec.diag.total_data_chunks, 0);
    }

    #[test]
    fn unknown_paths_are_logged_not_yielded() {
        let (events, dec) = decode_all(&[r#"data: {"p": "response/search", "v": "x"}"#]);
        assert!(events.is_empty());
        assert!(dec.diag.events.iter().any(|e| e.contains("unknown_path")));
    }
}
