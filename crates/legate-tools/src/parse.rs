// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Textually framed tool calling for the web transport.
//!
//! The browser backend has no native tool-call API, so Phase 1 teaches it
//! to emit one fenced block labelled `tool_call` containing a JSON object
//! or array.  This module builds that instruction block, parses the
//! responses, and formats results for re-injection.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::registry::ToolDescriptor;

/// Results longer than this are truncated before re-injection
/// (~30K tokens — a sliver of the upstream context window).
pub const MAX_RESULT_CHARS: usize = 120_000;

/// One parsed call from a `tool_call` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub tool: String,
    pub args: Value,
}

impl ParsedCall {
    /// Canonical identity: JSON of `{tool, args}` with sorted keys.
    /// Deduplication across a whole response keys on this.
    pub fn canonical(&self) -> String {
        fn sort_value(v: &Value) -> Value {
            match v {
                Value::Object(map) => {
                    let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                    sorted.sort_by_key(|(k, _)| k.as_str());
                    Value::Object(
                        sorted
                            .into_iter()
                            .map(|(k, v)| (k.clone(), sort_value(v)))
                            .collect(),
                    )
                }
                Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
                other => other.clone(),
            }
        }
        let obj = serde_json::json!({ "args": sort_value(&self.args), "tool": self.tool });
        obj.to_string()
    }
}

fn block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```tool_call\s*\n(.*?)\n```").unwrap())
}

fn try_parse_call(item: &Value) -> Option<ParsedCall> {
    let obj = item.as_object()?;
    let tool = obj.get("tool")?.as_str()?.to_string();
    let args = obj
        .get("args")
        .or_else(|| obj.get("arguments"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Some(ParsedCall { tool, args })
}

/// Extract and deduplicate tool calls from a response.
///
/// Returns the unique calls in first-appearance order plus the response
/// text with every `tool_call` block removed.  Blocks that fail to parse
/// are dropped (after one salvage attempt on an embedded `{...}`); the
/// rest of the response is still processed.  When duplicates were dropped
/// a `[dedup]` line goes to stderr.
pub fn extract_tool_calls(response: &str) -> (Vec<ParsedCall>, String) {
    let mut raw_calls: Vec<ParsedCall> = Vec::new();

    for cap in block_re().captures_iter(response) {
        let body = cap[1].trim();
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(items)) => {
                raw_calls.extend(items.iter().filter_map(try_parse_call));
            }
            Ok(single) => {
                raw_calls.extend(try_parse_call(&single));
            }
            Err(_) => {
                // The model sometimes wraps the JSON in prose; salvage the
                // outermost object if one is present.
                if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
                    if start < end {
                        if let Ok(v) = serde_json::from_str::<Value>(&body[start..=end]) {
                            raw_calls.extend(try_parse_call(&v));
                        }
                    }
                }
            }
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut calls: Vec<ParsedCall> = Vec::new();
    for call in &raw_calls {
        if seen.insert(call.canonical()) {
            calls.push(call.clone());
        }
    }
    if raw_calls.len() > calls.len() {
        eprintln!("  [dedup] {} tool_calls -> {} unicos", raw_calls.len(), calls.len());
    }

    let clean = block_re().replace_all(response, "").trim().to_string();
    (calls, clean)
}

/// Build the tool-catalogue block injected once per session in Phase 1.
pub fn tools_prompt(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut lines: Vec<String> = vec![
        "\n\n--- HERRAMIENTAS DISPONIBLES ---".into(),
        "REGLA CRITICA: DEBES usar herramientas para CUALQUIER accion sobre el sistema.".into(),
        "NUNCA describas lo que podrias hacer — HAZLO con herramientas.".into(),
        String::new(),
        "FORMATO: Para invocar herramientas, usa UN bloque tool_call con un array JSON:".into(),
        "```tool_call".into(),
        r#"[{"tool": "nombre", "args": {"param": "valor"}}]"#.into(),
        "```".into(),
        String::new(),
        "REGLAS:".into(),
        "1. Usa UN solo bloque ```tool_call``` por respuesta con TODAS las herramientas dentro.".into(),
        "2. Despues de recibir el resultado, RESUME la informacion en texto natural.".into(),
        "   NUNCA copies el JSON crudo en tu respuesta.".into(),
        "3. SOLO responde sin tool_call si es una pregunta puramente conversacional.".into(),
        "4. Puedes usar hasta 8 herramientas por bloque. Puedes repetir la misma.".into(),
        "5. Para write_file con archivos grandes, escribe TODO el contenido en UNA sola llamada.".into(),
        String::new(),
    ];

    for t in tools {
        lines.push(format!("**{}**: {}", t.name, t.description));
        if let Some(props) = t.parameters.get("properties").and_then(|p| p.as_object()) {
            let required: Vec<&str> = t
                .parameters
                .get("required")
                .and_then(|r| r.as_array())
                .map(|items| items.iter().filter_map(|i| i.as_str()).collect())
                .unwrap_or_default();
            if !props.is_empty() {
                lines.push("  Parametros:".into());
                for (pname, pinfo) in props {
                    let ptype = pinfo.get("type").and_then(|t| t.as_str()).unwrap_or("string");
                    let pdesc = pinfo
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("");
                    let req = if required.contains(&pname.as_str()) {
                        " (REQUERIDO)"
                    } else {
                        ""
                    };
                    lines.push(format!("    - {pname} ({ptype}){req}: {pdesc}"));
                }
            }
        }
        lines.push(String::new());
    }

    lines.push("--- FIN HERRAMIENTAS ---\n".into());
    lines.join("\n")
}

/// Format one tool result for injection back into the session.
pub fn format_tool_result(tool_name: &str, result: &str) -> String {
    let clipped = legate_index::clip(result, MAX_RESULT_CHARS);
    let mut result_text = clipped.to_string();
    if clipped.len() < result.len() {
        result_text
            .push_str("\n... [resultado truncado, usa read_file con max_lines para ver mas]");
    }
    format!("Resultado de `{tool_name}`:\n```\n{result_text}\n```")
}

/// Clean a final (non-tool) response of accidental tool-output echoes.
///
/// The backend sometimes copies tool results into its closing answer in
/// several formats; each is detected and stripped.
pub fn clean_final_response(response: &str) -> String {
    static RES: OnceLock<[Regex; 5]> = OnceLock::new();
    let res = RES.get_or_init(|| {
        [
            // Whole "Resultado de `tool`:" sections up to a blank line.
            Regex::new(r"(?s)Resultado de `\w+`:.*?(\n\n|\z)").unwrap(),
            // "Resultado de herramienta:" prose sections.
            Regex::new(r"(?s)Resultado de herramienta:.*?(\n\n|\z)").unwrap(),
            // Self-citation prefixes.
            Regex::new(r"(?m)^Asistente:\s*").unwrap(),
            // Internal step headers.
            Regex::new(r"(?m)^Paso \d+:.*$").unwrap(),
            // Three or more blank lines.
            Regex::new(r"\n{3,}").unwrap(),
        ]
    });

    let mut cleaned = response.to_string();

    // Long embedded fences (>300 chars of body) are echoed tool output.
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?s)```[a-z]*\s*\n(.*?)\n```").unwrap());
    cleaned = fence
        .replace_all(&cleaned, |caps: &regex::Captures| {
            if caps[1].len() > 300 {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .to_string();

    cleaned = res[0].replace_all(&cleaned, "").to_string();
    cleaned = res[1].replace_all(&cleaned, "").to_string();
    cleaned = res[2].replace_all(&cleaned, "").to_string();
    cleaned = res[3].replace_all(&cleaned, "").to_string();
    cleaned = res[4].replace_all(&cleaned, "\n\n").to_string();
    cleaned.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
