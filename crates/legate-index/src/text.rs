// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Normalization, slugs and token estimation.

/// Lowercase the text and fold Spanish accented characters to ASCII.
///
/// Keyword matching and the task classifier both operate on this normal
/// form so that `"autenticación"` matches `"autenticacion"`.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' => 'u',
            'ñ' => 'n',
            'ü' => 'u',
            _ => c,
        })
        .collect()
}

/// Estimate token count at ~3.5 chars/token, rounding up.
///
/// Used by the session ledger (system prompt and injection cost tracking).
pub fn estimate_tokens_chat(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() as f64 / 3.5).ceil() as usize
}

/// Estimate token count at 4 chars/token, rounding down.
///
/// Used for skill and briefing budget arithmetic.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Convert free text to a URL-safe slug for session naming.
///
/// Truncation happens at a word boundary so slugs stay readable.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_hyphen = true;
    for c in normalize(text).chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > max_len {
        slug.truncate(max_len);
        if let Some(pos) = slug.rfind('-') {
            slug.truncate(pos);
        }
    }
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Largest prefix of `s` that fits in `max_bytes` without splitting a
/// character.  Budgets are byte-based; injected text is frequently
/// Spanish, so a blind byte slice could land inside an accent.
pub fn clip(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Split normalized text into word tokens of at least 3 characters.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in normalize(text).chars() {
        if c.is_ascii_alphanumeric() {
            current.push(c);
        } else if !current.is_empty() {
            if current.len() >= 3 {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 3 {
        tokens.push(current);
    }
    tokens
}

// Filler words (Spanish and English) plus generic task verbs that carry no
// signal about what the task is actually about.
const STOP_WORDS: &[&str] = &[
    "el", "la", "los", "las", "un", "una", "de", "del", "que", "en", "con", "para", "por", "todo",
    "todos", "cada", "como", "the", "of", "to", "and", "or", "for", "in", "implementar",
    "implement", "crear", "create", "hacer", "make", "codigo", "code", "funcion", "function",
    "sea", "debe",
];

/// Extract up to 8 significant keywords from a task description.
pub fn extract_keywords(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .take(8)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── normalize ─────────────────────────────────────────────────────────────

    #[test]
    fn normalize_folds_accents_and_case() {
        assert_eq!(normalize("Autenticación JWT"), "autenticacion jwt");
        assert_eq!(normalize("NIÑO"), "nino");
    }

    #[test]
    fn normalize_leaves_ascii_untouched() {
        assert_eq!(normalize("plain text"), "plain text");
    }

    // ── token estimation ──────────────────────────────────────────────────────

    #[test]
    fn estimate_tokens_chat_rounds_up() {
        // 7 chars / 3.5 = 2.0 exactly; 8 chars → 2.28… → 3
        assert_eq!(estimate_tokens_chat("1234567"), 2);
        assert_eq!(estimate_tokens_chat("12345678"), 3);
    }

    #[test]
    fn estimate_tokens_chat_empty_is_zero() {
        assert_eq!(estimate_tokens_chat(""), 0);
    }

    #[test]
    fn estimate_tokens_divides_by_four() {
        assert_eq!(estimate_tokens("12345678"), 2);
        assert_eq!(estimate_tokens("123"), 0);
    }

    // ── slugify ───────────────────────────────────────────────────────────────

    #[test]
    fn slugify_basic() {
        assert_eq!(
            slugify("create login endpoint with JWT", 40),
            "create-login-endpoint-with-jwt"
        );
    }

    #[test]
    fn slugify_strips_punctuation_runs() {
        assert_eq!(
            slugify("implement UI for auth module!!! YES", 40),
            "implement-ui-for-auth-module-yes"
        );
    }

    #[test]
    fn slugify_truncates_at_word_boundary() {
        let slug = slugify("one two three four five six seven", 12);
        assert!(slug.len() <= 12);
        assert!(!slug.ends_with('-'));
        assert_eq!(slug, "one-two");
    }

    #[test]
    fn slugify_empty_falls_back() {
        assert_eq!(slugify("!!!", 30), "unnamed");
    }

    // ── tokenize / keywords ───────────────────────────────────────────────────

    #[test]
    fn tokenize_drops_short_tokens() {
        assert_eq!(tokenize("a la red de datos"), vec!["red", "datos"]);
    }

    #[test]
    fn extract_keywords_filters_stop_words() {
        let kws = extract_keywords("implementar el sistema de autenticacion JWT");
        assert!(kws.contains(&"sistema".to_string()));
        assert!(kws.contains(&"autenticacion".to_string()));
        assert!(kws.contains(&"jwt".to_string()));
        assert!(!kws.contains(&"implementar".to_string()));
    }

    #[test]
    fn extract_keywords_caps_at_eight() {
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliet";
        assert_eq!(extract_keywords(text).len(), 8);
    }

    // ── clip ──────────────────────────────────────────────────────────────────

    #[test]
    fn clip_short_strings_pass_through() {
        assert_eq!(clip("hola", 10), "hola");
    }

    #[test]
    fn clip_respects_char_boundaries() {
        // "ñ" is two bytes; clipping inside it must back off.
        let s = "añ";
        assert_eq!(clip(s, 2), "a");
        assert_eq!(clip(s, 3), "añ");
    }

    #[test]
    fn clip_exact_boundary() {
        assert_eq!(clip("abcdef", 3), "abc");
    }
}
