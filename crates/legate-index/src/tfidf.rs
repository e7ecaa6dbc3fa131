// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Minimal TF-IDF vectorizer with cosine similarity and a Jaccard fallback.
//!
//! The corpora here are tiny (dozens of skills, at most a few dozen memory
//! entries), so a sparse `HashMap<String, f64>` representation is plenty.
//! When IDF zeroes every dimension (a term present in every document of a
//! 2-document corpus), callers fall back to [`jaccard`] token overlap.

use std::collections::HashMap;

use crate::text::tokenize;

/// Sparse TF-IDF index over a fixed corpus.
#[derive(Debug, Default)]
pub struct TfIdf {
    /// Inverse document frequency per term.
    idf: HashMap<String, f64>,
    doc_count: usize,
}

impl TfIdf {
    /// Fit the index over a corpus of documents.
    pub fn fit<S: AsRef<str>>(docs: &[S]) -> Self {
        let doc_count = docs.len();
        let mut df: HashMap<String, usize> = HashMap::new();
        for doc in docs {
            let mut seen: Vec<String> = tokenize(doc.as_ref());
            seen.sort();
            seen.dedup();
            for term in seen {
                *df.entry(term).or_insert(0) += 1;
            }
        }
        let idf = df
            .into_iter()
            .map(|(term, count)| {
                let idf = ((doc_count as f64) / (count as f64)).ln();
                (term, idf)
            })
            .collect();
        Self { idf, doc_count }
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }

    /// Build the sparse TF-IDF vector of a text against this index.
    ///
    /// Terms unknown to the corpus contribute nothing.
    pub fn vector(&self, text: &str) -> HashMap<String, f64> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return HashMap::new();
        }
        let mut tf: HashMap<String, f64> = HashMap::new();
        for t in &tokens {
            *tf.entry(t.clone()).or_insert(0.0) += 1.0;
        }
        let total = tokens.len() as f64;
        tf.into_iter()
            .filter_map(|(term, count)| {
                self.idf
                    .get(&term)
                    .map(|idf| (term, (count / total) * idf))
            })
            .filter(|(_, w)| *w > 0.0)
            .collect()
    }
}

/// Cosine similarity between two sparse vectors.  Zero vectors score 0.
pub fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .filter_map(|(term, wa)| b.get(term).map(|wb| wa * wb))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();
    dot / (norm_a * norm_b)
}

/// Jaccard overlap of the token sets of two texts.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let mut set_a: Vec<String> = tokenize(a);
    let mut set_b: Vec<String> = tokenize(b);
    set_a.sort();
    set_a.dedup();
    set_b.sort();
    set_b.dedup();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let inter = set_a.iter().filter(|t| set_b.contains(t)).count();
    let union = set_a.len() + set_b.len() - inter;
    inter as f64 / union as f64
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_empty_corpus_is_empty() {
        let idx = TfIdf::fit::<&str>(&[]);
        assert!(idx.is_empty());
        assert!(idx.vector("anything").is_empty());
    }

    #[test]
    fn vector_ignores_unknown_terms() {
        let idx = TfIdf::fit(&["canvas rendering pipeline", "audio mixer engine"]);
        let v = idx.vector("quantum entanglement");
        assert!(v.is_empty());
    }

    #[test]
    fn similar_documents_score_higher() {
        let docs = [
            "canvas rendering sprites particles",
            "audio sound mixer playback",
            "database query index storage",
        ];
        let idx = TfIdf::fit(&docs);
        let query = idx.vector("render sprites on canvas particles");
        let canvas = idx.vector(docs[0]);
        let audio = idx.vector(docs[1]);
        assert!(cosine(&query, &canvas) > cosine(&query, &audio));
    }

    #[test]
    fn cosine_zero_for_disjoint_vectors() {
        let idx = TfIdf::fit(&["alpha bravo", "charlie delta"]);
        let a = idx.vector("alpha");
        let b = idx.vector("charlie");
        assert_eq!(cosine(&a, &b), 0.0);
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let idx = TfIdf::fit(&["alpha bravo unique", "charlie delta other"]);
        let v = idx.vector("alpha bravo");
        let sim = cosine(&v, &v);
        assert!((sim - 1.0).abs() < 1e-9, "got {sim}");
    }

    #[test]
    fn jaccard_overlap() {
        // tokens: {red, green, blue} vs {green, blue, yellow} → 2/4
        assert!((jaccard("red green blue", "green blue yellow") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn jaccard_empty_is_zero() {
        assert_eq!(jaccard("", "anything here"), 0.0);
    }
}
