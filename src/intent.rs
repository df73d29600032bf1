//! Keyword intent classifier.
//!
//! The serialized body is tokenized once, lowercased; each category scores
//! `Σ matched_keyword × weight` and the highest score wins.

use crate::types::IntentCategory;
use std::collections::HashMap;

/// Fixed category table: (category, weight, keywords).
const CATEGORIES: &[(IntentCategory, f64, &[&str])] = &[
    (
        IntentCategory::Destructive,
        1.5,
        &["delete", "remove", "drop", "truncate", "destroy", "kill", "terminate"],
    ),
    (
        IntentCategory::DataAccess,
        0.5,
        &["select", "query", "fetch", "read", "get", "list", "search"],
    ),
    (
        IntentCategory::DataModification,
        1.0,
        &["update", "insert", "upsert", "modify", "change", "set"],
    ),
    (
        IntentCategory::ExternalCall,
        1.2,
        &["http", "api", "webhook", "curl", "fetch", "request", "post"],
    ),
    (
        IntentCategory::CodeExecution,
        1.4,
        &["exec", "eval", "run", "execute", "shell", "command", "script"],
    ),
    (
        IntentCategory::FileOperation,
        1.1,
        &["file", "write", "save", "upload", "download", "path", "directory"],
    ),
];

#[derive(Debug, Clone, Copy)]
pub struct IntentScore {
    pub category: IntentCategory,
    /// Raw winning score (`matches × weight`).
    pub score: f64,
    /// `min(0.95, score / 5)`.
    pub confidence: f64,
}

/// Classify the serialized body. Empty input yields `unknown` at zero
/// confidence.
pub fn classify(text: &str) -> IntentScore {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if let Some(keyword) = lookup_keyword(token) {
            *counts.entry(keyword).or_insert(0) += 1;
        }
    }

    let mut best = IntentScore {
        category: IntentCategory::Unknown,
        score: 0.0,
        confidence: 0.0,
    };
    for (category, weight, keywords) in CATEGORIES {
        let matched: usize = keywords.iter().filter_map(|k| counts.get(k)).sum();
        let score = matched as f64 * weight;
        if score > best.score {
            best = IntentScore {
                category: *category,
                score,
                confidence: (score / 5.0).min(0.95),
            };
        }
    }
    best
}

/// Interns a token against the keyword universe so counting stays on
/// `&'static str` keys.
fn lookup_keyword(token: &str) -> Option<&'static str> {
    for (_, _, keywords) in CATEGORIES {
        if let Some(k) = keywords.iter().find(|k| **k == token) {
            return Some(*k);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_unknown() {
        let s = classify("");
        assert_eq!(s.category, IntentCategory::Unknown);
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn test_no_keywords_is_unknown() {
        let s = classify("what is two plus two");
        assert_eq!(s.category, IntentCategory::Unknown);
        assert_eq!(s.score, 0.0);
    }

    #[test]
    fn test_destructive_wins_on_weight() {
        // One destructive keyword (1.5) outweighs one data_access (0.5).
        let s = classify("drop the old rows then read the rest");
        assert_eq!(s.category, IntentCategory::Destructive);
        assert!((s.score - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_repeated_keywords_accumulate() {
        let s = classify("delete delete delete");
        assert_eq!(s.category, IntentCategory::Destructive);
        assert!((s.score - 4.5).abs() < 1e-9);
        assert!((s.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_capped() {
        let s = classify(&"destroy ".repeat(20));
        assert!((s.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_code_execution_detected() {
        let s = classify("exec the shell command and run the script");
        assert_eq!(s.category, IntentCategory::CodeExecution);
    }
}
