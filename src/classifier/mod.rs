//! Complexity classifier: a pure function from task description/metadata to
//! a `Tier`, cached on the task at submit time. Same shape of problem as
//! mapping free text to a small closed category set via keyword/length
//! heuristics, reused here for tier instead of language.

use crate::models::{Complexity, Tier};
use std::collections::{HashMap, HashSet};

const COMPLEX_KEYWORDS: &[&str] = &[
    "architecture",
    "redesign",
    "migrate",
    "migration",
    "investigate",
    "research",
    "refactor the",
    "design a",
];

const TRIVIAL_KEYWORDS: &[&str] = &[
    "format",
    "lint",
    "typo",
    "rename",
    "bump version",
    "update comment",
    "fix whitespace",
];

const TRIVIAL_MAX_WORDS: usize = 15;
const COMPLEX_MIN_WORDS: usize = 80;
const COMPLEX_MIN_CAPABILITIES: usize = 3;

/// Classifies a task. `metadata["complexity_hint"]` (a string matching one
/// of the `Tier` variant names) overrides the heuristic entirely — callers
/// that already know the right tier (e.g. the Goal Orchestrator decomposing
/// a goal it authored) can pin it directly.
pub fn classify(
    description: &str,
    needed_capabilities: &HashSet<String>,
    metadata: &HashMap<String, serde_json::Value>,
) -> Complexity {
    if let Some(hint) = metadata.get("complexity_hint").and_then(|v| v.as_str()) {
        if let Some(tier) = tier_from_str(hint) {
            return Complexity {
                effective_tier: tier,
                reason: format!("explicit complexity_hint={hint}"),
            };
        }
    }

    let trimmed = description.trim();
    if trimmed.is_empty() {
        return Complexity {
            effective_tier: Tier::Unknown,
            reason: "empty description, insufficient signal".to_string(),
        };
    }

    let lower = trimmed.to_lowercase();
    let word_count = trimmed.split_whitespace().count();

    if COMPLEX_KEYWORDS.iter().any(|k| lower.contains(k))
        || needed_capabilities.len() >= COMPLEX_MIN_CAPABILITIES
        || word_count >= COMPLEX_MIN_WORDS
    {
        return Complexity {
            effective_tier: Tier::Complex,
            reason: format!(
                "matched complex signal (words={word_count}, capabilities={})",
                needed_capabilities.len()
            ),
        };
    }

    if TRIVIAL_KEYWORDS.iter().any(|k| lower.contains(k))
        && word_count <= TRIVIAL_MAX_WORDS
        && needed_capabilities.is_empty()
    {
        return Complexity {
            effective_tier: Tier::Trivial,
            reason: format!("matched trivial keyword, short description (words={word_count})"),
        };
    }

    Complexity {
        effective_tier: Tier::Standard,
        reason: format!("no trivial/complex signal matched (words={word_count})"),
    }
}

fn tier_from_str(s: &str) -> Option<Tier> {
    match s {
        "trivial" => Some(Tier::Trivial),
        "standard" => Some(Tier::Standard),
        "complex" => Some(Tier::Complex),
        "unknown" => Some(Tier::Unknown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_description_is_unknown() {
        let c = classify("", &HashSet::new(), &HashMap::new());
        assert_eq!(c.effective_tier, Tier::Unknown);
    }

    #[test]
    fn short_trivial_keyword_with_no_capabilities() {
        let c = classify("fix whitespace in main.rs", &HashSet::new(), &HashMap::new());
        assert_eq!(c.effective_tier, Tier::Trivial);
    }

    #[test]
    fn long_description_is_complex() {
        let description = "word ".repeat(100);
        let c = classify(&description, &HashSet::new(), &HashMap::new());
        assert_eq!(c.effective_tier, Tier::Complex);
    }

    #[test]
    fn explicit_hint_overrides_heuristic() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "complexity_hint".to_string(),
            serde_json::Value::String("complex".to_string()),
        );
        let c = classify("fix typo", &HashSet::new(), &metadata);
        assert_eq!(c.effective_tier, Tier::Complex);
    }

    #[test]
    fn default_is_standard() {
        let c = classify("implement the new login endpoint", &HashSet::new(), &HashMap::new());
        assert_eq!(c.effective_tier, Tier::Standard);
    }
}
