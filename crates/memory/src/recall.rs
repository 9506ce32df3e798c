//! Recall gating and block assembly.
//!
//! The gate is a cheap heuristic: very short queries skip recall unless
//! they lean on referential anaphora ("how old am I?", "what did she
//! say?") — exactly the queries that cannot be answered without prior
//! context. LLM-based gating is out of scope here; the hook for it is
//! this module's single entry point.

use std::sync::OnceLock;

use palaver_domain::config::RecallConfig;

use crate::types::{RecallLayer, Snippet};

fn anaphora_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(he|she|they|them|him|her|it|that|this|those|these|me|my|mine|i|we|our|us)\b",
        )
        .expect("anaphora regex is valid")
    })
}

/// Decide whether recall is worth a store round-trip for this query.
pub fn should_recall(query: &str, cfg: &RecallConfig) -> bool {
    if !cfg.enabled {
        return false;
    }
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.chars().count() >= cfg.min_query_chars {
        return true;
    }
    anaphora_re().is_match(trimmed)
}

/// Assemble the layered textual block prepended to the prompt.
///
/// Layers appear in a fixed order (summaries → concepts → direct →
/// related → recent); empty layers are omitted. Returns `None` when no
/// snippet survived.
pub fn build_block(snippets: &[Snippet]) -> Option<String> {
    if snippets.is_empty() {
        return None;
    }

    let mut block = String::from("Things you remember about this user from earlier conversations:\n");
    for layer in [
        RecallLayer::Summary,
        RecallLayer::Concept,
        RecallLayer::Direct,
        RecallLayer::Related,
        RecallLayer::Recent,
    ] {
        let members: Vec<&Snippet> = snippets.iter().filter(|s| s.layer == layer).collect();
        if members.is_empty() {
            continue;
        }
        block.push_str(&format!("\n{}:\n", layer.heading()));
        for snippet in members {
            block.push_str(&format!("- {}\n", snippet.content.trim()));
        }
    }
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snippet(content: &str, layer: RecallLayer) -> Snippet {
        Snippet {
            content: content.into(),
            layer,
            score: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn long_queries_pass_the_gate() {
        let cfg = RecallConfig::default();
        assert!(should_recall("what database did we pick for the ingest path?", &cfg));
    }

    #[test]
    fn short_queries_skip_unless_anaphoric() {
        let mut cfg = RecallConfig::default();
        cfg.min_query_chars = 20;
        assert!(!should_recall("hello", &cfg));
        // "am I" leans on prior context.
        assert!(should_recall("How old am I?", &cfg));
    }

    #[test]
    fn disabled_gate_never_recalls() {
        let mut cfg = RecallConfig::default();
        cfg.enabled = false;
        assert!(!should_recall("a perfectly long and specific question", &cfg));
    }

    #[test]
    fn block_groups_layers_in_order() {
        let block = build_block(&[
            snippet("likes rust", RecallLayer::Recent),
            snippet("is 26 years old", RecallLayer::Direct),
            snippet("overall: a backend engineer", RecallLayer::Summary),
        ])
        .unwrap();

        let summary_pos = block.find("Summaries:").unwrap();
        let direct_pos = block.find("Relevant facts:").unwrap();
        let recent_pos = block.find("Recent:").unwrap();
        assert!(summary_pos < direct_pos && direct_pos < recent_pos);
        assert!(block.contains("- is 26 years old"));
    }

    #[test]
    fn empty_snippets_yield_no_block() {
        assert!(build_block(&[]).is_none());
    }
}
