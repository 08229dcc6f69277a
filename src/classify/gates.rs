//! Deterministic overrides applied after every successful classification.

use crate::taxonomy::{Catalog, TAG_IRRELEVANT};
use crate::types::Priority;

use super::Classification;

/// One override rule. Rules run in `GATE_RULES` order and each sees the
/// output of the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRule {
    /// Structurally irrelevant domains (sports, horoscopes, gossip).
    Blocklist,
    /// A transactional tag needs a transaction term somewhere in the text.
    Corroboration,
}

pub const GATE_RULES: [GateRule; 2] = [GateRule::Blocklist, GateRule::Corroboration];

impl GateRule {
    pub fn name(&self) -> &'static str {
        match self {
            GateRule::Blocklist => "blocklist",
            GateRule::Corroboration => "corroboration",
        }
    }

    /// Returns the overridden classification, or None when the rule does not fire.
    fn apply(&self, c: &Classification, text: &str, catalog: &Catalog) -> Option<Classification> {
        match self {
            GateRule::Blocklist => {
                let marker = catalog.blocklist_marker(text)?;
                if c.priority == Priority::Irrelevant && c.tag == TAG_IRRELEVANT {
                    return None;
                }
                log::debug!("Gates: blocklist marker '{}' matched", marker);
                Some(Classification {
                    priority: Priority::Irrelevant,
                    tag: TAG_IRRELEVANT.to_string(),
                    confidence: c.confidence,
                })
            }
            GateRule::Corroboration => {
                let above_p3 = matches!(c.priority, Priority::P1 | Priority::P2);
                if above_p3 && catalog.is_transactional(&c.tag) && !catalog.has_transaction_marker(text) {
                    Some(Classification {
                        priority: Priority::P3,
                        ..c.clone()
                    })
                } else {
                    None
                }
            }
        }
    }
}

/// Result of running the gates.
#[derive(Debug, Clone, PartialEq)]
pub struct Gated {
    pub classification: Classification,
    /// Rules that changed the classification, in order.
    pub fired: Vec<GateRule>,
}

/// Run every gate rule over `classification` for the cluster `text`.
pub fn apply_gates(classification: Classification, text: &str, catalog: &Catalog) -> Gated {
    let mut current = classification;
    let mut fired = Vec::new();
    for rule in GATE_RULES {
        if let Some(next) = rule.apply(&current, text, catalog) {
            fired.push(rule);
            current = next;
        }
    }
    Gated {
        classification: current,
        fired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(priority: Priority, tag: &str) -> Classification {
        Classification {
            priority,
            tag: tag.to_string(),
            confidence: Some(0.9),
        }
    }

    #[test]
    fn test_blocklist_always_wins() {
        let catalog = Catalog::embedded().unwrap();
        for (p, t) in [(Priority::P1, "Markets"), (Priority::P3, "M&A"), (Priority::P2, "Other")] {
            let gated = apply_gates(class(p, t), "Futebol: Flamengo vence o clássico", &catalog);
            assert_eq!(gated.classification.priority, Priority::Irrelevant);
            assert_eq!(gated.classification.tag, TAG_IRRELEVANT);
            assert_eq!(gated.fired, vec![GateRule::Blocklist]);
        }
    }

    #[test]
    fn test_blocklist_matches_accent_folded_words() {
        let catalog = Catalog::embedded().unwrap();
        let gated = apply_gates(class(Priority::P2, "Other"), "Horóscopo do dia", &catalog);
        assert_eq!(gated.classification.priority, Priority::Irrelevant);
    }

    #[test]
    fn test_uncorroborated_transaction_downgrades_to_p3() {
        let catalog = Catalog::embedded().unwrap();
        let gated = apply_gates(
            class(Priority::P1, "M&A"),
            "Acme and Beta executives meet in New York",
            &catalog,
        );
        assert_eq!(gated.classification.priority, Priority::P3);
        assert_eq!(gated.classification.tag, "M&A");
        assert_eq!(gated.fired, vec![GateRule::Corroboration]);
    }

    #[test]
    fn test_corroborated_transaction_keeps_priority() {
        let catalog = Catalog::embedded().unwrap();
        let gated = apply_gates(
            class(Priority::P1, "M&A"),
            "Acme agrees to a merger with Beta",
            &catalog,
        );
        assert_eq!(gated.classification.priority, Priority::P1);
        assert!(gated.fired.is_empty());

        let pt = apply_gates(class(Priority::P2, "M&A"), "Acme conclui aquisição da Beta", &catalog);
        assert_eq!(pt.classification.priority, Priority::P2);
    }

    #[test]
    fn test_non_transactional_tags_are_untouched() {
        let catalog = Catalog::embedded().unwrap();
        let gated = apply_gates(class(Priority::P1, "Monetary Policy"), "Copom holds Selic", &catalog);
        assert!(gated.fired.is_empty());
        assert_eq!(gated.classification, class(Priority::P1, "Monetary Policy"));
    }
}
