//! Stage 3: cluster classification, deterministic gates, summaries.

pub mod classifier;
pub mod gates;
pub mod summarize;

use crate::db::DbRecord;
use crate::types::Priority;
use crate::util::safe_truncate;

pub use classifier::{classify_cluster, ClassifyOutcome};
pub use gates::{apply_gates, GateRule, Gated};

/// A cluster's classification as a plain value.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub priority: Priority,
    pub tag: String,
    pub confidence: Option<f64>,
}

/// The longest member by text length; ties go to the oldest record.
pub fn pick_anchor(members: &[DbRecord]) -> Option<&DbRecord> {
    members.iter().max_by(|a, b| {
        a.text()
            .chars()
            .count()
            .cmp(&b.text().chars().count())
            .then(b.id.cmp(&a.id))
    })
}

/// Body text read from each member by the gates.
const GATE_MEMBER_CHARS: usize = 20_000;

/// Text the gates inspect: cluster title, then every member's title and body.
pub fn gate_text(cluster_title: &str, members: &[DbRecord]) -> String {
    let mut text = cluster_title.to_string();
    for member in members {
        text.push(' ');
        text.push_str(member.display_title());
        text.push(' ');
        text.push_str(safe_truncate(member.text(), GATE_MEMBER_CHARS));
    }
    text
}
