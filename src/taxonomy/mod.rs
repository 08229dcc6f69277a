//! Versioned tag catalog.
//!
//! A `Catalog` is an immutable snapshot built once per run and passed by
//! reference into every stage. Marker lists are matched on whole words of
//! accent-stripped, lowercase text.

pub mod embedded;
pub mod loader;
pub mod schema;

use crate::util::normalize_title;
use schema::{CatalogFile, TagDefinition};

/// Tag stamped by the blocklist gate and on explicitly irrelevant clusters.
pub const TAG_IRRELEVANT: &str = "IRRELEVANT";
/// Tag stamped when classification fails twice.
pub const TAG_ERROR: &str = "ERROR";

#[derive(Debug, Clone)]
pub struct Catalog {
    pub version: i64,
    pub default_tag: String,
    tags: Vec<TagDefinition>,
    /// Keywords per tag, normalized and padded for whole-word search.
    keyword_index: Vec<(usize, Vec<String>)>,
    promotional: Vec<String>,
    blocklist: Vec<String>,
    transaction: Vec<String>,
}

/// Pad normalized text with spaces so `" term "` matches whole words only.
fn padded(text: &str) -> String {
    format!(" {} ", normalize_title(text))
}

fn prepare_markers(markers: &[String]) -> Vec<String> {
    markers
        .iter()
        .map(|m| padded(m))
        .filter(|m| !m.trim().is_empty())
        .collect()
}

fn any_marker(padded_text: &str, markers: &[String]) -> Option<String> {
    markers
        .iter()
        .find(|m| padded_text.contains(m.as_str()))
        .map(|m| m.trim().to_string())
}

impl Catalog {
    pub fn from_file(file: CatalogFile) -> Self {
        let keyword_index = file
            .tags
            .iter()
            .enumerate()
            .map(|(i, t)| (i, prepare_markers(&t.keywords)))
            .collect();
        Self {
            version: file.version,
            default_tag: file.default_tag,
            keyword_index,
            promotional: prepare_markers(&file.promotional_markers),
            blocklist: prepare_markers(&file.blocklist_markers),
            transaction: prepare_markers(&file.transaction_markers),
            tags: file.tags,
        }
    }

    /// The snapshot compiled into the binary.
    pub fn embedded() -> Result<Self, String> {
        loader::load_default().map(Self::from_file)
    }

    pub fn tag_names(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.name.as_str()).collect()
    }

    /// Exact membership (special tags are not members).
    pub fn contains(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }

    /// Canonical spelling of a tag matched ignoring case and accents.
    pub fn find_case_insensitive(&self, name: &str) -> Option<&str> {
        let wanted = crate::util::fold_text(name.trim());
        self.tags
            .iter()
            .find(|t| crate::util::fold_text(&t.name) == wanted)
            .map(|t| t.name.as_str())
    }

    /// Tag whose keywords occur most often in `text`. Ties keep catalog order.
    pub fn keyword_match(&self, text: &str) -> Option<&str> {
        let haystack = padded(text);
        let mut best: Option<(usize, usize)> = None;
        for (idx, keywords) in &self.keyword_index {
            let hits = keywords
                .iter()
                .filter(|k| haystack.contains(k.as_str()))
                .count();
            if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
                best = Some((*idx, hits));
            }
        }
        best.map(|(idx, _)| self.tags[idx].name.as_str())
    }

    pub fn is_transactional(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.name == tag && t.transactional)
    }

    /// First promotional marker found in `text`.
    pub fn promotional_marker(&self, text: &str) -> Option<String> {
        any_marker(&padded(text), &self.promotional)
    }

    /// First blocklisted-domain marker found in `text`.
    pub fn blocklist_marker(&self, text: &str) -> Option<String> {
        any_marker(&padded(text), &self.blocklist)
    }

    pub fn has_transaction_marker(&self, text: &str) -> bool {
        any_marker(&padded(text), &self.transaction).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let catalog = Catalog::embedded().unwrap();
        assert_eq!(catalog.find_case_insensitive("m&a"), Some("M&A"));
        assert_eq!(catalog.find_case_insensitive(" earnings "), Some("Earnings"));
        assert_eq!(catalog.find_case_insensitive("Sports"), None);
    }

    #[test]
    fn test_keyword_match_prefers_most_hits() {
        let catalog = Catalog::embedded().unwrap();
        assert_eq!(
            catalog.keyword_match("Central bank holds interest rate, Copom says"),
            Some("Monetary Policy")
        );
        assert_eq!(catalog.keyword_match("Nothing to see"), None);
    }

    #[test]
    fn test_markers_match_whole_words_after_folding() {
        let catalog = Catalog::embedded().unwrap();
        assert!(catalog.has_transaction_marker("Anúncio de FUSÃO entre bancos"));
        // "stake" must not fire inside "mistake"
        assert!(!catalog.has_transaction_marker("A costly mistake"));
        assert_eq!(
            catalog.blocklist_marker("Horóscopo do dia"),
            Some("horoscopo".to_string())
        );
        assert!(catalog.blocklist_marker("Bond downgraded to BBB").is_none());
    }

    #[test]
    fn test_transactional_flag() {
        let catalog = Catalog::embedded().unwrap();
        assert!(catalog.is_transactional("M&A"));
        assert!(!catalog.is_transactional("IPO"));
        assert!(!catalog.contains(TAG_IRRELEVANT));
    }
}
