//! Record normalization: tag and priority correction plus the promotional filter.

use serde_json::Value;

use crate::db::{DbRecord, RecordUpdate};
use crate::error::PipelineError;
use crate::taxonomy::Catalog;
use crate::types::Priority;
use crate::util::{normalize_title, safe_truncate};

/// Jaro-Winkler similarity needed for a near-match tag correction.
const NEAR_MATCH_THRESHOLD: f64 = 0.90;

/// Longest title derived from the first line of raw text.
const DERIVED_TITLE_CHARS: usize = 200;

/// Fields proposed for a record, either from metadata or a repaired completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftRecord {
    pub title: Option<String>,
    pub body: Option<String>,
    pub source: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub tag: Option<String>,
    pub priority: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

impl DraftRecord {
    /// Draft built from ingestion metadata alone.
    pub fn from_metadata(record: &DbRecord) -> Self {
        Self {
            title: non_empty(record.title.as_deref()),
            body: non_empty(Some(&record.raw_text)),
            source: non_empty(record.source.as_deref()),
            author: non_empty(record.author.as_deref()),
            published_at: non_empty(record.published_at.as_deref()),
            tag: None,
            priority: None,
        }
    }

    /// Draft from a repaired extraction reply. Non-string fields are ignored.
    pub fn from_value(value: &Value) -> Self {
        let field = |key: &str| non_empty(value.get(key).and_then(Value::as_str));
        Self {
            title: field("title"),
            body: field("body"),
            source: field("source"),
            author: field("author"),
            published_at: field("published_at"),
            tag: field("tag"),
            priority: field("priority"),
        }
    }
}

/// Which rung of the tag ladder produced the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMethod {
    Exact,
    CaseInsensitive,
    Keyword,
    NearMatch,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagCorrection {
    pub tag: String,
    pub method: TagMethod,
}

/// Map a proposed tag onto the catalog.
///
/// exact → case-insensitive → keyword (in the proposal, then in the text) →
/// Jaro-Winkler near-match → catalog default.
pub fn correct_tag(proposed: Option<&str>, text: &str, catalog: &Catalog) -> TagCorrection {
    let proposed = proposed.map(str::trim).filter(|p| !p.is_empty());

    if let Some(p) = proposed {
        if catalog.contains(p) {
            return TagCorrection { tag: p.to_string(), method: TagMethod::Exact };
        }
        if let Some(tag) = catalog.find_case_insensitive(p) {
            return TagCorrection { tag: tag.to_string(), method: TagMethod::CaseInsensitive };
        }
        let padded = format!(" {} ", normalize_title(p));
        if let Some(tag) = catalog
            .tag_names()
            .into_iter()
            .find(|name| padded.contains(&format!(" {} ", normalize_title(name))))
        {
            return TagCorrection { tag: tag.to_string(), method: TagMethod::Keyword };
        }
    }

    let keyword_source = match proposed {
        Some(p) => format!("{} {}", p, text),
        None => text.to_string(),
    };
    if let Some(tag) = catalog.keyword_match(&keyword_source) {
        return TagCorrection { tag: tag.to_string(), method: TagMethod::Keyword };
    }

    if let Some(p) = proposed {
        let folded = crate::util::fold_text(p);
        let best = catalog
            .tag_names()
            .into_iter()
            .map(|name| (name, strsim::jaro_winkler(&folded, &crate::util::fold_text(name))))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((name, score)) = best {
            if score >= NEAR_MATCH_THRESHOLD {
                return TagCorrection { tag: name.to_string(), method: TagMethod::NearMatch };
            }
        }
    }

    TagCorrection {
        tag: catalog.default_tag.clone(),
        method: TagMethod::Default,
    }
}

/// Absent stays absent; anything unrecognized becomes IRRELEVANT.
pub fn correct_priority(proposed: Option<&str>) -> Option<Priority> {
    let p = proposed.map(str::trim).filter(|p| !p.is_empty())?;
    Some(Priority::parse_proposed(p).unwrap_or(Priority::Irrelevant))
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Ready {
        update: RecordUpdate,
        tag_method: TagMethod,
    },
    /// Matched a promotional marker; no further processing.
    Promotional(String),
}

fn first_line_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| safe_truncate(l, DERIVED_TITLE_CHARS).to_string())
}

/// Validate and correct a draft for `record`.
///
/// Title and body fall back draft → metadata → raw text; if either is still
/// empty the record fails validation.
pub fn normalize(
    record: &DbRecord,
    draft: &DraftRecord,
    catalog: &Catalog,
) -> Result<NormalizeOutcome, PipelineError> {
    let title = draft
        .title
        .clone()
        .or_else(|| non_empty(record.title.as_deref()))
        .or_else(|| first_line_title(&record.raw_text))
        .unwrap_or_default();
    let body = draft
        .body
        .clone()
        .or_else(|| non_empty(Some(&record.raw_text)))
        .unwrap_or_default();

    if let Some(marker) = catalog.promotional_marker(&format!("{} {}", title, body)) {
        return Ok(NormalizeOutcome::Promotional(marker));
    }

    if title.trim().is_empty() || body.trim().is_empty() {
        return Err(PipelineError::ValidationFailure(format!(
            "record {} has an empty {}",
            record.id,
            if title.trim().is_empty() { "title" } else { "body" }
        )));
    }

    let correction = correct_tag(draft.tag.as_deref(), &format!("{} {}", title, body), catalog);
    let priority = correct_priority(draft.priority.as_deref());

    Ok(NormalizeOutcome::Ready {
        update: RecordUpdate {
            title,
            body,
            source: draft.source.clone(),
            author: draft.author.clone(),
            published_at: draft.published_at.clone(),
            tag_hint: Some(correction.tag),
            priority_hint: priority.map(|p| p.as_str().to_string()),
        },
        tag_method: correction.method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordStatus;

    fn catalog() -> Catalog {
        Catalog::embedded().expect("embedded catalog")
    }

    fn record(title: Option<&str>, raw: &str) -> DbRecord {
        DbRecord {
            id: 1,
            content_hash: "h".into(),
            raw_text: raw.into(),
            title: title.map(String::from),
            source: None,
            author: None,
            page: None,
            published_at: None,
            body: None,
            tag_hint: None,
            priority_hint: None,
            status: RecordStatus::Pending,
            cluster_id: None,
            error_reason: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_tag_ladder() {
        let c = catalog();
        assert_eq!(correct_tag(Some("M&A"), "", &c).method, TagMethod::Exact);
        assert_eq!(
            correct_tag(Some("earnings"), "", &c),
            TagCorrection { tag: "Earnings".into(), method: TagMethod::CaseInsensitive }
        );
        assert_eq!(
            correct_tag(Some("Big M&A deal"), "", &c),
            TagCorrection { tag: "M&A".into(), method: TagMethod::Keyword }
        );
        assert_eq!(
            correct_tag(Some("Misc"), "Copom raises the Selic rate", &c),
            TagCorrection { tag: "Monetary Policy".into(), method: TagMethod::Keyword }
        );
        assert_eq!(
            correct_tag(Some("Comodities"), "", &c),
            TagCorrection { tag: "Commodities".into(), method: TagMethod::NearMatch }
        );
        assert_eq!(
            correct_tag(Some("Zebra"), "nothing here", &c),
            TagCorrection { tag: "Other".into(), method: TagMethod::Default }
        );
    }

    #[test]
    fn test_priority_correction() {
        assert_eq!(correct_priority(Some("p2")), Some(Priority::P2));
        assert_eq!(correct_priority(Some("urgent!!")), Some(Priority::Irrelevant));
        assert_eq!(correct_priority(None), None);
        assert_eq!(correct_priority(Some("  ")), None);
    }

    #[test]
    fn test_normalize_falls_back_to_metadata_and_raw_text() {
        let rec = record(None, "\n  Acme to buy Beta for $2bn\nAcme said on Monday it agreed to acquire Beta.");
        let outcome = normalize(&rec, &DraftRecord::default(), &catalog()).unwrap();
        match outcome {
            NormalizeOutcome::Ready { update, .. } => {
                assert_eq!(update.title, "Acme to buy Beta for $2bn");
                assert!(update.body.contains("agreed to acquire"));
                assert_eq!(update.tag_hint.as_deref(), Some("M&A"));
                assert_eq!(update.priority_hint, None);
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_rejects_empty() {
        let rec = record(None, "   ");
        let err = normalize(&rec, &DraftRecord::default(), &catalog()).unwrap_err();
        assert_eq!(err.kind(), "validation_failure");
    }

    #[test]
    fn test_promotional_short_circuits() {
        let rec = record(Some("Compre agora!"), "Promoção imperdível em eletrônicos");
        let outcome = normalize(&rec, &DraftRecord::from_metadata(&rec), &catalog()).unwrap();
        assert!(matches!(outcome, NormalizeOutcome::Promotional(_)));
    }

    #[test]
    fn test_draft_from_value_ignores_nulls() {
        let draft = DraftRecord::from_value(&serde_json::json!({
            "title": "Acme", "body": null, "author": "null", "tag": "M&A", "priority": 1
        }));
        assert_eq!(draft.title.as_deref(), Some("Acme"));
        assert_eq!(draft.body, None);
        assert_eq!(draft.author, None);
        assert_eq!(draft.priority, None);
    }
}
