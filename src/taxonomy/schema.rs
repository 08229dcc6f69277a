use serde::{Deserialize, Serialize};

/// A catalog file: the tag vocabulary plus the marker lists the
/// deterministic rules match against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFile {
    pub version: i64,
    pub name: String,
    pub default_tag: String,
    pub tags: Vec<TagDefinition>,
    /// Promotional content is dropped before extraction.
    #[serde(default)]
    pub promotional_markers: Vec<String>,
    /// Domains that are never desk-relevant (sports, horoscopes, ...).
    #[serde(default)]
    pub blocklist_markers: Vec<String>,
    /// Terms that corroborate a transactional tag.
    #[serde(default)]
    pub transaction_markers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDefinition {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Needs a transaction marker in the text to keep a high priority.
    #[serde(default)]
    pub transactional: bool,
}
