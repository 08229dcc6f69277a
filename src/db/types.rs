//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ClusterStatus, Priority, RecordStatus};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    /// A write would break a store invariant (e.g. merging into an inactive cluster).
    #[error("Integrity violation: {0}")]
    Integrity(String),
}

/// A row from the `raw_records` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRecord {
    pub id: i64,
    pub content_hash: String,
    pub raw_text: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub author: Option<String>,
    pub page: Option<String>,
    pub published_at: Option<String>,
    pub body: Option<String>,
    pub tag_hint: Option<String>,
    pub priority_hint: Option<String>,
    pub status: RecordStatus,
    pub cluster_id: Option<i64>,
    pub error_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DbRecord {
    /// Best available title: normalized, then metadata, then empty.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }

    /// Best available text: normalized body, else the raw text.
    pub fn text(&self) -> &str {
        match self.body.as_deref() {
            Some(b) if !b.trim().is_empty() => b,
            _ => &self.raw_text,
        }
    }
}

/// What the ingestion collaborator hands over. Metadata is best-effort.
#[derive(Debug, Clone, Default)]
pub struct NewRawRecord {
    pub raw_text: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub author: Option<String>,
    pub page: Option<String>,
    pub published_at: Option<String>,
}

/// Fields written when a record passes normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub title: String,
    pub body: String,
    pub source: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub tag_hint: Option<String>,
    pub priority_hint: Option<String>,
}

/// A row from the `event_clusters` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCluster {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub tag: Option<String>,
    /// NULL until the classifier first stamps the cluster.
    pub priority: Option<Priority>,
    pub status: ClusterStatus,
    pub record_count: i64,
    pub day: String,
    pub needs_classification: bool,
    pub review_reason: Option<String>,
    pub merged_into: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Cluster columns whose changes go through the alteration log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterField {
    Title,
    Summary,
    Tag,
    Priority,
}

impl ClusterField {
    pub fn column(&self) -> &'static str {
        match self {
            ClusterField::Title => "title",
            ClusterField::Summary => "summary",
            ClusterField::Tag => "tag",
            ClusterField::Priority => "priority",
        }
    }
}

/// A row from the `alteration_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAlteration {
    pub id: i64,
    pub cluster_id: Option<i64>,
    pub record_id: Option<i64>,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub motive: String,
    pub run_id: String,
    pub created_at: String,
}

/// An alteration about to be appended.
#[derive(Debug, Clone)]
pub struct NewAlteration<'a> {
    pub cluster_id: Option<i64>,
    pub record_id: Option<i64>,
    pub field: &'a str,
    pub old_value: Option<&'a str>,
    pub new_value: Option<&'a str>,
    pub motive: &'a str,
}

/// One tag of a stored catalog version.
#[derive(Debug, Clone, PartialEq)]
pub struct DbCatalogTag {
    pub name: String,
    pub keywords: Vec<String>,
    pub transactional: bool,
}

/// Outcome of a merge request against the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Sources archived by this call.
    pub merged_sources: Vec<i64>,
    /// Records whose ownership moved to the destination.
    pub reassigned_records: usize,
}

/// Build a conversion error for a TEXT column holding an unknown enum value.
pub(crate) fn invalid_enum(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown value '{}'", value).into(),
    )
}
