use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration stored in ~/.eventdesk/config.json
///
/// Every field has a serde default, so an empty object (or a missing file)
/// yields a runnable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// SQLite store. Defaults to `~/.eventdesk/eventdesk.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Where unrecoverable completion output is kept for triage.
    /// Defaults to `~/.eventdesk/_audit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_dir: Option<PathBuf>,
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u32,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            audit_dir: None,
            audit_retention_days: default_audit_retention_days(),
            completion: CompletionConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

fn default_audit_retention_days() -> u32 {
    30
}

/// Which wire protocol the completion endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionProvider {
    Gemini,
    OpenaiCompatible,
}

/// External completion endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: CompletionProvider,
    #[serde(default = "default_model")]
    pub model: String,
    /// Override for the provider's default endpoint root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> CompletionProvider {
    CompletionProvider::Gemini
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_api_key_env() -> String {
    "EVENTDESK_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

/// Tuning knobs for the batch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Upper bound on pool workers; the pool never exceeds 8 or the core count.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Units (records or clusters) a single stage touches per run.
    #[serde(default = "default_max_units")]
    pub max_units_per_run: usize,
    /// Records per grouping call.
    #[serde(default = "default_grouping_batch_size")]
    pub grouping_batch_size: usize,
    /// Failing grouping batches are halved until they would drop below this.
    #[serde(default = "default_grouping_min_batch")]
    pub grouping_min_batch: usize,
    /// Member titles shown per existing cluster in grouping prompts.
    #[serde(default = "default_sample_titles")]
    pub sample_titles_per_cluster: usize,
    #[serde(default = "default_prioritizer_batch_size")]
    pub prioritizer_batch_size: usize,
    #[serde(default = "default_consolidator_batch_size")]
    pub consolidator_batch_size: usize,
    /// Title Jaccard threshold for the deterministic merge fallback.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Extra attempts after a transient completion failure.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_units_per_run: default_max_units(),
            grouping_batch_size: default_grouping_batch_size(),
            grouping_min_batch: default_grouping_min_batch(),
            sample_titles_per_cluster: default_sample_titles(),
            prioritizer_batch_size: default_prioritizer_batch_size(),
            consolidator_batch_size: default_consolidator_batch_size(),
            similarity_threshold: default_similarity_threshold(),
            transient_retries: default_transient_retries(),
        }
    }
}

fn default_max_workers() -> usize {
    8
}

fn default_max_units() -> usize {
    500
}

fn default_grouping_batch_size() -> usize {
    150
}

fn default_grouping_min_batch() -> usize {
    5
}

fn default_sample_titles() -> usize {
    30
}

fn default_prioritizer_batch_size() -> usize {
    60
}

fn default_consolidator_batch_size() -> usize {
    80
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_transient_retries() -> u32 {
    2
}

// =============================================================================
// Domain enums
// =============================================================================

/// Cluster priority. `P1` is the highest tier, `P3` the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "P1")]
    P1,
    #[serde(rename = "P2")]
    P2,
    #[serde(rename = "P3")]
    P3,
    #[serde(rename = "IRRELEVANT")]
    Irrelevant,
    #[serde(rename = "NEEDS_REVIEW")]
    NeedsReview,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::Irrelevant => "IRRELEVANT",
            Priority::NeedsReview => "NEEDS_REVIEW",
        }
    }

    /// Strict parse of the stored representation.
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "P1" => Some(Priority::P1),
            "P2" => Some(Priority::P2),
            "P3" => Some(Priority::P3),
            "IRRELEVANT" => Some(Priority::Irrelevant),
            "NEEDS_REVIEW" => Some(Priority::NeedsReview),
            _ => None,
        }
    }

    /// Tolerant parse of a model-proposed value ("p1", "1", "Priority 2", "irrelevant").
    /// NEEDS_REVIEW is never accepted from a model; it is a pipeline sentinel.
    pub fn parse_proposed(s: &str) -> Option<Self> {
        let cleaned: String = s
            .trim()
            .to_uppercase()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .collect();
        let cleaned = cleaned.strip_prefix("PRIORITY").unwrap_or(&cleaned);
        match cleaned {
            "P1" | "1" => Some(Priority::P1),
            "P2" | "2" => Some(Priority::P2),
            "P3" | "3" => Some(Priority::P3),
            "IRRELEVANT" | "IRRELEVANTE" => Some(Priority::Irrelevant),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    ReadyToGroup,
    Processed,
    Irrelevant,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::ReadyToGroup => "ready_to_group",
            RecordStatus::Processed => "processed",
            RecordStatus::Irrelevant => "irrelevant",
            RecordStatus::Error => "error",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "ready_to_group" => Some(RecordStatus::ReadyToGroup),
            "processed" => Some(RecordStatus::Processed),
            "irrelevant" => Some(RecordStatus::Irrelevant),
            "error" => Some(RecordStatus::Error),
            _ => None,
        }
    }
}

/// Lifecycle of an event cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Active,
    Archived,
    Discarded,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Active => "active",
            ClusterStatus::Archived => "archived",
            ClusterStatus::Discarded => "discarded",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ClusterStatus::Active),
            "archived" => Some(ClusterStatus::Archived),
            "discarded" => Some(ClusterStatus::Discarded),
            _ => None,
        }
    }
}

/// Stage selector of the run surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Group,
    Classify,
    Consolidate,
    All,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Group => "group",
            Stage::Classify => "classify",
            Stage::Consolidate => "consolidate",
            Stage::All => "all",
        }
    }

    /// Whether `self` as a selector includes `stage`.
    pub fn includes(&self, stage: Stage) -> bool {
        *self == Stage::All || *self == stage
    }
}

/// How stage 2 assigns records to clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingMode {
    /// Attach to the day's existing clusters; cold-starts with the batch grouper
    /// when the day has none yet.
    Incremental,
    /// Group the whole ready set from scratch.
    FullBatch,
}
