//! Stage 2: assign ready records to event clusters.
//!
//! Both groupers send records in batches and share the same failure ladder:
//! a batch whose reply cannot be repaired (or whose call keeps failing) is
//! halved and each half retried, down to the configured floor. A batch that
//! fails below the floor is skipped and its records stay `ready_to_group`
//! for the next run.

pub mod batch;
pub mod incremental;

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::completion::{generate_with_retry, Completion, GenerationOptions};
use crate::db::{DbRecord, DeskDb};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::prompts::RecordLine;
use crate::repair::{repair_with, structural_ladder};
use crate::types::{GroupingMode, RecordStatus};
use crate::util::normalize_title;

/// Aggregate result of a grouping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingReport {
    pub records_considered: usize,
    pub attached: usize,
    pub clusters_created: usize,
    /// Completion requests sent, including retried halves.
    pub batches_sent: usize,
    pub skipped_batches: usize,
    pub skipped_records: usize,
    /// Decisions thrown away by validation (unknown ids, duplicates).
    pub discarded_decisions: usize,
}

impl GroupingReport {
    /// Record ownership changes made by this pass.
    pub fn mutations(&self) -> usize {
        self.attached + self.clusters_created
    }
}

/// Run stage 2 for the context's day.
///
/// Incremental mode falls back to the batch grouper when the day has no
/// active clusters yet.
pub fn run_grouping(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    mode: GroupingMode,
    limit: usize,
) -> Result<GroupingReport, PipelineError> {
    let records = db.records_by_status(RecordStatus::ReadyToGroup, limit)?;
    if records.is_empty() {
        log::info!("Grouping: nothing ready to group");
        return Ok(GroupingReport::default());
    }

    let report = match mode {
        GroupingMode::FullBatch => batch::group_batch(db, completion, ctx, &records)?,
        GroupingMode::Incremental => {
            if db.active_clusters_for_day(&ctx.day)?.is_empty() {
                log::info!("Grouping: no clusters for {} yet, using batch grouping", ctx.day);
                batch::group_batch(db, completion, ctx, &records)?
            } else {
                incremental::group_incremental(db, completion, ctx, &records)?
            }
        }
    };

    log::info!(
        "Grouping: {} records, {} attached, {} new clusters, {} batches skipped ({} records), {} decisions discarded",
        report.records_considered,
        report.attached,
        report.clusters_created,
        report.skipped_batches,
        report.skipped_records,
        report.discarded_decisions
    );
    Ok(report)
}

pub(crate) fn grouping_options() -> GenerationOptions {
    GenerationOptions::default()
        .with_temperature(0.1)
        .with_max_output_tokens(8192)
}

/// Process `records` in chunks of `batch_size`, halving failing chunks.
///
/// `process` returns Err for a failed batch. Store errors are not batch
/// failures and abort the whole pass.
pub(crate) fn run_split_ladder<F>(
    records: &[DbRecord],
    batch_size: usize,
    floor: usize,
    report: &mut GroupingReport,
    process: &mut F,
) -> Result<(), PipelineError>
where
    F: FnMut(&[DbRecord], &mut GroupingReport) -> Result<(), PipelineError>,
{
    for chunk in records.chunks(batch_size.max(1)) {
        process_with_split(chunk, floor.max(1), report, process)?;
    }
    Ok(())
}

fn process_with_split<F>(
    batch: &[DbRecord],
    floor: usize,
    report: &mut GroupingReport,
    process: &mut F,
) -> Result<(), PipelineError>
where
    F: FnMut(&[DbRecord], &mut GroupingReport) -> Result<(), PipelineError>,
{
    report.batches_sent += 1;
    match process(batch, report) {
        Ok(()) => Ok(()),
        Err(e @ PipelineError::Store(_)) => Err(e),
        Err(e) => {
            let half = batch.len() / 2;
            if half >= floor {
                log::warn!(
                    "Grouping: batch of {} failed ({}), splitting into halves",
                    batch.len(),
                    e.kind()
                );
                let (left, right) = batch.split_at(half);
                process_with_split(left, floor, report, process)?;
                process_with_split(right, floor, report, process)
            } else {
                log::warn!(
                    "Grouping: skipping batch of {} records starting at {}: {}",
                    batch.len(),
                    batch.first().map(|r| r.id).unwrap_or_default(),
                    e
                );
                report.skipped_batches += 1;
                report.skipped_records += batch.len();
                Ok(())
            }
        }
    }
}

/// Send one grouping prompt and repair its reply into a JSON value.
///
/// Only the structural repair layers apply here: a partial priority/tag
/// record is no use to a grouper, so anything short of real structure is a
/// batch failure.
pub(crate) fn request_grouping(
    completion: &dyn Completion,
    ctx: &RunContext,
    batch: &[DbRecord],
    build_prompt: impl FnMut(u32) -> String,
) -> Result<Value, PipelineError> {
    let reply = generate_with_retry(
        completion,
        ctx.pipeline.transient_retries,
        &grouping_options(),
        build_prompt,
    )?;
    match repair_with(&reply, &structural_ladder()) {
        Ok(repaired) => Ok(repaired.value),
        Err(unrecoverable) => {
            let unit = format!(
                "batch-{}-{}",
                batch.first().map(|r| r.id).unwrap_or_default(),
                batch.len()
            );
            crate::audit::record_unrecoverable(ctx.audit_dir.as_deref(), "group", &unit, &reply);
            Err(PipelineError::MalformedOutput(unrecoverable.to_string()))
        }
    }
}

/// Pull the list under `key`, accepting a bare top-level array as well.
pub(crate) fn reply_items<'a>(value: &'a Value, key: &str) -> Result<&'a [Value], PipelineError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => match map.get(key) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(PipelineError::MalformedOutput(format!("reply has no '{}' list", key))),
        },
        _ => Err(PipelineError::MalformedOutput("reply is not an object".to_string())),
    }
}

/// Integer id from a number or a numeric string.
pub(crate) fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().trim_start_matches('#').parse().ok(),
        _ => None,
    }
}

pub(crate) fn record_lines(batch: &[DbRecord]) -> Vec<RecordLine> {
    batch
        .iter()
        .map(|r| RecordLine {
            id: r.id,
            title: r.display_title().to_string(),
        })
        .collect()
}

/// Tracks which batch records already received a decision.
pub(crate) struct DecisionGuard {
    allowed: HashSet<i64>,
    decided: HashSet<i64>,
}

impl DecisionGuard {
    pub fn new(batch: &[DbRecord]) -> Self {
        Self {
            allowed: batch.iter().map(|r| r.id).collect(),
            decided: HashSet::new(),
        }
    }

    /// True the first time an in-batch record is seen.
    pub fn admit(&mut self, record_id: i64) -> bool {
        self.allowed.contains(&record_id) && self.decided.insert(record_id)
    }
}

/// Clusters keyed by normalized title, so equal themes land in one cluster.
#[derive(Default)]
pub(crate) struct ThemeIndex {
    by_theme: HashMap<String, i64>,
}

impl ThemeIndex {
    pub fn insert(&mut self, title: &str, cluster_id: i64) {
        let key = normalize_title(title);
        if !key.is_empty() {
            self.by_theme.entry(key).or_insert(cluster_id);
        }
    }

    pub fn get(&self, title: &str) -> Option<i64> {
        self.by_theme.get(&normalize_title(title)).copied()
    }
}

/// New-cluster proposals of one batch, merged by normalized theme.
#[derive(Default)]
pub(crate) struct ThemeGroups {
    order: Vec<String>,
    groups: HashMap<String, (String, Vec<i64>)>,
}

impl ThemeGroups {
    pub fn push(&mut self, theme: &str, record_id: i64) -> bool {
        let key = normalize_title(theme);
        if key.is_empty() {
            return false;
        }
        let entry = self.groups.entry(key.clone()).or_insert_with(|| {
            self.order.push(key);
            (theme.trim().to_string(), Vec::new())
        });
        entry.1.push(record_id);
        true
    }

    /// (display theme, record ids) in first-seen order.
    pub fn into_groups(mut self) -> Vec<(String, Vec<i64>)> {
        self.order
            .iter()
            .filter_map(|key| self.groups.remove(key))
            .collect()
    }
}

/// Attach one record to an existing cluster in its own transaction.
pub(crate) fn attach_one(db: &DeskDb, record_id: i64, cluster_id: i64) -> Result<bool, PipelineError> {
    let attached = db.with_transaction(|tx| {
        let ok = tx.attach_record(record_id, cluster_id)?;
        if ok {
            tx.refresh_record_count(cluster_id)?;
            tx.set_needs_classification(cluster_id, true)?;
        }
        Ok::<_, crate::db::DbError>(ok)
    })?;
    Ok(attached)
}

/// Create a cluster for `theme` holding the still-unowned records among
/// `record_ids`. Returns None when none of them can be attached any more.
pub(crate) fn create_with_records(
    db: &DeskDb,
    day: &str,
    theme: &str,
    record_ids: &[i64],
) -> Result<Option<(i64, usize)>, PipelineError> {
    let created = db.with_transaction(|tx| {
        let mut attachable = Vec::new();
        for &id in record_ids {
            if let Some(r) = tx.get_record(id)? {
                if r.status == RecordStatus::ReadyToGroup && r.cluster_id.is_none() {
                    attachable.push(id);
                }
            }
        }
        if attachable.is_empty() {
            return Ok::<_, crate::db::DbError>(None);
        }
        let cluster_id = tx.create_cluster(theme, day)?;
        let mut attached = 0;
        for id in attachable {
            if tx.attach_record(id, cluster_id)? {
                attached += 1;
            }
        }
        tx.refresh_record_count(cluster_id)?;
        Ok(Some((cluster_id, attached)))
    })?;
    Ok(created)
}
