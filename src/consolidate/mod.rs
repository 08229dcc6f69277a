//! Stage 4: find and merge duplicate clusters.
//!
//! Layer A sends the day's relevant clusters to the completion endpoint and
//! applies the merges it suggests, after validating each one against the
//! batch. Layer B (`fallback`) then merges near-identical P3 titles
//! deterministically.

pub mod fallback;

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::classify::{apply_gates, gate_text, Classification};
use crate::completion::{generate_with_retry, Completion, GenerationOptions};
use crate::db::{ClusterField, DbCluster, DbError, DeskDb};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::grouping::value_as_id;
use crate::processor::normalize::{correct_priority, correct_tag};
use crate::prompts::{build_consolidation_prompt, ConsolidationItem};
use crate::repair::{repair_with, structural_ladder};
use crate::types::Priority;
use crate::util::normalize_title;

pub use fallback::{run_fallback, FallbackReport};

const MOTIVE: &str = "duplicate consolidation";
const SAMPLE_TITLES: usize = 3;

/// A merge suggestion that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSuggestion {
    pub destination: i64,
    pub sources: Vec<i64>,
    pub title: Option<String>,
    pub tag: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub clusters_considered: usize,
    pub batches: usize,
    pub skipped_batches: usize,
    pub merges_applied: usize,
    pub clusters_discarded: usize,
    pub merges_rejected: usize,
    pub fallback: FallbackReport,
}

fn consolidation_options() -> GenerationOptions {
    GenerationOptions::default()
        .with_temperature(0.1)
        .with_max_output_tokens(4096)
}

/// Check one `merge` object against the ids present in its batch.
pub fn validate_merge(merge: &Value, batch_ids: &HashSet<i64>) -> Result<MergeSuggestion, PipelineError> {
    let destination = merge
        .get("destination")
        .and_then(value_as_id)
        .ok_or_else(|| PipelineError::MergeConflict("missing destination".to_string()))?;
    let sources: Vec<i64> = match merge.get("sources") {
        Some(Value::Array(items)) => items.iter().map(value_as_id).collect::<Option<Vec<_>>>().ok_or_else(
            || PipelineError::MergeConflict(format!("non-numeric source for destination {}", destination)),
        )?,
        _ => Vec::new(),
    };

    if sources.is_empty() {
        return Err(PipelineError::MergeConflict(format!(
            "merge into {} lists no sources",
            destination
        )));
    }
    if sources.contains(&destination) {
        return Err(PipelineError::MergeConflict(format!(
            "cluster {} listed as its own source",
            destination
        )));
    }
    if let Some(unknown) = std::iter::once(&destination)
        .chain(sources.iter())
        .find(|id| !batch_ids.contains(*id))
    {
        return Err(PipelineError::MergeConflict(format!(
            "cluster {} is not part of this batch",
            unknown
        )));
    }

    let mut unique = Vec::with_capacity(sources.len());
    for id in sources {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    let text = |key: &str| {
        merge
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Ok(MergeSuggestion {
        destination,
        sources: unique,
        title: text("title"),
        tag: text("tag"),
        priority: text("priority"),
    })
}

/// Run Layer A then Layer B for the context's day.
pub fn run_consolidation(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
) -> Result<ConsolidationReport, PipelineError> {
    let clusters: Vec<DbCluster> = db
        .active_clusters_for_day(&ctx.day)?
        .into_iter()
        .filter(|c| c.priority != Some(Priority::Irrelevant))
        .collect();
    let mut report = ConsolidationReport {
        clusters_considered: clusters.len(),
        ..Default::default()
    };

    if clusters.len() >= 2 {
        for batch in clusters.chunks(ctx.pipeline.consolidator_batch_size.max(1)) {
            report.batches += 1;
            consolidate_batch(db, completion, ctx, batch, &mut report)?;
        }
    }

    report.fallback = run_fallback(db, ctx)?;
    log::info!(
        "Consolidate: {} merges applied ({} clusters discarded), {} rejected, {} batches skipped; fallback merged {} groups",
        report.merges_applied,
        report.clusters_discarded,
        report.merges_rejected,
        report.skipped_batches,
        report.fallback.components_merged
    );
    Ok(report)
}

fn consolidate_batch(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    batch: &[DbCluster],
    report: &mut ConsolidationReport,
) -> Result<(), PipelineError> {
    let mut items = Vec::with_capacity(batch.len());
    for c in batch {
        items.push(ConsolidationItem {
            id: c.id,
            title: normalize_title(&c.title),
            tag: c.tag.clone().unwrap_or_default(),
            priority: c.priority.map(|p| p.as_str().to_string()).unwrap_or_default(),
            sample_titles: db.sample_member_titles(c.id, SAMPLE_TITLES)?,
        });
    }

    let reply = match generate_with_retry(
        completion,
        ctx.pipeline.transient_retries,
        &consolidation_options(),
        |attempt| build_consolidation_prompt(&items, attempt),
    ) {
        Ok(reply) => reply,
        Err(e) => {
            log::warn!("Consolidate: skipping batch of {}: {}", batch.len(), e);
            report.skipped_batches += 1;
            return Ok(());
        }
    };
    let value = match repair_with(&reply, &structural_ladder()) {
        Ok(repaired) => repaired.value,
        Err(e) => {
            let unit = format!("batch-{}-{}", batch[0].id, batch.len());
            crate::audit::record_unrecoverable(ctx.audit_dir.as_deref(), "consolidate", &unit, &reply);
            log::warn!("Consolidate: skipping batch of {}: {}", batch.len(), e);
            report.skipped_batches += 1;
            return Ok(());
        }
    };

    let actions: &[Value] = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("actions") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => {
                log::warn!("Consolidate: skipping batch of {}: reply has no actions list", batch.len());
                report.skipped_batches += 1;
                return Ok(());
            }
        },
        _ => {
            log::warn!("Consolidate: skipping batch of {}: reply is not an object or list", batch.len());
            report.skipped_batches += 1;
            return Ok(());
        }
    };
    let batch_ids: HashSet<i64> = batch.iter().map(|c| c.id).collect();
    let by_id: HashMap<i64, &DbCluster> = batch.iter().map(|c| (c.id, c)).collect();

    for action in actions {
        let Some(merge) = action.get("merge") else {
            continue;
        };
        let suggestion = match validate_merge(merge, &batch_ids) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Consolidate: {}", e);
                report.merges_rejected += 1;
                continue;
            }
        };
        match apply_merge(db, ctx, &suggestion, by_id.get(&suggestion.destination).copied()) {
            Ok(discarded) => {
                report.merges_applied += 1;
                report.clusters_discarded += discarded;
            }
            Err(PipelineError::MergeConflict(reason)) => {
                log::warn!("Consolidate: merge into {} rejected: {}", suggestion.destination, reason);
                report.merges_rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Merge and restamp the destination in one transaction.
fn apply_merge(
    db: &DeskDb,
    ctx: &RunContext,
    suggestion: &MergeSuggestion,
    destination: Option<&DbCluster>,
) -> Result<usize, PipelineError> {
    let result = db.with_transaction(|tx| -> Result<usize, DbError> {
        let outcome = tx.merge_clusters(suggestion.destination, &suggestion.sources, MOTIVE, &ctx.run_id)?;

        if let Some(title) = &suggestion.title {
            tx.update_cluster_field(suggestion.destination, ClusterField::Title, Some(title), MOTIVE, &ctx.run_id)?;
        }

        let current_priority = destination.and_then(|d| d.priority);
        let proposed_priority = suggestion.priority.as_deref().and_then(|p| correct_priority(Some(p)));
        if suggestion.tag.is_some() || proposed_priority.is_some() {
            let members = tx.records_for_cluster(suggestion.destination)?;
            let title = suggestion
                .title
                .as_deref()
                .or(destination.map(|d| d.title.as_str()))
                .unwrap_or("");
            let text = gate_text(title, &members);
            let tag = match &suggestion.tag {
                Some(t) => correct_tag(Some(t), &text, &ctx.catalog).tag,
                None => destination
                    .and_then(|d| d.tag.clone())
                    .unwrap_or_else(|| ctx.catalog.default_tag.clone()),
            };
            if let Some(priority) = proposed_priority.or(current_priority) {
                let gated = apply_gates(
                    Classification {
                        priority,
                        tag,
                        confidence: None,
                    },
                    &text,
                    &ctx.catalog,
                )
                .classification;
                tx.update_cluster_field(
                    suggestion.destination,
                    ClusterField::Priority,
                    Some(gated.priority.as_str()),
                    MOTIVE,
                    &ctx.run_id,
                )?;
                tx.update_cluster_field(suggestion.destination, ClusterField::Tag, Some(&gated.tag), MOTIVE, &ctx.run_id)?;
            } else {
                tx.update_cluster_field(suggestion.destination, ClusterField::Tag, Some(&tag), MOTIVE, &ctx.run_id)?;
            }
        }
        Ok(outcome.merged_sources.len())
    });

    match result {
        Ok(discarded) => {
            log::info!(
                "Consolidate: merged {:?} into {}",
                suggestion.sources,
                suggestion.destination
            );
            Ok(discarded)
        }
        Err(DbError::Integrity(reason)) => Err(PipelineError::MergeConflict(reason)),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_utils::ScriptedCompletion;
    use crate::db::test_utils::{raw, test_db};
    use crate::executor::test_utils::test_context;
    use crate::prompts::HEADER_CONSOLIDATE;
    use crate::types::{ClusterStatus, RecordStatus};

    fn cluster(db: &DeskDb, day: &str, title: &str, priority: Priority, tag: &str) -> i64 {
        let id = db.create_cluster(title, day).unwrap();
        let record = db
            .insert_raw_record(&raw(title, &format!("{} article {}", title, id)))
            .unwrap()
            .unwrap();
        db.set_record_status(record, RecordStatus::ReadyToGroup, None).unwrap();
        db.attach_record(record, id).unwrap();
        db.refresh_record_count(id).unwrap();
        db.update_cluster_field(id, ClusterField::Priority, Some(priority.as_str()), "setup", "r0")
            .unwrap();
        db.update_cluster_field(id, ClusterField::Tag, Some(tag), "setup", "r0").unwrap();
        db.set_needs_classification(id, false).unwrap();
        id
    }

    #[test]
    fn test_validate_merge_rejections() {
        let ids: HashSet<i64> = [1, 2, 3].into_iter().collect();
        let ok = validate_merge(&serde_json::json!({"destination": 1, "sources": [2, 2, 3]}), &ids).unwrap();
        assert_eq!(ok.sources, vec![2, 3]);

        for bad in [
            serde_json::json!({"destination": 1, "sources": [1, 2]}),
            serde_json::json!({"destination": 1, "sources": []}),
            serde_json::json!({"destination": 1}),
            serde_json::json!({"destination": 1, "sources": [9]}),
            serde_json::json!({"destination": 9, "sources": [1]}),
            serde_json::json!({"sources": [1]}),
        ] {
            let err = validate_merge(&bad, &ids).unwrap_err();
            assert_eq!(err.kind(), "merge_conflict");
        }
    }

    #[test]
    fn test_layer_a_merges_and_logs() {
        let db = test_db();
        let ctx = test_context();
        let a = cluster(&db, &ctx.day, "Acme agrees to buy Beta", Priority::P1, "M&A");
        let b = cluster(&db, &ctx.day, "Beta accepts Acme takeover offer", Priority::P2, "M&A");
        let c = cluster(&db, &ctx.day, "Copom holds Selic", Priority::P2, "Monetary Policy");
        let irrelevant = cluster(&db, &ctx.day, "Derby result", Priority::Irrelevant, "IRRELEVANT");

        let fake = ScriptedCompletion::new();
        fake.queue(
            HEADER_CONSOLIDATE,
            Ok(format!(
                r#"{{"actions": [
                    {{"merge": {{"destination": {a}, "sources": [{b}], "title": "Acme to acquire Beta"}}}},
                    {{"merge": {{"destination": {c}, "sources": [{c}]}}}},
                    {{"merge": {{"destination": {c}, "sources": [{irrelevant}]}}}},
                    {{"keep": {c}}}
                ]}}"#
            )),
        );

        let report = run_consolidation(&db, &fake.clone(), &ctx).unwrap();
        assert_eq!(report.clusters_considered, 3);
        assert_eq!(report.merges_applied, 1);
        assert_eq!(report.merges_rejected, 2);
        assert_eq!(report.clusters_discarded, 1);

        let prompt = &fake.prompts(HEADER_CONSOLIDATE)[0];
        assert!(!prompt.contains(&format!("[{}]", irrelevant)));

        let source = db.get_cluster(b).unwrap().unwrap();
        assert_eq!(source.status, ClusterStatus::Discarded);
        assert_eq!(source.merged_into, Some(a));
        let dest = db.get_cluster(a).unwrap().unwrap();
        assert_eq!(dest.title, "Acme to acquire Beta");
        assert_eq!(dest.record_count, 2);
        assert!(dest.needs_classification);

        let fields: Vec<String> = db
            .alterations_for_cluster(a)
            .unwrap()
            .into_iter()
            .filter(|e| e.run_id == ctx.run_id)
            .map(|e| e.field)
            .collect();
        assert_eq!(fields, vec!["cluster_id", "title"]);
    }

    #[test]
    fn test_reply_without_actions_skips_batch() {
        let db = test_db();
        let ctx = test_context();
        let a = cluster(&db, &ctx.day, "Acme agrees to buy Beta", Priority::P2, "M&A");
        cluster(&db, &ctx.day, "Copom holds Selic", Priority::P2, "Monetary Policy");

        let fake = ScriptedCompletion::new();
        fake.queue(HEADER_CONSOLIDATE, Ok(format!(r#"{{"keep": {a}}}"#)));

        let report = run_consolidation(&db, &fake.clone(), &ctx).unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.skipped_batches, 1);
        assert_eq!(report.merges_applied, 0);
        assert_eq!(report.merges_rejected, 0);
    }

    #[test]
    fn test_repeated_suggestion_is_idempotent() {
        let db = test_db();
        let ctx = test_context();
        let a = cluster(&db, &ctx.day, "Acme agrees to buy Beta", Priority::P1, "M&A");
        let b = cluster(&db, &ctx.day, "Beta accepts Acme deal", Priority::P2, "M&A");

        let suggestion = MergeSuggestion {
            destination: a,
            sources: vec![b],
            title: None,
            tag: None,
            priority: None,
        };
        assert_eq!(apply_merge(&db, &ctx, &suggestion, None).unwrap(), 1);
        assert_eq!(apply_merge(&db, &ctx, &suggestion, None).unwrap(), 0);
        assert_eq!(db.get_cluster(a).unwrap().unwrap().record_count, 2);
    }

    #[test]
    fn test_merge_into_discarded_destination_is_rejected() {
        let db = test_db();
        let ctx = test_context();
        let a = cluster(&db, &ctx.day, "One", Priority::P2, "Markets");
        let b = cluster(&db, &ctx.day, "Two", Priority::P2, "Markets");
        let c = cluster(&db, &ctx.day, "Three", Priority::P2, "Markets");

        let first = MergeSuggestion { destination: a, sources: vec![b], title: None, tag: None, priority: None };
        apply_merge(&db, &ctx, &first, None).unwrap();
        let second = MergeSuggestion { destination: b, sources: vec![c], title: None, tag: None, priority: None };
        let err = apply_merge(&db, &ctx, &second, None).unwrap_err();
        assert!(matches!(err, PipelineError::MergeConflict(_)));
        assert_eq!(db.get_cluster(c).unwrap().unwrap().status, ClusterStatus::Active);
    }

    #[test]
    fn test_proposed_priority_passes_gates() {
        let db = test_db();
        let ctx = test_context();
        let a = cluster(&db, &ctx.day, "Acme and Beta leaders meet", Priority::P2, "M&A");
        let b = cluster(&db, &ctx.day, "Acme Beta meeting", Priority::P3, "M&A");

        let suggestion = MergeSuggestion {
            destination: a,
            sources: vec![b],
            title: None,
            tag: Some("M&A".into()),
            priority: Some("P1".into()),
        };
        let dest = db.get_cluster(a).unwrap().unwrap();
        apply_merge(&db, &ctx, &suggestion, Some(&dest)).unwrap();
        assert_eq!(db.get_cluster(a).unwrap().unwrap().priority, Some(Priority::P3));
    }
}
