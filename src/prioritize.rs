//! Executive review: reconsider the day's priorities side by side.
//!
//! Runs after classification. Proposals are corrected against the catalog
//! and pass through the same gates as the classifier before anything is
//! diffed, so a gated cluster cannot be promoted back.

use std::collections::HashMap;

use serde_json::Value;

use crate::classify::{apply_gates, gate_text, Classification};
use crate::completion::{generate_with_retry, Completion, GenerationOptions};
use crate::db::{ClusterField, DbCluster, DeskDb};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::grouping::value_as_id;
use crate::processor::normalize::{correct_priority, correct_tag};
use crate::prompts::{build_prioritizer_prompt, ClusterDigest};
use crate::repair::{repair_with, structural_ladder};
use crate::taxonomy::TAG_IRRELEVANT;
use crate::types::Priority;

const MOTIVE: &str = "executive review";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrioritizeReport {
    pub clusters_reviewed: usize,
    pub batches: usize,
    pub skipped_batches: usize,
    /// Clusters with at least one changed field.
    pub clusters_changed: usize,
    pub alterations: usize,
    pub discarded_entries: usize,
}

fn review_options() -> GenerationOptions {
    GenerationOptions::default()
        .with_temperature(0.1)
        .with_max_output_tokens(8192)
}

/// Clusters eligible for review: active, classified, not waiting on a human.
fn reviewable(clusters: Vec<DbCluster>) -> Vec<DbCluster> {
    clusters
        .into_iter()
        .filter(|c| !c.needs_classification)
        .filter(|c| matches!(c.priority, Some(p) if p != Priority::NeedsReview))
        .collect()
}

pub fn run_prioritizer(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
) -> Result<PrioritizeReport, PipelineError> {
    let clusters = reviewable(db.active_clusters_for_day(&ctx.day)?);
    let mut report = PrioritizeReport {
        clusters_reviewed: clusters.len(),
        ..Default::default()
    };
    if clusters.is_empty() {
        return Ok(report);
    }

    let tags = ctx.catalog.tag_names();
    for batch in clusters.chunks(ctx.pipeline.prioritizer_batch_size.max(1)) {
        report.batches += 1;
        let digests: Vec<ClusterDigest> = batch
            .iter()
            .map(|c| ClusterDigest {
                id: c.id,
                title: c.title.clone(),
                tag: c.tag.clone().unwrap_or_default(),
                priority: c.priority.map(|p| p.as_str().to_string()).unwrap_or_default(),
                record_count: c.record_count,
            })
            .collect();

        let reply = match generate_with_retry(
            completion,
            ctx.pipeline.transient_retries,
            &review_options(),
            |attempt| build_prioritizer_prompt(&digests, &tags, attempt),
        ) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Prioritize: skipping batch of {}: {}", batch.len(), e);
                report.skipped_batches += 1;
                continue;
            }
        };
        let value = match repair_with(&reply, &structural_ladder()) {
            Ok(repaired) => repaired.value,
            Err(e) => {
                let unit = format!("batch-{}-{}", batch[0].id, batch.len());
                crate::audit::record_unrecoverable(ctx.audit_dir.as_deref(), "prioritize", &unit, &reply);
                log::warn!("Prioritize: skipping batch of {}: {}", batch.len(), e);
                report.skipped_batches += 1;
                continue;
            }
        };

        let entries: &[Value] = match &value {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => match map.get("clusters") {
                Some(Value::Array(items)) => items.as_slice(),
                _ => &[],
            },
            _ => &[],
        };
        let by_id: HashMap<i64, &DbCluster> = batch.iter().map(|c| (c.id, c)).collect();
        let mut seen = std::collections::HashSet::new();

        for entry in entries {
            let Some(cluster) = entry
                .get("id")
                .and_then(value_as_id)
                .and_then(|id| by_id.get(&id).copied())
            else {
                report.discarded_entries += 1;
                continue;
            };
            if !seen.insert(cluster.id) {
                report.discarded_entries += 1;
                continue;
            }
            let changed = review_cluster(db, ctx, cluster, entry)?;
            if changed > 0 {
                report.clusters_changed += 1;
                report.alterations += changed;
            }
        }
    }

    log::info!(
        "Prioritize: {} clusters reviewed in {} batches, {} changed, {} batches skipped",
        report.clusters_reviewed,
        report.batches,
        report.clusters_changed,
        report.skipped_batches
    );
    Ok(report)
}

/// Apply one proposal. Returns the number of fields that actually changed.
fn review_cluster(
    db: &DeskDb,
    ctx: &RunContext,
    cluster: &DbCluster,
    entry: &Value,
) -> Result<usize, PipelineError> {
    let (Some(current_priority), current_tag) = (cluster.priority, cluster.tag.clone()) else {
        return Ok(0);
    };
    let members = db.records_for_cluster(cluster.id)?;
    let text = gate_text(&cluster.title, &members);

    let priority = correct_priority(entry.get("priority").and_then(Value::as_str))
        .unwrap_or(current_priority);
    let tag = match entry.get("tag").and_then(Value::as_str) {
        _ if priority == Priority::Irrelevant => TAG_IRRELEVANT.to_string(),
        Some(proposed) => correct_tag(Some(proposed), &text, &ctx.catalog).tag,
        None => current_tag.unwrap_or_else(|| ctx.catalog.default_tag.clone()),
    };
    let gated = apply_gates(
        Classification {
            priority,
            tag,
            confidence: None,
        },
        &text,
        &ctx.catalog,
    );
    let proposal = gated.classification;

    let changed = db.with_transaction(|tx| {
        let mut changed = 0;
        if tx.update_cluster_field(
            cluster.id,
            ClusterField::Priority,
            Some(proposal.priority.as_str()),
            MOTIVE,
            &ctx.run_id,
        )? {
            changed += 1;
        }
        if tx.update_cluster_field(cluster.id, ClusterField::Tag, Some(&proposal.tag), MOTIVE, &ctx.run_id)? {
            changed += 1;
        }
        Ok::<_, crate::db::DbError>(changed)
    })?;
    if changed > 0 {
        log::debug!(
            "Prioritize: cluster {} {} -> {} / {}",
            cluster.id,
            current_priority,
            proposal.priority,
            proposal.tag
        );
    }
    Ok(changed)
}
