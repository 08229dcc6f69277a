//! Attach new records to the day's existing clusters, or open new ones.

use std::collections::HashSet;

use serde_json::Value;

use crate::completion::Completion;
use crate::db::{DbRecord, DeskDb};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::prompts::{build_incremental_grouping_prompt, ClusterContext};

use super::{
    attach_one, create_with_records, record_lines, reply_items, request_grouping,
    run_split_ladder, value_as_id, DecisionGuard, GroupingReport, ThemeGroups, ThemeIndex,
};

/// Clusters a batch may attach to. Grows as the run creates clusters.
struct Context {
    clusters: Vec<ClusterContext>,
    ids: HashSet<i64>,
    themes: ThemeIndex,
}

impl Context {
    fn add(&mut self, cluster: ClusterContext) {
        self.themes.insert(&cluster.title, cluster.id);
        self.ids.insert(cluster.id);
        self.clusters.push(cluster);
    }
}

pub fn group_incremental(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    records: &[DbRecord],
) -> Result<GroupingReport, PipelineError> {
    let mut context = Context {
        clusters: Vec::new(),
        ids: HashSet::new(),
        themes: ThemeIndex::default(),
    };
    for cluster in db.active_clusters_for_day(&ctx.day)? {
        let sample_titles =
            db.sample_member_titles(cluster.id, ctx.pipeline.sample_titles_per_cluster)?;
        context.add(ClusterContext {
            id: cluster.id,
            title: cluster.title,
            sample_titles,
        });
    }

    let mut report = GroupingReport {
        records_considered: records.len(),
        ..Default::default()
    };
    run_split_ladder(
        records,
        ctx.pipeline.grouping_batch_size,
        ctx.pipeline.grouping_min_batch,
        &mut report,
        &mut |batch, report| group_one_batch(db, completion, ctx, &mut context, batch, report),
    )?;
    Ok(report)
}

fn group_one_batch(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    context: &mut Context,
    batch: &[DbRecord],
    report: &mut GroupingReport,
) -> Result<(), PipelineError> {
    let lines = record_lines(batch);
    let value = request_grouping(completion, ctx, batch, |attempt| {
        build_incremental_grouping_prompt(&lines, &context.clusters, attempt)
    })?;
    let decisions = reply_items(&value, "decisions")?;

    let mut guard = DecisionGuard::new(batch);
    let mut attachments: Vec<(i64, i64)> = Vec::new();
    let mut new_themes = ThemeGroups::default();

    for decision in decisions {
        let Some(record_id) = decision.get("record_id").and_then(value_as_id) else {
            report.discarded_decisions += 1;
            continue;
        };
        if !guard.admit(record_id) {
            log::debug!("Grouping: discarding decision for record {} (outside batch or repeated)", record_id);
            report.discarded_decisions += 1;
            continue;
        }

        match decision.get("cluster_id").filter(|v| !v.is_null()) {
            Some(cluster_value) => match value_as_id(cluster_value) {
                Some(cluster_id) if context.ids.contains(&cluster_id) => {
                    attachments.push((record_id, cluster_id));
                }
                _ => {
                    log::warn!(
                        "Grouping: record {} points at unknown cluster {}, discarded",
                        record_id,
                        cluster_value
                    );
                    report.discarded_decisions += 1;
                }
            },
            None => {
                let theme = decision.get("new_theme").and_then(Value::as_str).unwrap_or("");
                if let Some(existing) = context.themes.get(theme) {
                    attachments.push((record_id, existing));
                } else if !new_themes.push(theme, record_id) {
                    report.discarded_decisions += 1;
                }
            }
        }
    }

    for (record_id, cluster_id) in attachments {
        if attach_one(db, record_id, cluster_id)? {
            report.attached += 1;
            if let Some(entry) = context.clusters.iter_mut().find(|c| c.id == cluster_id) {
                if let Some(r) = batch.iter().find(|r| r.id == record_id) {
                    entry.sample_titles.insert(0, r.display_title().to_string());
                    entry.sample_titles.truncate(ctx.pipeline.sample_titles_per_cluster);
                }
            }
        }
    }

    for (theme, record_ids) in new_themes.into_groups() {
        if let Some((cluster_id, attached)) = create_with_records(db, &ctx.day, &theme, &record_ids)? {
            report.clusters_created += 1;
            report.attached += attached;
            let sample_titles = batch
                .iter()
                .filter(|r| record_ids.contains(&r.id))
                .map(|r| r.display_title().to_string())
                .take(ctx.pipeline.sample_titles_per_cluster)
                .collect();
            context.add(ClusterContext {
                id: cluster_id,
                title: theme,
                sample_titles,
            });
        }
    }
    Ok(())
}
