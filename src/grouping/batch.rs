//! Cold-start grouping: form clusters from the ready set with no prior context.

use serde_json::Value;

use crate::completion::Completion;
use crate::db::{DbRecord, DeskDb};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::prompts::build_batch_grouping_prompt;

use super::{
    attach_one, create_with_records, record_lines, reply_items, request_grouping,
    run_split_ladder, value_as_id, DecisionGuard, GroupingReport, ThemeGroups, ThemeIndex,
};

pub fn group_batch(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    records: &[DbRecord],
) -> Result<GroupingReport, PipelineError> {
    // Themes seen earlier in this run; a later batch reusing one joins that cluster.
    let mut themes = ThemeIndex::default();
    let mut report = GroupingReport {
        records_considered: records.len(),
        ..Default::default()
    };
    run_split_ladder(
        records,
        ctx.pipeline.grouping_batch_size,
        ctx.pipeline.grouping_min_batch,
        &mut report,
        &mut |batch, report| form_clusters(db, completion, ctx, &mut themes, batch, report),
    )?;
    Ok(report)
}

fn form_clusters(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    themes: &mut ThemeIndex,
    batch: &[DbRecord],
    report: &mut GroupingReport,
) -> Result<(), PipelineError> {
    let lines = record_lines(batch);
    let value = request_grouping(completion, ctx, batch, |attempt| {
        build_batch_grouping_prompt(&lines, attempt)
    })?;
    let clusters = reply_items(&value, "clusters")?;

    let mut guard = DecisionGuard::new(batch);
    let mut groups = ThemeGroups::default();
    for cluster in clusters {
        let theme = cluster.get("theme").and_then(Value::as_str).unwrap_or("");
        let ids = match cluster.get("record_ids") {
            Some(Value::Array(ids)) => ids.as_slice(),
            _ => {
                report.discarded_decisions += 1;
                continue;
            }
        };
        for id_value in ids {
            match value_as_id(id_value) {
                Some(record_id) if guard.admit(record_id) => {
                    if !groups.push(theme, record_id) {
                        report.discarded_decisions += 1;
                    }
                }
                _ => {
                    log::debug!("Grouping: discarding record id {} from batch reply", id_value);
                    report.discarded_decisions += 1;
                }
            }
        }
    }

    for (theme, record_ids) in groups.into_groups() {
        if let Some(cluster_id) = themes.get(&theme) {
            for record_id in record_ids {
                if attach_one(db, record_id, cluster_id)? {
                    report.attached += 1;
                }
            }
            continue;
        }
        if let Some((cluster_id, attached)) = create_with_records(db, &ctx.day, &theme, &record_ids)? {
            themes.insert(&theme, cluster_id);
            report.clusters_created += 1;
            report.attached += attached;
        }
    }
    Ok(())
}
