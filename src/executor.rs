//! Pipeline run orchestration
//!
//! A run moves every stage forward once, in order:
//! - Stage 1: extract pending records (worker pool, one unit per record)
//! - Stage 2: group ready records into clusters (single-threaded)
//! - Stage 3: classify clusters (worker pool), then the executive review
//! - Stage 4: consolidate duplicate clusters (single-threaded)
//!
//! Each stage re-queries the store for its inputs, so an interrupted run is
//! resumed by running again. Unit failures are counted and logged; only
//! start-up failures abort a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::classify::classify_cluster;
use crate::completion::CompletionFactory;
use crate::consolidate::{run_consolidation, ConsolidationReport};
use crate::db::DeskDb;
use crate::error::PipelineError;
use crate::grouping::{run_grouping, GroupingReport};
use crate::pool::{run_units, worker_count, UnitFailure, UnitResult};
use crate::prioritize::{run_prioritizer, PrioritizeReport};
use crate::processor::process_record;
use crate::taxonomy::{loader, Catalog};
use crate::types::{Config, GroupingMode, PipelineConfig, RecordStatus, Stage};

/// Everything a stage needs besides its store and completion handles.
///
/// Built once per run and shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    /// Cluster day the run works on, `YYYY-MM-DD`.
    pub day: String,
    pub catalog: Catalog,
    pub pipeline: PipelineConfig,
    /// None disables the raw-output audit trail.
    pub audit_dir: Option<PathBuf>,
}

/// Caller-selected knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub stage: Stage,
    pub mode: GroupingMode,
    /// Overrides `pipeline.maxUnitsPerRun`.
    pub max_units: Option<usize>,
    /// Defaults to today (UTC).
    pub day: Option<String>,
    /// Overrides `pipeline.maxWorkers`.
    pub workers: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stage: Stage::All,
            mode: GroupingMode::Incremental,
            max_units: None,
            day: None,
            workers: None,
        }
    }
}

/// Outcome counts of a pooled stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitTally {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Units another run had already moved on.
    pub skipped: usize,
    /// Failure counts keyed by error kind.
    pub failures: BTreeMap<String, usize>,
}

impl UnitTally {
    fn count_failure(&mut self, kind: &str) {
        self.failed += 1;
        *self.failures.entry(kind.to_string()).or_default() += 1;
    }

    /// Input was non-empty and nothing succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.attempted > self.skipped && self.succeeded == 0
    }
}

/// Per-run aggregate, one entry per stage that ran.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub day: String,
    pub catalog_version: i64,
    pub extract: Option<UnitTally>,
    pub grouping: Option<GroupingReport>,
    pub classify: Option<UnitTally>,
    pub prioritize: Option<PrioritizeReport>,
    pub consolidate: Option<ConsolidationReport>,
    /// Stages aborted by a store error, with the error text.
    pub stage_errors: Vec<(String, String)>,
}

impl RunSummary {
    /// The run failed when stage 1 had work and got none of it done.
    pub fn is_failure(&self) -> bool {
        self.extract.as_ref().is_some_and(UnitTally::is_total_failure)
    }

    /// Human-readable lines for the run surface.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "run {} day {} (catalog v{})",
            self.run_id, self.day, self.catalog_version
        )];
        if let Some(t) = &self.extract {
            lines.push(tally_line("extract", t));
        }
        if let Some(g) = &self.grouping {
            lines.push(format!(
                "group: {} records, {} attached, {} new clusters, {} batches skipped ({} records)",
                g.records_considered, g.attached, g.clusters_created, g.skipped_batches, g.skipped_records
            ));
        }
        if let Some(t) = &self.classify {
            lines.push(tally_line("classify", t));
        }
        if let Some(p) = &self.prioritize {
            lines.push(format!(
                "review: {} clusters, {} changed, {} batches skipped",
                p.clusters_reviewed, p.clusters_changed, p.skipped_batches
            ));
        }
        if let Some(c) = &self.consolidate {
            lines.push(format!(
                "consolidate: {} merges ({} clusters discarded), {} rejected, fallback merged {} groups",
                c.merges_applied, c.clusters_discarded, c.merges_rejected, c.fallback.components_merged
            ));
        }
        for (stage, error) in &self.stage_errors {
            lines.push(format!("{} aborted: {}", stage, error));
        }
        lines
    }
}

fn tally_line(stage: &str, t: &UnitTally) -> String {
    let mut line = format!(
        "{}: {} units, {} ok, {} failed, {} skipped",
        stage, t.attempted, t.succeeded, t.failed, t.skipped
    );
    if !t.failures.is_empty() {
        let kinds: Vec<String> = t.failures.iter().map(|(k, n)| format!("{}={}", k, n)).collect();
        line.push_str(&format!(" [{}]", kinds.join(", ")));
    }
    line
}

/// Fold pooled results into a tally. `classify` maps a unit's value to
/// success, skip, or a failure kind.
fn tally<T>(results: Vec<UnitResult<T>>, stage: &str, classify: impl Fn(&T) -> UnitVerdict) -> UnitTally {
    let mut tally = UnitTally {
        attempted: results.len(),
        ..Default::default()
    };
    for (unit, result) in results {
        match result {
            Ok(value) => match classify(&value) {
                UnitVerdict::Success => tally.succeeded += 1,
                UnitVerdict::Skipped => tally.skipped += 1,
                UnitVerdict::Failed(kind) => tally.count_failure(kind),
            },
            Err(failure) => {
                log::warn!("{}: unit {} failed: {}", stage, unit, failure);
                let kind = match &failure {
                    UnitFailure::Error(e) => e.kind(),
                    UnitFailure::Panic(_) => "panic",
                    UnitFailure::NotRun(_) => "not_run",
                };
                tally.count_failure(kind);
            }
        }
    }
    tally
}

enum UnitVerdict {
    Success,
    Skipped,
    Failed(&'static str),
}

/// Run the selected stages once.
///
/// `db_path` is opened here for the single-threaded stages and again by
/// every pool worker.
pub fn run_pipeline(
    config: &Config,
    db_path: &Path,
    factory: &dyn CompletionFactory,
    options: &RunOptions,
) -> Result<RunSummary, PipelineError> {
    let db = DeskDb::open_at(db_path.to_path_buf())?;

    let audit_dir = crate::state::resolve_audit_dir(config).map_err(PipelineError::Config)?;
    let pruned = crate::audit::prune_audit_files(&audit_dir, config.audit_retention_days);
    if pruned > 0 {
        log::info!("Executor: pruned {} audit files", pruned);
    }

    loader::seed_if_empty(&db)?;
    let catalog = loader::load_snapshot(&db).map_err(PipelineError::Config)?;
    let client = factory
        .client()
        .map_err(|e| PipelineError::Config(e.to_string()))?;

    let ctx = RunContext {
        run_id: uuid::Uuid::new_v4().to_string(),
        day: options.day.clone().unwrap_or_else(crate::util::today),
        catalog,
        pipeline: config.pipeline.clone(),
        audit_dir: Some(audit_dir),
    };
    let max_units = options.max_units.unwrap_or(ctx.pipeline.max_units_per_run);
    let configured_workers = options.workers.unwrap_or(ctx.pipeline.max_workers);

    log::info!(
        "Executor: run {} starting (stage {}, day {}, catalog v{})",
        ctx.run_id,
        options.stage.as_str(),
        ctx.day,
        ctx.catalog.version
    );

    let mut summary = RunSummary {
        run_id: ctx.run_id.clone(),
        day: ctx.day.clone(),
        catalog_version: ctx.catalog.version,
        ..Default::default()
    };

    if options.stage.includes(Stage::Extract) {
        match db.record_ids_by_status(RecordStatus::Pending, max_units) {
            Ok(units) => {
                let workers = worker_count(configured_workers, units.len());
                log::info!("Executor: extracting {} records on {} workers", units.len(), workers);
                let results = run_units(db_path, factory, workers, units, |db, completion, id| {
                    process_record(db, completion, &ctx, id)
                });
                summary.extract = Some(tally(results, "Extract", |outcome| {
                    use crate::processor::ExtractOutcome;
                    match outcome {
                        ExtractOutcome::Ready | ExtractOutcome::Irrelevant(_) => UnitVerdict::Success,
                        ExtractOutcome::Skipped => UnitVerdict::Skipped,
                        ExtractOutcome::Invalid(_) => UnitVerdict::Failed("validation_failure"),
                        ExtractOutcome::Unrecoverable(_) => UnitVerdict::Failed("malformed_output"),
                    }
                }));
            }
            Err(e) => stage_failed(&mut summary, "extract", e.into()),
        }
    }

    if options.stage.includes(Stage::Group) {
        match run_grouping(&db, client.as_ref(), &ctx, options.mode, max_units) {
            Ok(report) => summary.grouping = Some(report),
            Err(e) => stage_failed(&mut summary, "group", e),
        }
    }

    if options.stage.includes(Stage::Classify) {
        match db.cluster_ids_needing_classification(&ctx.day, max_units) {
            Ok(units) => {
                let workers = worker_count(configured_workers, units.len());
                log::info!("Executor: classifying {} clusters on {} workers", units.len(), workers);
                let results = run_units(db_path, factory, workers, units, |db, completion, id| {
                    classify_cluster(db, completion, &ctx, id)
                });
                summary.classify = Some(tally(results, "Classify", |outcome| {
                    use crate::classify::ClassifyOutcome;
                    match outcome {
                        ClassifyOutcome::Classified { .. } | ClassifyOutcome::Irrelevant => UnitVerdict::Success,
                        ClassifyOutcome::Skipped => UnitVerdict::Skipped,
                        ClassifyOutcome::NeedsReview(_) => UnitVerdict::Failed("classification_ambiguous"),
                    }
                }));
            }
            Err(e) => stage_failed(&mut summary, "classify", e.into()),
        }

        match run_prioritizer(&db, client.as_ref(), &ctx) {
            Ok(report) => summary.prioritize = Some(report),
            Err(e) => stage_failed(&mut summary, "prioritize", e),
        }
    }

    if options.stage.includes(Stage::Consolidate) {
        match run_consolidation(&db, client.as_ref(), &ctx) {
            Ok(report) => summary.consolidate = Some(report),
            Err(e) => stage_failed(&mut summary, "consolidate", e),
        }
    }

    log::info!(
        "Executor: run {} finished with {} alterations",
        ctx.run_id,
        db.count_alterations_for_run(&ctx.run_id).unwrap_or(0)
    );
    Ok(summary)
}

fn stage_failed(summary: &mut RunSummary, stage: &str, error: PipelineError) {
    log::error!("Executor: {} stage aborted: {}", stage, error);
    summary.stage_errors.push((stage.to_string(), error.to_string()));
}

// =============================================================================
// Shared test utilities
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_utils::ScriptedCompletion;
    use crate::db::test_utils::{raw, test_db_path};
    use crate::prompts::{
        HEADER_CLASSIFY, HEADER_CONSOLIDATE, HEADER_GROUP_BATCH, HEADER_PRIORITIZE, HEADER_SUMMARY,
    };
    use crate::types::{ClusterStatus, Priority};

    fn test_config() -> Config {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.audit_dir = Some(dir.path().join("_audit"));
        std::mem::forget(dir);
        config
    }

    /// Pull `(id, title)` pairs out of a grouping prompt's record lines.
    fn prompt_records(prompt: &str) -> Vec<(i64, String)> {
        prompt
            .lines()
            .map(|l| l.trim_start_matches("<user_data>"))
            .filter_map(|l| l.strip_prefix("- ["))
            .filter_map(|l| {
                let (id, title) = l.split_once("] ")?;
                Some((id.parse().ok()?, title.trim_end_matches("</user_data>").to_string()))
            })
            .collect()
    }

    fn desk_fake() -> std::sync::Arc<ScriptedCompletion> {
        let fake = ScriptedCompletion::new();
        fake.on(HEADER_GROUP_BATCH, |prompt| {
            let mut merger = Vec::new();
            let mut clusters = Vec::new();
            for (id, title) in prompt_records(prompt) {
                if title.to_lowercase().contains("merger") {
                    merger.push(id);
                } else {
                    clusters.push(serde_json::json!({"theme": title, "record_ids": [id]}));
                }
            }
            if !merger.is_empty() {
                clusters.push(serde_json::json!({"theme": "Acme and Beta merger", "record_ids": merger}));
            }
            Ok(serde_json::json!({ "clusters": clusters }).to_string())
        });
        fake.on(HEADER_CLASSIFY, |prompt| {
            let reply = if prompt.contains("Delta") {
                r#"{"items": [{"priority": "P3", "tag": "Corporate", "confidence": 0.7}]}"#
            } else {
                r#"{"items": [{"priority": "P1", "tag": "M&A", "confidence": 0.9}]}"#
            };
            Ok(reply.into())
        });
        fake.on(HEADER_SUMMARY, |_| Ok(r#"{"summary": "Desk summary."}"#.into()));
        fake.on(HEADER_PRIORITIZE, |_| Ok(r#"{"clusters": []}"#.into()));
        fake.on(HEADER_CONSOLIDATE, |_| Ok(r#"{"actions": []}"#.into()));
        fake
    }

    #[test]
    fn test_end_to_end_merger_cluster_and_gate() {
        let db_path = test_db_path();
        let db = DeskDb::open_at(db_path.clone()).unwrap();
        for (title, text) in [
            ("Acme and Beta announce merger", "Acme and Beta agreed to merge in an all-stock deal."),
            ("Acme-Beta merger wins board approval", "Boards of Acme and Beta approved the merger."),
            ("Analysts weigh Acme Beta merger", "Analysts see synergies from the merger of Acme and Beta."),
            ("Gamma shares jump after upbeat forecast", "Gamma Corp shares rose 12% on Tuesday."),
            ("Delta bank opens new branch", "Delta opened a branch in Recife."),
        ] {
            db.insert_raw_record(&raw(title, text)).unwrap();
        }

        let fake = desk_fake();
        let options = RunOptions {
            day: Some("2024-03-15".to_string()),
            workers: Some(2),
            ..Default::default()
        };
        let summary = run_pipeline(&test_config(), &db_path, &fake, &options).unwrap();

        assert!(!summary.is_failure());
        assert_eq!(summary.extract.as_ref().unwrap().succeeded, 5);
        assert_eq!(summary.grouping.as_ref().unwrap().clusters_created, 3);
        assert_eq!(summary.classify.as_ref().unwrap().succeeded, 3);
        assert!(summary.stage_errors.is_empty());

        let clusters = db.active_clusters_for_day("2024-03-15").unwrap();
        assert_eq!(clusters.len(), 3);
        let merger = clusters.iter().find(|c| c.record_count == 3).expect("merger cluster");
        assert_eq!(merger.priority, Some(Priority::P1));
        assert_eq!(merger.tag.as_deref(), Some("M&A"));

        let gamma = clusters
            .iter()
            .find(|c| c.title.contains("Gamma"))
            .expect("gamma cluster");
        assert_eq!(gamma.priority, Some(Priority::P3));
        assert_eq!(gamma.tag.as_deref(), Some("M&A"));
        assert!(clusters.iter().all(|c| c.status == ClusterStatus::Active));

        let counts = db.record_status_counts().unwrap();
        assert_eq!(counts, vec![("processed".to_string(), 5)]);
    }

    #[test]
    fn test_rerun_is_a_no_op() {
        let db_path = test_db_path();
        let db = DeskDb::open_at(db_path.clone()).unwrap();
        db.insert_raw_record(&raw("Delta bank opens new branch", "Delta opened a branch."))
            .unwrap();
        let fake = desk_fake();
        let options = RunOptions {
            day: Some("2024-03-15".to_string()),
            ..Default::default()
        };
        let config = test_config();
        run_pipeline(&config, &db_path, &fake, &options).unwrap();
        let calls = fake.call_count(HEADER_CLASSIFY);

        let second = run_pipeline(&config, &db_path, &fake, &options).unwrap();
        assert_eq!(second.extract.as_ref().unwrap().attempted, 0);
        assert!(!second.is_failure());
        assert_eq!(second.grouping.as_ref().unwrap().mutations(), 0);
        assert_eq!(fake.call_count(HEADER_CLASSIFY), calls);
        assert_eq!(db.count_alterations_for_run(&second.run_id).unwrap(), 0);
    }

    #[test]
    fn test_stage_selection_runs_only_extract() {
        let db_path = test_db_path();
        let db = DeskDb::open_at(db_path.clone()).unwrap();
        db.insert_raw_record(&raw("Delta bank opens new branch", "Delta opened a branch."))
            .unwrap();
        let fake = desk_fake();
        let options = RunOptions {
            stage: Stage::Extract,
            ..Default::default()
        };
        let summary = run_pipeline(&test_config(), &db_path, &fake, &options).unwrap();
        assert!(summary.grouping.is_none());
        assert!(summary.consolidate.is_none());
        assert_eq!(fake.call_count(HEADER_GROUP_BATCH), 0);
        assert_eq!(
            db.record_status_counts().unwrap(),
            vec![("ready_to_group".to_string(), 1)]
        );
    }

    #[test]
    fn test_failure_only_when_stage_one_gets_nothing_done() {
        let mut tally = UnitTally::default();
        assert!(!tally.is_total_failure());

        tally.attempted = 3;
        tally.count_failure("malformed_output");
        tally.count_failure("malformed_output");
        tally.count_failure("panic");
        assert!(tally.is_total_failure());
        assert_eq!(tally.failures["malformed_output"], 2);

        tally.succeeded = 1;
        assert!(!tally.is_total_failure());

        let summary = RunSummary {
            extract: Some(UnitTally {
                attempted: 2,
                failed: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(summary.is_failure());
        assert!(!RunSummary::default().is_failure());
    }

    #[test]
    fn test_pool_stage_records_panics_and_errors() {
        let results: Vec<UnitResult<bool>> = vec![
            (1, Ok(true)),
            (2, Ok(false)),
            (3, Err(UnitFailure::Panic("boom".into()))),
            (4, Err(UnitFailure::Error(PipelineError::MalformedOutput("x".into())))),
        ];
        let t = tally(results, "Test", |ok| {
            if *ok {
                UnitVerdict::Success
            } else {
                UnitVerdict::Skipped
            }
        });
        assert_eq!((t.attempted, t.succeeded, t.skipped, t.failed), (4, 1, 1, 2));
        assert_eq!(t.failures["panic"], 1);
        assert_eq!(t.failures["malformed_output"], 1);
    }
}
