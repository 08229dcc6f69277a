//! Stage 1 unit of work: turn one pending record into a groupable one.

use crate::completion::{generate_with_retry, Completion, GenerationOptions};
use crate::db::DeskDb;
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::prompts::build_extraction_prompt;
use crate::repair::{repair, Confidence};
use crate::types::RecordStatus;

use super::normalize::{normalize, DraftRecord, NormalizeOutcome};

/// What happened to one record.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    /// Normalized and waiting for a grouper.
    Ready,
    /// Promotional content, dropped without further work.
    Irrelevant(String),
    /// Marked `error`: empty after every fallback.
    Invalid(String),
    /// Marked `error`: the extraction reply could not be repaired.
    Unrecoverable(String),
    /// No longer pending (another run got to it first).
    Skipped,
}

impl ExtractOutcome {
    /// Ready and irrelevant records both count as handled.
    pub fn is_success(&self) -> bool {
        matches!(self, ExtractOutcome::Ready | ExtractOutcome::Irrelevant(_))
    }
}

fn extraction_options() -> GenerationOptions {
    GenerationOptions::default()
        .with_temperature(0.1)
        .with_max_output_tokens(8192)
}

/// Process one pending record.
///
/// A transient completion failure is returned as an error and leaves the
/// record `pending`, so the next run retries it.
pub fn process_record(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    record_id: i64,
) -> Result<ExtractOutcome, PipelineError> {
    let record = match db.get_record(record_id)? {
        Some(r) if r.status == RecordStatus::Pending => r,
        _ => return Ok(ExtractOutcome::Skipped),
    };

    let prefilter_text = format!("{} {}", record.title.as_deref().unwrap_or(""), record.raw_text);
    if let Some(marker) = ctx.catalog.promotional_marker(&prefilter_text) {
        let reason = format!("promotional: {}", marker);
        db.set_record_status(record_id, RecordStatus::Irrelevant, Some(&reason))?;
        log::debug!("Extract: record {} dropped ({})", record_id, reason);
        return Ok(ExtractOutcome::Irrelevant(reason));
    }

    let has_metadata = record.title.as_deref().is_some_and(|t| !t.trim().is_empty())
        && !record.raw_text.trim().is_empty();

    let draft = if has_metadata {
        DraftRecord::from_metadata(&record)
    } else {
        let tags = ctx.catalog.tag_names();
        let reply = generate_with_retry(
            completion,
            ctx.pipeline.transient_retries,
            &extraction_options(),
            |attempt| {
                build_extraction_prompt(&record.raw_text, record.title.as_deref(), &tags, attempt)
            },
        )?;

        match repair(&reply) {
            Ok(repaired) => {
                if repaired.confidence == Confidence::Low {
                    log::info!(
                        "Extract: record {} recovered partial fields only ({})",
                        record_id,
                        repaired.strategy
                    );
                }
                let mut draft = DraftRecord::from_value(&repaired.value);
                if draft.source.is_none() {
                    draft.source = record.source.clone();
                }
                draft
            }
            Err(unrecoverable) => {
                let reason = unrecoverable.to_string();
                crate::audit::record_unrecoverable(
                    ctx.audit_dir.as_deref(),
                    "extract",
                    &format!("record-{}", record_id),
                    &reply,
                );
                db.set_record_status(record_id, RecordStatus::Error, Some(&reason))?;
                log::warn!("Extract: record {} unrecoverable: {}", record_id, reason);
                return Ok(ExtractOutcome::Unrecoverable(reason));
            }
        }
    };

    match normalize(&record, &draft, &ctx.catalog) {
        Ok(NormalizeOutcome::Ready { update, tag_method }) => {
            db.with_transaction(|tx| tx.mark_record_ready(record_id, &update))?;
            log::debug!(
                "Extract: record {} ready (tag {:?} via {:?})",
                record_id,
                update.tag_hint,
                tag_method
            );
            Ok(ExtractOutcome::Ready)
        }
        Ok(NormalizeOutcome::Promotional(marker)) => {
            let reason = format!("promotional: {}", marker);
            db.set_record_status(record_id, RecordStatus::Irrelevant, Some(&reason))?;
            Ok(ExtractOutcome::Irrelevant(reason))
        }
        Err(PipelineError::ValidationFailure(reason)) => {
            db.set_record_status(record_id, RecordStatus::Error, Some(&reason))?;
            log::warn!("Extract: record {} failed validation: {}", record_id, reason);
            Ok(ExtractOutcome::Invalid(reason))
        }
        Err(e) => Err(e),
    }
}
