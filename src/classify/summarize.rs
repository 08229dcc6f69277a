//! Desk summaries, sized by priority tier.

use serde_json::Value;

use crate::completion::{generate_with_retry, Completion, GenerationOptions};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::prompts::{build_summary_prompt, summary_length};
use crate::repair::{repair_with, structural_ladder};
use crate::types::Priority;

pub struct SummaryInput<'a> {
    pub cluster_title: &'a str,
    pub priority: Priority,
    pub anchor_text: &'a str,
    pub titles: &'a [String],
}

fn summary_options(priority: Priority) -> GenerationOptions {
    let tokens = match priority {
        Priority::P1 => 2048,
        Priority::P2 => 1024,
        _ => 512,
    };
    GenerationOptions::default()
        .with_temperature(0.3)
        .with_max_output_tokens(tokens)
}

/// Request a summary for a classified cluster.
///
/// `Ok(None)` when the tier gets no summary (IRRELEVANT, NEEDS_REVIEW).
/// An error here is a soft failure; the caller keeps the classification.
pub fn summarize(
    completion: &dyn Completion,
    ctx: &RunContext,
    input: &SummaryInput<'_>,
) -> Result<Option<String>, PipelineError> {
    if summary_length(input.priority).is_none() {
        return Ok(None);
    }

    let reply = generate_with_retry(
        completion,
        ctx.pipeline.transient_retries,
        &summary_options(input.priority),
        |attempt| {
            build_summary_prompt(
                input.cluster_title,
                input.priority,
                input.anchor_text,
                input.titles,
                attempt,
            )
            .unwrap_or_default()
        },
    )?;

    let summary = match repair_with(&reply, &structural_ladder()) {
        Ok(repaired) => repaired
            .value
            .get("summary")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string()),
        // Plain prose without any JSON is still a usable summary.
        Err(_) if !reply.contains('{') => Some(reply.trim().to_string()),
        Err(e) => return Err(PipelineError::MalformedOutput(e.to_string())),
    };

    match summary.filter(|s| !s.is_empty()) {
        Some(s) => Ok(Some(s)),
        None => Err(PipelineError::MalformedOutput("summary reply has no text".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_utils::ScriptedCompletion;
    use crate::executor::test_utils::test_context;
    use crate::prompts::HEADER_SUMMARY;

    fn input(priority: Priority) -> SummaryInput<'static> {
        SummaryInput {
            cluster_title: "Acme buys Beta",
            priority,
            anchor_text: "Acme agreed to acquire Beta for $2bn.",
            titles: &[],
        }
    }

    #[test]
    fn test_no_request_for_irrelevant_or_review() {
        let fake = ScriptedCompletion::new();
        let ctx = test_context();
        assert_eq!(summarize(&fake.clone(), &ctx, &input(Priority::Irrelevant)).unwrap(), None);
        assert_eq!(summarize(&fake.clone(), &ctx, &input(Priority::NeedsReview)).unwrap(), None);
        assert_eq!(fake.call_count(HEADER_SUMMARY), 0);
    }

    #[test]
    fn test_length_scales_with_priority() {
        let fake = ScriptedCompletion::new();
        fake.on(HEADER_SUMMARY, |_| Ok(r#"{"summary": "Acme buys Beta."}"#.into()));
        let ctx = test_context();
        summarize(&fake.clone(), &ctx, &input(Priority::P1)).unwrap();
        summarize(&fake.clone(), &ctx, &input(Priority::P3)).unwrap();
        let prompts = fake.prompts(HEADER_SUMMARY);
        assert!(prompts[0].contains("paragraphs"));
        assert!(prompts[1].contains("a single sentence"));
    }

    #[test]
    fn test_prose_reply_and_empty_reply() {
        let fake = ScriptedCompletion::new();
        fake.queue(HEADER_SUMMARY, Ok("Acme is buying Beta for $2bn.".into()));
        fake.queue(HEADER_SUMMARY, Ok(r#"{"summary": ""}"#.into()));
        let ctx = test_context();
        assert_eq!(
            summarize(&fake.clone(), &ctx, &input(Priority::P3)).unwrap().as_deref(),
            Some("Acme is buying Beta for $2bn.")
        );
        assert!(summarize(&fake.clone(), &ctx, &input(Priority::P3)).is_err());
    }
}
