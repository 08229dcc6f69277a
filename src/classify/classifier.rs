//! Per-cluster classification state machine.
//!
//! anchor context → titles-only fallback → NEEDS_REVIEW. A reply with an
//! empty item list marks the cluster IRRELEVANT. Successful results go
//! through the gates, then get a summary, and everything commits together.

use serde_json::Value;

use crate::completion::{generate_with_retry, Completion, GenerationOptions};
use crate::db::{ClusterField, DeskDb};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::processor::normalize::{correct_priority, correct_tag};
use crate::prompts::{build_classification_prompt, build_titles_only_prompt, ClassificationContext};
use crate::repair::{repair, Confidence};
use crate::taxonomy::{Catalog, TAG_ERROR, TAG_IRRELEVANT};
use crate::types::{ClusterStatus, Priority};

use super::gates::apply_gates;
use super::{gate_text, pick_anchor};
use super::summarize::{summarize, SummaryInput};
use super::Classification;

/// Sibling titles sent alongside the anchor record.
const MAX_SIBLING_TITLES: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyOutcome {
    /// Classified (possibly gated); `summarized` is false on a soft summary failure.
    Classified {
        classification: Classification,
        summarized: bool,
    },
    /// The model reported nothing relevant.
    Irrelevant,
    /// Both attempts failed; flagged NEEDS_REVIEW with the reason.
    NeedsReview(String),
    /// Not active or not waiting for classification.
    Skipped,
}

impl ClassifyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ClassifyOutcome::Classified { .. } | ClassifyOutcome::Irrelevant
        )
    }
}

/// What one attempt produced.
enum AttemptResult {
    Found(Classification),
    NothingRelevant,
}

fn anchor_options() -> GenerationOptions {
    GenerationOptions::default().with_max_output_tokens(1024)
}

fn titles_only_options() -> GenerationOptions {
    GenerationOptions::default().with_max_output_tokens(512)
}

/// Read a classification reply.
///
/// Accepts `{"items": [...]}`, a bare array, or a flat object carrying
/// `priority`/`tag` (what the minimal-field layer recovers). The item with
/// the highest confidence wins.
fn interpret_reply(value: &Value, text: &str, catalog: &Catalog) -> Result<AttemptResult, String> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("items") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(_) => return Err("'items' is not a list".to_string()),
            None if map.contains_key("priority") => vec![value],
            None => return Err("reply has no items".to_string()),
        },
        _ => return Err("reply is not an object".to_string()),
    };
    if items.is_empty() {
        return Ok(AttemptResult::NothingRelevant);
    }

    let best = items
        .iter()
        .filter_map(|item| {
            let priority = correct_priority(item.get("priority").and_then(Value::as_str))?;
            let confidence = item.get("confidence").and_then(Value::as_f64);
            Some((item, priority, confidence))
        })
        .max_by(|a, b| {
            a.2.unwrap_or(0.0)
                .total_cmp(&b.2.unwrap_or(0.0))
                .then(std::cmp::Ordering::Greater)
        });

    let Some((item, priority, confidence)) = best else {
        return Err("no item carries a priority".to_string());
    };
    let tag = if priority == Priority::Irrelevant {
        TAG_IRRELEVANT.to_string()
    } else {
        correct_tag(item.get("tag").and_then(Value::as_str), text, catalog).tag
    };
    Ok(AttemptResult::Found(Classification {
        priority,
        tag,
        confidence,
    }))
}

fn attempt(
    completion: &dyn Completion,
    ctx: &RunContext,
    unit: &str,
    options: &GenerationOptions,
    text: &str,
    build_prompt: impl FnMut(u32) -> String,
) -> Result<AttemptResult, String> {
    let reply = generate_with_retry(completion, ctx.pipeline.transient_retries, options, build_prompt)
        .map_err(|e| e.to_string())?;
    let repaired = match repair(&reply) {
        Ok(r) => r,
        Err(e) => {
            crate::audit::record_unrecoverable(ctx.audit_dir.as_deref(), "classify", unit, &reply);
            return Err(e.to_string());
        }
    };
    if repaired.confidence == Confidence::Low {
        log::info!("Classify: {} answered with partial fields only", unit);
    }
    interpret_reply(&repaired.value, text, &ctx.catalog)
}

/// Classify one cluster and commit the result.
pub fn classify_cluster(
    db: &DeskDb,
    completion: &dyn Completion,
    ctx: &RunContext,
    cluster_id: i64,
) -> Result<ClassifyOutcome, PipelineError> {
    let cluster = match db.get_cluster(cluster_id)? {
        Some(c) if c.status == ClusterStatus::Active && c.needs_classification => c,
        _ => return Ok(ClassifyOutcome::Skipped),
    };
    let members = db.records_for_cluster(cluster_id)?;
    let unit = format!("cluster-{}", cluster_id);
    let tags = ctx.catalog.tag_names();

    let titles: Vec<String> = members.iter().map(|r| r.display_title().to_string()).collect();
    let anchor = pick_anchor(&members);
    let anchor_text = anchor.map(|a| a.text()).unwrap_or("");
    let text_for_gates = gate_text(&cluster.title, &members);

    let mut failures = Vec::new();
    let mut result = None;

    if let Some(anchor) = anchor {
        let siblings: Vec<String> = members
            .iter()
            .filter(|r| r.id != anchor.id)
            .map(|r| r.display_title().to_string())
            .take(MAX_SIBLING_TITLES)
            .collect();
        let context = ClassificationContext {
            cluster_title: &cluster.title,
            anchor_title: anchor.display_title(),
            anchor_text,
            sibling_titles: &siblings,
        };
        match attempt(completion, ctx, &unit, &anchor_options(), &text_for_gates, |n| {
            build_classification_prompt(&context, &tags, n)
        }) {
            Ok(r) => result = Some(r),
            Err(reason) => {
                log::warn!("Classify: {} anchor attempt failed: {}", unit, reason);
                failures.push(format!("anchor: {}", reason));
            }
        }
    } else {
        failures.push("anchor: cluster has no member records".to_string());
    }

    if result.is_none() && !titles.is_empty() {
        match attempt(completion, ctx, &unit, &titles_only_options(), &text_for_gates, |_| {
            build_titles_only_prompt(&cluster.title, &titles, &tags)
        }) {
            Ok(r) => result = Some(r),
            Err(reason) => {
                log::warn!("Classify: {} titles-only attempt failed: {}", unit, reason);
                failures.push(format!("titles-only: {}", reason));
            }
        }
    }

    let motive = format!("classifier (catalog v{})", ctx.catalog.version);
    let (classification, outcome) = match result {
        Some(AttemptResult::Found(found)) => {
            let gated = apply_gates(found, &text_for_gates, &ctx.catalog);
            for rule in &gated.fired {
                log::info!("Classify: {} gate '{}' fired", unit, rule.name());
            }
            let classification = gated.classification;
            (
                classification.clone(),
                ClassifyOutcome::Classified {
                    classification,
                    summarized: false,
                },
            )
        }
        Some(AttemptResult::NothingRelevant) => (
            Classification {
                priority: Priority::Irrelevant,
                tag: TAG_IRRELEVANT.to_string(),
                confidence: None,
            },
            ClassifyOutcome::Irrelevant,
        ),
        None => {
            let reason = PipelineError::ClassificationAmbiguous(failures.join("; ")).to_string();
            (
                Classification {
                    priority: Priority::NeedsReview,
                    tag: TAG_ERROR.to_string(),
                    confidence: None,
                },
                ClassifyOutcome::NeedsReview(reason),
            )
        }
    };

    let summary = match summarize(
        completion,
        ctx,
        &SummaryInput {
            cluster_title: &cluster.title,
            priority: classification.priority,
            anchor_text,
            titles: &titles,
        },
    ) {
        Ok(summary) => summary,
        Err(e) => {
            log::warn!("Classify: {} summary failed, keeping classification: {}", unit, e);
            None
        }
    };
    let outcome = match outcome {
        ClassifyOutcome::Classified { classification, .. } => ClassifyOutcome::Classified {
            classification,
            summarized: summary.is_some(),
        },
        other => other,
    };
    let review_reason = match &outcome {
        ClassifyOutcome::NeedsReview(reason) => Some(reason.as_str()),
        _ => None,
    };

    db.with_transaction(|tx| {
        tx.update_cluster_field(
            cluster_id,
            ClusterField::Priority,
            Some(classification.priority.as_str()),
            &motive,
            &ctx.run_id,
        )?;
        tx.update_cluster_field(
            cluster_id,
            ClusterField::Tag,
            Some(&classification.tag),
            &motive,
            &ctx.run_id,
        )?;
        tx.update_cluster_field(
            cluster_id,
            ClusterField::Summary,
            Some(summary.as_deref().unwrap_or("")),
            &motive,
            &ctx.run_id,
        )?;
        tx.set_review_reason(cluster_id, review_reason)?;
        tx.set_needs_classification(cluster_id, false)?;
        Ok::<_, crate::db::DbError>(())
    })?;

    log::debug!(
        "Classify: {} -> {} / {}",
        unit,
        classification.priority,
        classification.tag
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_utils::ScriptedCompletion;
    use crate::completion::CompletionError;
    use crate::db::test_utils::{raw, test_db};
    use crate::executor::test_utils::test_context;
    use crate::prompts::{HEADER_CLASSIFY, HEADER_CLASSIFY_TITLES, HEADER_SUMMARY};
    use crate::types::RecordStatus;

    fn cluster_with(db: &DeskDb, day: &str, members: &[(&str, &str)]) -> i64 {
        let cluster_id = db.create_cluster(members[0].0, day).unwrap();
        for (title, text) in members {
            let id = db.insert_raw_record(&raw(title, text)).unwrap().unwrap();
            db.set_record_status(id, RecordStatus::ReadyToGroup, None).unwrap();
            db.attach_record(id, cluster_id).unwrap();
        }
        db.refresh_record_count(cluster_id).unwrap();
        cluster_id
    }

    #[test]
    fn test_anchor_is_longest_member() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(
            &db,
            &ctx.day,
            &[
                ("Short", "tiny"),
                ("Long", "a much longer article body about the Selic decision"),
            ],
        );
        let members = db.records_for_cluster(id).unwrap();
        assert_eq!(pick_anchor(&members).unwrap().display_title(), "Long");
    }

    #[test]
    fn test_classifies_and_summarizes() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(&db, &ctx.day, &[("Copom holds Selic", "The central bank held rates at 10.5%.")]);

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| {
            Ok(r#"{"items": [{"priority": "p2", "tag": "monetary policy", "confidence": 0.8}]}"#.into())
        });
        fake.on(HEADER_SUMMARY, |_| Ok(r#"{"summary": "Copom held the Selic at 10.5%."}"#.into()));

        let outcome = classify_cluster(&db, &fake.clone(), &ctx, id).unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Classified { summarized: true, .. }));

        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.priority, Some(Priority::P2));
        assert_eq!(cluster.tag.as_deref(), Some("Monetary Policy"));
        assert_eq!(cluster.summary, "Copom held the Selic at 10.5%.");
        assert!(!cluster.needs_classification);

        let fields: Vec<String> = db
            .alterations_for_cluster(id)
            .unwrap()
            .into_iter()
            .map(|a| a.field)
            .collect();
        assert_eq!(fields, vec!["priority", "tag", "summary"]);

        // Classified clusters are not picked up again.
        assert_eq!(classify_cluster(&db, &fake.clone(), &ctx, id).unwrap(), ClassifyOutcome::Skipped);
    }

    #[test]
    fn test_titles_only_fallback() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(&db, &ctx.day, &[("Ibovespa rallies", "Stocks rose in São Paulo.")]);

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| Ok(r#"{"items": [{"tag": "Markets"}]}"#.into()));
        fake.on(HEADER_CLASSIFY_TITLES, |_| {
            Ok(r#"{"items": [{"priority": "P3", "tag": "Markets", "confidence": 0.5}]}"#.into())
        });
        fake.on(HEADER_SUMMARY, |_| Ok(r#"{"summary": "Stocks rose."}"#.into()));

        classify_cluster(&db, &fake.clone(), &ctx, id).unwrap();
        assert_eq!(fake.call_count(HEADER_CLASSIFY_TITLES), 1);
        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.priority, Some(Priority::P3));
        assert_eq!(cluster.tag.as_deref(), Some("Markets"));
    }

    #[test]
    fn test_double_failure_needs_review() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(&db, &ctx.day, &[("Something", "Some text")]);

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| Ok("no idea".into()));
        fake.on(HEADER_CLASSIFY_TITLES, |_| Err(CompletionError::Timeout(5)));

        let outcome = classify_cluster(&db, &fake.clone(), &ctx, id).unwrap();
        assert!(matches!(outcome, ClassifyOutcome::NeedsReview(_)));
        assert!(!outcome.is_success());
        assert_eq!(fake.call_count(HEADER_SUMMARY), 0);

        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.priority, Some(Priority::NeedsReview));
        assert_eq!(cluster.tag.as_deref(), Some(TAG_ERROR));
        assert!(cluster.review_reason.unwrap().contains("titles-only"));
        assert!(!cluster.needs_classification);
    }

    #[test]
    fn test_empty_items_means_irrelevant() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(&db, &ctx.day, &[("Celebrity wedding", "Guests arrived.")]);

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| Ok(r#"{"items": []}"#.into()));

        assert_eq!(classify_cluster(&db, &fake.clone(), &ctx, id).unwrap(), ClassifyOutcome::Irrelevant);
        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.priority, Some(Priority::Irrelevant));
        assert_eq!(cluster.tag.as_deref(), Some(TAG_IRRELEVANT));
        assert_eq!(fake.call_count(HEADER_SUMMARY), 0);
    }

    #[test]
    fn test_summary_failure_keeps_classification() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(&db, &ctx.day, &[("Acme merger with Beta", "Acme agreed to a merger with Beta.")]);

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| {
            Ok(r#"{"items": [{"priority": "P1", "tag": "M&A", "confidence": 0.9}]}"#.into())
        });
        fake.on(HEADER_SUMMARY, |_| Err(CompletionError::Http { status: 400, body: String::new() }));

        let outcome = classify_cluster(&db, &fake.clone(), &ctx, id).unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Classified { summarized: false, .. }));
        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.priority, Some(Priority::P1));
        assert_eq!(cluster.summary, "");
    }

    #[test]
    fn test_blocklist_marker_in_shorter_member_body() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(
            &db,
            &ctx.day,
            &[
                (
                    "Rio weekend roundup",
                    "A long roundup of the weekend in Rio de Janeiro, with traffic, weather and events across the city.",
                ),
                ("Sunday results", "Futebol: Flamengo vence."),
            ],
        );

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| {
            Ok(r#"{"items": [{"priority": "P1", "tag": "Markets", "confidence": 0.9}]}"#.into())
        });

        classify_cluster(&db, &fake.clone(), &ctx, id).unwrap();
        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.priority, Some(Priority::Irrelevant));
        assert_eq!(cluster.tag.as_deref(), Some(TAG_IRRELEVANT));
        assert_eq!(fake.call_count(HEADER_SUMMARY), 0);
    }

    #[test]
    fn test_transaction_term_in_shorter_member_body_corroborates() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(
            &db,
            &ctx.day,
            &[
                (
                    "Acme and Beta boards meet",
                    "Boards of Acme and Beta met on Tuesday in São Paulo; executives declined to comment afterwards.",
                ),
                ("Acme confirms talks", "Acme confirmed a merger with Beta."),
            ],
        );

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| {
            Ok(r#"{"items": [{"priority": "P1", "tag": "M&A", "confidence": 0.9}]}"#.into())
        });
        fake.on(HEADER_SUMMARY, |_| Ok(r#"{"summary": "Acme and Beta plan a merger."}"#.into()));

        classify_cluster(&db, &fake.clone(), &ctx, id).unwrap();
        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.priority, Some(Priority::P1));
        assert_eq!(cluster.tag.as_deref(), Some("M&A"));
    }

    #[test]
    fn test_truncated_reply_uses_minimal_fields_and_gates() {
        let db = test_db();
        let ctx = test_context();
        let id = cluster_with(&db, &ctx.day, &[("Acme and Beta talk", "Executives met on Tuesday.")]);

        let fake = ScriptedCompletion::new();
        fake.on(HEADER_CLASSIFY, |_| Ok(r#"Result: "priority": "P1", "tag": "M&A", "confid"#.into()));
        fake.on(HEADER_SUMMARY, |_| Ok(r#"{"summary": "Talks."}"#.into()));

        classify_cluster(&db, &fake.clone(), &ctx, id).unwrap();
        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert_eq!(cluster.tag.as_deref(), Some("M&A"));
        assert_eq!(cluster.priority, Some(Priority::P3));
    }
}
