//! Prompt templates for every completion the pipeline makes.
//!
//! Each prompt opens with a `## Task:` header line that names the request.
//! Builders take an `attempt` number; retries after a transient failure halve
//! the amount of context sent.

use crate::types::Priority;
use crate::util::safe_truncate;

pub const HEADER_EXTRACT: &str = "## Task: record extraction";
pub const HEADER_GROUP_INCREMENTAL: &str = "## Task: cluster assignment";
pub const HEADER_GROUP_BATCH: &str = "## Task: cluster formation";
pub const HEADER_CLASSIFY: &str = "## Task: cluster classification";
pub const HEADER_CLASSIFY_TITLES: &str = "## Task: cluster classification (titles only)";
pub const HEADER_SUMMARY: &str = "## Task: cluster summary";
pub const HEADER_PRIORITIZE: &str = "## Task: executive review";
pub const HEADER_CONSOLIDATE: &str = "## Task: duplicate clusters";

/// Raw text sent for extraction on the first attempt.
const EXTRACT_TEXT_CHARS: usize = 12_000;
/// Anchor text sent for classification on the first attempt.
const ANCHOR_TEXT_CHARS: usize = 6_000;
/// Titles-only fallback keeps at most this many sibling titles.
const TITLES_ONLY_LIMIT: usize = 15;
/// Per-title budget in list prompts on the first attempt.
const LIST_TITLE_CHARS: usize = 240;

/// Halve `n` once per retry, never below 1.
pub fn shrink(n: usize, attempt: u32) -> usize {
    n.checked_shr(attempt).unwrap_or(0).max(1)
}

/// Fence untrusted text so instructions inside it are treated as data.
pub fn wrap_user_data(text: &str) -> String {
    format!(
        "<user_data>{}</user_data>",
        text.replace("<user_data>", "").replace("</user_data>", "")
    )
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A title for a list prompt, cut shorter on every retry.
fn list_title(text: &str, attempt: u32) -> String {
    safe_truncate(&one_line(text), shrink(LIST_TITLE_CHARS, attempt)).to_string()
}

// =============================================================================
// Stage 1: extraction
// =============================================================================

pub fn build_extraction_prompt(
    raw_text: &str,
    known_title: Option<&str>,
    tags: &[&str],
    attempt: u32,
) -> String {
    let text = safe_truncate(raw_text, shrink(EXTRACT_TEXT_CHARS, attempt));
    let title_line = known_title
        .filter(|t| !t.trim().is_empty())
        .map(|t| format!("Known title: {}\n", wrap_user_data(t)))
        .unwrap_or_default();
    format!(
        r#"{header}
You are preparing a news item for a financial analysis desk.
Extract the article from the raw text below. Raw text may contain page furniture,
navigation menus or several articles; keep only the main article.

{title_line}Allowed tags: {tags}

Reply with a single JSON object and nothing else:
{{"title": "...", "body": "...", "source": "...", "author": "...", "published_at": "YYYY-MM-DD", "tag": "...", "priority": "P1|P2|P3|IRRELEVANT"}}

Use null for fields you cannot find. The body must be the article text, not a summary.

Raw text:
{text}
"#,
        header = HEADER_EXTRACT,
        title_line = title_line,
        tags = tags.join(", "),
        text = wrap_user_data(text),
    )
}

// =============================================================================
// Stage 2: grouping
// =============================================================================

/// A record offered to a grouper.
#[derive(Debug, Clone)]
pub struct RecordLine {
    pub id: i64,
    pub title: String,
}

/// An existing cluster offered to the incremental grouper.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub id: i64,
    pub title: String,
    pub sample_titles: Vec<String>,
}

fn record_lines(records: &[RecordLine]) -> String {
    records
        .iter()
        .map(|r| format!("- [{}] {}", r.id, one_line(&r.title)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_incremental_grouping_prompt(
    records: &[RecordLine],
    clusters: &[ClusterContext],
    attempt: u32,
) -> String {
    let samples = clusters
        .first()
        .map(|c| shrink(c.sample_titles.len().max(1), attempt))
        .unwrap_or(1);
    let cluster_block = if clusters.is_empty() {
        "(none yet)".to_string()
    } else {
        clusters
            .iter()
            .map(|c| {
                let mut block = format!("- cluster {}: {}", c.id, one_line(&c.title));
                for title in c.sample_titles.iter().take(samples) {
                    block.push_str(&format!("\n    * {}", one_line(title)));
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"{header}
You maintain today's event clusters for a financial news desk. A cluster holds
every article about the same real-world event.

For each new article decide: attach it to one existing cluster, or start a new
cluster with a short theme. Articles about the same new event must share the
exact same theme text. Decide every article exactly once.

Reply with JSON only:
{{"decisions": [{{"record_id": 12, "cluster_id": 3}}, {{"record_id": 13, "new_theme": "Acme agrees to buy Beta"}}]}}

Existing clusters:
{clusters}

New articles:
{records}
"#,
        header = HEADER_GROUP_INCREMENTAL,
        clusters = wrap_user_data(&cluster_block),
        records = wrap_user_data(&record_lines(records)),
    )
}

/// Every record must stay in the list, so retries shorten titles instead.
pub fn build_batch_grouping_prompt(records: &[RecordLine], attempt: u32) -> String {
    let lines = records
        .iter()
        .map(|r| format!("- [{}] {}", r.id, list_title(&r.title, attempt)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"{header}
Group these financial news articles into event clusters. A cluster holds every
article about the same real-world event; an article belongs to exactly one
cluster. Singleton clusters are fine.

Reply with JSON only:
{{"clusters": [{{"theme": "Acme agrees to buy Beta", "record_ids": [12, 15]}}, {{"theme": "Central bank holds rates", "record_ids": [13]}}]}}

Articles:
{records}
"#,
        header = HEADER_GROUP_BATCH,
        records = wrap_user_data(&lines),
    )
}

// =============================================================================
// Stage 3: classification and summaries
// =============================================================================

const PRIORITY_GUIDE: &str = "\
P1: market-moving for the desk today (large M&A, rate decisions, major defaults).
P2: relevant to covered companies or sectors, worth reading today.
P3: background or minor news.
IRRELEVANT: not financial news (sports, lifestyle, entertainment, advertising).";

/// Context for the first classification attempt.
#[derive(Debug, Clone)]
pub struct ClassificationContext<'a> {
    pub cluster_title: &'a str,
    pub anchor_title: &'a str,
    pub anchor_text: &'a str,
    pub sibling_titles: &'a [String],
}

pub fn build_classification_prompt(
    ctx: &ClassificationContext<'_>,
    tags: &[&str],
    attempt: u32,
) -> String {
    let text = safe_truncate(ctx.anchor_text, shrink(ANCHOR_TEXT_CHARS, attempt));
    let siblings = ctx
        .sibling_titles
        .iter()
        .take(shrink(ctx.sibling_titles.len().max(1), attempt))
        .map(|t| format!("- {}", one_line(t)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"{header}
Classify this event cluster for a financial news desk.

{guide}

Allowed tags: {tags}

Reply with JSON only:
{{"items": [{{"priority": "P2", "tag": "Earnings", "confidence": 0.8}}]}}
If nothing here is relevant to the desk, reply {{"items": []}}.

Cluster: {title}
Main article: {anchor_title}
{text}

Other headlines in the cluster:
{siblings}
"#,
        header = HEADER_CLASSIFY,
        guide = PRIORITY_GUIDE,
        tags = tags.join(", "),
        title = wrap_user_data(ctx.cluster_title),
        anchor_title = wrap_user_data(ctx.anchor_title),
        text = wrap_user_data(text),
        siblings = wrap_user_data(&siblings),
    )
}

pub fn build_titles_only_prompt(cluster_title: &str, titles: &[String], tags: &[&str]) -> String {
    let lines = titles
        .iter()
        .take(TITLES_ONLY_LIMIT)
        .map(|t| format!("- {}", one_line(t)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"{header}
Classify this event cluster from its headlines alone.

{guide}

Allowed tags: {tags}

Reply with JSON only: {{"items": [{{"priority": "P3", "tag": "Markets", "confidence": 0.5}}]}}
or {{"items": []}} if nothing is relevant.

Cluster: {title}
Headlines:
{lines}
"#,
        header = HEADER_CLASSIFY_TITLES,
        guide = PRIORITY_GUIDE,
        tags = tags.join(", "),
        title = wrap_user_data(cluster_title),
        lines = wrap_user_data(&lines),
    )
}

/// Summary length instruction per tier. None means no summary is requested.
pub fn summary_length(priority: Priority) -> Option<&'static str> {
    match priority {
        Priority::P1 => Some("two to three paragraphs covering what happened, who is involved, figures, and what to watch next"),
        Priority::P2 => Some("one paragraph of three to four sentences"),
        Priority::P3 => Some("a single sentence"),
        Priority::Irrelevant | Priority::NeedsReview => None,
    }
}

pub fn build_summary_prompt(
    cluster_title: &str,
    priority: Priority,
    anchor_text: &str,
    titles: &[String],
    attempt: u32,
) -> Option<String> {
    let length = summary_length(priority)?;
    let text = safe_truncate(anchor_text, shrink(ANCHOR_TEXT_CHARS, attempt));
    let headlines = titles
        .iter()
        .take(shrink(titles.len().max(1), attempt))
        .map(|t| format!("- {}", one_line(t)))
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!(
        r#"{header}
Write a desk summary of this {priority} event. Length: {length}.
Stick to facts in the material; no speculation.

Reply with JSON only: {{"summary": "..."}}

Cluster: {title}
Headlines:
{headlines}

Main article:
{text}
"#,
        header = HEADER_SUMMARY,
        priority = priority.as_str(),
        length = length,
        title = wrap_user_data(cluster_title),
        headlines = wrap_user_data(&headlines),
        text = wrap_user_data(text),
    ))
}

// =============================================================================
// Stage 3b: executive review
// =============================================================================

#[derive(Debug, Clone)]
pub struct ClusterDigest {
    pub id: i64,
    pub title: String,
    pub tag: String,
    pub priority: String,
    pub record_count: i64,
}

pub fn build_prioritizer_prompt(clusters: &[ClusterDigest], tags: &[&str], attempt: u32) -> String {
    let lines = clusters
        .iter()
        .map(|c| {
            format!(
                "- [{}] ({} / {}, {} articles) {}",
                c.id,
                c.priority,
                c.tag,
                c.record_count,
                list_title(&c.title, attempt)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"{header}
You are the desk editor reviewing today's full list of event clusters.
Reconsider each cluster's priority and tag relative to the others, so that P1
is reserved for the few events that matter most today.

{guide}

Allowed tags: {tags}

Reply with JSON only, listing every cluster:
{{"clusters": [{{"id": 4, "priority": "P2", "tag": "Markets"}}]}}

Clusters:
{lines}
"#,
        header = HEADER_PRIORITIZE,
        guide = PRIORITY_GUIDE,
        tags = tags.join(", "),
        lines = wrap_user_data(&lines),
    )
}

// =============================================================================
// Stage 4: consolidation
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConsolidationItem {
    pub id: i64,
    pub title: String,
    pub tag: String,
    pub priority: String,
    pub sample_titles: Vec<String>,
}

pub fn build_consolidation_prompt(items: &[ConsolidationItem], attempt: u32) -> String {
    let lines = items
        .iter()
        .map(|c| {
            let mut block = format!(
                "- [{}] ({} / {}) {}",
                c.id,
                c.priority,
                c.tag,
                list_title(&c.title, attempt)
            );
            let samples = shrink(c.sample_titles.len().max(1), attempt);
            for t in c.sample_titles.iter().take(samples) {
                block.push_str(&format!("\n    * {}", list_title(t, attempt)));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"{header}
Some of today's event clusters describe the same real-world event. Find them.
For each set of duplicates, pick the destination cluster and list the others as
sources. You may propose a better title, tag or priority for the destination.
Leave distinct events alone.

Reply with JSON only:
{{"actions": [{{"merge": {{"destination": 4, "sources": [9, 11], "title": "optional", "tag": "optional", "priority": "optional"}}}}, {{"keep": 5}}]}}

Clusters:
{lines}
"#,
        header = HEADER_CONSOLIDATE,
        lines = wrap_user_data(&lines),
    )
}
