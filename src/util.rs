use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// SHA-256 hex digest of the raw text. Dedup key for ingested records.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Decompose and drop combining marks: "Fusão" → "Fusao".
pub fn strip_accents(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Accent-stripped lowercase form used by every text-matching rule.
pub fn fold_text(text: &str) -> String {
    strip_accents(text).to_lowercase()
}

/// Fold a title and replace punctuation with spaces, collapsing whitespace.
///
/// Example: "Acme to Buy Beta, Inc. — $2bn" → "acme to buy beta inc 2bn"
pub fn normalize_title(title: &str) -> String {
    fold_text(title)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tokens of a normalized title, ignoring tokens of two characters or fewer.
pub fn title_tokens(title: &str) -> Vec<String> {
    normalize_title(title)
        .split_whitespace()
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn safe_truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Today's date in UTC as `YYYY-MM-DD`.
pub fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn atomic_write_str(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
