//! Best-effort recovery of structured values from completion output.
//!
//! Model replies arrive wrapped in prose, fenced, cut off mid-array, or with
//! raw line breaks inside strings. `repair` runs an ordered ladder of parsers
//! and returns the first value any of them produces:
//!
//! 1. `direct`: fenced block (closing fence optional) or text from the first
//!    `{`/`[`, parsed as the first complete JSON value.
//! 2. `sanitized`: string-aware cleanup of control characters, raw newlines
//!    inside strings, trailing commas and stray fence markers.
//! 3. `truncated`: cut back to the last balanced closing token and re-close
//!    whatever is still open.
//! 4. `minimal_fields`: regex pull of a few `"key": "value"` pairs. Low confidence.
//!
//! Never panics. Each failed layer is logged with its offset and a 120-char window.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// How much to trust a repaired value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Low,
}

/// A value recovered from raw output.
#[derive(Debug, Clone)]
pub struct Repaired {
    pub value: Value,
    /// Name of the parser that succeeded.
    pub strategy: &'static str,
    pub confidence: Confidence,
}

/// Why one layer could not produce a value.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub message: String,
    /// Byte offset into the text the layer tried to parse.
    pub offset: Option<usize>,
    /// Up to 120 characters around `offset`.
    pub window: String,
}

impl ParseFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: None,
            window: String::new(),
        }
    }
}

/// Every layer failed.
#[derive(Debug, Clone)]
pub struct Unrecoverable {
    pub failures: Vec<(&'static str, ParseFailure)>,
}

impl fmt::Display for Unrecoverable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no repair layer produced a value")?;
        for (name, failure) in &self.failures {
            write!(f, "; {}: {}", name, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Unrecoverable {}

/// One rung of the repair ladder.
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    fn confidence(&self) -> Confidence {
        Confidence::High
    }

    fn parse(&self, raw: &str) -> Result<Value, ParseFailure>;
}

/// The standard four-layer ladder.
pub fn default_ladder() -> Vec<Box<dyn Parser>> {
    vec![
        Box::new(DirectParse),
        Box::new(SanitizedParse),
        Box::new(TruncatedParse),
        Box::new(MinimalFields::priority_and_tag()),
    ]
}

/// Layers 1-3 only. For replies where a partial field pull is meaningless
/// (grouping decisions, merge suggestions).
pub fn structural_ladder() -> Vec<Box<dyn Parser>> {
    vec![
        Box::new(DirectParse),
        Box::new(SanitizedParse),
        Box::new(TruncatedParse),
    ]
}

/// Repair with the standard ladder.
pub fn repair(raw: &str) -> Result<Repaired, Unrecoverable> {
    repair_with(raw, &default_ladder())
}

/// Repair with a caller-supplied ladder, tried in order.
pub fn repair_with(raw: &str, ladder: &[Box<dyn Parser>]) -> Result<Repaired, Unrecoverable> {
    let mut failures = Vec::new();
    for (layer, parser) in ladder.iter().enumerate() {
        match parser.parse(raw) {
            Ok(value) => {
                if layer > 0 {
                    log::debug!("Repair: recovered with '{}' (layer {})", parser.name(), layer + 1);
                }
                return Ok(Repaired {
                    value,
                    strategy: parser.name(),
                    confidence: parser.confidence(),
                });
            }
            Err(failure) => {
                log::debug!(
                    "Repair: '{}' failed at offset {:?}: {} | window: {:?}",
                    parser.name(),
                    failure.offset,
                    failure.message,
                    failure.window
                );
                failures.push((parser.name(), failure));
            }
        }
    }
    log::warn!(
        "Repair: unrecoverable after {} layers ({} bytes of output)",
        failures.len(),
        raw.len()
    );
    Err(Unrecoverable { failures })
}

// =============================================================================
// Layers
// =============================================================================

pub struct DirectParse;

impl Parser for DirectParse {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn parse(&self, raw: &str) -> Result<Value, ParseFailure> {
        let candidate = extract_candidate(raw).ok_or_else(|| ParseFailure::new("no opening token"))?;
        parse_first_value(candidate)
    }
}

pub struct SanitizedParse;

impl Parser for SanitizedParse {
    fn name(&self) -> &'static str {
        "sanitized"
    }

    fn parse(&self, raw: &str) -> Result<Value, ParseFailure> {
        let candidate = extract_candidate(raw).ok_or_else(|| ParseFailure::new("no opening token"))?;
        parse_first_value(&sanitize(candidate))
    }
}

pub struct TruncatedParse;

/// Closing positions tried, newest first, before giving up.
const MAX_TRUNCATION_CANDIDATES: usize = 64;

impl Parser for TruncatedParse {
    fn name(&self) -> &'static str {
        "truncated"
    }

    fn parse(&self, raw: &str) -> Result<Value, ParseFailure> {
        let candidate = extract_candidate(raw).ok_or_else(|| ParseFailure::new("no opening token"))?;
        let text = sanitize(candidate);
        let closings = closing_points(&text);
        if closings.is_empty() {
            return Err(ParseFailure::new("no balanced closing token"));
        }

        let mut last_failure = None;
        for (end, open) in closings.iter().rev().take(MAX_TRUNCATION_CANDIDATES) {
            let mut attempt = String::with_capacity(end + open.len());
            attempt.push_str(&text[..*end]);
            attempt.extend(open.iter().rev());
            match parse_first_value(&attempt) {
                Ok(v) => return Ok(v),
                Err(e) => last_failure = Some(e),
            }
        }
        Err(last_failure.unwrap_or_else(|| ParseFailure::new("no closing point parsed")))
    }
}

/// Pulls individually recognizable `"key": "value"` pairs for a fixed field set.
pub struct MinimalFields {
    re: Regex,
}

impl MinimalFields {
    pub fn new(fields: &[&str]) -> Result<Self, regex::Error> {
        let alternatives: Vec<String> = fields.iter().map(|f| regex::escape(f)).collect();
        let re = Regex::new(&format!(
            r#""({})"\s*:\s*"((?:[^"\\]|\\.)*)""#,
            alternatives.join("|")
        ))?;
        Ok(Self { re })
    }

    /// The fields every classification-shaped reply carries.
    pub fn priority_and_tag() -> Self {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE
            .get_or_init(|| Regex::new(r#""(priority|tag)"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap())
            .clone();
        Self { re }
    }
}

impl Parser for MinimalFields {
    fn name(&self) -> &'static str {
        "minimal_fields"
    }

    fn confidence(&self) -> Confidence {
        Confidence::Low
    }

    fn parse(&self, raw: &str) -> Result<Value, ParseFailure> {
        let mut fields = Map::new();
        for caps in self.re.captures_iter(raw) {
            let key = caps[1].to_string();
            if fields.contains_key(&key) {
                continue;
            }
            let captured = &caps[2];
            let value = serde_json::from_str::<String>(&format!("\"{}\"", captured))
                .unwrap_or_else(|_| captured.to_string());
            fields.insert(key, Value::String(value));
        }
        if fields.is_empty() {
            return Err(ParseFailure::new("no recognizable fields"));
        }
        Ok(Value::Object(fields))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Fenced block body (closing fence optional), else text from the first `{`/`[`.
fn extract_candidate(raw: &str) -> Option<&str> {
    if let Some(start) = raw.find("```") {
        let after = start + 3;
        let body_start = match raw[after..].find('\n') {
            Some(nl) => after + nl + 1,
            None => after,
        };
        let rest = &raw[body_start..];
        let body = match rest.find("```") {
            Some(end) => &rest[..end],
            None => rest,
        };
        if let Some(candidate) = from_first_opening(body) {
            return Some(candidate);
        }
    }
    from_first_opening(raw)
}

fn from_first_opening(text: &str) -> Option<&str> {
    text.find(|c| c == '{' || c == '[')
        .map(|i| text[i..].trim_end())
        .filter(|s| !s.is_empty())
}

/// Parse the first complete JSON value, ignoring anything after it.
fn parse_first_value(text: &str) -> Result<Value, ParseFailure> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => {
            let offset = byte_offset(text, e.line(), e.column());
            Err(ParseFailure {
                message: e.to_string(),
                offset: Some(offset),
                window: window(text, offset).to_string(),
            })
        }
        None => Err(ParseFailure::new("empty input")),
    }
}

/// Convert serde_json's 1-based line/column into a byte offset.
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    let mut offset = (line_start + column.saturating_sub(1)).min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Up to 60 characters either side of `offset`.
fn window(text: &str, offset: usize) -> &str {
    let mut start = offset.saturating_sub(60);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (offset + 60).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

/// Single-pass, string-aware cleanup.
///
/// Inside strings: raw line breaks and tabs are escaped, other control
/// characters dropped. Outside strings: control characters, fence markers
/// (with their language tag) and commas directly before `}`/`]` are dropped.
fn sanitize(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escape = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            if escape {
                escape = false;
                out.push(c);
            } else {
                match c {
                    '\\' => {
                        escape = true;
                        out.push(c);
                    }
                    '"' => {
                        in_string = false;
                        out.push(c);
                    }
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c if c.is_control() => {}
                    c => out.push(c),
                }
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '`' => {
                let mut j = i;
                while j < chars.len() && chars[j] == '`' {
                    j += 1;
                }
                if j - i >= 3 {
                    while j < chars.len() && chars[j].is_ascii_alphabetic() {
                        j += 1;
                    }
                }
                i = j;
                continue;
            }
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_whitespace() || chars[j] == '`') {
                    j += 1;
                }
                let before_close = j < chars.len() && (chars[j] == '}' || chars[j] == ']');
                if !before_close {
                    out.push(c);
                }
            }
            '\n' | '\r' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
        i += 1;
    }
    out
}

/// Byte positions just after each balanced closing token, with the closers
/// still needed at that point (innermost last).
fn closing_points(text: &str) -> Vec<(usize, Vec<char>)> {
    let mut points = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() != Some(&c) {
                    break;
                }
                stack.pop();
                points.push((i + 1, stack.clone()));
                if stack.is_empty() {
                    break;
                }
            }
            _ => {}
        }
    }
    points
}
