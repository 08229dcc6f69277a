//! Stage 1: record extraction and normalization.
//!
//! Each pending record becomes `ready_to_group`, `irrelevant` or `error`.
//! Records whose completion call fails transiently stay `pending`.

pub mod extract;
pub mod normalize;

pub use extract::{process_record, ExtractOutcome};
