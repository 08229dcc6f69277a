//! EventDesk: raw news records in, deduplicated and prioritized event clusters out.

pub mod audit;
pub mod classify;
pub mod completion;
pub mod consolidate;
pub mod db;
pub mod error;
pub mod executor;
pub mod grouping;
mod migrations;
pub mod pool;
pub mod prioritize;
pub mod processor;
pub mod prompts;
pub mod repair;
pub mod state;
pub mod taxonomy;
pub mod types;
pub mod util;
