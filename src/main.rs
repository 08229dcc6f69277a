//! `eventdesk` run surface: move every pipeline stage forward once.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use eventdesk_lib::completion::HttpCompletionFactory;
use eventdesk_lib::executor::{run_pipeline, RunOptions};
use eventdesk_lib::state::{load_config, resolve_database_path, validate_config};
use eventdesk_lib::types::{GroupingMode, Stage};

#[derive(Parser)]
#[command(name = "eventdesk")]
#[command(about = "Turn raw news records into prioritized event clusters")]
#[command(version)]
struct Cli {
    /// Stage to run
    #[arg(long, value_enum, default_value_t = StageArg::All)]
    stage: StageArg,

    /// How stage 2 assigns records to clusters
    #[arg(long, value_enum, default_value_t = ModeArg::Incremental)]
    mode: ModeArg,

    /// Units (records or clusters) per stage; overrides the config
    #[arg(long)]
    max_units: Option<usize>,

    /// Cluster day (YYYY-MM-DD); defaults to today in UTC
    #[arg(long, value_parser = parse_day)]
    day: Option<String>,

    /// Config file; defaults to ~/.eventdesk/config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite store; overrides the config
    #[arg(long)]
    db: Option<PathBuf>,

    /// Pool workers; overrides the config (never more than 8)
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    Extract,
    Group,
    Classify,
    Consolidate,
    All,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Extract => Stage::Extract,
            StageArg::Group => Stage::Group,
            StageArg::Classify => Stage::Classify,
            StageArg::Consolidate => Stage::Consolidate,
            StageArg::All => Stage::All,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Incremental,
    FullBatch,
}

impl From<ModeArg> for GroupingMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Incremental => GroupingMode::Incremental,
            ModeArg::FullBatch => GroupingMode::FullBatch,
        }
    }
}

fn parse_day(value: &str) -> Result<String, String> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(db) = cli.db {
        config.database_path = Some(db);
    }
    if let Err(e) = validate_config(&config) {
        eprintln!("Error: {}", e);
        return ExitCode::from(2);
    }
    let db_path = match resolve_database_path(&config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    let options = RunOptions {
        stage: cli.stage.into(),
        mode: cli.mode.into(),
        max_units: cli.max_units,
        day: cli.day,
        workers: cli.workers,
    };
    let factory = HttpCompletionFactory::new(config.completion.clone());

    match run_pipeline(&config, &db_path, &factory, &options) {
        Ok(summary) => {
            for line in summary.lines() {
                println!("{}", line);
            }
            if summary.is_failure() {
                eprintln!("Error: stage 1 had input and no record succeeded");
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}
