use std::fs;
use std::path::{Path, PathBuf};

use crate::types::Config;

/// Get the state directory (~/.eventdesk), creating it on first use.
pub fn state_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    let dir = home.join(".eventdesk");

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create state dir: {}", e))?;
    }

    Ok(dir)
}

/// Get the canonical config file path (~/.eventdesk/config.json)
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".eventdesk").join("config.json"))
}

/// Load configuration.
///
/// An explicit path must exist. The default path is optional: when
/// `~/.eventdesk/config.json` is absent, serde defaults apply.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, String> {
    let path = match explicit {
        Some(p) => {
            if !p.exists() {
                return Err(format!("Config file not found at {}", p.display()));
            }
            p.to_path_buf()
        }
        None => {
            let p = config_path()?;
            if !p.exists() {
                log::info!("No config at {}, using defaults", p.display());
                return Ok(Config::default());
            }
            p
        }
    };

    let content =
        fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;
    parse_config(&content)
}

/// Parse and validate config JSON.
pub fn parse_config(content: &str) -> Result<Config, String> {
    let config: Config =
        serde_json::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values that would stall or loop the pipeline.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let p = &config.pipeline;
    if p.grouping_batch_size == 0 || p.prioritizer_batch_size == 0 || p.consolidator_batch_size == 0
    {
        return Err("Batch sizes must be greater than zero".into());
    }
    if p.grouping_min_batch == 0 {
        return Err("groupingMinBatch must be at least 1".into());
    }
    if !(0.0..=1.0).contains(&p.similarity_threshold) {
        return Err(format!(
            "similarityThreshold must be within [0, 1], got {}",
            p.similarity_threshold
        ));
    }
    if config.completion.model.trim().is_empty() {
        return Err("completion.model is required".into());
    }
    Ok(())
}

/// Resolve the SQLite path: config override, else `~/.eventdesk/eventdesk.db`.
pub fn resolve_database_path(config: &Config) -> Result<PathBuf, String> {
    match &config.database_path {
        Some(p) => Ok(p.clone()),
        None => Ok(state_dir()?.join("eventdesk.db")),
    }
}

/// Resolve the audit directory: config override, else `~/.eventdesk/_audit`.
pub fn resolve_audit_dir(config: &Config) -> Result<PathBuf, String> {
    match &config.audit_dir {
        Some(p) => Ok(p.clone()),
        None => Ok(state_dir()?.join("_audit")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_explicit_missing_file_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = load_config(Some(&dir.path().join("nope.json")));
        assert!(result.unwrap_err().contains("not found"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"databasePath": "/tmp/desk.db", "pipeline": {"maxUnitsPerRun": 10}}"#)
            .unwrap();
        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/desk.db")));
        assert_eq!(config.pipeline.max_units_per_run, 10);
        assert_eq!(
            resolve_database_path(&config).unwrap(),
            PathBuf::from("/tmp/desk.db")
        );
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let result = parse_config(r#"{"pipeline": {"groupingBatchSize": 0}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let result = parse_config(r#"{"pipeline": {"similarityThreshold": 1.5}}"#);
        assert!(result.unwrap_err().contains("similarityThreshold"));
    }
}
