//! Audit trail for unrecoverable completion output.
//!
//! When no repair layer can make sense of a reply, the raw text is kept on
//! disk so the failure can be investigated later. Files live in the
//! configured audit directory and are pruned at the start of each run.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;

use crate::util::atomic_write_str;

/// File-name-safe form: ASCII alphanumerics and '-' survive, the rest become '_'.
fn file_component(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Write raw completion output to the audit trail.
///
/// Creates `{audit_dir}/{timestamp}_{stage}_{unit}.txt` atomically and
/// returns its path.
pub fn write_audit_entry(
    audit_dir: &Path,
    stage: &str,
    unit: &str,
    raw_output: &str,
) -> Result<PathBuf, String> {
    std::fs::create_dir_all(audit_dir)
        .map_err(|e| format!("Failed to create audit dir {}: {}", audit_dir.display(), e))?;

    let path = audit_dir.join(format!(
        "{}_{}_{}.txt",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        file_component(stage),
        file_component(unit)
    ));
    atomic_write_str(&path, raw_output).map_err(|e| format!("Audit write failed: {}", e))?;
    Ok(path)
}

/// Best-effort variant for pipeline stages: failures are logged, never raised.
pub fn record_unrecoverable(audit_dir: Option<&Path>, stage: &str, unit: &str, raw_output: &str) {
    let Some(dir) = audit_dir else {
        return;
    };
    match write_audit_entry(dir, stage, unit, raw_output) {
        Ok(path) => log::info!("Audit: kept raw {} output for {} at {}", stage, unit, path.display()),
        Err(e) => log::warn!("Audit: {}", e),
    }
}

/// Delete audit files last modified more than `retention_days` ago.
///
/// Returns the number of files removed. Unreadable entries are left alone.
pub fn prune_audit_files(audit_dir: &Path, retention_days: u32) -> usize {
    let Ok(entries) = std::fs::read_dir(audit_dir) else {
        return 0;
    };
    let max_age = Duration::from_secs(u64::from(retention_days) * 24 * 3600);
    let now = SystemTime::now();

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age)
        })
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_audit_entry_creates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit_dir = dir.path().join("_audit");

        let path = write_audit_entry(&audit_dir, "extract", "record-42", "```json\n{\"title\":")
            .expect("write should succeed");

        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "```json\n{\"title\":");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.contains("_extract_record-42"));
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn test_write_audit_entry_sanitizes_unit() {
        let dir = tempfile::tempdir().expect("tempdir");

        let path = write_audit_entry(dir.path(), "group", "batch 3/1..5", "data")
            .expect("write should succeed");

        let filename = path.file_name().unwrap().to_str().unwrap();
        assert!(!filename.contains('/'));
        assert!(!filename.contains(' '));
        assert!(filename.contains("batch_3_1__5"));
    }

    #[test]
    fn test_record_unrecoverable_without_dir_is_noop() {
        record_unrecoverable(None, "classify", "cluster-1", "x");
    }

    #[test]
    fn test_prune_removes_old_keeps_recent() {
        let dir = tempfile::tempdir().expect("tempdir");

        let recent = write_audit_entry(dir.path(), "classify", "recent", "new").expect("write");
        let old = write_audit_entry(dir.path(), "classify", "old", "old").expect("write");

        let old_time =
            std::time::SystemTime::now() - std::time::Duration::from_secs(60 * 24 * 3600);
        filetime::set_file_mtime(&old, filetime::FileTime::from_system_time(old_time))
            .expect("set mtime");

        let pruned = prune_audit_files(dir.path(), 30);

        assert_eq!(pruned, 1);
        assert!(!old.exists(), "old file should be deleted");
        assert!(recent.exists(), "recent file should be kept");
    }
}
