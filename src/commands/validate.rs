//! `unistore validate <dir>` - parse and validate every store descriptor.
//!
//! Nothing is opened: no connectors are contacted and no files besides the
//! descriptors are touched.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::config::{Descriptor, store_name};
use crate::registry::descriptor_files;

/// Outcome for one descriptor file.
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub name: Option<String>,
    /// Store type, when the file parsed.
    pub kind: Option<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl FileReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Checks every descriptor in `dir`, in file name order.
///
/// # Errors
///
/// Returns an error only if `dir` cannot be read.
pub fn check_dir(dir: &Path) -> Result<Vec<FileReport>> {
    let files = descriptor_files(dir)?;
    Ok(files.into_iter().map(check_file).collect())
}

fn check_file(path: PathBuf) -> FileReport {
    let mut report = FileReport {
        name: store_name(&path),
        path,
        kind: None,
        warnings: Vec::new(),
        error: None,
    };
    if report.name.is_none() {
        report.error = Some("cannot derive a store name from the file name".to_string());
        return report;
    }

    match Descriptor::load_from(&report.path) {
        Ok(descriptor) => {
            report.kind = Some(descriptor.kind.to_string());
            match descriptor.validate() {
                Ok(result) => report.warnings = result.warnings,
                Err(e) => report.error = Some(format!("{e:#}")),
            }
        },
        Err(e) => report.error = Some(format!("{e:#}")),
    }
    report
}

/// Execute the validate command.
///
/// # Errors
///
/// Returns an error if any descriptor is invalid.
pub fn execute(dir: &Path) -> Result<()> {
    let reports = check_dir(dir)?;
    if reports.is_empty() {
        println!("No store descriptors found in {}", dir.display());
        return Ok(());
    }

    let mut failed = 0usize;
    for report in &reports {
        let name = report.name.as_deref().unwrap_or("?");
        match &report.error {
            None => {
                let kind = report.kind.as_deref().unwrap_or("?");
                println!("ok    {name} ({kind})");
            },
            Some(error) => {
                failed += 1;
                println!("error {name} [{}]", report.path.display());
                for line in error.lines() {
                    println!("      {line}");
                }
            },
        }
        for warning in &report.warnings {
            println!("      warning: {warning}");
        }
    }

    println!();
    println!("{} descriptor(s), {failed} invalid", reports.len());
    if failed > 0 {
        bail!("{failed} store descriptor(s) failed validation");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_check_dir_reports_each_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cache.json"), r#"{"type": "lru", "option": {"size": 10}}"#).unwrap();
        fs::write(
            dir.path().join("sessions.xun.toml"),
            "type = \"xun\"\n[option]\ntable = \"bad table\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("remote.json"), r#"{"type": "redis"}"#).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let reports = check_dir(dir.path()).unwrap();
        let names: Vec<_> = reports.iter().map(|r| r.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["cache", "remote", "sessions"]);

        assert!(reports[0].is_ok());
        assert_eq!(reports[0].kind.as_deref(), Some("lru"));

        let remote = reports[1].error.as_deref().unwrap();
        assert!(remote.contains("require a connector"), "{remote}");

        let sessions = reports[2].error.as_deref().unwrap();
        assert!(sessions.contains("bad table"), "{sessions}");
    }

    #[test]
    fn test_parse_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        let reports = check_dir(dir.path()).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].is_ok());
        assert!(reports[0].kind.is_none());
    }

    #[test]
    fn test_execute_fails_on_invalid_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cache.json"), r#"{"type": "lru", "option": {"size": 0}}"#).unwrap();
        assert!(execute(dir.path()).is_err());

        fs::write(dir.path().join("cache.json"), r#"{"type": "lru"}"#).unwrap();
        assert!(execute(dir.path()).is_ok());
    }
}
