//! The files the two sides coordinate through: metadata, readiness and completion.
//!
//! Marker content is for humans; only existence carries protocol meaning.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::models::{MigrationMetadata, Package};

/// Write the metadata record via a temp file and rename so a reader never
/// sees a half-written document.
pub fn write_metadata(path: &Path, metadata: &MigrationMetadata) -> Result<()> {
    let serialized =
        serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;

    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {}", temp_path.display()))?;
        file.write_all(serialized.as_bytes())
            .with_context(|| format!("Failed to write temp file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file {}", temp_path.display()))?;
    }

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    debug!(path = %path.display(), "Metadata written");
    Ok(())
}

/// Read the metadata record.
///
/// `Ok(None)` when the file is absent; `Err` when it exists but is not a
/// usable document.
pub fn read_metadata(path: &Path) -> Result<Option<MigrationMetadata>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let metadata = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(metadata))
}

/// Create a marker file that must not already exist.
fn create_marker(path: &Path, contents: &str) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            bail!("Marker {} already exists", path.display())
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to create {}", path.display())),
    };
    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all().ok();
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessMarker {
    pub package_id: String,
    pub share_path: String,
}

impl ReadinessMarker {
    pub fn render(&self) -> String {
        format!(
            "PackageId={}\r\nSharePath={}\r\n",
            self.package_id, self.share_path
        )
    }

    /// Key/value lines; unknown keys are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let mut package_id = None;
        let mut share_path = String::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "PackageId" => package_id = Some(value.trim().to_string()),
                    "SharePath" => share_path = value.trim().to_string(),
                    _ => {}
                }
            }
        }
        Some(Self {
            package_id: package_id.filter(|id| !id.is_empty())?,
            share_path,
        })
    }

    pub fn write(&self, package: &Package) -> Result<()> {
        create_marker(&package.ready_marker(), &self.render())
    }
}

pub fn completion_line(host: &str, at: DateTime<Local>) -> String {
    format!(
        "COPIED by {} at {}\r\n",
        host,
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Write the completion marker into a local package copy. An existing marker
/// is left as it is.
pub fn write_local_completion(package: &Package, host: &str) -> Result<PathBuf> {
    let path = package.completion_marker();
    match create_marker(&path, &completion_line(host, Local::now())) {
        Ok(()) => {}
        Err(e) if path.exists() => warn!(error = %e, "Completion marker already present"),
        Err(e) => return Err(e),
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn metadata_write_then_read() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("od_migration.json");
        let metadata = MigrationMetadata {
            engine: "MariaDB".into(),
            version: "10.5.22".into(),
            version_major_minor: "10.5".into(),
            source_host: "OLDSERVER".into(),
            ..Default::default()
        };

        write_metadata(&path, &metadata).unwrap();
        let read = read_metadata(&path).unwrap().unwrap();
        assert_eq!(read, metadata);

        // no temp file left behind
        let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_metadata_is_none_and_garbage_is_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("od_migration.json");
        assert!(read_metadata(&path).unwrap().is_none());

        fs::write(&path, "not json").unwrap();
        assert!(read_metadata(&path).is_err());
    }

    #[test]
    fn readiness_marker_parse() {
        let marker = ReadinessMarker {
            package_id: "od_migration_20240101_120000".into(),
            share_path: r"\\OLD\ODMigration\od_migration_20240101_120000".into(),
        };
        assert_eq!(ReadinessMarker::parse(&marker.render()), Some(marker));
        assert_eq!(ReadinessMarker::parse("Hello\nSharePath=x"), None);
    }

    #[test]
    fn readiness_marker_is_written_once() {
        let temp = tempdir().unwrap();
        let package = Package::new(temp.path(), "od_migration_20240101_120000");
        fs::create_dir_all(&package.root).unwrap();
        let marker = ReadinessMarker {
            package_id: package.id.clone(),
            share_path: "x".into(),
        };

        marker.write(&package).unwrap();
        assert!(marker.write(&package).is_err());
    }

    #[test]
    fn completion_marker_tolerates_existing() {
        let temp = tempdir().unwrap();
        let package = Package::new(temp.path(), "od_migration_20240101_120000");
        fs::create_dir_all(&package.root).unwrap();

        let path = write_local_completion(&package, "NEWSERVER").unwrap();
        let first = fs::read_to_string(&path).unwrap();
        assert!(first.starts_with("COPIED by NEWSERVER"));

        write_local_completion(&package, "OTHER").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }
}
