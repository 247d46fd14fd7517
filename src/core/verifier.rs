//! Post-copy verification for the native mirror engine.
//!
//! Source files are hashed while they are copied; afterwards the destination
//! copies are re-read and compared against those digests. A mismatch here
//! means the mirror cannot be trusted for a database restore, so the engine
//! turns any finding into the FAILED status bit.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::transfer_engine::FileHash;

const READ_CHUNK: usize = 128 * 1024;

/// Findings are listed in the transcript up to this count.
const LISTED_FINDINGS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    Corrupt(PathBuf),
    Missing(PathBuf),
    Unreadable { path: PathBuf, error: String },
}

impl Finding {
    pub fn path(&self) -> &Path {
        match self {
            Finding::Corrupt(path) | Finding::Missing(path) => path,
            Finding::Unreadable { path, .. } => path,
        }
    }

    fn describe(&self) -> String {
        match self {
            Finding::Corrupt(path) => format!("{}: contents differ from source", path.display()),
            Finding::Missing(path) => format!("{}: missing in destination", path.display()),
            Finding::Unreadable { path, error } => format!("{}: unreadable ({error})", path.display()),
        }
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub files_checked: u64,
    pub bytes_checked: u64,
    pub findings: Vec<Finding>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Transcript lines for the run log, capped at a readable length.
    pub fn transcript_lines(&self) -> Vec<String> {
        if self.is_clean() {
            return vec![format!(
                "VERIFIED {} file(s), {} bytes",
                self.files_checked, self.bytes_checked
            )];
        }

        let mut lines = vec![format!(
            "VERIFY FAILED {} of {} file(s)",
            self.findings.len(),
            self.files_checked
        )];
        lines.extend(
            self.findings
                .iter()
                .take(LISTED_FINDINGS)
                .map(|f| format!("  {}", f.describe())),
        );
        if self.findings.len() > LISTED_FINDINGS {
            lines.push(format!("  ... {} more", self.findings.len() - LISTED_FINDINGS));
        }
        lines
    }
}

/// Re-read every copied file under `destination` and compare digests.
///
/// Blocking. Callers on the runtime must be inside `spawn_blocking`.
pub fn verify_copies(destination: &Path, copied: &[FileHash]) -> VerifyReport {
    let mut report = VerifyReport::default();

    for expected in copied {
        report.files_checked += 1;
        let target = destination.join(&expected.relative_path);
        let relative = expected.relative_path.clone();

        match digest(&target) {
            Ok(actual) if actual.as_bytes() == &expected.hash => {
                report.bytes_checked += expected.size;
            }
            Ok(_) => report.findings.push(Finding::Corrupt(relative)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.findings.push(Finding::Missing(relative))
            }
            Err(e) => {
                debug!(file = %target.display(), error = %e, "Could not re-read copied file");
                report.findings.push(Finding::Unreadable {
                    path: relative,
                    error: e.to_string(),
                });
            }
        }
    }

    if !report.is_clean() {
        warn!(
            findings = report.findings.len(),
            checked = report.files_checked,
            "Copied files did not verify"
        );
    }
    report
}

fn digest(path: &Path) -> io::Result<blake3::Hash> {
    let mut reader = BufReader::with_capacity(READ_CHUNK, File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(hasher.finalize());
        }
        hasher.update(&chunk[..n]);
    }
}
