//! Fatal conditions that end a migration run.
//!
//! Anything in here terminates the invoking process with its own exit code.
//! Recoverable conditions are logged as warnings at the call site instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Share {path} is not reachable from this machine")]
    ShareUnreachable { path: PathBuf },

    #[error("No completed migration package found under {path}")]
    NoPackage { path: PathBuf },

    #[error(
        "{label} copy from {src} to {dest} failed with status {code} (transcript: {log})"
    )]
    CopyFailed {
        label: String,
        src: PathBuf,
        dest: PathBuf,
        code: i32,
        log: PathBuf,
    },

    #[error("No MySQL/MariaDB service is installed on this machine")]
    NoDatabaseService,

    #[error("Could not locate the {what} (searched {} location(s))", searched.len())]
    NotLocated {
        what: &'static str,
        searched: Vec<PathBuf>,
    },

    #[error("This command must be run with administrator privileges")]
    NotElevated,

    #[error("Cancelled by operator")]
    Cancelled,

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MigrationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this failure. Every variant gets its own code so
    /// wrapper scripts can tell them apart.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ShareUnreachable { .. } => 10,
            Self::NoPackage { .. } => 11,
            Self::CopyFailed { .. } => 12,
            Self::NoDatabaseService => 13,
            Self::NotLocated { .. } => 14,
            Self::NotElevated => 15,
            Self::Io { .. } => 20,
            Self::Cancelled => 130,
        }
    }
}
