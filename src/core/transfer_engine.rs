mod native_copy;
mod robocopy;
mod rsync;

pub use native_copy::NativeMirrorEngine;
pub use robocopy::RobocopyEngine;
pub use rsync::RsyncEngine;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Robocopy-compatible status bits. The native engine reports these too so
/// one classifier covers both.
pub mod status {
    pub const NO_CHANGE: i32 = 0;
    pub const COPIED: i32 = 1;
    pub const EXTRAS: i32 = 2;
    pub const MISMATCH: i32 = 4;
    pub const FAILED: i32 = 8;
    pub const FATAL: i32 = 16;
}

/// Lowest robocopy status that means the copy did not complete.
pub const ROBOCOPY_FATAL_THRESHOLD: i32 = status::FAILED;

/// Outcome class of one mirror run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    /// Everything copied (or already in place).
    Success,
    /// Tool flagged mismatched entries but nothing failed to copy.
    PartialMismatch,
    /// Files were left uncopied or the run aborted.
    Fatal,
}

impl CopyStatus {
    pub fn from_robocopy(code: i32) -> Self {
        match code {
            c if c < 0 || c >= ROBOCOPY_FATAL_THRESHOLD => Self::Fatal,
            c if c & status::MISMATCH != 0 => Self::PartialMismatch,
            _ => Self::Success,
        }
    }

    pub fn from_rsync(code: i32) -> Self {
        match code {
            0 => Self::Success,
            // 24: source files vanished mid-transfer
            24 => Self::PartialMismatch,
            _ => Self::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferEngineType {
    Robocopy,
    Rsync,
    #[default]
    Native,
}

#[derive(Debug, Clone)]
pub struct MirrorRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub retries: u32,
    pub retry_wait: Duration,
    /// Transcript file; engines append to it.
    pub log_file: PathBuf,
}

/// A tool that makes `destination` an exact copy of `source`.
#[async_trait]
pub trait MirrorEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the mirror and return the tool's raw status code.
    ///
    /// `Err` is reserved for failures to run the tool at all.
    async fn mirror(&self, req: &MirrorRequest) -> Result<i32>;

    fn classify(&self, code: i32) -> CopyStatus;
}

pub fn create_engine(engine_type: TransferEngineType, verify: bool) -> Arc<dyn MirrorEngine> {
    match engine_type {
        TransferEngineType::Robocopy => Arc::new(RobocopyEngine),
        TransferEngineType::Rsync => Arc::new(RsyncEngine),
        TransferEngineType::Native => Arc::new(NativeMirrorEngine {
            verify,
            ..Default::default()
        }),
    }
}

/// BLAKE3 digest recorded while a file was copied.
#[derive(Debug, Clone)]
pub struct FileHash {
    pub relative_path: PathBuf,
    pub hash: [u8; 32],
    pub size: u64,
}
