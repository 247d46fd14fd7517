//! Verified bulk tree replication used for every data movement on both sides.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{error, info, warn};

use crate::config::CopyConfig;
use crate::core::transfer_engine::{CopyStatus, MirrorEngine, MirrorRequest, create_engine};
use crate::error::MigrationError;

#[derive(Clone)]
pub struct SafeCopy {
    engine: Arc<dyn MirrorEngine>,
    retries: u32,
    retry_wait: Duration,
    log_dir: PathBuf,
}

impl SafeCopy {
    pub fn new(engine: Arc<dyn MirrorEngine>, config: &CopyConfig) -> Self {
        Self {
            engine,
            retries: config.retries,
            retry_wait: Duration::from_secs(config.retry_wait_secs),
            log_dir: config.log_dir.clone(),
        }
    }

    pub fn from_config(config: &CopyConfig) -> Self {
        Self::new(create_engine(config.engine, config.verify), config)
    }

    /// Mirror `source` into `destination`, creating the destination if needed.
    ///
    /// Returns the status class on success; a fatal class (or failing to run
    /// the tool at all) becomes `MigrationError::CopyFailed`.
    pub async fn mirror(
        &self,
        source: &Path,
        destination: &Path,
        label: &str,
    ) -> Result<CopyStatus, MigrationError> {
        let log_file = self.log_dir.join(format!(
            "{}-{}.log",
            Local::now().format("%Y%m%d_%H%M%S"),
            label
        ));

        let failed = |code: i32| MigrationError::CopyFailed {
            label: label.to_string(),
            src: source.to_path_buf(),
            dest: destination.to_path_buf(),
            code,
            log: log_file.clone(),
        };

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| MigrationError::io(destination, e))?;
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| MigrationError::io(&self.log_dir, e))?;

        info!(
            label,
            engine = self.engine.name(),
            source = %source.display(),
            destination = %destination.display(),
            "Mirroring"
        );

        let req = MirrorRequest {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            retries: self.retries,
            retry_wait: self.retry_wait,
            log_file: log_file.clone(),
        };

        let code = match self.engine.mirror(&req).await {
            Ok(code) => code,
            Err(e) => {
                error!(label, error = %e, "Copy tool could not run");
                return Err(failed(-1));
            }
        };

        match self.engine.classify(code) {
            CopyStatus::Success => {
                info!(label, code, "Mirror complete");
                Ok(CopyStatus::Success)
            }
            CopyStatus::PartialMismatch => {
                warn!(
                    label,
                    code,
                    log = %log_file.display(),
                    "Mirror completed with mismatches; review the transcript"
                );
                Ok(CopyStatus::PartialMismatch)
            }
            CopyStatus::Fatal => {
                error!(label, code, log = %log_file.display(), "Mirror failed");
                Err(failed(code))
            }
        }
    }
}
