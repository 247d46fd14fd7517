use crate::core::transfer_engine::{CopyStatus, MirrorEngine, MirrorRequest, status};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Windows' built-in mirroring tool.
pub struct RobocopyEngine;

impl RobocopyEngine {
    fn args(req: &MirrorRequest) -> Vec<String> {
        vec![
            req.source.display().to_string(),
            req.destination.display().to_string(),
            "/MIR".to_string(),
            "/COPY:DAT".to_string(),
            "/DCOPY:T".to_string(),
            format!("/R:{}", req.retries),
            format!("/W:{}", req.retry_wait.as_secs()),
            "/NP".to_string(),
            "/NDL".to_string(),
            format!("/LOG+:{}", req.log_file.display()),
        ]
    }
}

#[async_trait]
impl MirrorEngine for RobocopyEngine {
    fn name(&self) -> &'static str {
        "robocopy"
    }

    async fn mirror(&self, req: &MirrorRequest) -> Result<i32> {
        let args = Self::args(req);
        debug!(args = ?args, "Running robocopy");

        let exit = Command::new("robocopy")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| anyhow!("Failed to spawn robocopy: {}", e))?;

        Ok(exit.code().unwrap_or(status::FATAL))
    }

    fn classify(&self, code: i32) -> CopyStatus {
        CopyStatus::from_robocopy(code)
    }
}
