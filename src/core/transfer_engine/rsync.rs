use crate::core::transfer_engine::{CopyStatus, MirrorEngine, MirrorRequest};
use crate::logging::LogThrottle;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use tokio::{io::AsyncReadExt, process::Command};
use tracing::{debug, warn};

/// rsync exit codes worth another attempt: socket/IO/protocol stream errors and timeouts.
const RETRYABLE_CODES: &[i32] = &[10, 11, 12, 30, 35];

pub struct RsyncEngine;

impl RsyncEngine {
    fn args(req: &MirrorRequest) -> Vec<String> {
        vec![
            "-a".to_string(),
            "--delete".to_string(),
            "--info=progress2".to_string(),
            "--no-inc-recursive".to_string(),
            format!("--log-file={}", req.log_file.display()),
            // trailing slash to copy contents
            format!("{}/", req.source.display()),
            req.destination.display().to_string(),
        ]
    }

    async fn run_once(req: &MirrorRequest) -> Result<i32> {
        let mut child = Command::new("rsync")
            .args(Self::args(req))
            .stdout(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn rsync process: {}", e))?;

        if let Some(mut stdout) = child.stdout.take() {
            let mut progress = ProgressParser::new()?;
            let throttle = LogThrottle::new(Duration::from_secs(2));
            let mut chunk = [0u8; 4096];
            loop {
                let n = match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "rsync output closed early");
                        break;
                    }
                };
                if let Some((bytes, percent)) = progress.feed(&chunk[..n])
                    && throttle.should_log()
                {
                    debug!(bytes, percent, "rsync progress");
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| anyhow!("Failed to wait for rsync: {}", e))?;

        Ok(status.code().unwrap_or(-1))
    }
}

/// Pulls the latest `--info=progress2` reading out of rsync's stdout.
///
/// Progress lines are separated by carriage returns and may be split across
/// reads, so a partial line is carried over to the next chunk.
struct ProgressParser {
    pattern: Regex,
    pending: String,
}

impl ProgressParser {
    fn new() -> Result<Self> {
        Ok(Self {
            // "  12,345,678   45%  10.2MB/s    0:01:02"
            pattern: Regex::new(r"^\s*([\d,]+)\s+(\d+)%")?,
            pending: String::new(),
        })
    }

    /// Latest (bytes, percent) completed within this chunk.
    fn feed(&mut self, chunk: &[u8]) -> Option<(u64, u8)> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let cut = self.pending.rfind(['\r', '\n'])?;
        let complete: String = self.pending.drain(..=cut).collect();

        complete
            .split(['\r', '\n'])
            .filter_map(|line| self.pattern.captures(line))
            .last()
            .map(|caps| {
                (
                    caps[1].replace(',', "").parse().unwrap_or(0),
                    caps[2].parse().unwrap_or(0),
                )
            })
    }
}

#[async_trait]
impl MirrorEngine for RsyncEngine {
    fn name(&self) -> &'static str {
        "rsync"
    }

    async fn mirror(&self, req: &MirrorRequest) -> Result<i32> {
        let mut attempt = 0;
        loop {
            let code = Self::run_once(req).await?;
            if code == 0 || !RETRYABLE_CODES.contains(&code) || attempt >= req.retries {
                return Ok(code);
            }

            attempt += 1;
            warn!(
                code,
                attempt,
                retries = req.retries,
                "rsync failed with a transient error, retrying"
            );
            tokio::time::sleep(req.retry_wait).await;
        }
    }

    fn classify(&self, code: i32) -> CopyStatus {
        CopyStatus::from_rsync(code)
    }
}
