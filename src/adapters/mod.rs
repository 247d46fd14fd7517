use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::{AppConfig, PlatformKind};
use crate::context::Platform;
use crate::core::discovery::LocalFs;
use crate::core::provisioning::{Provisioner, installer_file_name};
use crate::core::safe_copy::SafeCopy;

mod linux;
pub mod simulated;
mod windows;

/// Wire up the real OS collaborators for the configured platform.
pub fn get_platform(config: &AppConfig) -> Platform {
    let copier = SafeCopy::from_config(&config.copy);
    let provisioner = Arc::new(HttpProvisioner::new(config.platform));

    match config.platform {
        PlatformKind::Windows => Platform {
            services: Arc::new(windows::WindowsServices),
            shares: Arc::new(windows::WindowsShares),
            firewall: Arc::new(windows::WindowsFirewall),
            fs: Arc::new(LocalFs),
            provisioner,
            copier,
        },
        PlatformKind::Linux => Platform {
            services: Arc::new(linux::SystemdServices),
            shares: Arc::new(linux::SambaUserShares::new(config.import.mount_root.clone())),
            firewall: Arc::new(linux::UfwFirewall),
            fs: Arc::new(LocalFs),
            provisioner,
            copier,
        },
    }
}

pub(crate) struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run a command to completion. `Err` only when it cannot be started.
pub(crate) async fn run<I, S>(program: &str, args: I) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn {}", program))?;

    let out = CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(program, code = ?out.code, "Command finished");
    Ok(out)
}

/// Like [`run`], but a non-zero exit is an error carrying the tool's output.
pub(crate) async fn run_checked<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = run(program, args).await?;
    if !out.success() {
        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim()
        } else {
            out.stderr.trim()
        };
        bail!("{} exited with {:?}: {}", program, out.code, detail);
    }
    Ok(out.stdout)
}

/// `<binary> --version`; some builds print the banner on stderr.
pub(crate) async fn binary_version(binary: &Path) -> Result<String> {
    let program = binary.to_string_lossy();
    let out = run(&program, ["--version"]).await?;
    if !out.success() {
        bail!("{} --version exited with {:?}", program, out.code);
    }
    Ok(format!("{}{}", out.stdout, out.stderr))
}

/// Downloads over HTTPS and runs the installer with the platform's elevation.
pub struct HttpProvisioner {
    client: reqwest::Client,
    platform: PlatformKind,
}

impl HttpProvisioner {
    pub fn new(platform: PlatformKind) -> Self {
        Self {
            client: reqwest::Client::new(),
            platform,
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
        let dest = dest_dir.join(installer_file_name(url));

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(&dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(dest = %dest.display(), bytes = written, "Installer downloaded");
        Ok(dest)
    }

    async fn launch(&self, installer: &Path) -> Result<()> {
        let path = installer.to_string_lossy().into_owned();
        let extension = installer
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        match self.platform {
            PlatformKind::Windows => {
                let start = if extension == "msi" {
                    format!(
                        "Start-Process msiexec.exe -ArgumentList '/i','\"{}\"' -Verb RunAs -Wait",
                        path
                    )
                } else {
                    format!("Start-Process -FilePath '{}' -Verb RunAs -Wait", path)
                };
                run_checked("powershell.exe", ["-NoProfile", "-Command", start.as_str()]).await?;
            }
            PlatformKind::Linux => match extension.as_str() {
                "deb" => {
                    run_checked("dpkg", ["-i", path.as_str()]).await?;
                }
                "rpm" => {
                    run_checked("rpm", ["-i", path.as_str()]).await?;
                }
                _ => {
                    run_checked(&path, std::iter::empty::<&str>()).await?;
                }
            },
        }
        Ok(())
    }
}
