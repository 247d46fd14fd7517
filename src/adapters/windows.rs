//! Windows collaborators: the service control manager, SMB shares, icacls and
//! the advanced firewall, all driven through their command-line tools.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{binary_version, run, run_checked};
use crate::core::firewall::{Firewall, FirewallRule, RuleAction};
use crate::core::models::{ServiceHandle, ServiceState};
use crate::core::services::ServiceController;
use crate::core::shares::{AccessLevel, ShareInfo, SharePublisher};

/// Well-known SID for "Everyone", independent of the OS language.
const EVERYONE_SID: &str = "*S-1-1-0";

async fn powershell_json(script: &str) -> Result<String> {
    run_checked("powershell.exe", ["-NoProfile", "-NonInteractive", "-Command", script]).await
}

/// `ConvertTo-Json` emits a bare object for one result and nothing for none.
fn parse_json_list<T: for<'de> Deserialize<'de>>(text: &str) -> Result<Vec<T>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if text.starts_with('[') {
        serde_json::from_str(text).context("Failed to parse PowerShell output")
    } else {
        Ok(vec![serde_json::from_str(text).context("Failed to parse PowerShell output")?])
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CimService {
    name: String,
    display_name: Option<String>,
    state: Option<String>,
    path_name: Option<String>,
}

impl From<CimService> for ServiceHandle {
    fn from(s: CimService) -> Self {
        Self {
            state: ServiceState::parse(s.state.as_deref().unwrap_or_default()),
            display_name: s.display_name.unwrap_or_default(),
            command_line: s.path_name,
            name: s.name,
        }
    }
}

pub struct WindowsServices;

#[async_trait]
impl ServiceController for WindowsServices {
    async fn list(&self) -> Result<Vec<ServiceHandle>> {
        let json = powershell_json(
            "Get-CimInstance Win32_Service | Select-Object Name,DisplayName,State,PathName | ConvertTo-Json -Compress",
        )
        .await?;
        let services: Vec<CimService> = parse_json_list(&json)?;
        Ok(services.into_iter().map(Into::into).collect())
    }

    async fn query(&self, name: &str) -> Result<Option<ServiceHandle>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|s| s.name.eq_ignore_ascii_case(name)))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        // net waits for the stop to finish, sc does not
        run_checked("net", ["stop", name, "/y"])
            .await
            .with_context(|| format!("Failed to stop {}", name))?;
        Ok(())
    }

    async fn disable(&self, name: &str) -> Result<()> {
        run_checked("sc.exe", ["config", name, "start=", "disabled"])
            .await
            .with_context(|| format!("Failed to disable {}", name))?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        run_checked("net", ["start", name])
            .await
            .with_context(|| format!("Failed to start {}", name))?;
        Ok(())
    }

    async fn version_output(&self, binary: &Path) -> Result<String> {
        binary_version(binary).await
    }

    async fn is_elevated(&self) -> bool {
        run("net", ["session"]).await.is_ok_and(|out| out.success())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SmbShare {
    name: String,
    path: Option<String>,
}

fn grant_argument(account: &str, access: AccessLevel) -> String {
    let right = match access {
        AccessLevel::Read => "READ",
        AccessLevel::Change => "CHANGE",
        AccessLevel::Full => "FULL",
    };
    format!("/GRANT:{},{}", account, right)
}

/// `net share /GRANT` takes account names only, and "Everyone" is localized
/// ("Jeder", "Tout le monde", ...), so ask Windows for the name of the SID.
async fn everyone_account() -> Result<String> {
    let script = format!(
        "(New-Object System.Security.Principal.SecurityIdentifier('{}')).Translate([System.Security.Principal.NTAccount]).Value",
        EVERYONE_SID.trim_start_matches('*')
    );
    let name = run_checked("powershell.exe", ["-NoProfile", "-NonInteractive", "-Command", script.as_str()])
        .await?
        .trim()
        .to_string();
    if name.is_empty() {
        bail!("No account name for {}", EVERYONE_SID);
    }
    Ok(name)
}

pub struct WindowsShares;

impl WindowsShares {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(run("net", ["share", name]).await?.success())
    }
}

#[async_trait]
impl SharePublisher for WindowsShares {
    async fn list(&self) -> Result<Vec<ShareInfo>> {
        let json =
            powershell_json("Get-SmbShare | Select-Object Name,Path | ConvertTo-Json -Compress").await?;
        let shares: Vec<SmbShare> = parse_json_list(&json)?;
        Ok(shares
            .into_iter()
            .filter_map(|s| {
                let path = s.path.filter(|p| !p.is_empty())?;
                Some(ShareInfo {
                    name: s.name,
                    path: PathBuf::from(path),
                })
            })
            .collect())
    }

    async fn publish(&self, name: &str, path: &Path, access: AccessLevel) -> Result<()> {
        // net share cannot change permissions in place, so re-create
        if self.exists(name).await? {
            debug!(share = name, "Share exists, re-creating with requested access");
            run_checked("net", ["share", name, "/DELETE", "/Y"]).await?;
        }
        let account = everyone_account()
            .await
            .context("Failed to resolve the local name of Everyone")?;
        let target = format!("{}={}", name, path.display());
        let grant = grant_argument(&account, access);
        run_checked("net", ["share", target.as_str(), grant.as_str()])
            .await
            .with_context(|| format!("Failed to share {} as {}", path.display(), name))?;
        info!(share = name, path = %path.display(), access = ?access, "Share published");
        Ok(())
    }

    async fn unpublish(&self, name: &str) -> Result<()> {
        if !self.exists(name).await? {
            debug!(share = name, "Share already removed");
            return Ok(());
        }
        run_checked("net", ["share", name, "/DELETE", "/Y"]).await?;
        Ok(())
    }

    async fn grant_modify(&self, dir: &Path) -> Result<()> {
        let dir = dir.display().to_string();
        let grant = format!("{}:(OI)(CI)M", EVERYONE_SID);
        run_checked("icacls", [dir.as_str(), "/grant", grant.as_str(), "/T"])
            .await
            .with_context(|| format!("Failed to grant modify on {}", dir))?;
        Ok(())
    }

    fn remote_path(&self, server: &str, share: &str) -> PathBuf {
        PathBuf::from(format!(r"\\{}\{}", server, share))
    }
}

pub struct WindowsFirewall;

impl WindowsFirewall {
    async fn has_rule(&self, rule: &FirewallRule) -> Result<bool> {
        let name = format!("name={}", rule.name);
        let out = run("netsh", ["advfirewall", "firewall", "show", "rule", name.as_str()]).await?;
        Ok(out.success())
    }
}

#[async_trait]
impl Firewall for WindowsFirewall {
    async fn ensure_rule(&self, rule: &FirewallRule) -> Result<()> {
        if self.has_rule(rule).await? {
            debug!(rule = %rule.name, "Firewall rule already present");
            return Ok(());
        }
        let name = format!("name={}", rule.name);
        let action = match rule.action {
            RuleAction::Allow => "action=allow",
            RuleAction::Block => "action=block",
        };
        let port = format!("localport={}", rule.port);
        run_checked(
            "netsh",
            [
                "advfirewall",
                "firewall",
                "add",
                "rule",
                name.as_str(),
                "dir=in",
                action,
                "protocol=TCP",
                port.as_str(),
            ],
        )
        .await?;
        info!(rule = %rule.name, "Firewall rule added");
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        if !self.has_rule(rule).await? {
            return Ok(());
        }
        let name = format!("name={}", rule.name);
        run_checked("netsh", ["advfirewall", "firewall", "delete", "rule", name.as_str()]).await?;
        Ok(())
    }
}
