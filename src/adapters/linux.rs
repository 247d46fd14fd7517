//! Linux collaborators: systemd, Samba usershares, chmod and ufw.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{binary_version, run, run_checked};
use crate::core::firewall::{Firewall, FirewallRule, RuleAction};
use crate::core::models::{ServiceHandle, ServiceState};
use crate::core::services::{ServiceController, is_database_service};
use crate::core::shares::{AccessLevel, ShareInfo, SharePublisher};

fn unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_string()
    } else {
        format!("{}.service", name)
    }
}

/// `UNIT LOAD ACTIVE SUB DESCRIPTION...` as printed with `--plain --no-legend`.
fn parse_list_units(text: &str) -> Vec<ServiceHandle> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let unit = cols.next()?;
            let _load = cols.next()?;
            let _active = cols.next()?;
            let sub = cols.next()?;
            let description = cols.collect::<Vec<_>>().join(" ");
            Some(ServiceHandle {
                name: unit.trim_end_matches(".service").to_string(),
                display_name: description,
                state: ServiceState::parse(sub),
                command_line: None,
            })
        })
        .collect()
}

/// `systemctl show` key=value output.
fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `{ path=/usr/sbin/mariadbd ; argv[]=/usr/sbin/mariadbd $MYSQLD_OPTS ; ... }` -> argv.
fn exec_start_command_line(value: &str) -> Option<String> {
    let start = value.find("argv[]=")? + "argv[]=".len();
    let rest = &value[start..];
    let end = rest.find(" ;").unwrap_or(rest.len());
    let argv = rest[..end].trim();
    (!argv.is_empty()).then(|| argv.to_string())
}

pub struct SystemdServices;

impl SystemdServices {
    async fn exec_start(&self, name: &str) -> Option<String> {
        let unit = unit_name(name);
        match run_checked("systemctl", ["show", "-p", "ExecStart", "--value", unit.as_str()]).await {
            Ok(value) => exec_start_command_line(&value),
            Err(e) => {
                debug!(unit = %unit, error = %e, "Could not read ExecStart");
                None
            }
        }
    }
}

#[async_trait]
impl ServiceController for SystemdServices {
    async fn list(&self) -> Result<Vec<ServiceHandle>> {
        let text = run_checked(
            "systemctl",
            ["list-units", "--type=service", "--all", "--no-legend", "--plain"],
        )
        .await?;
        let mut services = parse_list_units(&text);
        for handle in services.iter_mut().filter(|h| is_database_service(h)) {
            handle.command_line = self.exec_start(&handle.name).await;
        }
        Ok(services)
    }

    async fn query(&self, name: &str) -> Result<Option<ServiceHandle>> {
        let unit = unit_name(name);
        let text = run_checked(
            "systemctl",
            ["show", "-p", "LoadState,SubState,Description,ExecStart", unit.as_str()],
        )
        .await?;
        let props = parse_properties(&text);
        if props.get("LoadState").is_none_or(|s| s == "not-found") {
            return Ok(None);
        }
        Ok(Some(ServiceHandle {
            name: name.trim_end_matches(".service").to_string(),
            display_name: props.get("Description").cloned().unwrap_or_default(),
            state: ServiceState::parse(props.get("SubState").map(String::as_str).unwrap_or_default()),
            command_line: props.get("ExecStart").and_then(|v| exec_start_command_line(v)),
        }))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        run_checked("systemctl", ["stop", unit_name(name).as_str()]).await?;
        Ok(())
    }

    async fn disable(&self, name: &str) -> Result<()> {
        run_checked("systemctl", ["disable", unit_name(name).as_str()]).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        run_checked("systemctl", ["start", unit_name(name).as_str()]).await?;
        Ok(())
    }

    async fn version_output(&self, binary: &Path) -> Result<String> {
        binary_version(binary).await
    }

    async fn is_elevated(&self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no preconditions and cannot fail.
            unsafe { libc::geteuid() == 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

fn usershare_acl(access: AccessLevel) -> &'static str {
    match access {
        AccessLevel::Read => "Everyone:R",
        AccessLevel::Change | AccessLevel::Full => "Everyone:F",
    }
}

/// `net usershare info` prints an ini section per share.
fn parse_usershare_info(text: &str) -> Vec<ShareInfo> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.to_string());
        } else if let (Some(name), Some(path)) = (&current, line.strip_prefix("path=")) {
            out.push(ShareInfo {
                name: name.clone(),
                path: PathBuf::from(path),
            });
        }
    }
    out
}

/// Samba usershares. Remote shares are expected to be mounted under
/// `<mount_root>/<server>/<share>`.
pub struct SambaUserShares {
    mount_root: PathBuf,
}

impl SambaUserShares {
    pub fn new(mount_root: PathBuf) -> Self {
        Self { mount_root }
    }
}

#[async_trait]
impl SharePublisher for SambaUserShares {
    async fn list(&self) -> Result<Vec<ShareInfo>> {
        let out = run("net", ["usershare", "info"]).await?;
        if !out.success() {
            bail!("net usershare info failed: {}", out.stderr.trim());
        }
        Ok(parse_usershare_info(&out.stdout))
    }

    async fn publish(&self, name: &str, path: &Path, access: AccessLevel) -> Result<()> {
        // usershare add replaces an existing definition
        let path_arg = path.display().to_string();
        run_checked(
            "net",
            [
                "usershare",
                "add",
                name,
                path_arg.as_str(),
                "",
                usershare_acl(access),
                "guest_ok=y",
            ],
        )
        .await?;
        info!(share = name, path = %path.display(), access = ?access, "Share published");
        Ok(())
    }

    async fn unpublish(&self, name: &str) -> Result<()> {
        if !self.list().await?.iter().any(|s| s.name == name) {
            debug!(share = name, "Share already removed");
            return Ok(());
        }
        run_checked("net", ["usershare", "delete", name]).await?;
        Ok(())
    }

    async fn grant_modify(&self, dir: &Path) -> Result<()> {
        let dir = dir.display().to_string();
        run_checked("chmod", ["-R", "a+rwX", dir.as_str()]).await?;
        Ok(())
    }

    fn remote_path(&self, server: &str, share: &str) -> PathBuf {
        self.mount_root.join(server).join(share)
    }
}

pub struct UfwFirewall;

fn ufw_args(verb: Option<&str>, rule: &FirewallRule) -> Vec<String> {
    let action = match rule.action {
        RuleAction::Allow => "allow",
        RuleAction::Block => "deny",
    };
    let mut args: Vec<String> = verb.into_iter().map(str::to_string).collect();
    args.extend(
        [action, "proto", "tcp", "to", "any", "port"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(rule.port.to_string());
    args
}

#[async_trait]
impl Firewall for UfwFirewall {
    async fn ensure_rule(&self, rule: &FirewallRule) -> Result<()> {
        // ufw skips rules it already has
        let mut args = ufw_args(None, rule);
        args.extend(["comment".to_string(), rule.name.clone()]);
        run_checked("ufw", &args).await?;
        info!(rule = %rule.name, "Firewall rule added");
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        let out = run("ufw", ufw_args(Some("delete"), rule)).await?;
        if !out.success() {
            warn!(rule = %rule.name, output = %out.stdout.trim(), "ufw did not delete the rule");
        }
        Ok(())
    }
}
