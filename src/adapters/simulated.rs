//! In-memory stand-ins for the OS collaborators.
//!
//! File copies are real (they run against whatever directories the caller
//! hands out, normally temp dirs); services, shares, the firewall and the
//! network between machines are tables behind mutexes.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::AppConfig;
use crate::context::{MigrationContext, Platform};
use crate::core::discovery::{DirectoryLister, LocalFs};
use crate::core::firewall::{Firewall, FirewallRule};
use crate::core::models::{ServiceHandle, ServiceState};
use crate::core::operator::Operator;
use crate::core::provisioning::{Provisioner, installer_file_name};
use crate::core::safe_copy::SafeCopy;
use crate::core::services::ServiceController;
use crate::core::shares::{AccessLevel, ShareInfo, SharePublisher};
use crate::core::transfer_engine::{CopyStatus, MirrorEngine, MirrorRequest, NativeMirrorEngine, status};
use crate::core::wait::Sleeper;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct SimService {
    handle: ServiceHandle,
    disabled: bool,
}

#[derive(Default)]
struct ServiceTable {
    services: BTreeMap<String, SimService>,
    version_output: String,
}

#[derive(Clone, Default)]
pub struct SimulatedServices {
    table: Arc<Mutex<ServiceTable>>,
}

impl SimulatedServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, name: &str, state: ServiceState, command_line: Option<&str>) {
        lock(&self.table).services.insert(
            name.to_ascii_lowercase(),
            SimService {
                handle: ServiceHandle {
                    name: name.to_string(),
                    display_name: name.to_string(),
                    state,
                    command_line: command_line.map(str::to_string),
                },
                disabled: false,
            },
        );
    }

    /// What `--version` prints for any binary.
    pub fn set_version_output(&self, output: &str) {
        lock(&self.table).version_output = output.to_string();
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        lock(&self.table)
            .services
            .get(&name.to_ascii_lowercase())
            .map(|s| s.handle.state)
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        lock(&self.table)
            .services
            .get(&name.to_ascii_lowercase())
            .is_some_and(|s| s.disabled)
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut SimService)) -> Result<()> {
        let mut table = lock(&self.table);
        match table.services.get_mut(&name.to_ascii_lowercase()) {
            Some(service) => {
                f(service);
                Ok(())
            }
            None => bail!("Service {} does not exist", name),
        }
    }
}

#[async_trait]
impl ServiceController for SimulatedServices {
    async fn list(&self) -> Result<Vec<ServiceHandle>> {
        Ok(lock(&self.table)
            .services
            .values()
            .map(|s| s.handle.clone())
            .collect())
    }

    async fn query(&self, name: &str) -> Result<Option<ServiceHandle>> {
        Ok(lock(&self.table)
            .services
            .get(&name.to_ascii_lowercase())
            .map(|s| s.handle.clone()))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.update(name, |s| s.handle.state = ServiceState::Stopped)
    }

    async fn disable(&self, name: &str) -> Result<()> {
        self.update(name, |s| s.disabled = true)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.update(name, |s| s.handle.state = ServiceState::Running)
    }

    async fn version_output(&self, binary: &Path) -> Result<String> {
        let output = lock(&self.table).version_output.clone();
        if output.is_empty() {
            bail!("{} did not report a version", binary.display());
        }
        Ok(output)
    }

    async fn is_elevated(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct ShareEntry {
    name: String,
    path: PathBuf,
    access: AccessLevel,
}

/// Share tables of every simulated host, keyed by lowercased host then share name.
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    hosts: Arc<Mutex<HashMap<String, HashMap<String, ShareEntry>>>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, server: &str, share: &str) -> Option<PathBuf> {
        lock(&self.hosts)
            .get(&server.to_ascii_lowercase())?
            .get(&share.to_ascii_lowercase())
            .map(|entry| entry.path.clone())
    }
}

#[derive(Clone)]
pub struct SimulatedShares {
    host: String,
    network: SimulatedNetwork,
    granted: Arc<Mutex<Vec<PathBuf>>>,
}

impl SimulatedShares {
    pub fn new(host: &str, network: SimulatedNetwork) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            network,
            granted: Arc::default(),
        }
    }

    pub fn access_of(&self, name: &str) -> Option<AccessLevel> {
        lock(&self.network.hosts)
            .get(&self.host)?
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.access)
    }

    pub fn share_count(&self) -> usize {
        lock(&self.network.hosts)
            .get(&self.host)
            .map_or(0, HashMap::len)
    }

    /// Directories that were opened up for remote writers.
    pub fn granted(&self) -> Vec<PathBuf> {
        lock(&self.granted).clone()
    }
}

#[async_trait]
impl SharePublisher for SimulatedShares {
    async fn list(&self) -> Result<Vec<ShareInfo>> {
        Ok(lock(&self.network.hosts)
            .get(&self.host)
            .map(|shares| {
                shares
                    .values()
                    .map(|entry| ShareInfo {
                        name: entry.name.clone(),
                        path: entry.path.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn publish(&self, name: &str, path: &Path, access: AccessLevel) -> Result<()> {
        if !path.is_dir() {
            bail!("Cannot share {}: not a directory", path.display());
        }
        lock(&self.network.hosts)
            .entry(self.host.clone())
            .or_default()
            .insert(
                name.to_ascii_lowercase(),
                ShareEntry {
                    name: name.to_string(),
                    path: path.to_path_buf(),
                    access,
                },
            );
        Ok(())
    }

    async fn unpublish(&self, name: &str) -> Result<()> {
        if let Some(shares) = lock(&self.network.hosts).get_mut(&self.host) {
            shares.remove(&name.to_ascii_lowercase());
        }
        Ok(())
    }

    async fn grant_modify(&self, dir: &Path) -> Result<()> {
        lock(&self.granted).push(dir.to_path_buf());
        Ok(())
    }

    fn remote_path(&self, server: &str, share: &str) -> PathBuf {
        self.network
            .resolve(server, share)
            .unwrap_or_else(|| PathBuf::from(format!("//{}/{}", server, share)))
    }
}

#[derive(Clone, Default)]
pub struct SimulatedFirewall {
    rules: Arc<Mutex<Vec<FirewallRule>>>,
}

impl SimulatedFirewall {
    pub fn rules(&self) -> Vec<FirewallRule> {
        lock(&self.rules).clone()
    }
}

#[async_trait]
impl Firewall for SimulatedFirewall {
    async fn ensure_rule(&self, rule: &FirewallRule) -> Result<()> {
        let mut rules = lock(&self.rules);
        if !rules.iter().any(|r| r.name == rule.name) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        lock(&self.rules).retain(|r| r.name != rule.name);
        Ok(())
    }
}

/// Writes a placeholder installer; "running" it registers a database service.
pub struct SimulatedProvisioner {
    installs: Option<(SimulatedServices, String)>,
    launched: Mutex<Vec<PathBuf>>,
}

impl SimulatedProvisioner {
    pub fn installing(services: SimulatedServices, service_name: &str) -> Self {
        Self {
            installs: Some((services, service_name.to_string())),
            launched: Mutex::default(),
        }
    }

    /// Every download fails.
    pub fn failing() -> Self {
        Self {
            installs: None,
            launched: Mutex::default(),
        }
    }

    pub fn launched(&self) -> Vec<PathBuf> {
        lock(&self.launched).clone()
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        if self.installs.is_none() {
            bail!("Download of {} failed", url);
        }
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(installer_file_name(url));
        tokio::fs::write(&dest, url.as_bytes()).await?;
        Ok(dest)
    }

    async fn launch(&self, installer: &Path) -> Result<()> {
        lock(&self.launched).push(installer.to_path_buf());
        if let Some((services, name)) = &self.installs {
            services.add_service(name, ServiceState::Running, None);
        }
        Ok(())
    }
}

/// The local filesystem, restricted to one sandbox directory.
pub struct SandboxFs {
    root: PathBuf,
}

impl SandboxFs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn inside(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

impl DirectoryLister for SandboxFs {
    fn exists(&self, path: &Path) -> bool {
        self.inside(path) && LocalFs.exists(path)
    }

    fn list_dirs(&self, path: &Path) -> Vec<PathBuf> {
        if self.inside(path) {
            LocalFs.list_dirs(path)
        } else {
            Vec::new()
        }
    }

    fn roots(&self) -> Vec<PathBuf> {
        vec![self.root.clone()]
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        self.inside(path).then(|| LocalFs.read_to_string(path)).flatten()
    }
}

/// Yields briefly instead of sleeping for the requested interval.
pub struct FastSleeper;

#[async_trait]
impl Sleeper for FastSleeper {
    async fn sleep(&self, _duration: Duration) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Reports a fatal status without copying anything.
struct FailingEngine;

#[async_trait]
impl MirrorEngine for FailingEngine {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn mirror(&self, _req: &MirrorRequest) -> Result<i32> {
        Ok(status::FATAL)
    }

    fn classify(&self, code: i32) -> CopyStatus {
        CopyStatus::from_robocopy(code)
    }
}

/// One simulated machine.
#[derive(Clone)]
pub struct SimulatedPlatform {
    pub host: String,
    pub services: SimulatedServices,
    pub shares: SimulatedShares,
    pub firewall: SimulatedFirewall,
    pub provisioner: Arc<SimulatedProvisioner>,
    sandbox: PathBuf,
    engine: Arc<dyn MirrorEngine>,
}

impl SimulatedPlatform {
    pub fn new(host: &str, sandbox: &Path) -> Self {
        Self::on_network(host, sandbox, SimulatedNetwork::new())
    }

    /// A machine that can see the shares of every other machine on `network`.
    pub fn on_network(host: &str, sandbox: &Path, network: SimulatedNetwork) -> Self {
        let services = SimulatedServices::new();
        Self {
            host: host.to_string(),
            provisioner: Arc::new(SimulatedProvisioner::installing(services.clone(), "MariaDB")),
            services,
            shares: SimulatedShares::new(host, network),
            firewall: SimulatedFirewall::default(),
            sandbox: sandbox.to_path_buf(),
            engine: Arc::new(NativeMirrorEngine::default()),
        }
    }

    /// The same machine, but every bulk copy reports a fatal status.
    pub fn failing_copies(&self) -> Self {
        Self {
            engine: Arc::new(FailingEngine),
            ..self.clone()
        }
    }

    pub fn platform(&self, config: &AppConfig) -> Platform {
        Platform {
            services: Arc::new(self.services.clone()),
            shares: Arc::new(self.shares.clone()),
            firewall: Arc::new(self.firewall.clone()),
            fs: Arc::new(SandboxFs::new(&self.sandbox)),
            provisioner: self.provisioner.clone(),
            copier: SafeCopy::new(self.engine.clone(), &config.copy),
        }
    }

    pub fn context(&self, config: AppConfig, operator: Arc<dyn Operator>) -> MigrationContext {
        let platform = self.platform(&config);
        MigrationContext::new(config, platform, operator, Arc::new(FastSleeper), self.host.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn publishing_twice_keeps_one_registration() {
        let temp = tempdir().unwrap();
        let shares = SimulatedShares::new("OLDSERVER", SimulatedNetwork::new());

        shares.publish("ODMigration", temp.path(), AccessLevel::Read).await.unwrap();
        shares.publish("ODMigration", temp.path(), AccessLevel::Change).await.unwrap();

        assert_eq!(shares.share_count(), 1);
        assert_eq!(shares.access_of("odmigration"), Some(AccessLevel::Change));

        shares.unpublish("ODMigration").await.unwrap();
        shares.unpublish("ODMigration").await.unwrap();
        assert_eq!(shares.share_count(), 0);
    }

    #[tokio::test]
    async fn shares_resolve_across_the_network() {
        let temp = tempdir().unwrap();
        let network = SimulatedNetwork::new();
        let old = SimulatedShares::new("OLDSERVER", network.clone());
        let new = SimulatedShares::new("NEWSERVER", network);

        old.publish("ODMigration", temp.path(), AccessLevel::Change).await.unwrap();

        assert_eq!(new.remote_path("oldserver", "ODMigration"), temp.path());
        assert!(!new.remote_path("elsewhere", "ODMigration").exists());
    }

    #[tokio::test]
    async fn service_lifecycle() {
        let services = SimulatedServices::new();
        services.add_service("MariaDB", ServiceState::Running, None);

        services.stop("mariadb").await.unwrap();
        services.disable("MariaDB").await.unwrap();
        assert_eq!(services.state_of("MariaDB"), Some(ServiceState::Stopped));
        assert!(services.is_disabled("MariaDB"));

        assert!(services.query("MySQL").await.unwrap().is_none());
        assert!(services.stop("MySQL").await.is_err());
    }

    #[test]
    fn sandbox_hides_the_rest_of_the_disk() {
        let temp = tempdir().unwrap();
        let fs = SandboxFs::new(temp.path());
        assert!(fs.exists(temp.path()));
        assert!(!fs.exists(Path::new("/")));
        assert_eq!(fs.roots(), vec![temp.path().to_path_buf()]);
    }
}
