//! New-server side: pull the package, restore it, bring it online, signal back.

use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::context::MigrationContext;
use crate::core::discovery::locate_database;
use crate::core::engine_info::{InstallerRecommendation, major_minor, recommend_installer};
use crate::core::firewall::FirewallRule;
use crate::core::markers::{ReadinessMarker, read_metadata, write_local_completion};
use crate::core::models::{MigrationMetadata, Package, ServiceHandle};
use crate::core::provisioning::{ProvisionRequest, provision_database};
use crate::core::services::{find_database_service, stop_if_running};
use crate::error::MigrationError;

/// Where the workstation installer usually sits inside the attachment tree.
const SETUP_LOCATIONS: &[&[&str]] = &[&["Setup.exe"], &["Setup Files", "Setup.exe"]];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Connecting,
    Staging,
    Resolving,
    Provisioning,
    Restoring,
    Online,
    Signaled,
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    /// The package as it sits on the old server's share.
    pub remote: Package,
    /// The local staged copy.
    pub local: Package,
    pub metadata: Option<MigrationMetadata>,
    pub service: String,
    pub data_dir: PathBuf,
    pub backup: Option<PathBuf>,
    pub setup_exe: Option<PathBuf>,
    /// Whether the completion marker reached the old server.
    pub signaled: bool,
}

/// Newest ready package under `root`.
///
/// A candidate counts only when its readiness marker exists and names the
/// directory it sits in; `pinned` restricts the choice to one id.
pub fn select_package(root: &Path, pinned: Option<&str>) -> Result<Option<Package>> {
    let entries = std::fs::read_dir(root).map_err(|e| MigrationError::io(root, e))?;

    let mut candidates: Vec<Package> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| Package::from_dir(&entry.path()))
        .filter(|package| pinned.is_none_or(|id| package.id == id))
        .collect();
    candidates.sort_by(|a, b| b.id.cmp(&a.id));

    for package in candidates {
        let Ok(text) = std::fs::read_to_string(package.ready_marker()) else {
            debug!(package = %package.id, "Not ready, skipping");
            continue;
        };
        match ReadinessMarker::parse(&text) {
            Some(marker) if marker.package_id == package.id => return Ok(Some(package)),
            Some(marker) => warn!(
                package = %package.id,
                recorded = %marker.package_id,
                "Readiness marker names another package, skipping"
            ),
            None => warn!(package = %package.id, "Unreadable readiness marker, skipping"),
        }
    }
    Ok(None)
}

/// Sibling of `dir` named `<name>_backup_<timestamp>`.
pub fn backup_path(dir: &Path, stamp: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    dir.with_file_name(format!("{}_backup_{}", name, stamp))
}

pub fn find_setup_exe(attachments: &Path) -> Option<PathBuf> {
    SETUP_LOCATIONS
        .iter()
        .map(|parts| parts.iter().fold(attachments.to_path_buf(), |p, part| p.join(part)))
        .find(|p| p.is_file())
}

pub struct Importer {
    ctx: MigrationContext,
}

impl Importer {
    pub fn new(ctx: MigrationContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<ImportReport> {
        enter(ImportPhase::Connecting);
        let remote_root = self.connect().await?;

        enter(ImportPhase::Staging);
        let remote = self.pick_package(&remote_root)?;
        let local = remote.relocated(&self.ctx.config.import.stage_root);
        self.ctx
            .platform
            .copier
            .mirror(&remote.root, &local.root, "package")
            .await?;

        enter(ImportPhase::Resolving);
        if !local.database_dir().is_dir() {
            return Err(MigrationError::NotLocated {
                what: "database subtree in the staged package",
                searched: vec![local.database_dir()],
            }
            .into());
        }
        let metadata = resolve_metadata(&local);

        let service = match find_database_service(self.ctx.platform.services.as_ref()).await {
            Some(handle) => handle,
            None => {
                enter(ImportPhase::Provisioning);
                self.provision(metadata.as_ref())
                    .await
                    .ok_or(MigrationError::NoDatabaseService)?
            }
        };

        enter(ImportPhase::Restoring);
        let (data_dir, backup) = self.restore(&local, &service).await?;

        enter(ImportPhase::Online);
        let setup_exe = self.bring_online().await;

        enter(ImportPhase::Signaled);
        let signaled = self.signal(&local, &remote).await;

        Ok(ImportReport {
            remote,
            local,
            metadata,
            service: service.name,
            data_dir,
            backup,
            setup_exe,
            signaled,
        })
    }

    async fn connect(&self) -> Result<PathBuf> {
        let cfg = &self.ctx.config.import;
        let operator = self.ctx.operator.as_ref();

        let (server, share) = match &cfg.server {
            Some(server) => (server.clone(), cfg.share_name.clone()),
            None => (
                operator.ask_text("Old server name or IP address", "")?,
                operator.ask_text("Share name", &cfg.share_name)?,
            ),
        };

        let remote_root = self.ctx.platform.shares.remote_path(server.trim(), share.trim());
        if server.trim().is_empty() || !tokio::fs::metadata(&remote_root).await.is_ok_and(|m| m.is_dir()) {
            return Err(MigrationError::ShareUnreachable { path: remote_root }.into());
        }
        info!(share = %remote_root.display(), "Connected to share");
        Ok(remote_root)
    }

    fn pick_package(&self, remote_root: &Path) -> Result<Package> {
        let pinned = self.ctx.config.import.package.as_deref();
        let package = select_package(remote_root, pinned)?.ok_or_else(|| MigrationError::NoPackage {
            path: remote_root.to_path_buf(),
        })?;
        info!(package = %package.id, "Package selected");
        Ok(package)
    }

    async fn provision(&self, metadata: Option<&MigrationMetadata>) -> Option<ServiceHandle> {
        let cfg = &self.ctx.config.import;
        let guidance = metadata.map(installer_guidance);

        provision_database(
            self.ctx.platform.provisioner.as_ref(),
            self.ctx.platform.services.as_ref(),
            self.ctx.operator.as_ref(),
            &ProvisionRequest {
                installer_url: guidance.as_ref().map(|g| g.installer_url.as_str()),
                upgrade_url: guidance.as_ref().and_then(|g| g.upgrade_url.as_deref()),
                download_dir: &cfg.download_dir,
                assume_yes: cfg.assume_yes,
            },
        )
        .await
    }

    async fn restore(
        &self,
        local: &Package,
        service: &ServiceHandle,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        let cfg = &self.ctx.config.import;
        let platform = &self.ctx.platform;

        stop_if_running(platform.services.as_ref(), service)
            .await
            .with_context(|| format!("Failed to stop database service {}", service.name))?;

        let data_dir = match &cfg.data_dir {
            Some(dir) => dir.clone(),
            None => {
                let located = locate_database(platform.fs.as_ref(), None, None, Some(service));
                located.data_dir.ok_or(MigrationError::NotLocated {
                    what: "local database data directory",
                    searched: located.searched,
                })?
            }
        };

        let backup = if platform.fs.exists(&data_dir) {
            let target = backup_path(&data_dir, &Local::now().format("%Y%m%d_%H%M%S").to_string());
            platform.copier.mirror(&data_dir, &target, "backup").await?;
            info!(backup = %target.display(), "Existing data directory backed up");
            Some(target)
        } else {
            None
        };

        platform
            .copier
            .mirror(&local.database_dir(), &data_dir, "restore-database")
            .await?;

        platform
            .services
            .start(&service.name)
            .await
            .with_context(|| format!("Failed to start database service {}", service.name))?;
        info!(service = %service.name, "Database service started");

        tokio::fs::create_dir_all(&cfg.attachments_path)
            .await
            .map_err(|e| MigrationError::io(&cfg.attachments_path, e))?;
        platform
            .shares
            .publish(&cfg.attachments_share, &cfg.attachments_path, cfg.attachments_access)
            .await
            .with_context(|| format!("Failed to publish share {}", cfg.attachments_share))?;

        platform
            .copier
            .mirror(&local.attachments_dir(), &cfg.attachments_path, "restore-attachments")
            .await?;

        Ok((data_dir, backup))
    }

    async fn bring_online(&self) -> Option<PathBuf> {
        let cfg = &self.ctx.config.import;

        let setup_exe = find_setup_exe(&cfg.attachments_path);
        match &setup_exe {
            Some(path) => self.ctx.operator.notify(&format!(
                "Workstation setup found at {}. Run it on each workstation to point it at this server.",
                path.display()
            )),
            None => warn!(attachments = %cfg.attachments_path.display(), "No Setup.exe in the attachment tree"),
        }

        if cfg.open_db_port {
            let firewall = self.ctx.platform.firewall.as_ref();
            // a block rule left by an earlier export on this machine would win
            if let Err(e) = firewall.remove_rule(&FirewallRule::block_database()).await {
                warn!(error = %e, "Could not remove a leftover database-port block rule");
            }
            if let Err(e) = firewall.ensure_rule(&FirewallRule::allow_database()).await {
                warn!(error = %e, "Could not open the database port");
            }
        }

        setup_exe
    }

    /// Write the completion marker locally, then into the old server's package.
    async fn signal(&self, local: &Package, remote: &Package) -> bool {
        let result = async {
            let marker = write_local_completion(local, &self.ctx.host_name)?;
            let target = remote.completion_marker();
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                warn!(target = %target.display(), "Completion marker already on the old server");
                return Ok(());
            }
            tokio::fs::copy(&marker, &target)
                .await
                .with_context(|| format!("Failed to write {}", target.display()))?;
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(package = %remote.id, "Old server signalled");
                true
            }
            Err(e) => {
                warn!(error = format!("{e:#}"), "Could not signal the old server");
                self.ctx.operator.notify(&format!(
                    "Create {} by hand so the old server can finish.",
                    remote.completion_marker().display()
                ));
                false
            }
        }
    }
}

/// Installer to offer for the engine recorded in the package.
///
/// URLs written by the exporter win. Otherwise the table is consulted, with
/// major.minor derived from the full version when the record lacks it.
pub fn installer_guidance(metadata: &MigrationMetadata) -> InstallerRecommendation {
    if let Some(url) = &metadata.installer_url {
        return InstallerRecommendation {
            installer_url: url.clone(),
            upgrade_url: metadata.upgrade_url.clone(),
        };
    }

    let derived;
    let version_major_minor = if metadata.version_major_minor.is_empty() {
        derived = major_minor(&metadata.version).unwrap_or_default();
        &derived
    } else {
        &metadata.version_major_minor
    };
    let recommended = recommend_installer(&metadata.engine, version_major_minor);
    InstallerRecommendation {
        upgrade_url: metadata.upgrade_url.clone().or(recommended.upgrade_url),
        installer_url: recommended.installer_url,
    }
}

fn enter(phase: ImportPhase) {
    info!(phase = ?phase, "Import phase");
}

fn resolve_metadata(local: &Package) -> Option<MigrationMetadata> {
    match read_metadata(&local.metadata_file()) {
        Ok(Some(metadata)) => {
            info!(
                engine = %metadata.engine,
                version = %metadata.version,
                source = %metadata.source_host,
                "Package metadata loaded"
            );
            Some(metadata)
        }
        Ok(None) => {
            warn!("Package has no metadata; continuing without installer guidance");
            None
        }
        Err(e) => {
            warn!(error = format!("{e:#}"), "Package metadata unreadable; continuing without it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine_info::GENERIC_INSTALLER_URL;
    use std::fs;
    use tempfile::tempdir;

    fn package(root: &Path, id: &str, ready_for: Option<&str>) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        if let Some(recorded) = ready_for {
            let marker = ReadinessMarker {
                package_id: recorded.to_string(),
                share_path: String::new(),
            };
            fs::write(dir.join("READY.txt"), marker.render()).unwrap();
        }
    }

    #[test]
    fn newest_ready_package_wins() {
        let temp = tempdir().unwrap();
        package(temp.path(), "od_migration_20240101_120000", Some("od_migration_20240101_120000"));
        package(temp.path(), "od_migration_20240102_120000", Some("od_migration_20240102_120000"));
        // newer, still exporting
        package(temp.path(), "od_migration_20240103_120000", None);
        fs::create_dir_all(temp.path().join("zzz")).unwrap();

        let picked = select_package(temp.path(), None).unwrap().unwrap();
        assert_eq!(picked.id, "od_migration_20240102_120000");
    }

    #[test]
    fn marker_must_name_its_own_directory() {
        let temp = tempdir().unwrap();
        package(temp.path(), "od_migration_20240101_120000", Some("od_migration_20240101_120000"));
        package(temp.path(), "od_migration_20240105_120000", Some("od_migration_20240101_120000"));

        let picked = select_package(temp.path(), None).unwrap().unwrap();
        assert_eq!(picked.id, "od_migration_20240101_120000");
    }

    #[test]
    fn pinned_id_restricts_selection() {
        let temp = tempdir().unwrap();
        package(temp.path(), "od_migration_20240101_120000", Some("od_migration_20240101_120000"));
        package(temp.path(), "od_migration_20240102_120000", Some("od_migration_20240102_120000"));

        let picked = select_package(temp.path(), Some("od_migration_20240101_120000"))
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, "od_migration_20240101_120000");
        assert!(select_package(temp.path(), Some("od_migration_19990101_000000")).unwrap().is_none());
    }

    #[test]
    fn no_ready_package_is_none() {
        let temp = tempdir().unwrap();
        package(temp.path(), "od_migration_20240101_120000", None);
        assert!(select_package(temp.path(), None).unwrap().is_none());
    }

    #[test]
    fn guidance_derives_major_minor_from_version() {
        let metadata = MigrationMetadata {
            engine: "MariaDB".into(),
            version: "10.5.22".into(),
            ..Default::default()
        };
        let guidance = installer_guidance(&metadata);
        assert!(guidance.installer_url.ends_with("mariadb-10.5.22-winx64.msi"));
        assert_eq!(guidance.upgrade_url, None);
    }

    #[test]
    fn guidance_prefers_recorded_urls_and_falls_back_to_generic() {
        let recorded = MigrationMetadata {
            engine: "MariaDB".into(),
            version: "10.5.22".into(),
            installer_url: Some("https://mirror.local/mariadb.msi".into()),
            ..Default::default()
        };
        assert_eq!(installer_guidance(&recorded).installer_url, "https://mirror.local/mariadb.msi");

        let legacy = MigrationMetadata {
            engine: "MySQL".into(),
            version: "5.5.62".into(),
            ..Default::default()
        };
        assert!(installer_guidance(&legacy).upgrade_url.is_some());

        let unknown = MigrationMetadata {
            engine: "Percona".into(),
            version: "8.0.1".into(),
            ..Default::default()
        };
        let guidance = installer_guidance(&unknown);
        assert_eq!(guidance.installer_url, GENERIC_INSTALLER_URL);
        assert_eq!(guidance.upgrade_url, None);
    }

    #[test]
    fn backup_is_a_timestamped_sibling() {
        let path = backup_path(Path::new("/var/lib/mysql"), "20240101_120000");
        assert_eq!(path, PathBuf::from("/var/lib/mysql_backup_20240101_120000"));
    }

    #[test]
    fn setup_exe_in_either_location() {
        let temp = tempdir().unwrap();
        assert!(find_setup_exe(temp.path()).is_none());

        let nested = temp.path().join("Setup Files");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("Setup.exe"), b"MZ").unwrap();
        assert_eq!(find_setup_exe(temp.path()), Some(nested.join("Setup.exe")));

        fs::write(temp.path().join("Setup.exe"), b"MZ").unwrap();
        assert_eq!(find_setup_exe(temp.path()), Some(temp.path().join("Setup.exe")));
    }
}
