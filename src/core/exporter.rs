//! Old-server side: quiesce, export, publish, wait for the importer, lock down.

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::MigrationContext;
use crate::core::discovery::{
    AttachmentChoice, AttachmentSearch, DatabaseLocations, binary_from_command_line,
    discover_attachment_tree, locate_database,
};
use crate::core::engine_info::{EngineVersion, parse_version_output, recommend_installer};
use crate::core::firewall::FirewallRule;
use crate::core::markers::{ReadinessMarker, write_metadata};
use crate::core::models::{MigrationMetadata, Package, ServiceHandle};
use crate::core::services::{find_database_service, stop_if_running};
use crate::core::wait::{WaitOutcome, poll_until};
use crate::error::MigrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    Quiescing,
    Exporting,
    Publishing,
    AwaitingSignal,
    LockedDown,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub package: Package,
    pub metadata: MigrationMetadata,
    /// Completion-marker checks made while waiting.
    pub checks: u64,
}

/// Where the exported data came from.
struct ExportedSources {
    data_dir: PathBuf,
    config_file: Option<PathBuf>,
    attachments: PathBuf,
}

pub struct Exporter {
    ctx: MigrationContext,
}

impl Exporter {
    pub fn new(ctx: MigrationContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExportReport> {
        enter(ExportPhase::Quiescing);
        let db_service = self.quiesce().await?;

        ensure_not_cancelled(cancel, ExportPhase::Exporting)?;
        enter(ExportPhase::Exporting);
        let package = self.create_package()?;
        let sources = self.export(&package, db_service.as_ref()).await?;

        // Nothing is shared or marked ready once an interrupt has arrived.
        ensure_not_cancelled(cancel, ExportPhase::Publishing)?;
        enter(ExportPhase::Publishing);
        let metadata = self.publish(&package, db_service.as_ref(), &sources).await?;

        enter(ExportPhase::AwaitingSignal);
        self.ctx.operator.notify(&format!(
            "Package {} is published. Run the import on the new server; this window waits until it reports back.",
            package.id
        ));
        let checks = match self.await_signal(&package, cancel).await {
            WaitOutcome::Signaled { checks } => checks,
            WaitOutcome::Cancelled { checks } => {
                warn!(
                    checks,
                    share = %self.ctx.config.export.share_name,
                    "Wait cancelled; the share stays published until `odmigrate cleanup` runs"
                );
                return Err(MigrationError::Cancelled.into());
            }
        };

        enter(ExportPhase::LockedDown);
        self.lock_down().await;

        Ok(ExportReport {
            package,
            metadata,
            checks,
        })
    }

    /// Stop and disable the database and application services.
    ///
    /// Returns the database service if there is one.
    async fn quiesce(&self) -> Result<Option<ServiceHandle>> {
        let services = self.ctx.platform.services.as_ref();
        let db_service = find_database_service(services).await;

        if let Some(handle) = &db_service {
            stop_if_running(services, handle)
                .await
                .with_context(|| format!("Failed to stop database service {}", handle.name))?;
            if let Err(e) = services.disable(&handle.name).await {
                warn!(service = %handle.name, error = %e, "Could not disable auto-start");
            }
        }

        for name in &self.ctx.config.export.app_services {
            let handle = match services.query(name).await {
                Ok(Some(handle)) => handle,
                Ok(None) => {
                    info!(service = %name, "Service not installed, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Could not query service");
                    continue;
                }
            };
            if let Err(e) = stop_if_running(services, &handle).await {
                warn!(service = %name, error = %e, "Could not stop service");
            }
            if let Err(e) = services.disable(name).await {
                warn!(service = %name, error = %e, "Could not disable auto-start");
            }
        }

        Ok(db_service)
    }

    fn create_package(&self) -> Result<Package> {
        let staging_root = &self.ctx.config.export.staging_root;
        std::fs::create_dir_all(staging_root).map_err(|e| MigrationError::io(staging_root, e))?;

        let package = Package::new(staging_root, &Package::create_id(Local::now()));
        std::fs::create_dir(&package.root).map_err(|e| MigrationError::io(&package.root, e))?;
        info!(package = %package.id, root = %package.root.display(), "Package created");
        Ok(package)
    }

    async fn export(
        &self,
        package: &Package,
        db_service: Option<&ServiceHandle>,
    ) -> Result<ExportedSources> {
        let cfg = &self.ctx.config.export;
        let copier = &self.ctx.platform.copier;

        let DatabaseLocations {
            data_dir,
            config_file,
            searched,
        } = locate_database(
            self.ctx.platform.fs.as_ref(),
            cfg.data_dir.as_deref(),
            cfg.config_file.as_deref(),
            db_service,
        );
        let data_dir = data_dir.ok_or(MigrationError::NotLocated {
            what: "database data directory",
            searched,
        })?;
        if config_file.is_none() {
            warn!("No my.ini found; the package will not include one");
        }

        let attachments = self.choose_attachments(self.find_attachments().await?)?;
        if !self.ctx.platform.fs.exists(&attachments) {
            return Err(MigrationError::NotLocated {
                what: "attachment tree",
                searched: vec![attachments],
            }
            .into());
        }

        copier
            .mirror(&data_dir, &package.database_dir(), "database")
            .await?;
        copier
            .mirror(&attachments, &package.attachments_dir(), "attachments")
            .await?;

        if let Some(src) = &config_file {
            match tokio::fs::copy(src, package.config_file()).await {
                Ok(_) => info!(config = %src.display(), "Configuration file copied"),
                Err(e) => warn!(config = %src.display(), error = %e, "Could not copy configuration file"),
            }
        }

        if cfg.rename_attachments {
            rename_aside(&attachments).await;
        }

        Ok(ExportedSources {
            data_dir,
            config_file,
            attachments,
        })
    }

    async fn find_attachments(&self) -> Result<AttachmentChoice> {
        let cfg = &self.ctx.config.export;
        let pattern = Regex::new(&cfg.attachments_share_pattern)
            .with_context(|| format!("Invalid share pattern {:?}", cfg.attachments_share_pattern))?;

        let shares = match self.ctx.platform.shares.list().await {
            Ok(shares) => shares,
            Err(e) => {
                warn!(error = %e, "Could not list existing shares");
                Vec::new()
            }
        };

        let fs = self.ctx.platform.fs.clone();
        let hint = cfg.attachments_hint.clone();
        let (scan_depth, min_score) = (cfg.scan_depth, cfg.min_score);
        let exclude = vec![cfg.staging_root.clone()];

        tokio::task::spawn_blocking(move || {
            let search = AttachmentSearch {
                hint: &hint,
                share_pattern: &pattern,
                scan_depth,
                min_score,
                exclude: &exclude,
            };
            discover_attachment_tree(fs.as_ref(), &shares, &search)
        })
        .await
        .context("Attachment discovery task failed")
    }

    /// Ask the operator only when several candidates share the best score.
    fn choose_attachments(&self, choice: AttachmentChoice) -> Result<PathBuf> {
        if choice.fallback {
            warn!(hint = %choice.path.display(), "No convincing attachment tree found; using the configured default");
        }
        if choice.ties.is_empty() {
            return Ok(choice.path);
        }

        let mut listing = format!("Several folders look like the A-to-Z tree (score {}):", choice.score);
        for path in std::iter::once(&choice.path).chain(&choice.ties) {
            listing.push_str(&format!("\n  {}", path.display()));
        }
        self.ctx.operator.notify(&listing);

        let default = choice.path.display().to_string();
        let answer = self.ctx.operator.ask_text("Attachment tree to export", &default)?;
        Ok(PathBuf::from(answer))
    }

    async fn publish(
        &self,
        package: &Package,
        db_service: Option<&ServiceHandle>,
        sources: &ExportedSources,
    ) -> Result<MigrationMetadata> {
        let cfg = &self.ctx.config.export;
        let shares = self.ctx.platform.shares.as_ref();
        if !cfg.share_access.is_writable() {
            warn!(
                access = ?cfg.share_access,
                "Share is read-only; the importer will not be able to write its completion marker"
            );
        }

        let binary = db_service
            .and_then(|s| s.command_line.as_deref())
            .and_then(binary_from_command_line);
        let version = self.detect_version(binary.as_deref()).await;
        let (engine, version, major_minor) = match version {
            Some(EngineVersion {
                engine,
                version,
                major_minor,
            }) => (engine, version, major_minor),
            None => Default::default(),
        };
        let recommendation = recommend_installer(&engine, &major_minor);

        let metadata = MigrationMetadata {
            engine,
            version,
            version_major_minor: major_minor,
            binary_path: binary,
            data_dir: Some(sources.data_dir.clone()),
            config_file: sources.config_file.clone(),
            attachments_dir: Some(sources.attachments.clone()),
            installer_url: Some(recommendation.installer_url),
            upgrade_url: recommendation.upgrade_url,
            notes: cfg.notes.clone(),
            created_at: Some(Utc::now()),
            source_host: self.ctx.host_name.clone(),
        };
        write_metadata(&package.metadata_file(), &metadata)?;

        shares
            .publish(&cfg.share_name, &cfg.staging_root, cfg.share_access)
            .await
            .with_context(|| format!("Failed to publish share {}", cfg.share_name))?;

        if let Err(e) = shares.grant_modify(&package.root).await {
            warn!(
                package = %package.root.display(),
                error = %e,
                "Could not grant write access; the importer will not be able to signal completion"
            );
        }

        let share_path = shares
            .remote_path(&self.ctx.host_name, &cfg.share_name)
            .join(&package.id);
        ReadinessMarker {
            package_id: package.id.clone(),
            share_path: share_path.display().to_string(),
        }
        .write(package)?;
        info!(package = %package.id, share = %share_path.display(), "Package ready");

        if cfg.block_db_port {
            if let Err(e) = self
                .ctx
                .platform
                .firewall
                .ensure_rule(&FirewallRule::block_database())
                .await
            {
                warn!(error = %e, "Could not add the database port block rule");
            }
        }

        Ok(metadata)
    }

    async fn detect_version(&self, binary: Option<&Path>) -> Option<EngineVersion> {
        let Some(binary) = binary else {
            warn!("Database binary unknown; engine version not recorded");
            return None;
        };
        match self.ctx.platform.services.version_output(binary).await {
            Ok(output) => {
                let parsed = parse_version_output(&output);
                match &parsed {
                    Some(v) => info!(engine = %v.engine, version = %v.version, "Database engine detected"),
                    None => warn!(output = %output.trim(), "Unrecognised version output"),
                }
                parsed
            }
            Err(e) => {
                warn!(binary = %binary.display(), error = %e, "Version query failed");
                None
            }
        }
    }

    async fn await_signal(&self, package: &Package, cancel: &CancellationToken) -> WaitOutcome {
        let marker = package.completion_marker();
        let interval = Duration::from_secs(self.ctx.config.export.poll_interval_secs);
        info!(marker = %marker.display(), "Waiting for the importer");
        poll_until(|| marker.exists(), interval, self.ctx.sleeper.as_ref(), cancel).await
    }

    async fn lock_down(&self) {
        let share = &self.ctx.config.export.share_name;
        match self.ctx.platform.shares.unpublish(share).await {
            Ok(()) => info!(share = %share, "Share removed"),
            Err(e) => {
                warn!(share = %share, error = %e, "Could not remove share");
                self.ctx
                    .operator
                    .notify(&format!("Remove the share {} manually.", share));
            }
        }
        self.ctx.operator.notify(
            "Migration signalled complete. Database and application services remain stopped and disabled on this server.",
        );
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken, next: ExportPhase) -> Result<()> {
    if cancel.is_cancelled() {
        warn!(phase = ?next, "Interrupted; stopping before the next phase");
        return Err(MigrationError::Cancelled.into());
    }
    Ok(())
}

fn enter(phase: ExportPhase) {
    info!(phase = ?phase, "Export phase");
}

/// Move the tree out of the way so nobody keeps writing into it. Best effort.
async fn rename_aside(dir: &Path) {
    let Some(name) = dir.file_name() else {
        warn!(dir = %dir.display(), "Cannot rename a root directory");
        return;
    };
    let target = dir.with_file_name(format!("{}_migrated", name.to_string_lossy()));
    match tokio::fs::rename(dir, &target).await {
        Ok(()) => info!(from = %dir.display(), to = %target.display(), "Attachment tree renamed"),
        Err(e) => warn!(dir = %dir.display(), error = %e, "Could not rename attachment tree"),
    }
}

/// Remove the export share after an interrupted wait.
pub async fn cleanup(ctx: &MigrationContext) -> Result<()> {
    let share = &ctx.config.export.share_name;
    ctx.platform
        .shares
        .unpublish(share)
        .await
        .with_context(|| format!("Failed to remove share {}", share))?;
    info!(share = %share, "Share removed");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageStatus {
    pub id: String,
    pub ready: bool,
    pub copied: bool,
}

/// Packages under the staging root, newest first.
pub fn package_status(staging_root: &Path) -> Result<Vec<PackageStatus>> {
    let entries = match std::fs::read_dir(staging_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MigrationError::io(staging_root, e).into()),
    };

    let mut out: Vec<PackageStatus> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| Package::from_dir(&entry.path()))
        .map(|package| PackageStatus {
            ready: package.ready_marker().exists(),
            copied: package.completion_marker().exists(),
            id: package.id,
        })
        .collect();
    out.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::SimulatedPlatform;
    use crate::config::AppConfig;
    use crate::core::models::ServiceState;
    use crate::core::operator::ScriptedOperator;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn letters(root: &Path) {
        for c in 'A'..='Z' {
            fs::create_dir_all(root.join(c.to_string())).unwrap();
        }
        fs::write(root.join("A").join("Smith.jpg"), b"xray").unwrap();
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        sim: SimulatedPlatform,
        config: AppConfig,
        data_dir: PathBuf,
        attachments: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let root = temp.path();
        let data_dir = root.join("mysql/data");
        fs::create_dir_all(data_dir.join("opendental")).unwrap();
        fs::write(data_dir.join("opendental/patient.frm"), b"frm").unwrap();
        let attachments = root.join("OpenDentImages");
        letters(&attachments);

        let mut config = AppConfig::default();
        config.export.staging_root = root.join("staging");
        config.export.data_dir = Some(data_dir.clone());
        config.export.config_file = Some(root.join("missing.ini"));
        config.export.attachments_hint = attachments.clone();
        config.export.scan_depth = 0;
        config.copy.log_dir = root.join("logs");
        config.copy.retries = 0;

        let sim = SimulatedPlatform::new("OLDSERVER", root);
        sim.services
            .add_service("MySQL", ServiceState::Running, Some(r#""C:\mysql\bin\mysqld.exe" MySQL"#));
        sim.services.add_service("OpenDentalService", ServiceState::Running, None);
        sim.services.set_version_output("mysqld  Ver 5.6.51 for Win64");

        Fixture {
            _temp: temp,
            sim,
            config,
            data_dir,
            attachments,
        }
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_share_published() {
        let f = fixture();
        let ctx = f.sim.context(f.config.clone(), Arc::new(ScriptedOperator::new(Vec::<String>::new())));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let exporter = Exporter::new(ctx);
        let handle = tokio::spawn(async move { exporter.run(&cancel).await });

        // simulated sleeps return immediately; let the export reach the wait
        for _ in 0..200 {
            if f.sim.shares.access_of("ODMigration").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trigger.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigrationError>(),
            Some(MigrationError::Cancelled)
        ));
        assert!(f.sim.shares.access_of("ODMigration").is_some());
        assert_eq!(f.sim.services.state_of("MySQL"), Some(ServiceState::Stopped));
        assert!(f.sim.services.is_disabled("OpenDentalService"));

        let packages = package_status(&f.config.export.staging_root).unwrap();
        assert_eq!(packages.len(), 1);
        assert!(packages[0].ready);
        assert!(!packages[0].copied);

        let ctx = f.sim.context(f.config.clone(), Arc::new(ScriptedOperator::new(Vec::<String>::new())));
        cleanup(&ctx).await.unwrap();
        assert!(f.sim.shares.access_of("ODMigration").is_none());
    }

    #[tokio::test]
    async fn missing_data_dir_is_fatal_before_any_marker() {
        let mut f = fixture();
        fs::remove_dir_all(&f.data_dir).unwrap();
        f.config.export.data_dir = Some(f.data_dir.clone());
        let ctx = f.sim.context(f.config.clone(), Arc::new(ScriptedOperator::new(Vec::<String>::new())));

        let err = Exporter::new(ctx)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigrationError>(),
            Some(MigrationError::NotLocated { .. })
        ));

        let packages = package_status(&f.config.export.staging_root).unwrap();
        assert!(packages.iter().all(|p| !p.ready));
        assert!(f.sim.shares.access_of("ODMigration").is_none());
    }

    #[tokio::test]
    async fn interrupt_before_publishing_shares_nothing() {
        let f = fixture();
        let ctx = f
            .sim
            .context(f.config.clone(), Arc::new(ScriptedOperator::new(Vec::<String>::new())));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Exporter::new(ctx).run(&cancel).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigrationError>(),
            Some(MigrationError::Cancelled)
        ));
        assert!(f.sim.shares.access_of("ODMigration").is_none());
        assert!(f.sim.firewall.rules().is_empty());
        assert!(f.sim.shares.granted().is_empty());
        assert!(package_status(&f.config.export.staging_root).unwrap().is_empty());
        // quiesce already ran; services stay down
        assert_eq!(f.sim.services.state_of("MySQL"), Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn failed_copy_never_writes_readiness_marker() {
        let f = fixture();
        let ctx = f
            .sim
            .failing_copies()
            .context(f.config.clone(), Arc::new(ScriptedOperator::new(Vec::<String>::new())));

        let err = Exporter::new(ctx)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigrationError>(),
            Some(MigrationError::CopyFailed { .. })
        ));
        let packages = package_status(&f.config.export.staging_root).unwrap();
        assert_eq!(packages.len(), 1);
        assert!(!packages[0].ready);
        assert!(f.attachments.exists());
    }

    #[test]
    fn status_lists_newest_first_and_ignores_strangers() {
        let temp = tempdir().unwrap();
        for id in ["od_migration_20240101_120000", "od_migration_20240301_090000", "notes"] {
            fs::create_dir_all(temp.path().join(id)).unwrap();
        }
        fs::write(temp.path().join("od_migration_20240301_090000/READY.txt"), "x").unwrap();

        let packages = package_status(temp.path()).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].id, "od_migration_20240301_090000");
        assert!(packages[0].ready);
        assert!(!packages[1].ready);

        assert!(package_status(&temp.path().join("absent")).unwrap().is_empty());
    }
}
