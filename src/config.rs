use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::shares::AccessLevel;
use crate::core::transfer_engine::TransferEngineType;

pub const DEFAULT_CONFIG_FILE: &str = "odmigrate.toml";
const ENV_PREFIX: &str = "ODMIGRATE_";

/// Which set of OS collaborators to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Windows,
    Linux,
}

impl Default for PlatformKind {
    fn default() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub platform: PlatformKind,
    pub export: ExportConfig,
    pub import: ImportConfig,
    pub copy: CopyConfig,
}

/// Settings for the old-server side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory that holds package directories; this is what gets shared.
    pub staging_root: PathBuf,
    pub share_name: String,
    pub share_access: AccessLevel,
    /// Where the attachment tree usually lives when nothing better is found.
    pub attachments_hint: PathBuf,
    /// Existing shares whose name matches this pattern are attachment candidates.
    pub attachments_share_pattern: String,
    pub scan_depth: usize,
    pub min_score: u32,
    pub data_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub app_services: Vec<String>,
    pub poll_interval_secs: u64,
    pub rename_attachments: bool,
    pub block_db_port: bool,
    pub notes: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            staging_root: platform_path(r"C:\ODMigration", "/srv/odmigration"),
            share_name: "ODMigration".to_string(),
            share_access: AccessLevel::Change,
            attachments_hint: platform_path(r"C:\OpenDentImages", "/srv/OpenDentImages"),
            attachments_share_pattern: r"(?i)opendent|a.?to.?z|images".to_string(),
            scan_depth: 3,
            min_score: 8,
            data_dir: None,
            config_file: None,
            app_services: vec![
                "OpenDentalService".to_string(),
                "OpenDentalEConnector".to_string(),
                "OpenDentalCustListener".to_string(),
            ],
            poll_interval_secs: 5,
            rename_attachments: false,
            block_db_port: true,
            notes: String::new(),
        }
    }
}

/// Settings for the new-server side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Old server host name or address. Prompted for when unset.
    pub server: Option<String>,
    pub share_name: String,
    /// Pin a specific package id instead of picking the newest ready one.
    pub package: Option<String>,
    pub stage_root: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub attachments_path: PathBuf,
    pub attachments_share: String,
    pub attachments_access: AccessLevel,
    pub download_dir: PathBuf,
    pub open_db_port: bool,
    pub assume_yes: bool,
    /// Linux only: remote shares are expected mounted at `<mount_root>/<server>/<share>`.
    pub mount_root: PathBuf,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            server: None,
            share_name: "ODMigration".to_string(),
            package: None,
            stage_root: platform_path(r"C:\ODMigration\incoming", "/srv/odmigration/incoming"),
            data_dir: None,
            attachments_path: platform_path(r"C:\OpenDentImages", "/srv/OpenDentImages"),
            attachments_share: "OpenDentImages".to_string(),
            attachments_access: AccessLevel::Read,
            download_dir: platform_path(r"C:\ODMigration\downloads", "/srv/odmigration/downloads"),
            open_db_port: true,
            assume_yes: false,
            mount_root: PathBuf::from("/mnt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub engine: TransferEngineType,
    pub retries: u32,
    pub retry_wait_secs: u64,
    pub log_dir: PathBuf,
    /// Hash-verify destination files after a native copy.
    pub verify: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            engine: TransferEngineType::default(),
            retries: 2,
            retry_wait_secs: 5,
            log_dir: platform_path(r"C:\ODMigration\logs", "/var/log/odmigrate"),
            verify: true,
        }
    }
}

fn platform_path(windows: &str, unix: &str) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(windows)
    } else {
        PathBuf::from(unix)
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `ODMIGRATE_*` variables and finally
    /// whatever the command line set. `overrides` is serialized under `section`.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        section: &str,
        overrides: Option<&T>,
    ) -> Result<Self> {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = overrides {
            figment = figment.merge(Serialized::default(section, args));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", file.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        server: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        open_db_port: Option<bool>,
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = AppConfig::default();
        assert_eq!(config.export.poll_interval_secs, 5);
        assert_eq!(config.export.min_score, 8);
        assert_eq!(config.export.share_access, AccessLevel::Change);
        assert_eq!(config.import.attachments_access, AccessLevel::Read);
        assert_eq!(config.copy.retries, 2);
    }

    #[test]
    fn file_and_overrides_are_layered() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("odmigrate.toml");
        std::fs::write(
            &path,
            "[import]\nshare_name = \"Moving\"\nopen_db_port = true\n\n[copy]\nretries = 4\n",
        )
        .unwrap();

        let overrides = Overrides {
            server: Some("OLDSERVER".to_string()),
            open_db_port: Some(false),
        };
        let config = AppConfig::new(Some(&path), "import", Some(&overrides)).unwrap();

        assert_eq!(config.import.share_name, "Moving");
        assert_eq!(config.import.server.as_deref(), Some("OLDSERVER"));
        assert!(!config.import.open_db_port);
        assert_eq!(config.copy.retries, 4);
        // untouched sections keep their defaults
        assert_eq!(config.export.share_name, "ODMigration");
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = AppConfig::default().to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.export.app_services.len(), 3);
        assert_eq!(parsed.copy.engine, TransferEngineType::default());
    }
}
