use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PACKAGE_PREFIX: &str = "od_migration_";
pub const DATABASE_DIR: &str = "database";
pub const ATTACHMENTS_DIR: &str = "OpenDentImages";
pub const CONFIG_FILE: &str = "my.ini";
pub const METADATA_FILE: &str = "od_migration.json";
pub const READY_MARKER: &str = "READY.txt";
pub const COPIED_MARKER: &str = "COPIED.txt";

/// One timestamped export bundle under the staging root.
///
/// The exporter creates it, the importer only ever reads it (apart from the
/// completion marker), and it is left on disk afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: String,
    pub root: PathBuf,
}

impl Package {
    pub fn create_id(now: DateTime<Local>) -> String {
        format!("{}{}", PACKAGE_PREFIX, now.format("%Y%m%d_%H%M%S"))
    }

    pub fn new(parent: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            root: parent.join(id),
        }
    }

    /// Treat an existing directory as a package if its name looks like one.
    pub fn from_dir(dir: &Path) -> Option<Self> {
        let name = dir.file_name()?.to_str()?;
        Self::is_package_name(name).then(|| Self {
            id: name.to_string(),
            root: dir.to_path_buf(),
        })
    }

    pub fn is_package_name(name: &str) -> bool {
        name.len() > PACKAGE_PREFIX.len() && name.starts_with(PACKAGE_PREFIX)
    }

    /// The same package placed under a different parent directory.
    pub fn relocated(&self, parent: &Path) -> Self {
        Self::new(parent, &self.id)
    }

    pub fn database_dir(&self) -> PathBuf {
        self.root.join(DATABASE_DIR)
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.root.join(ATTACHMENTS_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn ready_marker(&self) -> PathBuf {
        self.root.join(READY_MARKER)
    }

    pub fn completion_marker(&self) -> PathBuf {
        self.root.join(COPIED_MARKER)
    }
}

/// Everything the importer needs to know about the old server's database.
///
/// Every field defaults so that older or hand-edited files still load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationMetadata {
    pub engine: String,
    pub version: String,
    pub version_major_minor: String,
    pub binary_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub attachments_dir: Option<PathBuf>,
    pub installer_url: Option<String>,
    pub upgrade_url: Option<String>,
    pub notes: String,
    pub created_at: Option<DateTime<Utc>>,
    pub source_host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    StartPending,
    StopPending,
    Unknown,
}

impl ServiceState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace([' ', '_'], "").as_str() {
            "running" | "active" => Self::Running,
            "stopped" | "inactive" | "dead" | "exited" | "failed" => Self::Stopped,
            "startpending" | "activating" => Self::StartPending,
            "stoppending" | "deactivating" => Self::StopPending,
            _ => Self::Unknown,
        }
    }
}

/// A controllable OS service as last seen by the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub name: String,
    pub display_name: String,
    pub state: ServiceState,
    /// Raw command line the service manager launches, when it reports one.
    pub command_line: Option<String>,
}

impl ServiceHandle {
    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }
}
