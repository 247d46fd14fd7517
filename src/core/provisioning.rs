//! Installing the database engine on a new server that does not have one yet.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::models::ServiceHandle;
use crate::core::operator::Operator;
use crate::core::services::{ServiceController, find_database_service};

const DEFAULT_INSTALLER_NAME: &str = "database-installer.msi";

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Download `url` into `dest_dir`, returning the saved file.
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Run the installer interactively and wait for it to exit.
    async fn launch(&self, installer: &Path) -> Result<()>;
}

/// Last path segment of the URL when it looks like a file name.
pub fn installer_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/')
        .next()
        .filter(|segment| {
            segment
                .rsplit_once('.')
                .is_some_and(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        })
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_INSTALLER_NAME.to_string())
}

pub struct ProvisionRequest<'a> {
    pub installer_url: Option<&'a str>,
    pub upgrade_url: Option<&'a str>,
    pub download_dir: &'a Path,
    pub assume_yes: bool,
}

/// Offer to install the engine, then look for the database service again.
///
/// A refusal or a failed download/install is reported to the operator and
/// leaves the caller to decide; only the final lookup result is returned.
pub async fn provision_database(
    provisioner: &dyn Provisioner,
    services: &dyn ServiceController,
    operator: &dyn Operator,
    req: &ProvisionRequest<'_>,
) -> Option<ServiceHandle> {
    let Some(url) = req.installer_url else {
        warn!("No installer recommendation available");
        operator.notify(&manual_instructions(None, req.upgrade_url));
        return None;
    };

    let consent = req.assume_yes
        || operator
            .ask_yes_no(&format!(
                "No MySQL/MariaDB service found. Download and run the installer from {}?",
                url
            ))
            .unwrap_or(false);

    if !consent {
        warn!("Operator declined automatic installation");
        operator.notify(&manual_instructions(Some(url), req.upgrade_url));
        return None;
    }

    if let Err(e) = fetch_and_launch(provisioner, url, req.download_dir).await {
        warn!(error = format!("{e:#}"), "Automatic installation failed");
        operator.notify(&manual_instructions(Some(url), req.upgrade_url));
    }

    find_database_service(services).await
}

async fn fetch_and_launch(provisioner: &dyn Provisioner, url: &str, dir: &Path) -> Result<()> {
    info!(url, "Downloading installer");
    let installer = provisioner.fetch(url, dir).await?;
    info!(installer = %installer.display(), "Launching installer");
    provisioner.launch(&installer).await?;
    info!("Installer exited");
    Ok(())
}

fn manual_instructions(url: Option<&str>, upgrade_url: Option<&str>) -> String {
    let mut text = String::from("Install MySQL/MariaDB manually, then run the import again.");
    if let Some(url) = url {
        text.push_str(&format!("\nInstaller: {}", url));
    }
    if let Some(upgrade) = upgrade_url {
        text.push_str(&format!("\nUpgrade guide: {}", upgrade));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::{SimulatedProvisioner, SimulatedServices};
    use crate::core::models::ServiceState;
    use crate::core::operator::ScriptedOperator;
    use tempfile::tempdir;

    #[test]
    fn file_name_from_url() {
        assert_eq!(
            installer_file_name("https://archive.mariadb.org/mariadb-10.5.22/winx64-packages/mariadb-10.5.22-winx64.msi"),
            "mariadb-10.5.22-winx64.msi"
        );
        assert_eq!(installer_file_name("https://x.org/get/setup.exe?mirror=1"), "setup.exe");
        assert_eq!(installer_file_name("https://mariadb.org/download/"), DEFAULT_INSTALLER_NAME);
        assert_eq!(installer_file_name("https://x.org/get/latest"), DEFAULT_INSTALLER_NAME);
    }

    #[tokio::test]
    async fn consent_installs_and_finds_service() {
        let temp = tempdir().unwrap();
        let services = SimulatedServices::new();
        let provisioner = SimulatedProvisioner::installing(services.clone(), "MariaDB");
        let operator = ScriptedOperator::new(["y"]);

        let found = provision_database(
            &provisioner,
            &services,
            &operator,
            &ProvisionRequest {
                installer_url: Some("https://x.org/mariadb.msi"),
                upgrade_url: None,
                download_dir: temp.path(),
                assume_yes: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(found.name, "MariaDB");
        assert_eq!(provisioner.launched().len(), 1);
        assert_eq!(services.state_of("MariaDB"), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn refusal_degrades_to_instructions() {
        let temp = tempdir().unwrap();
        let services = SimulatedServices::new();
        let provisioner = SimulatedProvisioner::installing(services.clone(), "MariaDB");
        let operator = ScriptedOperator::new(["n"]);

        let found = provision_database(
            &provisioner,
            &services,
            &operator,
            &ProvisionRequest {
                installer_url: Some("https://x.org/mariadb.msi"),
                upgrade_url: Some("https://guide"),
                download_dir: temp.path(),
                assume_yes: false,
            },
        )
        .await;

        assert!(found.is_none());
        assert!(provisioner.launched().is_empty());
        assert!(operator.notices()[0].contains("https://guide"));
    }

    #[tokio::test]
    async fn failed_download_is_not_fatal() {
        let temp = tempdir().unwrap();
        let services = SimulatedServices::new();
        let provisioner = SimulatedProvisioner::failing();
        let operator = ScriptedOperator::new(Vec::<String>::new());

        let found = provision_database(
            &provisioner,
            &services,
            &operator,
            &ProvisionRequest {
                installer_url: Some("https://x.org/mariadb.msi"),
                upgrade_url: None,
                download_dir: temp.path(),
                assume_yes: true,
            },
        )
        .await;

        assert!(found.is_none());
        assert_eq!(operator.notices().len(), 1);
    }
}
