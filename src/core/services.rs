//! OS service control seam and database-service selection.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::core::models::{ServiceHandle, ServiceState};

const DATABASE_PATTERNS: &[&str] = &["mysql", "mariadb"];

#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Every service the manager knows about.
    async fn list(&self) -> Result<Vec<ServiceHandle>>;

    /// Re-query one service. `None` when it does not exist.
    async fn query(&self, name: &str) -> Result<Option<ServiceHandle>>;

    /// Stop and wait until the manager reports it stopped.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Turn off automatic start at boot.
    async fn disable(&self, name: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Run the service's binary with a version query and return what it printed.
    async fn version_output(&self, binary: &Path) -> Result<String>;

    /// Whether this process may control services, shares and the firewall.
    async fn is_elevated(&self) -> bool;
}

/// How well a service matches the database patterns: 2 for a name or display
/// name that starts with a pattern, 1 for a plain substring match.
fn database_match_rank(handle: &ServiceHandle) -> u8 {
    let name = handle.name.to_ascii_lowercase();
    let display = handle.display_name.to_ascii_lowercase();

    DATABASE_PATTERNS
        .iter()
        .map(|pattern| {
            if name.starts_with(pattern) || display.starts_with(pattern) {
                2
            } else if name.contains(pattern) || display.contains(pattern) {
                1
            } else {
                0
            }
        })
        .max()
        .unwrap_or(0)
}

pub fn is_database_service(handle: &ServiceHandle) -> bool {
    database_match_rank(handle) > 0
}

/// Pick the database service out of a listing, preferring one that is running.
pub fn pick_database_service(services: Vec<ServiceHandle>) -> Option<ServiceHandle> {
    services
        .into_iter()
        .filter(is_database_service)
        .max_by(|a, b| {
            (a.is_running(), database_match_rank(a))
                .cmp(&(b.is_running(), database_match_rank(b)))
                // stable choice among equals: alphabetically first name wins
                .then_with(|| b.name.cmp(&a.name))
        })
}

/// Locate the database service. Lookup failures are reported as absence.
pub async fn find_database_service(services: &dyn ServiceController) -> Option<ServiceHandle> {
    match services.list().await {
        Ok(all) => {
            let found = pick_database_service(all);
            match &found {
                Some(handle) => info!(
                    service = %handle.name,
                    display_name = %handle.display_name,
                    state = ?handle.state,
                    "Found database service"
                ),
                None => warn!("No MySQL/MariaDB service found"),
            }
            found
        }
        Err(e) => {
            warn!(error = %e, "Could not list services");
            None
        }
    }
}

/// Stop a service unless it is already stopped.
pub async fn stop_if_running(services: &dyn ServiceController, handle: &ServiceHandle) -> Result<()> {
    if handle.state == ServiceState::Stopped {
        debug!(service = %handle.name, "Already stopped");
        return Ok(());
    }
    info!(service = %handle.name, "Stopping service");
    services.stop(&handle.name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, display: &str, state: ServiceState) -> ServiceHandle {
        ServiceHandle {
            name: name.to_string(),
            display_name: display.to_string(),
            state,
            command_line: None,
        }
    }

    #[test]
    fn matches_name_or_display_name_case_insensitively() {
        assert!(is_database_service(&svc("MySQL", "", ServiceState::Stopped)));
        assert!(is_database_service(&svc("svc1", "MariaDB Server", ServiceState::Stopped)));
        assert!(is_database_service(&svc("OD_mysql56", "", ServiceState::Stopped)));
        assert!(!is_database_service(&svc("OpenDentalService", "Open Dental", ServiceState::Running)));
    }

    #[test]
    fn prefers_running_service() {
        let picked = pick_database_service(vec![
            svc("MySQL", "MySQL", ServiceState::Stopped),
            svc("MariaDB", "MariaDB", ServiceState::Running),
            svc("Spooler", "Print Spooler", ServiceState::Running),
        ])
        .unwrap();
        assert_eq!(picked.name, "MariaDB");
    }

    #[test]
    fn prefers_prefix_match_among_equals() {
        let picked = pick_database_service(vec![
            svc("backup-mysql-agent", "", ServiceState::Stopped),
            svc("mysql57", "", ServiceState::Stopped),
        ])
        .unwrap();
        assert_eq!(picked.name, "mysql57");
    }

    #[test]
    fn none_when_nothing_matches() {
        assert!(pick_database_service(vec![svc("W32Time", "Windows Time", ServiceState::Running)]).is_none());
        assert!(pick_database_service(vec![]).is_none());
    }
}
