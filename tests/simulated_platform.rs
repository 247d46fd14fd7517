use odmigrate::adapters::simulated::{SimulatedNetwork, SimulatedPlatform};
use odmigrate::config::AppConfig;
use odmigrate::core::firewall::FirewallRule;
use odmigrate::core::models::ServiceState;
use odmigrate::core::services::{find_database_service, stop_if_running};
use odmigrate::core::shares::AccessLevel;
use tempfile::tempdir;

#[tokio::test]
async fn test_publish_is_idempotent() {
    let temp = tempdir().unwrap();
    let sim = SimulatedPlatform::new("OLDSERVER", temp.path());
    let platform = sim.platform(&AppConfig::default());

    for _ in 0..2 {
        platform
            .shares
            .publish("ODMigration", temp.path(), AccessLevel::Change)
            .await
            .unwrap();
    }

    let shares = platform.shares.list().await.unwrap();
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].name, "ODMigration");
    assert_eq!(sim.shares.access_of("ODMigration"), Some(AccessLevel::Change));
}

#[tokio::test]
async fn test_publish_adjusts_access_level() {
    let temp = tempdir().unwrap();
    let sim = SimulatedPlatform::new("NEWSERVER", temp.path());
    let platform = sim.platform(&AppConfig::default());

    platform
        .shares
        .publish("OpenDentImages", temp.path(), AccessLevel::Change)
        .await
        .unwrap();
    platform
        .shares
        .publish("OpenDentImages", temp.path(), AccessLevel::Read)
        .await
        .unwrap();

    assert_eq!(sim.shares.share_count(), 1);
    assert_eq!(sim.shares.access_of("OpenDentImages"), Some(AccessLevel::Read));
}

#[tokio::test]
async fn test_unpublish_tolerates_absent_share() {
    let temp = tempdir().unwrap();
    let sim = SimulatedPlatform::new("OLDSERVER", temp.path());
    let platform = sim.platform(&AppConfig::default());

    platform.shares.unpublish("ODMigration").await.unwrap();
}

#[tokio::test]
async fn test_remote_path_follows_network() {
    let temp = tempdir().unwrap();
    let network = SimulatedNetwork::new();
    let old = SimulatedPlatform::on_network("OLDSERVER", temp.path(), network.clone());
    let new = SimulatedPlatform::on_network("NEWSERVER", temp.path(), network);

    old.platform(&AppConfig::default())
        .shares
        .publish("ODMigration", temp.path(), AccessLevel::Change)
        .await
        .unwrap();

    let remote = new
        .platform(&AppConfig::default())
        .shares
        .remote_path("OldServer", "odmigration");
    assert_eq!(remote, temp.path());
}

#[tokio::test]
async fn test_database_service_lookup_prefers_running() {
    let temp = tempdir().unwrap();
    let sim = SimulatedPlatform::new("OLDSERVER", temp.path());
    sim.services.add_service("MySQL", ServiceState::Stopped, None);
    sim.services.add_service("MariaDB", ServiceState::Running, None);
    sim.services.add_service("OpenDentalService", ServiceState::Running, None);
    let platform = sim.platform(&AppConfig::default());

    let found = find_database_service(platform.services.as_ref()).await.unwrap();
    assert_eq!(found.name, "MariaDB");

    stop_if_running(platform.services.as_ref(), &found).await.unwrap();
    assert_eq!(sim.services.state_of("MariaDB"), Some(ServiceState::Stopped));
}

#[tokio::test]
async fn test_no_database_service_is_absence_not_error() {
    let temp = tempdir().unwrap();
    let sim = SimulatedPlatform::new("NEWSERVER", temp.path());
    sim.services.add_service("Spooler", ServiceState::Running, None);
    let platform = sim.platform(&AppConfig::default());

    assert!(find_database_service(platform.services.as_ref()).await.is_none());
}

#[tokio::test]
async fn test_firewall_rules_are_not_duplicated() {
    let temp = tempdir().unwrap();
    let sim = SimulatedPlatform::new("NEWSERVER", temp.path());
    let platform = sim.platform(&AppConfig::default());
    let rule = FirewallRule::allow_database();

    platform.firewall.ensure_rule(&rule).await.unwrap();
    platform.firewall.ensure_rule(&rule).await.unwrap();
    assert_eq!(sim.firewall.rules(), vec![rule.clone()]);

    platform.firewall.remove_rule(&rule).await.unwrap();
    assert!(sim.firewall.rules().is_empty());
}
