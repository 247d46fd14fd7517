use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::discovery::DirectoryLister;
use crate::core::firewall::Firewall;
use crate::core::operator::Operator;
use crate::core::provisioning::Provisioner;
use crate::core::safe_copy::SafeCopy;
use crate::core::services::ServiceController;
use crate::core::shares::SharePublisher;
use crate::core::wait::Sleeper;

/// The OS collaborators a migration drives.
#[derive(Clone)]
pub struct Platform {
    pub services: Arc<dyn ServiceController>,
    pub shares: Arc<dyn SharePublisher>,
    pub firewall: Arc<dyn Firewall>,
    pub fs: Arc<dyn DirectoryLister>,
    pub provisioner: Arc<dyn Provisioner>,
    pub copier: SafeCopy,
}

#[derive(Clone)]
pub struct MigrationContext {
    pub config: Arc<AppConfig>,
    pub platform: Platform,
    pub operator: Arc<dyn Operator>,
    pub sleeper: Arc<dyn Sleeper>,
    /// This machine's name as the other side would address it.
    pub host_name: String,
}

impl MigrationContext {
    pub fn new(
        config: AppConfig,
        platform: Platform,
        operator: Arc<dyn Operator>,
        sleeper: Arc<dyn Sleeper>,
        host_name: String,
    ) -> Self {
        Self {
            config: Arc::new(config),
            platform,
            operator,
            sleeper,
            host_name,
        }
    }
}
