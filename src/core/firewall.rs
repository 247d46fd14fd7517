use anyhow::Result;
use async_trait::async_trait;

/// Standard MySQL/MariaDB client port.
pub const DATABASE_PORT: u16 = 3306;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub port: u16,
    pub action: RuleAction,
}

impl FirewallRule {
    /// Keeps workstations from reconnecting to the old database mid-migration.
    pub fn block_database() -> Self {
        Self {
            name: format!("ODMigrate block MySQL {}", DATABASE_PORT),
            port: DATABASE_PORT,
            action: RuleAction::Block,
        }
    }

    pub fn allow_database() -> Self {
        Self {
            name: format!("ODMigrate allow MySQL {}", DATABASE_PORT),
            port: DATABASE_PORT,
            action: RuleAction::Allow,
        }
    }
}

/// Inbound TCP rules.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Create the rule unless one with the same name already exists.
    async fn ensure_rule(&self, rule: &FirewallRule) -> Result<()>;

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()>;
}
