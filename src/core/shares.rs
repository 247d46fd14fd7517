//! Network share publishing seam.
//!
//! The transfer relies entirely on share and filesystem ACLs: there is no
//! credential exchange between the two sides.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Access granted to the "everyone" principal on a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Change,
    Full,
}

impl AccessLevel {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo {
    pub name: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait SharePublisher: Send + Sync {
    async fn list(&self) -> Result<Vec<ShareInfo>>;

    /// Expose `path` as `name`. Re-publishing an existing share replaces its
    /// access level; it never fails just because the share exists.
    async fn publish(&self, name: &str, path: &Path, access: AccessLevel) -> Result<()>;

    /// Remove the share registration. Absent shares are not an error.
    async fn unpublish(&self, name: &str) -> Result<()>;

    /// Grant everyone modify rights on `dir` and everything below it.
    async fn grant_modify(&self, dir: &Path) -> Result<()>;

    /// Local path through which `\\server\share` is reached from this machine.
    fn remote_path(&self, server: &str, share: &str) -> PathBuf;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_read_is_read_only() {
        assert!(!AccessLevel::Read.is_writable());
        assert!(AccessLevel::Change.is_writable());
        assert!(AccessLevel::Full.is_writable());
    }

    #[test]
    fn access_level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AccessLevel::Change).unwrap(), "\"change\"");
    }
}
