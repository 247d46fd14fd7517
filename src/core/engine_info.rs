//! Database engine detection and the installer recommendation table.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineVersion {
    pub engine: String,
    pub version: String,
    pub major_minor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerRecommendation {
    pub installer_url: String,
    pub upgrade_url: Option<String>,
}

pub const GENERIC_INSTALLER_URL: &str = "https://mariadb.org/download/";

struct InstallerEntry {
    engine: &'static str,
    major_minor: &'static str,
    installer_url: &'static str,
    upgrade_url: Option<&'static str>,
}

const INSTALLERS: &[InstallerEntry] = &[
    InstallerEntry {
        engine: "MariaDB",
        major_minor: "10.5",
        installer_url: "https://archive.mariadb.org/mariadb-10.5.22/winx64-packages/mariadb-10.5.22-winx64.msi",
        upgrade_url: None,
    },
    InstallerEntry {
        engine: "MariaDB",
        major_minor: "10.6",
        installer_url: "https://archive.mariadb.org/mariadb-10.6.16/winx64-packages/mariadb-10.6.16-winx64.msi",
        upgrade_url: None,
    },
    InstallerEntry {
        engine: "MariaDB",
        major_minor: "10.11",
        installer_url: "https://archive.mariadb.org/mariadb-10.11.6/winx64-packages/mariadb-10.11.6-winx64.msi",
        upgrade_url: None,
    },
    InstallerEntry {
        engine: "MySQL",
        major_minor: "5.6",
        installer_url: "https://downloads.mysql.com/archives/get/p/25/file/mysql-installer-community-5.6.51.0.msi",
        upgrade_url: None,
    },
    // Legacy 5.5 installs should move to MariaDB rather than be reproduced.
    InstallerEntry {
        engine: "MySQL",
        major_minor: "5.5",
        installer_url: "https://archive.mariadb.org/mariadb-10.5.22/winx64-packages/mariadb-10.5.22-winx64.msi",
        upgrade_url: Some("https://mariadb.com/kb/en/upgrading-from-mysql-to-mariadb/"),
    },
];

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("valid version regex"));
static MARIADB_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\.(\d+)\.(\d+)(?:-[\w.]+?)?-MariaDB").expect("valid MariaDB regex")
});

/// "10.5.22" -> "10.5"
pub fn major_minor(version: &str) -> Option<String> {
    let mut parts = version.split('.');
    let major = parts.next().filter(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))?;
    let minor: String = parts.next()?.chars().take_while(|c| c.is_ascii_digit()).collect();
    (!minor.is_empty()).then(|| format!("{}.{}", major, minor))
}

/// Make sense of whatever `mysqld --version` printed.
///
/// Handles the server's own banner (`mysqld  Ver 10.5.22-MariaDB for Win64`),
/// the client banner (`mysql  Ver 15.1 Distrib 10.5.22-MariaDB`) and terse
/// strings such as `MariaDB 10.5.22`.
pub fn parse_version_output(output: &str) -> Option<EngineVersion> {
    let lowered = output.to_ascii_lowercase();
    let engine = if lowered.contains("mariadb") {
        "MariaDB"
    } else if lowered.contains("mysql") {
        "MySQL"
    } else {
        return None;
    };

    let caps = if engine == "MariaDB" {
        MARIADB_VERSION_RE
            .captures(output)
            .or_else(|| VERSION_RE.captures(output))?
    } else {
        VERSION_RE.captures(output)?
    };

    let version = format!("{}.{}.{}", &caps[1], &caps[2], &caps[3]);
    Some(EngineVersion {
        engine: engine.to_string(),
        major_minor: format!("{}.{}", &caps[1], &caps[2]),
        version,
    })
}

/// Look up the installer for an engine line, falling back to the generic download page.
pub fn recommend_installer(engine: &str, major_minor: &str) -> InstallerRecommendation {
    INSTALLERS
        .iter()
        .find(|entry| entry.engine.eq_ignore_ascii_case(engine) && entry.major_minor == major_minor)
        .map(|entry| InstallerRecommendation {
            installer_url: entry.installer_url.to_string(),
            upgrade_url: entry.upgrade_url.map(str::to_string),
        })
        .unwrap_or_else(|| InstallerRecommendation {
            installer_url: GENERIC_INSTALLER_URL.to_string(),
            upgrade_url: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terse_mariadb_string() {
        let v = parse_version_output("MariaDB 10.5.22").unwrap();
        assert_eq!(v.engine, "MariaDB");
        assert_eq!(v.version, "10.5.22");
        assert_eq!(v.major_minor, "10.5");
    }

    #[test]
    fn server_banners() {
        let v = parse_version_output(
            "mysqld  Ver 10.5.22-MariaDB for Win64 on AMD64 (mariadb.org binary distribution)",
        )
        .unwrap();
        assert_eq!((v.engine.as_str(), v.version.as_str()), ("MariaDB", "10.5.22"));

        let v = parse_version_output(
            r"C:\mysql\bin\mysqld.exe  Ver 5.6.51 for Win64 on x86_64 (MySQL Community Server (GPL))",
        )
        .unwrap();
        assert_eq!((v.engine.as_str(), v.major_minor.as_str()), ("MySQL", "5.6"));
    }

    #[test]
    fn client_banner_prefers_distrib_version() {
        let v = parse_version_output("mysql  Ver 15.1 Distrib 10.11.6-MariaDB, for debian-linux-gnu")
            .unwrap();
        assert_eq!(v.version, "10.11.6");
        assert_eq!(v.major_minor, "10.11");
    }

    #[test]
    fn unrelated_output_is_not_an_engine() {
        assert!(parse_version_output("PostgreSQL 15.2").is_none());
        assert!(parse_version_output("mysqld: unknown option").is_none());
    }

    #[test]
    fn major_minor_derivation() {
        assert_eq!(major_minor("10.5.22").as_deref(), Some("10.5"));
        assert_eq!(major_minor("5.6.51-log").as_deref(), Some("5.6"));
        assert_eq!(major_minor("8").as_deref(), None);
        assert_eq!(major_minor("").as_deref(), None);
    }

    #[test]
    fn mariadb_10_5_has_dedicated_installer() {
        let rec = recommend_installer("MariaDB", "10.5");
        assert!(rec.installer_url.contains("mariadb-10.5"));
        assert!(rec.upgrade_url.is_none());
    }

    #[test]
    fn legacy_mysql_gets_upgrade_guide() {
        let rec = recommend_installer("MySQL", "5.5");
        assert!(rec.upgrade_url.is_some());
    }

    #[test]
    fn unknown_pair_falls_back_to_generic() {
        let rec = recommend_installer("MySQL", "8.0");
        assert_eq!(rec.installer_url, GENERIC_INSTALLER_URL);
        assert!(rec.upgrade_url.is_none());

        let rec = recommend_installer("Unknown", "");
        assert_eq!(rec.installer_url, GENERIC_INSTALLER_URL);
    }
}
