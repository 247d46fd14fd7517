//! Locating the database files and the A-to-Z attachment tree on the old server.
//!
//! Nothing in here touches the filesystem directly; it all goes through a
//! [`DirectoryLister`] so ranking can be exercised against an in-memory tree.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::models::ServiceHandle;
use crate::core::shares::ShareInfo;

/// Subfolder names found in a typical attachment tree besides the letters.
pub const WELL_KNOWN_FOLDERS: &[&str] = &[
    "Imaging",
    "Scans",
    "EmailAttachments",
    "Forms",
    "Letters",
    "Reports",
    "Sheets",
    "Statements",
];

/// Directory names never worth descending into while scanning for the tree.
const SCAN_SKIP: &[&str] = &[
    "windows",
    "program files",
    "program files (x86)",
    "programdata",
    "$recycle.bin",
    "system volume information",
    "proc",
    "sys",
    "dev",
    "run",
    "usr",
];

pub trait DirectoryLister: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Immediate subdirectories of `path`; empty if unreadable.
    fn list_dirs(&self, path: &Path) -> Vec<PathBuf>;

    /// Filesystem roots to scan from.
    fn roots(&self) -> Vec<PathBuf>;

    fn read_to_string(&self, path: &Path) -> Option<String>;
}

/// The real local filesystem.
pub struct LocalFs;

impl DirectoryLister for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dirs(&self, path: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(path) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        dirs.sort();
        dirs
    }

    fn roots(&self) -> Vec<PathBuf> {
        if cfg!(windows) {
            ('A'..='Z')
                .map(|letter| PathBuf::from(format!("{}:\\", letter)))
                .filter(|root| root.exists())
                .collect()
        } else {
            vec![PathBuf::from("/")]
        }
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// One point per distinct letter folder A-Z plus one per well-known folder.
pub fn score_attachment_tree<S: AsRef<str>>(subdir_names: &[S]) -> u32 {
    let mut letters = HashSet::new();
    let mut bonus = HashSet::new();

    for name in subdir_names {
        let name = name.as_ref();
        let mut chars = name.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_alphabetic() {
                letters.insert(c.to_ascii_uppercase());
                continue;
            }
        }
        if let Some(known) = WELL_KNOWN_FOLDERS
            .iter()
            .find(|known| known.eq_ignore_ascii_case(name))
        {
            bonus.insert(*known);
        }
    }

    (letters.len() + bonus.len()) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredCandidate {
    pub path: PathBuf,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentChoice {
    pub path: PathBuf,
    pub score: u32,
    /// The hint was used because no candidate reached the threshold.
    pub fallback: bool,
    /// Other candidates sharing the winning score.
    pub ties: Vec<PathBuf>,
}

pub struct AttachmentSearch<'a> {
    pub hint: &'a Path,
    pub share_pattern: &'a Regex,
    pub scan_depth: usize,
    pub min_score: u32,
    /// Trees never considered, e.g. the staging root holding earlier packages.
    pub exclude: &'a [PathBuf],
}

impl AttachmentSearch<'_> {
    fn excludes(&self, path: &Path) -> bool {
        self.exclude.iter().any(|root| path.starts_with(root))
    }
}

/// Candidates in gathering order: matching shares, the hint, then a bounded scan.
pub fn gather_candidates(
    fs: &dyn DirectoryLister,
    shares: &[ShareInfo],
    search: &AttachmentSearch<'_>,
) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |path: PathBuf, out: &mut Vec<PathBuf>| {
        if !search.excludes(&path) && seen.insert(path.clone()) {
            out.push(path);
        }
    };

    for share in shares {
        if search.share_pattern.is_match(&share.name) {
            debug!(share = %share.name, path = %share.path.display(), "Share matches attachment pattern");
            push(share.path.clone(), &mut out);
        }
    }

    push(search.hint.to_path_buf(), &mut out);

    let mut scanned = Vec::new();
    for root in fs.roots() {
        scan(fs, &root, search.scan_depth, search.exclude, &mut scanned);
    }
    for path in scanned {
        push(path, &mut out);
    }

    out
}

fn scan(fs: &dyn DirectoryLister, dir: &Path, depth_left: usize, exclude: &[PathBuf], out: &mut Vec<PathBuf>) {
    if depth_left == 0 {
        return;
    }
    for child in fs.list_dirs(dir) {
        let name = dir_name(&child);
        let lowered = name.to_ascii_lowercase();
        // letter folders live inside trees, not above them
        if name.chars().count() == 1
            || SCAN_SKIP.contains(&lowered.as_str())
            || name.starts_with('.')
            || exclude.contains(&child)
        {
            continue;
        }
        out.push(child.clone());
        scan(fs, &child, depth_left - 1, exclude, out);
    }
}

/// Score every candidate; highest first, gathering order kept among equals.
pub fn rank_candidates(fs: &dyn DirectoryLister, candidates: &[PathBuf]) -> Vec<ScoredCandidate> {
    let mut ranked: Vec<ScoredCandidate> = candidates
        .iter()
        .filter(|path| fs.exists(path))
        .map(|path| {
            let names: Vec<String> = fs.list_dirs(path).iter().map(|p| dir_name(p)).collect();
            ScoredCandidate {
                path: path.clone(),
                score: score_attachment_tree(&names),
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked
}

pub fn choose_attachment_tree(ranked: &[ScoredCandidate], hint: &Path, min_score: u32) -> AttachmentChoice {
    match ranked.first() {
        Some(best) if best.score >= min_score => AttachmentChoice {
            path: best.path.clone(),
            score: best.score,
            fallback: false,
            ties: ranked[1..]
                .iter()
                .take_while(|c| c.score == best.score)
                .map(|c| c.path.clone())
                .collect(),
        },
        _ => AttachmentChoice {
            path: hint.to_path_buf(),
            score: ranked
                .iter()
                .find(|c| c.path == hint)
                .map(|c| c.score)
                .unwrap_or(0),
            fallback: true,
            ties: Vec::new(),
        },
    }
}

pub fn discover_attachment_tree(
    fs: &dyn DirectoryLister,
    shares: &[ShareInfo],
    search: &AttachmentSearch<'_>,
) -> AttachmentChoice {
    let candidates = gather_candidates(fs, shares, search);
    let ranked = rank_candidates(fs, &candidates);
    let choice = choose_attachment_tree(&ranked, search.hint, search.min_score);
    info!(
        path = %choice.path.display(),
        score = choice.score,
        fallback = choice.fallback,
        candidates = ranked.len(),
        "Attachment tree selected"
    );
    choice
}

/// Split a service command line into arguments, honouring double quotes.
pub fn split_command_line(command_line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in command_line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

pub fn binary_from_command_line(command_line: &str) -> Option<PathBuf> {
    split_command_line(command_line)
        .into_iter()
        .next()
        .map(PathBuf::from)
}

pub fn defaults_file_from_command_line(command_line: &str) -> Option<PathBuf> {
    split_command_line(command_line)
        .into_iter()
        .find_map(|arg| arg.strip_prefix("--defaults-file=").map(PathBuf::from))
}

/// `datadir` from the server sections of a my.ini / my.cnf.
pub fn parse_datadir(ini: &str) -> Option<PathBuf> {
    let mut in_server_section = false;
    for raw in ini.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            let section = line.trim_matches(|c| c == '[' || c == ']').trim().to_ascii_lowercase();
            in_server_section = matches!(section.as_str(), "mysqld" | "server" | "mariadb" | "mariadbd");
            continue;
        }
        if !in_server_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim().eq_ignore_ascii_case("datadir") {
                let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                if !value.is_empty() {
                    return Some(PathBuf::from(value));
                }
            }
        }
    }
    None
}

fn install_root(service: Option<&ServiceHandle>) -> Option<PathBuf> {
    let binary = binary_from_command_line(service?.command_line.as_deref()?)?;
    Some(binary.parent()?.parent()?.to_path_buf())
}

const DEFAULT_CONFIG_FILES: &[&str] = &[
    r"C:\mysql\my.ini",
    r"C:\ProgramData\MySQL\MySQL Server 5.6\my.ini",
    r"C:\ProgramData\MySQL\MySQL Server 5.5\my.ini",
    r"C:\Program Files\MariaDB 10.5\data\my.ini",
    "/etc/mysql/my.cnf",
    "/etc/my.cnf",
];

const DEFAULT_DATA_DIRS: &[&str] = &[
    r"C:\mysql\data",
    r"C:\ProgramData\MySQL\MySQL Server 5.6\data",
    r"C:\ProgramData\MySQL\MySQL Server 5.5\data",
    r"C:\Program Files\MariaDB 10.5\data",
    "/var/lib/mysql",
];

/// Ranked config file candidates; the first that exists wins.
pub fn config_file_candidates(hint: Option<&Path>, service: Option<&ServiceHandle>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = hint.map(Path::to_path_buf).into_iter().collect();
    if let Some(cmd) = service.and_then(|s| s.command_line.as_deref()) {
        out.extend(defaults_file_from_command_line(cmd));
    }
    if let Some(root) = install_root(service) {
        out.push(root.join("my.ini"));
        out.push(root.join("data").join("my.ini"));
    }
    out.extend(DEFAULT_CONFIG_FILES.iter().map(PathBuf::from));
    out
}

/// Ranked data directory candidates; the first that exists wins.
pub fn data_dir_candidates(
    hint: Option<&Path>,
    service: Option<&ServiceHandle>,
    config_text: Option<&str>,
) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = hint.map(Path::to_path_buf).into_iter().collect();
    out.extend(config_text.and_then(parse_datadir));
    if let Some(root) = install_root(service) {
        out.push(root.join("data"));
    }
    out.extend(DEFAULT_DATA_DIRS.iter().map(PathBuf::from));
    out
}

pub fn first_existing(fs: &dyn DirectoryLister, candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| fs.exists(p)).cloned()
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseLocations {
    pub data_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    /// Everything tried for the data directory, for error reporting.
    pub searched: Vec<PathBuf>,
}

pub fn locate_database(
    fs: &dyn DirectoryLister,
    data_dir_hint: Option<&Path>,
    config_hint: Option<&Path>,
    service: Option<&ServiceHandle>,
) -> DatabaseLocations {
    let config_file = first_existing(fs, &config_file_candidates(config_hint, service));
    let config_text = config_file.as_deref().and_then(|p| fs.read_to_string(p));
    let searched = data_dir_candidates(data_dir_hint, service, config_text.as_deref());
    let data_dir = first_existing(fs, &searched);

    debug!(data_dir = ?data_dir, config_file = ?config_file, "Database locations resolved");

    DatabaseLocations {
        data_dir,
        config_file,
        searched,
    }
}
