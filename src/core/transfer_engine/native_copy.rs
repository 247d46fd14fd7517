use crate::core::transfer_engine::{CopyStatus, FileHash, MirrorEngine, MirrorRequest, status};
use crate::core::verifier::verify_copies;
use crate::logging::LogThrottle;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, info_span, warn};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Pure Rust mirror engine.
///
/// Behaves like `robocopy /MIR`: extra destination entries are purged,
/// unchanged files (same size and modification second) are skipped, and the
/// run reports robocopy-compatible status bits. Every copied file is hashed
/// while it is written and, when `verify` is set, re-read from the
/// destination afterwards.
pub struct NativeMirrorEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
    pub verify: bool,
}

impl Default for NativeMirrorEngine {
    fn default() -> Self {
        Self {
            sync_files: true,
            verify: true,
        }
    }
}

#[async_trait]
impl MirrorEngine for NativeMirrorEngine {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn mirror(&self, req: &MirrorRequest) -> Result<i32> {
        let req = req.clone();
        let options = MirrorOptions {
            sync_files: self.sync_files,
            verify: self.verify,
        };
        let span = info_span!(
            "native_mirror",
            source = %req.source.display(),
            destination = %req.destination.display()
        );

        tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            mirror_tree(&req, &options)
        })
        .await?
    }

    fn classify(&self, code: i32) -> CopyStatus {
        CopyStatus::from_robocopy(code)
    }
}

struct MirrorOptions {
    sync_files: bool,
    verify: bool,
}

/// Append-only copy transcript, one timestamped line per event.
struct Transcript {
    writer: BufWriter<File>,
}

impl Transcript {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn line(&mut self, message: impl Display) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = writeln!(self.writer, "{} {}", stamp, message) {
            debug!(error = %e, "Failed to write copy transcript");
        }
    }
}

/// Tree contents keyed by path relative to the scanned root.
#[derive(Default)]
struct ScanResult {
    files: BTreeMap<PathBuf, FileInfo>,
    /// BTreeSet order puts parents before their children.
    directories: BTreeSet<PathBuf>,
    /// Symbolic links with their targets; never followed.
    links: BTreeMap<PathBuf, PathBuf>,
    total_bytes: u64,
}

#[derive(Clone, Copy)]
struct FileInfo {
    size: u64,
    modified: Option<SystemTime>,
}

impl FileInfo {
    fn same_as(&self, other: &FileInfo) -> bool {
        self.size == other.size
            && match (self.modified, other.modified) {
                (Some(a), Some(b)) => whole_seconds(a) == whole_seconds(b),
                _ => false,
            }
    }
}

fn whole_seconds(t: SystemTime) -> Option<u64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

fn mirror_tree(req: &MirrorRequest, options: &MirrorOptions) -> Result<i32> {
    let mut transcript = Transcript::open(&req.log_file)?;
    transcript.line(format_args!(
        "MIRROR {} -> {} (retries {}, wait {}s)",
        req.source.display(),
        req.destination.display(),
        req.retries,
        req.retry_wait.as_secs()
    ));

    if !req.source.is_dir() {
        error!("Source directory does not exist");
        transcript.line("ERROR source directory does not exist");
        return Ok(status::FATAL);
    }

    if let Err(e) = fs::create_dir_all(&req.destination) {
        error!(error = %e, "Failed to create destination directory");
        transcript.line(format_args!("ERROR creating destination: {}", e));
        return Ok(status::FATAL);
    }

    let (source, existing) = match (scan_tree(&req.source), scan_tree(&req.destination)) {
        (Ok(s), Ok(d)) => (s, d),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to scan directory tree");
            transcript.line(format_args!("ERROR scanning: {}", e));
            return Ok(status::FATAL);
        }
    };

    info!(
        files = source.files.len(),
        directories = source.directories.len(),
        total_bytes = source.total_bytes,
        "Scan complete"
    );

    let mut code = status::NO_CHANGE;
    let mut failures: Vec<String> = Vec::new();

    // Destination links go first, including ones standing where the source
    // has a file or directory, so nothing below writes through them.
    for (relative, target) in &existing.links {
        if source.links.get(relative) == Some(target) {
            continue;
        }
        match remove_link(&req.destination.join(relative)) {
            Ok(()) => {
                code |= status::EXTRAS;
                transcript.line(format_args!("*EXTRA Link {}", relative.display()));
            }
            Err(e) => {
                code |= status::FAILED;
                transcript.line(format_args!("ERROR purging {}: {}", relative.display(), e));
                failures.push(format!("{}: {}", relative.display(), e));
            }
        }
    }

    // Purge what the source no longer has. Files first so directory removal
    // only has to deal with emptied or wholly-extra trees.
    for relative in existing.files.keys() {
        if source.files.contains_key(relative) {
            continue;
        }
        let target = req.destination.join(relative);
        match remove_entry(&target, false) {
            Ok(()) => {
                code |= status::EXTRAS;
                transcript.line(format_args!("*EXTRA File {}", relative.display()));
            }
            Err(e) => {
                code |= status::FAILED;
                transcript.line(format_args!("ERROR purging {}: {}", relative.display(), e));
                failures.push(format!("{}: {}", relative.display(), e));
            }
        }
    }

    for relative in existing.directories.iter() {
        if source.directories.contains(relative) {
            continue;
        }
        let target = req.destination.join(relative);
        match remove_entry(&target, true) {
            Ok(()) => {
                code |= status::EXTRAS;
                transcript.line(format_args!("*EXTRA Dir {}", relative.display()));
            }
            Err(e) => {
                code |= status::FAILED;
                transcript.line(format_args!("ERROR purging {}: {}", relative.display(), e));
                failures.push(format!("{}: {}", relative.display(), e));
            }
        }
    }

    for relative in &source.directories {
        let target = req.destination.join(relative);
        if let Err(e) = fs::create_dir_all(&target) {
            code |= status::FAILED;
            transcript.line(format_args!("ERROR creating {}: {}", relative.display(), e));
            failures.push(format!("{}: {}", relative.display(), e));
        }
    }

    for (relative, target) in &source.links {
        if existing.links.get(relative) == Some(target) {
            continue;
        }
        match create_link(&req.source.join(relative), target, &req.destination.join(relative)) {
            Ok(()) => {
                code |= status::COPIED;
                transcript.line(format_args!("New Link {} -> {}", relative.display(), target.display()));
            }
            Err(e) => {
                code |= status::FAILED;
                transcript.line(format_args!("ERROR linking {}: {}", relative.display(), e));
                failures.push(format!("{}: {}", relative.display(), e));
            }
        }
    }

    let throttle = LogThrottle::new(Duration::from_secs(2));
    let mut hashes: Vec<FileHash> = Vec::new();
    let mut bytes_copied: u64 = 0;

    for (relative, info) in &source.files {
        if existing
            .files
            .get(relative)
            .is_some_and(|dest_info| dest_info.same_as(info))
        {
            continue;
        }

        let src = req.source.join(relative);
        let dst = req.destination.join(relative);

        match copy_with_retries(&src, &dst, relative, req, options.sync_files) {
            Ok(file_hash) => {
                code |= status::COPIED;
                bytes_copied += file_hash.size;
                transcript.line(format_args!(
                    "{} {} ({} bytes)",
                    if existing.files.contains_key(relative) {
                        "Newer"
                    } else {
                        "New File"
                    },
                    relative.display(),
                    file_hash.size
                ));
                hashes.push(file_hash);

                if throttle.should_log() {
                    debug!(
                        bytes_copied,
                        total_bytes = source.total_bytes,
                        current_file = %relative.display(),
                        "Mirror progress"
                    );
                }
            }
            Err(e) if e.is_connection_lost => {
                error!(file = %relative.display(), error = %e.message, "Lost access to the tree, aborting");
                transcript.line(format_args!(
                    "ERROR connection lost at {}: {}",
                    relative.display(),
                    e.message
                ));
                return Ok(status::FATAL);
            }
            Err(e) => {
                error!(file = %relative.display(), error = %e.message, "Failed to copy file");
                code |= status::FAILED;
                transcript.line(format_args!("ERROR {}: {}", relative.display(), e.message));
                failures.push(format!("{}: {}", relative.display(), e.message));
            }
        }
    }

    // Directory timestamps last, since writing files into them bumps mtime.
    for relative in &source.directories {
        if let Err(e) = preserve_timestamps(&req.source.join(relative), &req.destination.join(relative)) {
            debug!(dir = %relative.display(), error = %e, "Failed to preserve directory timestamps");
        }
    }

    if options.verify && !hashes.is_empty() {
        let report = verify_copies(&req.destination, &hashes);
        for line in report.transcript_lines() {
            transcript.line(line);
        }
        if !report.is_clean() {
            code |= status::FAILED;
            failures.extend(report.findings.iter().map(|f| f.path().display().to_string()));
        }
    }

    if !failures.is_empty() {
        warn!(failures = failures.len(), "Mirror finished with failures");
    }

    transcript.line(format_args!(
        "DONE status {} copied {} file(s), {} bytes",
        code,
        hashes.len(),
        bytes_copied
    ));

    info!(
        status = code,
        files_copied = hashes.len(),
        bytes_copied,
        "Native mirror complete"
    );

    Ok(code)
}

fn remove_entry(path: &Path, is_dir: bool) -> io::Result<()> {
    let result = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        // already gone with a purged parent
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove a link itself, never what it points at.
fn remove_link(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        // directory links on Windows
        Err(_) if cfg!(windows) => fs::remove_dir(path),
        other => other,
    }
}

#[cfg(unix)]
fn create_link(_source: &Path, target: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(windows)]
fn create_link(source: &Path, target: &Path, dest: &Path) -> io::Result<()> {
    if fs::metadata(source).is_ok_and(|m| m.is_dir()) {
        std::os::windows::fs::symlink_dir(target, dest)
    } else {
        std::os::windows::fs::symlink_file(target, dest)
    }
}

#[cfg(not(any(unix, windows)))]
fn create_link(_source: &Path, _target: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(ErrorKind::Unsupported, "symbolic links are not supported here"))
}

/// Walk `root` without following symlinks. A missing root is an empty tree.
fn scan_tree(root: &Path) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    if !root.exists() {
        return Ok(result);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|e| anyhow::anyhow!("Failed to list {}: {}", dir.display(), e))?;

        for entry in entries {
            let entry = entry.map_err(|e| anyhow::anyhow!("Failed to list {}: {}", dir.display(), e))?;
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(root).map(Path::to_path_buf) else {
                continue;
            };

            let metadata = match path.symlink_metadata() {
                Ok(m) => m,
                Err(e) if is_connection_lost_error(&e) => {
                    anyhow::bail!("Lost access to {} while scanning: {}", root.display(), e)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let kind = metadata.file_type();
            if kind.is_dir() {
                result.directories.insert(relative);
                pending.push(path);
            } else if kind.is_symlink() {
                match fs::read_link(&path) {
                    Ok(target) => {
                        result.links.insert(relative, target);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable link"),
                }
            } else if kind.is_file() {
                result.total_bytes += metadata.len();
                result.files.insert(
                    relative,
                    FileInfo {
                        size: metadata.len(),
                        modified: metadata.modified().ok(),
                    },
                );
            }
        }
    }

    Ok(result)
}

struct FileCopyError {
    message: String,
    is_connection_lost: bool,
}

impl FileCopyError {
    fn new(context: &str, e: &io::Error) -> Self {
        Self {
            message: format!("{}: {}", context, e),
            is_connection_lost: is_connection_lost_error(e),
        }
    }
}

fn copy_with_retries(
    src: &Path,
    dst: &Path,
    relative: &Path,
    req: &MirrorRequest,
    sync_file: bool,
) -> Result<FileHash, FileCopyError> {
    let mut attempt = 0;
    loop {
        match copy_single_file(src, dst, sync_file) {
            Ok((size, hash)) => {
                return Ok(FileHash {
                    relative_path: relative.to_path_buf(),
                    hash: *hash.as_bytes(),
                    size,
                });
            }
            Err(e) if e.is_connection_lost || attempt >= req.retries => return Err(e),
            Err(e) => {
                attempt += 1;
                warn!(
                    file = %relative.display(),
                    attempt,
                    error = %e.message,
                    "Copy failed, retrying"
                );
                std::thread::sleep(req.retry_wait);
            }
        }
    }
}

/// Writer adapter that feeds everything written through BLAKE3.
struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy one file, hashing the bytes as they pass through.
fn copy_single_file(
    source: &Path,
    dest: &Path,
    sync_file: bool,
) -> Result<(u64, blake3::Hash), FileCopyError> {
    let opened = File::open(source).map_err(|e| FileCopyError::new("Failed to open source file", &e))?;
    let permissions = opened
        .metadata()
        .map_err(|e| FileCopyError::new("Failed to read source metadata", &e))?
        .permissions();
    let created = File::create(dest).map_err(|e| FileCopyError::new("Failed to create destination file", &e))?;

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, opened);
    let mut writer = HashingWriter {
        inner: BufWriter::with_capacity(BUFFER_SIZE, created),
        hasher: blake3::Hasher::new(),
        written: 0,
    };
    io::copy(&mut reader, &mut writer).map_err(|e| FileCopyError::new("Failed to copy contents", &e))?;

    let HashingWriter { inner, hasher, written } = writer;
    let file = inner
        .into_inner()
        .map_err(|e| FileCopyError::new("Failed to flush destination file", e.error()))?;
    if sync_file {
        file.sync_all()
            .map_err(|e| FileCopyError::new("Failed to sync destination file", &e))?;
    }
    drop(file);

    if let Err(e) = fs::set_permissions(dest, permissions) {
        debug!(dest = %dest.display(), error = %e, "Failed to copy file permissions");
    }
    if let Err(e) = preserve_timestamps(source, dest) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok((written, hasher.finalize()))
}

fn preserve_timestamps(source: &Path, dest: &Path) -> Result<()> {
    let source_metadata = fs::metadata(source)?;

    let atime = filetime::FileTime::from_last_access_time(&source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);

    filetime::set_file_times(dest, atime, mtime)?;
    Ok(())
}

/// Errors meaning the share or volume went away, where retrying per file is pointless.
fn is_connection_lost_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => true,
        _ => error.raw_os_error().is_some_and(is_connection_lost_os_error),
    }
}

#[cfg(unix)]
fn is_connection_lost_os_error(code: i32) -> bool {
    matches!(
        code,
        libc::EIO | libc::ENODEV | libc::ENXIO | libc::EHOSTDOWN | libc::EHOSTUNREACH
    )
}

#[cfg(windows)]
fn is_connection_lost_os_error(code: i32) -> bool {
    // ERROR_BAD_NETPATH, ERROR_NETNAME_DELETED, ERROR_BAD_NET_NAME, ERROR_UNEXP_NET_ERR
    matches!(code, 53 | 59 | 64 | 67)
}

#[cfg(not(any(unix, windows)))]
fn is_connection_lost_os_error(_code: i32) -> bool {
    false
}
