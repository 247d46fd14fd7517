//! Integration tests for the native mirror engine behind Safe Copy.
//!
//! These exercise mirror semantics end to end on real directories:
//! - extra destination entries are purged
//! - timestamps survive the copy
//! - a second run over an unchanged tree copies nothing

use filetime::{FileTime, set_file_mtime};
use odmigrate::config::CopyConfig;
use odmigrate::core::safe_copy::SafeCopy;
use odmigrate::core::transfer_engine::{
    CopyStatus, MirrorEngine, MirrorRequest, NativeMirrorEngine, TransferEngineType, create_engine,
    status,
};
use odmigrate::error::MigrationError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Every file and directory under `root`, relative to it.
fn listing(root: &Path) -> BTreeSet<PathBuf> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeSet<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            out.insert(path.strip_prefix(base).unwrap().to_path_buf());
            if path.is_dir() {
                walk(base, &path, out);
            }
        }
    }
    let mut out = BTreeSet::new();
    walk(root, root, &mut out);
    out
}

fn request(source: &Path, destination: &Path, log: &Path) -> MirrorRequest {
    MirrorRequest {
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
        retries: 0,
        retry_wait: Duration::ZERO,
        log_file: log.to_path_buf(),
    }
}

fn copy_config(log_dir: &Path) -> CopyConfig {
    CopyConfig {
        engine: TransferEngineType::Native,
        retries: 0,
        retry_wait_secs: 0,
        log_dir: log_dir.to_path_buf(),
        verify: true,
    }
}

#[tokio::test]
async fn mirror_leaves_no_stray_entries() {
    let temp = tempdir().unwrap();
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");

    create_file(&src.join("opendental/patient.MYD"), b"patients");
    create_file(&src.join("opendental/appointment.MYD"), b"appointments");
    std::fs::create_dir_all(src.join("empty")).unwrap();

    create_file(&dst.join("opendental/patient.MYD"), b"stale");
    create_file(&dst.join("opendental/removed.MYD"), b"gone from source");
    create_file(&dst.join("old_schema/table.frm"), b"gone from source");

    let copier = SafeCopy::new(create_engine(TransferEngineType::Native, true), &copy_config(&temp.path().join("logs")));
    let result = copier.mirror(&src, &dst, "database").await.unwrap();

    assert_eq!(result, CopyStatus::Success);
    assert_eq!(listing(&src), listing(&dst));
    assert_eq!(std::fs::read(dst.join("opendental/patient.MYD")).unwrap(), b"patients");

    let logs: Vec<_> = std::fs::read_dir(temp.path().join("logs")).unwrap().collect();
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn status_bits_follow_robocopy() {
    let temp = tempdir().unwrap();
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    let log = temp.path().join("mirror.log");
    create_file(&src.join("a.txt"), b"a");
    create_file(&dst.join("extra.txt"), b"x");

    let engine = NativeMirrorEngine::default();
    let code = engine.mirror(&request(&src, &dst, &log)).await.unwrap();
    assert_eq!(code, status::COPIED | status::EXTRAS);
    assert_eq!(engine.classify(code), CopyStatus::Success);

    let code = engine.mirror(&request(&src, &dst, &log)).await.unwrap();
    assert_eq!(code, status::NO_CHANGE);

    let transcript = std::fs::read_to_string(&log).unwrap();
    assert!(transcript.contains("*EXTRA File extra.txt"));
    assert_eq!(transcript.matches("MIRROR").count(), 2);
}

#[tokio::test]
async fn modification_times_are_preserved() {
    let temp = tempdir().unwrap();
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    create_file(&src.join("A/Adams/scan.pdf"), b"%PDF");

    let mtime = FileTime::from_unix_time(1_600_000_000, 0);
    set_file_mtime(src.join("A/Adams/scan.pdf"), mtime).unwrap();

    let engine = NativeMirrorEngine::default();
    engine
        .mirror(&request(&src, &dst, &temp.path().join("log")))
        .await
        .unwrap();

    let copied = std::fs::metadata(dst.join("A/Adams/scan.pdf")).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&copied), mtime);
}

#[tokio::test]
async fn missing_source_aborts_the_caller() {
    let temp = tempdir().unwrap();
    let copier = SafeCopy::new(
        Arc::new(NativeMirrorEngine::default()),
        &copy_config(&temp.path().join("logs")),
    );

    let err = copier
        .mirror(&temp.path().join("absent"), &temp.path().join("dst"), "attachments")
        .await
        .unwrap_err();

    match err {
        MigrationError::CopyFailed { code, label, .. } => {
            assert_eq!(code, status::FATAL);
            assert_eq!(label, "attachments");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn links_are_mirrored_as_links_and_strays_purged() {
    use std::os::unix::fs::symlink;

    let temp = tempdir().unwrap();
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    let outside = temp.path().join("outside");
    create_file(&src.join("real.txt"), b"real");
    create_file(&src.join("patient.MYD"), b"patients");
    symlink("real.txt", src.join("linked_db")).unwrap();

    create_file(&outside.join("victim.txt"), b"untouched");
    std::fs::create_dir_all(&dst).unwrap();
    symlink(&outside, dst.join("stray_link")).unwrap();
    // a link standing where the source has a regular file
    symlink(outside.join("victim.txt"), dst.join("patient.MYD")).unwrap();

    let copier = SafeCopy::new(
        Arc::new(NativeMirrorEngine::default()),
        &copy_config(&temp.path().join("logs")),
    );
    let result = copier.mirror(&src, &dst, "database").await.unwrap();
    assert_eq!(result, CopyStatus::Success);

    assert!(dst.join("stray_link").symlink_metadata().is_err());
    assert_eq!(std::fs::read_link(dst.join("linked_db")).unwrap(), Path::new("real.txt"));
    assert!(!dst.join("patient.MYD").symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(std::fs::read(dst.join("patient.MYD")).unwrap(), b"patients");
    assert_eq!(std::fs::read(outside.join("victim.txt")).unwrap(), b"untouched");

    let engine = NativeMirrorEngine::default();
    let code = engine
        .mirror(&request(&src, &dst, &temp.path().join("again.log")))
        .await
        .unwrap();
    assert_eq!(code, status::NO_CHANGE);
}
