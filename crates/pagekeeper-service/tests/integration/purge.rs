use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use pagekeeper_service::caching::purge_directory;

use crate::setup_services;

fn write_aged(path: &Path, size: usize, age: Duration) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, vec![0u8; size]).unwrap();
    let mtime = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(path, mtime).unwrap();
}

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn test_cleanup_respects_age_and_size() {
    let (services, _telemetry, cache_dir) = setup_services(|config| {
        config.caches.disk.max_unused_for = Some(24 * HOUR);
        config.caches.disk.max_bytes = 10;
    });
    let renders = cache_dir.path().join("renders");
    let downloads = cache_dir.path().join("downloads");

    write_aged(&renders.join("aa/expired"), 1, 48 * HOUR);
    write_aged(&renders.join("bb/old"), 6, 2 * HOUR);
    write_aged(&renders.join("cc/new"), 6, HOUR);
    write_aged(&downloads.join("manual.pdf"), 4, HOUR);

    services.caches.cleanup(false).unwrap();

    assert!(!renders.join("aa/expired").exists());
    assert!(!renders.join("bb/old").exists());
    assert!(renders.join("cc/new").exists());
    // directories are left alone
    assert!(renders.join("aa").is_dir());
    assert!(downloads.join("manual.pdf").exists());
}

#[test]
fn test_dry_run_keeps_files() {
    let (services, _telemetry, cache_dir) = setup_services(|config| {
        config.caches.disk.max_bytes = 1;
    });
    let file = cache_dir.path().join("renders/aa/bitmap");
    write_aged(&file, 8, HOUR);

    let result = services.caches.renders.cleanup(true).unwrap();

    assert!(file.exists());
    assert_eq!(result.files_removed, 1);
    assert_eq!(result.bytes_freed, 8);
}

#[test]
fn test_purge_is_idempotent() {
    let dir = crate::tempdir();
    for (name, age) in [("a", 3 * HOUR), ("b", 2 * HOUR), ("c", HOUR)] {
        write_aged(&dir.path().join(name), 5, age);
    }
    let now = SystemTime::now();

    let first = purge_directory(dir.path(), 10, 24 * HOUR, now);
    let second = purge_directory(dir.path(), 10, 24 * HOUR, now);

    assert_eq!(first.files_removed, 1);
    assert_eq!(first.bytes_freed, 5);
    assert_eq!(first.failures, 0);
    assert_eq!(second.files_removed, 0);
    assert_eq!(second.bytes_freed, 0);
    assert!(!dir.path().join("a").exists());
}
