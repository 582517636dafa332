use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};

use crate::config::{Config, DiskCacheConfig};
use crate::utils::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// This will clean up all cache directories based on the configured limits.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    Caches::from_config(&config).cleanup(dry_run)
}

/// The outcome of a single purge pass over a directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeResult {
    /// The total size of all removed files.
    pub bytes_freed: u64,
    /// The number of removed files.
    pub files_removed: usize,
    /// The number of files that could not be removed.
    pub failures: usize,
    /// The number of files left in the directory.
    pub retained_files: usize,
    /// The total size of all files left in the directory.
    pub retained_bytes: u64,
}

/// Size and age limits applied to a directory of cache files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryBudget {
    pub max_bytes: u64,
    /// `None` disables the age limit.
    pub max_age: Option<Duration>,
}

impl From<DiskCacheConfig> for DirectoryBudget {
    fn from(config: DiskCacheConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            max_age: config.max_unused_for,
        }
    }
}

/// Removes files from `directory` so that none is older than `max_age` and all of them together
/// are at most `max_bytes` large.
///
/// Files older than `max_age` are removed unconditionally. If the survivors are still too large,
/// the least recently modified ones are removed until the rest fits. Removal failures are logged
/// and counted but never returned.
pub fn purge_directory(
    directory: &Path,
    max_bytes: u64,
    max_age: Duration,
    now: SystemTime,
) -> PurgeResult {
    DirectoryBudget {
        max_bytes,
        max_age: Some(max_age),
    }
    .purge(directory, now)
}

#[derive(Debug)]
struct ScannedFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

enum Removal {
    Removed,
    /// The file was gone or changed since it was scanned.
    Skipped,
    Failed,
}

impl DirectoryBudget {
    /// Purges `directory` as described in [`purge_directory`].
    pub fn purge(&self, directory: &Path, now: SystemTime) -> PurgeResult {
        self.purge_inner(directory, now, false)
    }

    fn purge_inner(&self, directory: &Path, now: SystemTime, dry_run: bool) -> PurgeResult {
        let mut result = PurgeResult::default();

        let files = match catch_not_found(|| scan_directory(directory, &mut result)) {
            Ok(Some(files)) => files,
            Ok(None) => {
                tracing::debug!("Directory not found: `{}`", directory.display());
                return result;
            }
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", directory.display().to_string().into()),
                    || tracing::error!(error = &e as &dyn std::error::Error, "Failed to scan cache directory"),
                );
                result.failures += 1;
                return result;
            }
        };

        // Age pass. Failed removals still occupy their bytes, they count towards the budget
        // below but are not tried again.
        let mut survivors = Vec::with_capacity(files.len());
        let mut stuck_bytes = 0;
        for file in files {
            let age = now.duration_since(file.modified).unwrap_or_default();
            if !self.max_age.is_some_and(|max_age| age > max_age) {
                survivors.push(file);
                continue;
            }
            match remove_scanned(&file, dry_run) {
                Removal::Removed => {
                    result.bytes_freed += file.size;
                    result.files_removed += 1;
                }
                Removal::Skipped => {}
                Removal::Failed => {
                    result.failures += 1;
                    result.retained_files += 1;
                    stuck_bytes += file.size;
                }
            }
        }

        // Size pass, least recently modified first.
        survivors.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        let mut total = stuck_bytes + survivors.iter().map(|file| file.size).sum::<u64>();
        for file in survivors {
            if total > self.max_bytes {
                match remove_scanned(&file, dry_run) {
                    Removal::Removed => {
                        total -= file.size;
                        result.bytes_freed += file.size;
                        result.files_removed += 1;
                        continue;
                    }
                    Removal::Skipped => {
                        total -= file.size;
                        continue;
                    }
                    Removal::Failed => result.failures += 1,
                }
            }
            result.retained_files += 1;
        }
        result.retained_bytes = total;

        result
    }
}

/// Collects every regular file below `directory`.
///
/// Directories are descended into but never removed, cache writers may be about to put a file
/// into them. Only failing to read `directory` itself is an error. Entries below it that cannot
/// be read are logged, counted in `result` and left alone.
fn scan_directory(directory: &Path, result: &mut PurgeResult) -> io::Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    let mut pending = Vec::new();
    scan_entries(fs::read_dir(directory)?, &mut files, &mut pending, result);

    while let Some(dir) = pending.pop() {
        match catch_not_found(|| fs::read_dir(&dir)) {
            Ok(Some(entries)) => scan_entries(entries, &mut files, &mut pending, result),
            Ok(None) => {}
            Err(e) => scan_failed(&dir, e, result),
        }
    }

    Ok(files)
}

fn scan_entries(
    entries: fs::ReadDir,
    files: &mut Vec<ScannedFile>,
    pending: &mut Vec<PathBuf>,
    result: &mut PurgeResult,
) {
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "Failed to read cache directory entry");
                result.failures += 1;
                continue;
            }
        };
        let path = entry.path();
        let metadata = match catch_not_found(|| entry.metadata()) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => continue,
            Err(e) => {
                scan_failed(&path, e, result);
                continue;
            }
        };
        if metadata.is_dir() {
            pending.push(path);
        } else if metadata.is_file() {
            match metadata.modified() {
                Ok(modified) => files.push(ScannedFile {
                    path,
                    modified,
                    size: metadata.len(),
                }),
                Err(e) => scan_failed(&path, e, result),
            }
        }
    }
}

fn scan_failed(path: &Path, e: io::Error, result: &mut PurgeResult) {
    tracing::warn!(
        error = &e as &dyn std::error::Error,
        "Failed to scan `{}`, leaving it alone",
        path.display()
    );
    result.failures += 1;
}

fn is_unchanged(file: &ScannedFile, metadata: &Metadata) -> bool {
    metadata.len() == file.size && metadata.modified().ok() == Some(file.modified)
}

fn remove_scanned(file: &ScannedFile, dry_run: bool) -> Removal {
    // A file that was replaced or touched after the scan counts as freshly written.
    match catch_not_found(|| fs::symlink_metadata(&file.path)) {
        Ok(Some(metadata)) if is_unchanged(file, &metadata) => {}
        Ok(_) => {
            tracing::debug!("Skipping changed file `{}`", file.path.display());
            return Removal::Skipped;
        }
        Err(e) => return removal_failed(&file.path, e),
    }

    tracing::debug!("Removing file `{}`", file.path.display());
    if dry_run {
        return Removal::Removed;
    }
    match catch_not_found(|| fs::remove_file(&file.path)) {
        Ok(Some(())) => Removal::Removed,
        Ok(None) => Removal::Skipped,
        Err(e) => removal_failed(&file.path, e),
    }
}

fn removal_failed(path: &Path, e: io::Error) -> Removal {
    sentry::with_scope(
        |scope| scope.set_extra("path", path.display().to_string().into()),
        || tracing::error!(error = &e as &dyn std::error::Error, "Failed to clean cache file"),
    );
    Removal::Failed
}

/// An on-disk cache directory together with its limits.
#[derive(Debug, Clone)]
pub struct CacheDir {
    name: &'static str,
    path: Option<PathBuf>,
    budget: DirectoryBudget,
}

impl CacheDir {
    pub fn new(name: &'static str, path: Option<PathBuf>, budget: DirectoryBudget) -> Self {
        Self { name, path, budget }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The directory, or `None` if caching to disk is disabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn budget(&self) -> DirectoryBudget {
        self.budget
    }

    /// Cleans up this directory based on its limits.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<PurgeResult> {
        tracing::info!("Cleaning up `{}` cache", self.name);
        let cache_dir = self.path.as_ref().ok_or_else(|| {
            anyhow!("no caching configured! Did you provide a path to your config file?")
        })?;

        let stats = self
            .budget
            .purge_inner(cache_dir, SystemTime::now(), dry_run);

        tracing::info!("Cleaning up `{}` complete", self.name);
        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.files_removed,
            stats.bytes_freed
        );
        if stats.failures > 0 {
            tracing::warn!("Failed to remove {} files", stats.failures);
        }

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => self.name);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => self.name);
        metric!(counter("caches.size.files_removed") += stats.files_removed as i64, "cache" => self.name);
        metric!(counter("caches.size.bytes_removed") += stats.bytes_freed as i64, "cache" => self.name);

        Ok(stats)
    }
}

/// All on-disk cache directories.
#[derive(Debug, Clone)]
pub struct Caches {
    /// Bitmaps mirrored to disk while degraded mode is active.
    pub renders: CacheDir,
    /// Documents fetched from remote origins.
    pub downloads: CacheDir,
}

impl Caches {
    pub fn from_config(config: &Config) -> Self {
        let budget = DirectoryBudget::from(config.caches.disk);
        Self {
            renders: CacheDir::new("renders", config.cache_dir("renders"), budget),
            downloads: CacheDir::new("downloads", config.cache_dir("downloads"), budget),
        }
    }

    /// Clear the temporary files.
    ///
    /// This is done on startup to avoid leaving temporary files which survive a hard crash.
    pub fn clear_tmp(&self, config: &Config) -> io::Result<()> {
        if let Some(ref tmp) = config.cache_dir("tmp") {
            if tmp.exists() {
                fs::remove_dir_all(tmp)?;
            }
            fs::create_dir_all(tmp)?;
        }
        Ok(())
    }

    /// Cleans up all cache directories.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        // Destructure so we do not accidentally forget to cleanup one of our members.
        let Self { renders, downloads } = self;

        // Collect results so we can fail the entire function. But we do not want to early
        // return since we should at least attempt to clean up all caches.
        let results: Vec<_> = [renders, downloads]
            .into_iter()
            .map(|c| c.cleanup(dry_run))
            .collect();

        let mut first_error = None;
        for result in results {
            if let Err(err) = result {
                let stderr: &dyn std::error::Error = &*err;
                tracing::error!(stderr, "Failed to cleanup cache");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
