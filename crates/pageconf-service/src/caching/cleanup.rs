use std::fs::{read_dir, remove_dir, remove_file};
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};

use crate::config::Config;

use super::FsCache;
use super::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// Removes cached configurations that have not been used for `caches.max_unused_for`.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    let fs = FsCache::from_config(&config)?.ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;

    if let Some(tmp) = config.cache_dir("tmp") {
        // leftovers of writes interrupted by a crash
        if !dry_run {
            catch_not_found(|| std::fs::remove_dir_all(&tmp))?;
            std::fs::create_dir_all(&tmp)?;
        }
    }

    fs.cleanup(config.caches.max_unused_for, dry_run)?;
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl FsCache {
    /// Removes files that have not been read or written for `max_unused_for`, along with
    /// directories left empty.
    ///
    /// With `max_unused_for` set to `None` nothing expires and only statistics are gathered.
    pub fn cleanup(&self, max_unused_for: Option<Duration>, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up config cache in `{}`", self.cache_dir.display());

        let mut stats = CleanupStats::default();
        let cleaner = Cleaner {
            max_unused_for,
            now: SystemTime::now(),
            dry_run,
        };
        cleaner.cleanup_directory_recursive(&self.cache_dir, &mut stats)?;

        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("cache.size.files") = stats.retained_files as u64);
        metric!(gauge("cache.size.bytes") = stats.retained_bytes);
        metric!(counter("cache.size.files_removed") += stats.removed_files as i64);
        metric!(counter("cache.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }
}

struct Cleaner {
    max_unused_for: Option<Duration>,
    now: SystemTime,
    dry_run: bool,
}

impl Cleaner {
    /// Returns `true` if `directory` is left empty.
    fn cleanup_directory_recursive(&self, directory: &Path, stats: &mut CleanupStats) -> Result<bool> {
        let Some(entries) = catch_not_found(|| read_dir(directory))? else {
            tracing::warn!("Directory not found: `{}`", directory.display());
            return Ok(true);
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !self.dry_run {
                        if let Err(e) = remove_dir(&path) {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to clean cache directory: {:?}", e),
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats) {
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Returns `true` if the file at `path` was removed.
    fn try_cleanup_path(&self, path: &Path, stats: &mut CleanupStats) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        let idle = self
            .now
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        let expired = self.max_unused_for.is_some_and(|max| idle > max);

        if expired {
            tracing::debug!("Removing file `{}`", path.display());
            if !self.dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }
}
