use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::Config;

use super::{CacheContents, CacheEntry, ResourceId};

/// The interval in which used cache files are touched.
///
/// `cleanup` removes files by "time to idle", so files in use need a recent `mtime`. This is
/// debounced so that not every single read writes to the file system.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// The on-disk layer of the [`CacheStore`](super::CacheStore).
///
/// Every entry is a JSON file at [`ResourceId::cache_path`] inside `cache_dir`. Files are
/// written to a temporary file in `tmp_dir` first and then atomically moved into place, so a
/// reader never observes a partially written entry.
#[derive(Debug, Clone)]
pub struct FsCache {
    pub(super) cache_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl FsCache {
    /// Creates the disk layer if a `cache_dir` is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        let (Some(cache_dir), Some(tmp_dir)) = (config.cache_dir("configs"), config.cache_dir("tmp"))
        else {
            return Ok(None);
        };
        Self::new(cache_dir, tmp_dir).map(Some)
    }

    pub fn new(cache_dir: PathBuf, tmp_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self { cache_dir, tmp_dir })
    }

    pub fn path(&self, resource_id: &ResourceId) -> PathBuf {
        self.cache_dir.join(resource_id.cache_path())
    }

    /// Reads the entry for `resource_id`, if one was persisted.
    pub fn read(&self, resource_id: &ResourceId) -> CacheContents<Option<CacheEntry>> {
        let path = self.path(resource_id);
        tracing::trace!("Trying cache file at path {}", path.display());

        let data = match catch_not_found(|| fs::read(&path))? {
            Some(data) => data,
            None => return Ok(None),
        };
        let entry: CacheEntry = serde_json::from_slice(&data)?;

        // Two ids hashing to the same path is astronomically unlikely, but cheap to rule out.
        if &entry.resource_id != resource_id {
            tracing::warn!(
                path = %path.display(),
                "Cache file belongs to `{}`, expected `{}`",
                entry.resource_id,
                resource_id,
            );
            return Ok(None);
        }

        touch_if_stale(&path);
        Ok(Some(entry))
    }

    /// Persists `entry`, replacing any previous file for the same resource.
    pub fn write(&self, entry: &CacheEntry) -> CacheContents {
        let path = self.path(&entry.resource_id);
        tracing::trace!("Writing cache file for `{}` to {}", entry.resource_id, path.display());

        let mut temp_file = NamedTempFile::new_in(&self.tmp_dir)?;
        serde_json::to_writer(temp_file.as_file_mut(), entry)?;
        persist_tempfile(temp_file, &path)?;
        Ok(())
    }

    /// Removes the file for `resource_id`, if any.
    pub fn remove(&self, resource_id: &ResourceId) -> CacheContents {
        catch_not_found(|| fs::remove_file(self.path(resource_id)))?;
        Ok(())
    }

    /// Removes all persisted entries.
    pub fn clear(&self) -> CacheContents {
        catch_not_found(|| fs::remove_dir_all(&self.cache_dir))?;
        fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

/// Updates the `mtime` of a file that is in use, at most once per [`TOUCH_EVERY`].
fn touch_if_stale(path: &Path) {
    let Ok(mtime) = path.metadata().and_then(|m| m.modified()) else {
        return;
    };
    let idle = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or_default();

    if idle > TOUCH_EVERY {
        tracing::trace!("Touching cache file {}", path.display());
        if let Err(e) = filetime::set_file_mtime(path, FileTime::now()) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to touch cache file",
            );
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // `cleanup` could remove the parent directories we are operating in concurrently, so
    // retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), "Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(path = %cache_path.display(), "Failed to create cache file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

/// Runs `f`, mapping an [`io::ErrorKind::NotFound`] error to `Ok(None)`.
pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(result) => Ok(Some(result)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
