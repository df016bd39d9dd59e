use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

use stevedore_types::error::{Result, StoreError};

use crate::cache::DedupeCache;

/// Per-repository scratch directory for in-progress uploads. Not part of the
/// OCI layout; readers of the tree skip it.
pub const BLOB_UPLOAD_DIR: &str = ".uploads";

/// File name of the dedupe index database under the store root.
pub(crate) const CACHE_DB_NAME: &str = "cache";

/// The image store: one instance per root directory.
///
/// All repositories live under `root`. A single store-wide reader-writer
/// lock serializes coarse-grained operations; large body writes happen
/// outside it (see the upload module).
pub struct ImageStore {
    root: PathBuf,
    lock: RwLock<()>,
    gc: bool,
    dedupe: bool,
    cache: Option<DedupeCache>,
}

impl ImageStore {
    /// Open a store rooted at `root`, creating the root directory (mode
    /// 0700) if it does not exist.
    ///
    /// Failure to create the root, or to open the dedupe index when `dedupe`
    /// is enabled, is fatal: no usable handle is returned.
    pub fn new(root: impl AsRef<Path>, gc: bool, dedupe: bool) -> Result<Self> {
        let root = root.as_ref();

        if !root.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(root)
                .map_err(|e| {
                    error!(root = %root.display(), "unable to create store root: {e}");
                    StoreError::Io(e)
                })?;
        }
        // Canonicalize so dedupe records and symlinked roots resolve the
        // same paths across reopens.
        let root = std::fs::canonicalize(root)?;

        let cache = if dedupe {
            Some(DedupeCache::open(&root, CACHE_DB_NAME)?)
        } else {
            None
        };

        Ok(Self {
            root,
            lock: RwLock::new(()),
            gc,
            dedupe,
            cache,
        })
    }

    /// Absolute root directory of the store.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Whether garbage collection runs after index mutations.
    pub fn gc_enabled(&self) -> bool {
        self.gc
    }

    /// Whether cross-repository dedupe is enabled.
    pub fn dedupe_enabled(&self) -> bool {
        self.dedupe
    }

    pub(crate) fn cache(&self) -> Option<&DedupeCache> {
        self.cache.as_ref()
    }

    // A poisoned lock only means another caller panicked while holding it;
    // the on-disk state is still consistent, so recover the guard.

    pub(crate) fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve a repository name to its directory, rejecting names that
    /// could escape the store root.
    pub(crate) fn repo_dir(&self, name: &str) -> Result<PathBuf> {
        validate_repo_name(name)?;
        Ok(self.root.join(name))
    }

    /// Resolve a repository name and require its directory to exist. Only a
    /// missing (or non-directory) path maps to `RepoNotFound`; any other
    /// stat failure surfaces as it is.
    pub(crate) fn require_repo_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.repo_dir(name)?;
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StoreError::RepoNotFound(name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::RepoNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Repository names are relative path segment sequences (slashes allowed).
/// Anything that could resolve outside the root is treated as not-a-repo.
fn validate_repo_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') || name.contains('\\') {
        return Err(StoreError::RepoNotFound(name.to_string()));
    }
    for component in Path::new(name).components() {
        if component == Component::ParentDir {
            return Err(StoreError::RepoNotFound(name.to_string()));
        }
    }
    Ok(())
}
