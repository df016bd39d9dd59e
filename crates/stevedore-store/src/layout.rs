//! Filesystem layout management: creating and validating the per-repository
//! directory tree. This module owns the on-disk format contract, so the
//! files it writes are byte-exact against the OCI image-layout.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use tracing::{debug, warn};

use stevedore_types::error::{Result, StoreError};
use stevedore_types::oci;

use crate::store::{ImageStore, BLOB_UPLOAD_DIR};

/// Content-addressed blob directory inside a repository.
pub(crate) const BLOBS_DIR: &str = "blobs";

/// The repository's manifest index document.
pub(crate) const INDEX_FILE: &str = "index.json";

/// Create `dir` (and missing parents) with mode 0755; existing is fine.
pub(crate) fn ensure_dir(dir: &Path) -> io::Result<()> {
    match DirBuilder::new().recursive(true).mode(0o755).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

impl ImageStore {
    /// Create an image repository under this store. Idempotent: each
    /// required entry is created only if missing, so a partially-created
    /// repository is repaired rather than left broken.
    pub fn init_repo(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock();
        self.init_repo_unlocked(name)
    }

    /// Init without taking the store lock; callers already hold it.
    pub(crate) fn init_repo_unlocked(&self, name: &str) -> Result<()> {
        let dir = self.repo_dir(name)?;

        ensure_dir(&dir.join(BLOBS_DIR))?;
        ensure_dir(&dir.join(BLOB_UPLOAD_DIR))?;

        let layout_path = dir.join(oci::IMAGE_LAYOUT_FILE);
        if !layout_path.exists() {
            let buf = serde_json::to_vec(&oci::ImageLayout::current())?;
            fs::write(&layout_path, buf)?;
        }

        let index_path = dir.join(INDEX_FILE);
        if !index_path.exists() {
            let buf = serde_json::to_vec(&oci::ImageIndex::empty())?;
            fs::write(&index_path, buf)?;
        }

        debug!(repo = %name, "initialized repository");
        Ok(())
    }

    /// Check that the repository directory is a compliant OCI layout.
    ///
    /// At minimum `blobs/`, `oci-layout` and `index.json` must exist
    /// (`.uploads` may be absent). A missing directory is `RepoNotFound`;
    /// a layout file with the wrong version is `RepoBadVersion`.
    pub fn validate_repo(&self, name: &str) -> Result<bool> {
        let dir = self.require_repo_dir(name)?;

        let mut blobs_is_dir = false;
        let mut found_layout = false;
        let mut found_index = false;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            match entry.file_name().to_str() {
                Some(BLOBS_DIR) => blobs_is_dir = entry.file_type()?.is_dir(),
                Some(oci::IMAGE_LAYOUT_FILE) => found_layout = true,
                Some(INDEX_FILE) => found_index = true,
                _ => {}
            }
        }
        if !blobs_is_dir || !found_layout || !found_index {
            return Ok(false);
        }

        let buf = fs::read(dir.join(oci::IMAGE_LAYOUT_FILE))?;
        let layout: oci::ImageLayout = serde_json::from_slice(&buf)?;
        if layout.version != oci::IMAGE_LAYOUT_VERSION {
            warn!(repo = %name, version = %layout.version, "unsupported layout version");
            return Err(StoreError::RepoBadVersion(layout.version));
        }

        Ok(true)
    }

    /// Walk the store root and return every subdirectory that validates as
    /// a repository, in lexical order.
    pub fn get_repositories(&self) -> Result<Vec<String>> {
        let _guard = self.read_lock();

        let mut repos = Vec::new();
        let root = self.root_dir().to_path_buf();
        self.collect_repos(&root, &mut repos)?;
        Ok(repos)
    }

    pub(crate) fn collect_repos(&self, dir: &Path, repos: &mut Vec<String>) -> Result<()> {
        let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(self.root_dir()) else {
                continue;
            };
            let name = rel.to_string_lossy().into_owned();
            if matches!(self.validate_repo(&name), Ok(true)) {
                repos.push(name);
            }
            // Repositories may nest, so keep descending either way.
            self.collect_repos(&path, repos)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::new_store;

    #[test]
    fn init_creates_byte_exact_layout() {
        let (store, tmp) = new_store(false, false);
        store.init_repo("library/ubuntu").unwrap();

        let dir = tmp.path().join("library/ubuntu");
        assert!(dir.join("blobs").is_dir());
        assert!(dir.join(".uploads").is_dir());
        assert_eq!(
            fs::read(dir.join("oci-layout")).unwrap(),
            br#"{"imageLayoutVersion":"1.0.0"}"#
        );
        assert_eq!(
            fs::read(dir.join("index.json")).unwrap(),
            br#"{"schemaVersion":2,"manifests":[]}"#
        );
    }

    #[test]
    fn init_is_idempotent_and_preserves_index() {
        let (store, tmp) = new_store(false, false);
        store.init_repo("repo").unwrap();

        // Scribble into index.json, then re-init: the file must survive.
        let index_path = tmp.path().join("repo/index.json");
        fs::write(&index_path, br#"{"schemaVersion":2,"manifests":[]} "#).unwrap();
        store.init_repo("repo").unwrap();
        assert!(fs::read(&index_path).unwrap().ends_with(b" "));
    }

    #[test]
    fn init_repairs_partial_repo() {
        let (store, tmp) = new_store(false, false);
        // A bare directory, as a crashed init might leave behind.
        fs::create_dir_all(tmp.path().join("partial")).unwrap();

        store.init_repo("partial").unwrap();
        assert!(store.validate_repo("partial").unwrap());
    }

    #[test]
    fn validate_missing_repo_is_not_found() {
        let (store, _tmp) = new_store(false, false);
        assert!(matches!(
            store.validate_repo("nope"),
            Err(StoreError::RepoNotFound(_))
        ));
    }

    #[test]
    fn validate_rejects_blobs_as_file() {
        let (store, tmp) = new_store(false, false);
        store.init_repo("repo").unwrap();
        let blobs = tmp.path().join("repo/blobs");
        fs::remove_dir_all(&blobs).unwrap();
        fs::write(&blobs, b"not a dir").unwrap();

        assert!(!store.validate_repo("repo").unwrap());
    }

    #[test]
    fn validate_incomplete_repo_is_false() {
        let (store, tmp) = new_store(false, false);
        store.init_repo("repo").unwrap();
        fs::remove_file(tmp.path().join("repo/index.json")).unwrap();

        assert!(!store.validate_repo("repo").unwrap());
    }

    #[test]
    fn validate_flags_version_mismatch() {
        let (store, tmp) = new_store(false, false);
        store.init_repo("repo").unwrap();
        fs::write(
            tmp.path().join("repo/oci-layout"),
            br#"{"imageLayoutVersion":"0.9.0"}"#,
        )
        .unwrap();

        assert!(matches!(
            store.validate_repo("repo"),
            Err(StoreError::RepoBadVersion(v)) if v == "0.9.0"
        ));
    }

    #[test]
    fn get_repositories_lists_nested_names_in_order() {
        let (store, tmp) = new_store(false, false);
        store.init_repo("zoo").unwrap();
        store.init_repo("a/b").unwrap();
        store.init_repo("a/b/c").unwrap();

        // A random non-repo directory is skipped.
        fs::create_dir_all(tmp.path().join("not-a-repo")).unwrap();

        let repos = store.get_repositories().unwrap();
        assert_eq!(repos, vec!["a/b", "a/b/c", "zoo"]);
    }
}
