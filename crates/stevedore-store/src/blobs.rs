//! Blob store: content-addressed placement, reads, deletes, and the
//! cross-repository dedupe placement loop.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use stevedore_types::digest::Digest;
use stevedore_types::error::{Result, StoreError};

use crate::cache::DedupeCache;
use crate::layout::BLOBS_DIR;
use crate::store::ImageStore;

impl ImageStore {
    /// Content-addressed path of a blob. Pure: no filesystem access and no
    /// name validation. Public operations validate the repository name
    /// before deriving paths.
    pub fn blob_path(&self, repo: &str, digest: &Digest) -> PathBuf {
        self.root_dir()
            .join(repo)
            .join(BLOBS_DIR)
            .join(digest.algorithm())
            .join(digest.encoded())
    }

    /// Stat a blob, returning its size.
    pub fn check_blob(&self, repo: &str, digest: &str) -> Result<u64> {
        let digest = Digest::parse(digest)?;
        self.repo_dir(repo)?;

        let path = self.blob_path(repo, &digest);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a blob for reading, returning the stream and its size.
    ///
    /// The file is opened under the store read lock but remains valid after
    /// the lock is released; the caller owns closure.
    pub fn get_blob(&self, repo: &str, digest: &str) -> Result<(fs::File, u64)> {
        let digest = Digest::parse(digest)?;
        self.repo_dir(repo)?;
        let path = self.blob_path(repo, &digest);

        let _guard = self.read_lock();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(digest.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    /// Remove a blob from the repository. With dedupe enabled, the index
    /// record is released first (conditionally, so a newer canonical path
    /// recorded by a concurrent writer survives).
    pub fn delete_blob(&self, repo: &str, digest: &str) -> Result<()> {
        let digest = Digest::parse(digest)?;
        self.repo_dir(repo)?;
        let path = self.blob_path(repo, &digest);

        match fs::metadata(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(digest.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(cache) = self.cache() {
            cache.delete_blob(&digest, &path)?;
        }

        let _guard = self.write_lock();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(repo = %repo, digest = %digest, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dedupe-aware placement: move the verified scratch file to `dst`, or
    /// hard-link it to the canonical copy recorded in the index.
    ///
    /// A record whose canonical file has vanished (typically GC'd along a
    /// different repository's path) is purged and the lookup retried. Each
    /// retry makes progress on either the index or the filesystem, so two
    /// concurrent writers cannot livelock.
    pub(crate) fn dedupe_blob(
        &self,
        cache: &DedupeCache,
        src: &Path,
        digest: &Digest,
        dst: &Path,
    ) -> Result<()> {
        loop {
            let rel = match cache.get_blob(digest) {
                Ok(rel) => rel,
                Err(StoreError::CacheMiss) => {
                    // First copy of this digest: claim it and move into place.
                    cache.put_blob(digest, dst)?;
                    fs::rename(src, dst)?;
                    debug!(digest = %digest, dst = %dst.display(), "dedupe: placed canonical blob");
                    return Ok(());
                }
                Err(e) => {
                    error!(digest = %digest, "dedupe: unable to look up blob record: {e}");
                    return Err(e);
                }
            };

            let canonical = self.root_dir().join(&rel);
            let canonical_meta = match fs::metadata(&canonical) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(digest = %digest, canonical = %canonical.display(),
                        "dedupe: canonical blob vanished, purging stale record");
                    cache.delete_blob(digest, &canonical)?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let dst_meta = match fs::metadata(dst) {
                Ok(meta) => Some(meta),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };

            let same_inode = dst_meta
                .map(|m| m.dev() == canonical_meta.dev() && m.ino() == canonical_meta.ino())
                .unwrap_or(false);
            if !same_inode {
                match fs::hard_link(&canonical, dst) {
                    Ok(()) => {
                        debug!(digest = %digest, dst = %dst.display(), "dedupe: hard-linked blob");
                    }
                    // A concurrent finalize completed first; the object with
                    // the right digest is already present.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        error!(digest = %digest, dst = %dst.display(), "dedupe: unable to hard link: {e}");
                        return Err(e.into());
                    }
                }
            }

            fs::remove_file(src)?;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::testutil::{new_store, put_blob};

    #[test]
    fn check_blob_reports_size() {
        let (store, _tmp) = new_store(false, false);
        let digest = put_blob(&store, "repo", b"hello");
        assert_eq!(store.check_blob("repo", &digest.to_string()).unwrap(), 5);
    }

    #[test]
    fn check_blob_missing_and_malformed() {
        let (store, _tmp) = new_store(false, false);
        store.init_repo("repo").unwrap();

        let absent = format!("sha256:{}", "a".repeat(64));
        assert!(matches!(
            store.check_blob("repo", &absent),
            Err(StoreError::BlobNotFound(_))
        ));
        assert!(matches!(
            store.check_blob("repo", "not-a-digest"),
            Err(StoreError::BadBlobDigest(_))
        ));
    }

    #[test]
    fn get_blob_streams_exact_content() {
        let (store, _tmp) = new_store(false, false);
        let digest = put_blob(&store, "repo", b"hello");

        let (mut reader, size) = store.get_blob("repo", &digest.to_string()).unwrap();
        assert_eq!(size, 5);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn delete_blob_removes_file() {
        let (store, _tmp) = new_store(false, false);
        let digest = put_blob(&store, "repo", b"gone");

        store.delete_blob("repo", &digest.to_string()).unwrap();
        assert!(matches!(
            store.check_blob("repo", &digest.to_string()),
            Err(StoreError::BlobNotFound(_))
        ));
        // A second delete no longer finds it.
        assert!(matches!(
            store.delete_blob("repo", &digest.to_string()),
            Err(StoreError::BlobNotFound(_))
        ));
    }

    #[test]
    fn delete_blob_rejects_malformed_digest() {
        let (store, _tmp) = new_store(false, false);
        store.init_repo("repo").unwrap();
        assert!(matches!(
            store.delete_blob("repo", "sha512:beef"),
            Err(StoreError::BadBlobDigest(_))
        ));
    }

    #[test]
    fn dedupe_links_same_digest_across_repos() {
        let (store, _tmp) = new_store(false, true);
        let digest = put_blob(&store, "repo1", b"shared payload");
        put_blob(&store, "repo2", b"shared payload");

        let meta1 = fs::metadata(store.blob_path("repo1", &digest)).unwrap();
        let meta2 = fs::metadata(store.blob_path("repo2", &digest)).unwrap();
        assert_eq!(meta1.ino(), meta2.ino());
        assert!(meta1.nlink() >= 2);
    }

    #[test]
    fn dedupe_heals_after_canonical_removed_out_of_band() {
        let (store, _tmp) = new_store(false, true);
        let digest = put_blob(&store, "repo1", b"healing payload");

        // Simulate GC removing the canonical copy behind the index's back.
        fs::remove_file(store.blob_path("repo1", &digest)).unwrap();

        // The next finalize for the digest sees the stale record, purges it
        // and places a fresh canonical copy.
        put_blob(&store, "repo2", b"healing payload");
        let (mut reader, size) = store.get_blob("repo2", &digest.to_string()).unwrap();
        assert_eq!(size, 15);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"healing payload");
    }

    #[test]
    fn delete_blob_releases_dedupe_record() {
        let (store, _tmp) = new_store(false, true);
        let digest = put_blob(&store, "repo1", b"claimed");

        store.delete_blob("repo1", &digest.to_string()).unwrap();

        // With the record released, a new upload becomes the canonical copy.
        put_blob(&store, "repo2", b"claimed");
        assert_eq!(store.check_blob("repo2", &digest.to_string()).unwrap(), 7);
    }
}
