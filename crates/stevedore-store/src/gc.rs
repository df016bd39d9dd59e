//! Garbage collection: removes blobs unreachable from any manifest in the
//! repository's `index.json`, gated by a grace delay so in-flight uploads
//! (placed but not yet referenced) are never swept.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::time::Duration;

use tracing::{debug, info, warn};

use stevedore_types::error::Result;
use stevedore_types::oci::ImageManifest;

use crate::layout::BLOBS_DIR;
use crate::manifest::read_index;
use crate::store::ImageStore;

/// Grace delay protecting freshly-written blobs from collection.
pub(crate) const GC_DELAY: Duration = Duration::from_secs(60 * 60);

impl ImageStore {
    /// Sweep one repository. Called with the store write lock already held
    /// by the index mutation that triggered it.
    ///
    /// The dedupe index is deliberately left alone: a record whose canonical
    /// file was collected here is detected and healed lazily by the next
    /// placement of that digest.
    pub(crate) fn gc_repo_unlocked(&self, repo: &str, grace: Duration) -> Result<()> {
        let dir = self.repo_dir(repo)?;
        let index = read_index(&dir)?;

        // Reachability closure: every indexed manifest, its config and its
        // layers.
        let mut reachable: HashSet<String> = HashSet::new();
        for desc in &index.manifests {
            reachable.insert(desc.digest.to_string());

            let body = match fs::read(self.blob_path(repo, &desc.digest)) {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(repo = %repo, digest = %desc.digest, "gc: indexed manifest blob missing");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let manifest: ImageManifest = match serde_json::from_slice(&body) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(repo = %repo, digest = %desc.digest, "gc: unparseable manifest body: {e}");
                    continue;
                }
            };

            if let Some(config) = &manifest.config {
                reachable.insert(config.digest.to_string());
            }
            for layer in &manifest.layers {
                reachable.insert(layer.digest.to_string());
            }
        }

        let blobs_dir = dir.join(BLOBS_DIR);
        let algorithms = match fs::read_dir(&blobs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for alg_entry in algorithms {
            let alg_entry = alg_entry?;
            if !alg_entry.file_type()?.is_dir() {
                continue;
            }
            let alg = alg_entry.file_name().to_string_lossy().into_owned();

            for blob_entry in fs::read_dir(alg_entry.path())? {
                let blob_entry = blob_entry?;
                let digest = format!("{alg}:{}", blob_entry.file_name().to_string_lossy());
                if reachable.contains(&digest) {
                    continue;
                }

                let meta = blob_entry.metadata()?;
                match meta.modified()?.elapsed() {
                    Ok(age) if age >= grace => {
                        info!(repo = %repo, digest = %digest, "gc: removing unreferenced blob");
                        fs::remove_file(blob_entry.path())?;
                    }
                    // Inside the grace window (or an mtime in the future):
                    // likely an upload racing toward a manifest, keep it.
                    _ => {
                        debug!(repo = %repo, digest = %digest, "gc: unreferenced blob inside grace window");
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stevedore_types::digest::Digest;
    use stevedore_types::oci;

    use crate::testutil::{manifest_body, new_store, put_blob};

    #[test]
    fn gc_removes_only_unreachable_blobs() {
        let (store, _tmp) = new_store(false, false);
        let kept = put_blob(&store, "repo", b"referenced layer");
        let doomed = put_blob(&store, "repo", b"orphan layer");

        let body = manifest_body(&[&kept]);
        let manifest_digest = store
            .put_image_manifest("repo", "latest", oci::MEDIA_TYPE_IMAGE_MANIFEST, &body)
            .unwrap();

        // Zero grace: everything unreferenced goes immediately.
        store.gc_repo_unlocked("repo", Duration::ZERO).unwrap();

        assert!(store.check_blob("repo", &kept.to_string()).is_ok());
        assert!(store.check_blob("repo", &manifest_digest).is_ok());
        assert!(store.check_blob("repo", &doomed.to_string()).is_err());
    }

    #[test]
    fn gc_grace_protects_young_blobs() {
        let (store, _tmp) = new_store(false, false);
        store.init_repo("repo").unwrap();
        let orphan = put_blob(&store, "repo", b"just uploaded");

        // The default one-hour grace: a blob written moments ago survives
        // even though nothing references it.
        store
            .gc_repo_unlocked("repo", super::GC_DELAY)
            .unwrap();
        assert!(store.check_blob("repo", &orphan.to_string()).is_ok());
    }

    #[test]
    fn gc_keeps_config_blob_of_indexed_manifest() {
        let (store, _tmp) = new_store(false, false);
        let config = put_blob(&store, "repo", b"{}");
        let layer = put_blob(&store, "repo", b"layer bytes");

        let body = format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"{config}","size":2}},"layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar","digest":"{layer}","size":11}}]}}"#
        )
        .into_bytes();
        store
            .put_image_manifest("repo", "latest", oci::MEDIA_TYPE_IMAGE_MANIFEST, &body)
            .unwrap();

        store.gc_repo_unlocked("repo", Duration::ZERO).unwrap();

        assert!(store.check_blob("repo", &config.to_string()).is_ok());
        assert!(store.check_blob("repo", &layer.to_string()).is_ok());
    }

    #[test]
    fn gc_runs_after_manifest_delete_when_enabled() {
        let (store, _tmp) = new_store(true, false);
        let layer = put_blob(&store, "repo", b"layer");
        let body = manifest_body(&[&layer]);
        let digest = store
            .put_image_manifest("repo", "latest", oci::MEDIA_TYPE_IMAGE_MANIFEST, &body)
            .unwrap();

        // Young blobs sit inside the grace window, so the triggered sweep
        // must leave the now-unreferenced layer alone.
        store.delete_image_manifest("repo", &digest).unwrap();
        assert!(store.check_blob("repo", &layer.to_string()).is_ok());
    }

    #[test]
    fn gc_tolerates_missing_manifest_blob() {
        let (store, _tmp) = new_store(false, false);
        let layer = put_blob(&store, "repo", b"layer");
        let body = manifest_body(&[&layer]);
        let digest = store
            .put_image_manifest("repo", "latest", oci::MEDIA_TYPE_IMAGE_MANIFEST, &body)
            .unwrap();

        // Remove the manifest blob behind the index's back.
        std::fs::remove_file(store.blob_path("repo", &Digest::parse(&digest).unwrap())).unwrap();

        // The walker logs and keeps going rather than failing the mutation
        // that triggered it.
        store
            .gc_repo_unlocked("repo", Duration::ZERO)
            .unwrap();
    }
}
