//! Manifest and index maintenance: tag listing, manifest reads, validated
//! manifest writes with `index.json` upkeep, and manifest deletion.
//!
//! Every index mutation happens under the store write lock, so the sequence
//! of put/delete calls within a repository is a total order.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, error, info};

use stevedore_types::digest::Digest;
use stevedore_types::error::{Result, StoreError};
use stevedore_types::oci::{
    self, Descriptor, ImageIndex, ImageManifest, Platform, ANNOTATION_REF_NAME,
};

use crate::gc::GC_DELAY;
use crate::layout::{ensure_dir, BLOBS_DIR, INDEX_FILE};
use crate::store::ImageStore;

pub(crate) fn read_index(dir: &Path) -> Result<ImageIndex> {
    let buf = fs::read(dir.join(INDEX_FILE))?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Rewrite `index.json` atomically: write a temp file, then rename over.
fn write_index(dir: &Path, index: &ImageIndex) -> Result<()> {
    let buf = serde_json::to_vec(index)?;
    let tmp = dir.join(".index.json.tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, dir.join(INDEX_FILE))?;
    Ok(())
}

impl ImageStore {
    /// Tags available in the repository, in descriptor order.
    pub fn get_image_tags(&self, repo: &str) -> Result<Vec<String>> {
        let dir = self.require_repo_dir(repo)?;

        let _guard = self.read_lock();
        let index = match read_index(&dir) {
            Ok(index) => index,
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::RepoNotFound(repo.to_string()));
            }
            Err(e) => return Err(e),
        };

        Ok(index
            .manifests
            .iter()
            .filter_map(|m| m.tag().map(str::to_string))
            .collect())
    }

    /// Fetch a manifest by reference, either a digest string or a tag.
    /// On a tag-and-digest collision the exact digest match wins.
    ///
    /// Returns `(body, digest, media type)`.
    pub fn get_image_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, String, String)> {
        let dir = self.require_repo_dir(repo)?;

        let _guard = self.read_lock();
        let index = match read_index(&dir) {
            Ok(index) => index,
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::RepoNotFound(repo.to_string()));
            }
            Err(e) => return Err(e),
        };

        let desc = index
            .manifests
            .iter()
            .find(|m| m.digest.to_string() == reference)
            .or_else(|| index.manifests.iter().find(|m| m.tag() == Some(reference)))
            .ok_or_else(|| StoreError::ManifestNotFound(reference.to_string()))?;

        let path = self.blob_path(repo, &desc.digest);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                error!(repo = %repo, blob = %path.display(), "manifest blob missing");
                return Err(StoreError::ManifestNotFound(reference.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        // Sanity check: the stored body must still parse as a manifest.
        let _: ImageManifest = serde_json::from_slice(&buf)?;

        Ok((buf, desc.digest.to_string(), desc.media_type.clone()))
    }

    /// Validate and store a manifest, updating `index.json`.
    ///
    /// The body must be an OCI image manifest with `schemaVersion` 2 whose
    /// layer digests all resolve to existing blobs in this repository. If
    /// `reference` parses as a digest it must equal the digest of `body`;
    /// otherwise it is recorded as the descriptor's tag annotation.
    pub fn put_image_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        body: &[u8],
    ) -> Result<String> {
        let _guard = self.write_lock();
        self.init_repo_unlocked(repo)?;
        let dir = self.repo_dir(repo)?;

        if media_type != oci::MEDIA_TYPE_IMAGE_MANIFEST {
            error!(repo = %repo, media_type = %media_type, "bad manifest media type");
            return Err(StoreError::BadManifest(format!(
                "unexpected media type '{media_type}'"
            )));
        }
        if body.is_empty() {
            return Err(StoreError::BadManifest("empty manifest body".to_string()));
        }

        let manifest: ImageManifest = serde_json::from_slice(body)
            .map_err(|e| StoreError::BadManifest(format!("invalid JSON: {e}")))?;
        if manifest.schema_version != oci::SCHEMA_VERSION {
            return Err(StoreError::BadManifest(format!(
                "unsupported schemaVersion {}",
                manifest.schema_version
            )));
        }

        for layer in &manifest.layers {
            let blob = self.blob_path(repo, &layer.digest);
            match fs::metadata(&blob) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    error!(repo = %repo, layer = %layer.digest, "manifest references missing layer blob");
                    return Err(StoreError::BlobNotFound(layer.digest.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let computed = Digest::from_bytes(body);
        let ref_digest = Digest::parse(reference).ok();
        if let Some(claimed) = &ref_digest {
            if *claimed != computed {
                error!(repo = %repo, expected = %claimed, actual = %computed,
                    "manifest digest does not match digest reference");
                return Err(StoreError::BadManifest(
                    "reference digest does not match manifest body".to_string(),
                ));
            }
        }

        let mut index = read_index(&dir)?;

        // A digest reference that is already indexed: nothing changed.
        if ref_digest.is_some() && index.manifests.iter().any(|m| m.digest == computed) {
            debug!(repo = %repo, digest = %computed, "manifest already indexed");
            return Ok(computed.to_string());
        }

        let mut replaced_tag = false;
        if ref_digest.is_none() {
            if let Some(existing) = index
                .manifests
                .iter_mut()
                .find(|m| m.tag() == Some(reference))
            {
                if existing.digest == computed {
                    // Same tag, same content: don't touch the index.
                    debug!(repo = %repo, tag = %reference, "manifest already indexed under tag");
                    return Ok(computed.to_string());
                }
                // Same tag, new content: update the descriptor in place so
                // the sequence position is preserved.
                info!(repo = %repo, tag = %reference,
                    old_digest = %existing.digest, new_digest = %computed,
                    "updating existing tag with new manifest contents");
                existing.digest = computed.clone();
                existing.size = body.len() as u64;
                replaced_tag = true;
            }
        }

        if !replaced_tag {
            let annotations = ref_digest.is_none().then(|| {
                let mut map = BTreeMap::new();
                map.insert(ANNOTATION_REF_NAME.to_string(), reference.to_string());
                map
            });
            index.manifests.push(Descriptor {
                media_type: media_type.to_string(),
                digest: computed.clone(),
                size: body.len() as u64,
                platform: Some(Platform::linux_amd64()),
                annotations,
            });
        }

        // Write the manifest body as a blob at its digest, then flip the
        // index over to the new contents.
        let alg_dir = dir.join(BLOBS_DIR).join(computed.algorithm());
        ensure_dir(&alg_dir)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(alg_dir.join(computed.encoded()))?;
        file.write_all(body)?;
        drop(file);

        write_index(&dir, &index)?;

        if self.gc_enabled() {
            self.gc_repo_unlocked(repo, GC_DELAY)?;
        }

        debug!(repo = %repo, digest = %computed, "stored manifest");
        Ok(computed.to_string())
    }

    /// Delete a manifest. `reference` must be a digest; tag-only deletes
    /// are not supported.
    pub fn delete_image_manifest(&self, repo: &str, reference: &str) -> Result<()> {
        let dir = self.require_repo_dir(repo)?;

        let _guard = self.write_lock();

        let digest = Digest::parse(reference).map_err(|_| {
            StoreError::BadManifest("delete requires a digest reference".to_string())
        })?;

        let mut index = read_index(&dir)?;
        let before = index.manifests.len();
        index.manifests.retain(|m| m.digest != digest);
        if index.manifests.len() == before {
            return Err(StoreError::ManifestNotFound(reference.to_string()));
        }

        write_index(&dir, &index)?;

        if self.gc_enabled() {
            self.gc_repo_unlocked(repo, GC_DELAY)?;
        }

        // The descriptor is gone, so a leftover body is unreachable anyway.
        let _ = fs::remove_file(self.blob_path(repo, &digest));

        debug!(repo = %repo, digest = %digest, "deleted manifest");
        Ok(())
    }
}
