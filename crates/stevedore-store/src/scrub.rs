//! Administrative consistency check over all repositories.
//!
//! Scrub verifies that blob contents still hash to their file names and
//! that every indexed manifest and its referenced blobs are present. It
//! reports findings; with `fix` it removes blobs that fail the digest
//! check. Deeper repair (index healing, orphaned-upload sweeping) is
//! deferred.

use std::fs;
use std::io;

use tracing::{info, warn};

use stevedore_types::digest::Digest;
use stevedore_types::error::Result;
use stevedore_types::oci::ImageManifest;

use crate::layout::BLOBS_DIR;
use crate::manifest::read_index;
use crate::store::ImageStore;

/// One consistency violation found by `scrub`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrubIssue {
    /// Blob content no longer hashes to the digest in its file name.
    CorruptBlob { repo: String, digest: String },
    /// An `index.json` descriptor whose manifest blob is missing.
    DanglingDescriptor { repo: String, digest: String },
    /// A manifest references a config or layer blob that does not exist.
    MissingBlob {
        repo: String,
        manifest: String,
        digest: String,
    },
}

impl ImageStore {
    /// Enumerate all repositories and report consistency violations.
    ///
    /// With `fix`, blobs whose content fails the digest check are removed
    /// (and their dedupe record released) so a re-push can replace them.
    pub fn scrub(&self, fix: bool) -> Result<Vec<ScrubIssue>> {
        let _guard = self.write_lock();

        let mut repos = Vec::new();
        let root = self.root_dir().to_path_buf();
        self.collect_repos(&root, &mut repos)?;

        let mut issues = Vec::new();
        for repo in &repos {
            self.scrub_repo(repo, fix, &mut issues)?;
        }

        info!(repos = repos.len(), issues = issues.len(), "scrub finished");
        Ok(issues)
    }

    fn scrub_repo(&self, repo: &str, fix: bool, issues: &mut Vec<ScrubIssue>) -> Result<()> {
        let dir = self.repo_dir(repo)?;

        // Every blob's content must hash to its file name.
        for alg_entry in fs::read_dir(dir.join(BLOBS_DIR))? {
            let alg_entry = alg_entry?;
            if !alg_entry.file_type()?.is_dir() {
                continue;
            }
            let alg = alg_entry.file_name().to_string_lossy().into_owned();

            for blob_entry in fs::read_dir(alg_entry.path())? {
                let blob_entry = blob_entry?;
                let name = blob_entry.file_name().to_string_lossy().into_owned();
                let digest_str = format!("{alg}:{name}");

                let Ok(claimed) = Digest::parse(&digest_str) else {
                    warn!(repo = %repo, blob = %digest_str, "scrub: skipping blob with foreign digest algorithm");
                    continue;
                };

                let actual = Digest::from_reader(fs::File::open(blob_entry.path())?)?;
                if actual == claimed {
                    continue;
                }

                warn!(repo = %repo, digest = %digest_str, actual = %actual, "scrub: blob content does not match digest");
                issues.push(ScrubIssue::CorruptBlob {
                    repo: repo.to_string(),
                    digest: digest_str,
                });
                if fix {
                    if let Some(cache) = self.cache() {
                        cache.delete_blob(&claimed, &blob_entry.path())?;
                    }
                    fs::remove_file(blob_entry.path())?;
                }
            }
        }

        // Every indexed manifest must exist and close over its blobs.
        let index = read_index(&dir)?;
        for desc in &index.manifests {
            let manifest_path = self.blob_path(repo, &desc.digest);
            match fs::metadata(&manifest_path) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    issues.push(ScrubIssue::DanglingDescriptor {
                        repo: repo.to_string(),
                        digest: desc.digest.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let body = fs::read(&manifest_path)?;
            let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&body) else {
                // Content was digest-checked above; an unparseable body is
                // a dangling descriptor from the index's point of view.
                issues.push(ScrubIssue::DanglingDescriptor {
                    repo: repo.to_string(),
                    digest: desc.digest.to_string(),
                });
                continue;
            };

            let referenced = manifest
                .config
                .iter()
                .chain(manifest.layers.iter());
            for reference in referenced {
                match fs::metadata(self.blob_path(repo, &reference.digest)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        issues.push(ScrubIssue::MissingBlob {
                            repo: repo.to_string(),
                            manifest: desc.digest.to_string(),
                            digest: reference.digest.to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(())
    }
}
