//! Upload sessions: resumable chunked blob uploads into per-repository
//! scratch files, digest verification on finalize, and placement handoff to
//! the blob store.
//!
//! Body writes deliberately happen outside the store lock, since streaming
//! a large body under the write lock would serialize all upload traffic.
//! Only the repository-ensure step and the final placement are locked.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::{debug, error};
use uuid::Uuid;

use stevedore_types::digest::{Digest, Digester};
use stevedore_types::error::{Result, StoreError};

use crate::layout::{ensure_dir, BLOBS_DIR};
use crate::store::{ImageStore, BLOB_UPLOAD_DIR};

/// Read-buffer size for streaming bodies to disk.
const COPY_BUF_SIZE: usize = 256 * 1024;

impl ImageStore {
    /// Scratch file path for an upload in this store.
    pub(crate) fn upload_path(&self, repo: &str, uuid: &str) -> Result<PathBuf> {
        Ok(self.repo_dir(repo)?.join(BLOB_UPLOAD_DIR).join(uuid))
    }

    /// Start a new upload: ensures the repository exists, creates an empty
    /// scratch file and returns its UUID.
    pub fn new_blob_upload(&self, repo: &str) -> Result<String> {
        {
            let _guard = self.write_lock();
            self.init_repo_unlocked(repo)?;
        }

        let uuid = Uuid::new_v4().to_string();
        let path = self.upload_path(repo, &uuid)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;

        debug!(repo = %repo, uuid = %uuid, "opened blob upload");
        Ok(uuid)
    }

    /// Current size of an upload's scratch file.
    pub fn blob_upload_size(&self, repo: &str, uuid: &str) -> Result<u64> {
        let path = self.upload_path(repo, uuid)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Append one chunk at an explicit range. `from` must equal the current
    /// scratch size, otherwise `BadUploadRange` tells the client where to
    /// resume. Returns the number of bytes written.
    pub fn put_blob_chunk(
        &self,
        repo: &str,
        uuid: &str,
        from: u64,
        to: u64,
        body: impl Read,
    ) -> Result<u64> {
        {
            let _guard = self.write_lock();
            self.init_repo_unlocked(repo)?;
        }

        let path = self.upload_path(repo, uuid)?;
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::UploadNotFound(uuid.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if from != size {
            error!(repo = %repo, uuid = %uuid, from, size, "invalid range start for blob upload");
            return Err(StoreError::BadUploadRange { offset: from, size });
        }

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(from))?;
        let written = copy_body(body, &mut file)?;

        debug!(repo = %repo, uuid = %uuid, from, to, written, "wrote blob chunk");
        Ok(written)
    }

    /// Append a body at the current EOF with no range check (whole-blob
    /// uploads without range headers). Returns the number of bytes written.
    pub fn put_blob_chunk_streamed(&self, repo: &str, uuid: &str, body: impl Read) -> Result<u64> {
        {
            let _guard = self.write_lock();
            self.init_repo_unlocked(repo)?;
        }

        let path = self.upload_path(repo, uuid)?;
        match fs::metadata(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::UploadNotFound(uuid.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        let written = copy_body(body, &mut file)?;

        debug!(repo = %repo, uuid = %uuid, written, "wrote streamed blob chunk");
        Ok(written)
    }

    /// Verify the scratch file against `digest` and move it to its
    /// content-addressed location.
    ///
    /// The file is rehashed from scratch; no running hash is trusted. On a
    /// mismatch the scratch file stays in place so the client can retry or
    /// cancel.
    pub fn finish_blob_upload(&self, repo: &str, uuid: &str, digest: &str) -> Result<()> {
        let expected = Digest::parse(digest)?;

        let src = self.upload_path(repo, uuid)?;
        let file = match fs::File::open(&src) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::UploadNotFound(uuid.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = Digest::from_reader(file)?;
        if actual != expected {
            error!(repo = %repo, uuid = %uuid, expected = %expected, actual = %actual,
                "upload digest does not match expected digest");
            return Err(StoreError::BadBlobDigest(digest.to_string()));
        }

        let _guard = self.write_lock();
        self.place_blob(repo, &src, &expected)?;

        debug!(repo = %repo, digest = %expected, "finished blob upload");
        Ok(())
    }

    /// One-call upload: stream the whole body through a digest calculator
    /// into a fresh scratch file, then place it. Returns the upload UUID and
    /// the number of bytes written.
    pub fn full_blob_upload(
        &self,
        repo: &str,
        mut body: impl Read,
        digest: &str,
    ) -> Result<(String, u64)> {
        {
            let _guard = self.write_lock();
            self.init_repo_unlocked(repo)?;
        }

        let expected = Digest::parse(digest)?;
        let uuid = Uuid::new_v4().to_string();
        let src = self.upload_path(repo, &uuid)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&src)?;

        let mut digester = Digester::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            file.write_all(&buf[..n])?;
            written += n as u64;
        }
        drop(file);

        let actual = digester.finalize();
        if actual != expected {
            error!(repo = %repo, expected = %expected, actual = %actual,
                "full upload digest does not match expected digest");
            return Err(StoreError::BadBlobDigest(digest.to_string()));
        }

        let _guard = self.write_lock();
        self.place_blob(repo, &src, &expected)?;

        debug!(repo = %repo, digest = %expected, written, "finished full blob upload");
        Ok((uuid, written))
    }

    /// Cancel an upload in progress. A scratch file that is already gone is
    /// not an error the caller needs to distinguish.
    pub fn delete_blob_upload(&self, repo: &str, uuid: &str) -> Result<()> {
        let path = self.upload_path(repo, uuid)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Placement step shared by finalize and full upload. Must be called
    /// with the store write lock held.
    fn place_blob(&self, repo: &str, src: &std::path::Path, digest: &Digest) -> Result<()> {
        let dir = self.repo_dir(repo)?;
        let alg_dir = dir.join(BLOBS_DIR).join(digest.algorithm());
        ensure_dir(&alg_dir)?;
        let dst = alg_dir.join(digest.encoded());

        if let Some(cache) = self.cache() {
            self.dedupe_blob(cache, src, digest, &dst)
        } else {
            fs::rename(src, &dst)?;
            Ok(())
        }
    }
}

fn copy_body(mut body: impl Read, file: &mut fs::File) -> Result<u64> {
    let mut written: u64 = 0;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = body.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        written += n as u64;
    }
    Ok(written)
}
