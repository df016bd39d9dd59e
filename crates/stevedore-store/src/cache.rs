//! Persistent dedupe index: digest → canonical on-disk location.
//!
//! One record per digest, stored root-relative so records survive a store
//! relocation. Backed by a single redb database file under the store root;
//! redb serializes writers internally, so callers never hold the store lock
//! around index operations.

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use stevedore_types::digest::Digest;
use stevedore_types::error::{Result, StoreError};

const DIGESTS: TableDefinition<&str, &str> = TableDefinition::new("digests");

/// Handle to the dedupe index, opened once per store.
pub struct DedupeCache {
    db: Database,
    root: PathBuf,
}

impl DedupeCache {
    /// Open (creating if necessary) the index database file `root/<name>`.
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        let db = Database::create(root.join(name))?;
        Ok(Self {
            db,
            root: root.to_path_buf(),
        })
    }

    /// Look up the canonical root-relative path recorded for `digest`.
    /// Not-present is `CacheMiss`.
    pub fn get_blob(&self, digest: &Digest) -> Result<String> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(DIGESTS) {
            Ok(table) => table,
            // No writes have happened yet, so no table. Same as a miss.
            Err(redb::TableError::TableDoesNotExist(_)) => return Err(StoreError::CacheMiss),
            Err(e) => return Err(e.into()),
        };
        match table.get(digest.to_string().as_str())? {
            Some(guard) => Ok(guard.value().to_string()),
            None => Err(StoreError::CacheMiss),
        }
    }

    /// Record `path` as the canonical location of `digest`. Last writer wins.
    pub fn put_blob(&self, digest: &Digest, path: &Path) -> Result<()> {
        let rel = self.relative(path);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DIGESTS)?;
            table.insert(digest.to_string().as_str(), rel.as_str())?;
        }
        txn.commit()?;
        debug!(digest = %digest, path = %rel, "dedupe: recorded canonical blob");
        Ok(())
    }

    /// Remove the record for `digest`, but only if it still points at
    /// `path`. A mismatch means a concurrent writer has re-claimed the
    /// digest with a newer canonical location; the request is ignored.
    pub fn delete_blob(&self, digest: &Digest, path: &Path) -> Result<()> {
        let rel = self.relative(path);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DIGESTS)?;
            let matches = match table.get(digest.to_string().as_str())? {
                Some(guard) => guard.value() == rel,
                None => false,
            };
            if matches {
                table.remove(digest.to_string().as_str())?;
                debug!(digest = %digest, path = %rel, "dedupe: removed blob record");
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Root-relative form of `path`, as stored in the index.
    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}
