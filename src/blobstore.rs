//! Content-addressed blob storage on the local filesystem.
//!
//! Blobs are keyed by the SHA-256 of their bytes and stored under a
//! sharded directory tree (`blobs/<hash[0..2]>/<hash>`) to bound
//! directory fan-out.  Identical content is stored exactly once.
//!
//! All writes follow crash-only design: bytes stream into a staging
//! file, are fsynced, then renamed into the final content-addressed
//! location.  A crash mid-write leaves only an orphaned staging file,
//! which the next startup sweeps away.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::IngotError;

/// Immutable reference to stored content: hash plus exact size.
///
/// Identifies blob bytes independent of any name; never mutated once
/// created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    /// Lowercase hex SHA-256 digest of the blob bytes (64 characters).
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
}

/// Stores blobs under a root directory.
pub struct BlobStore {
    /// Directory holding the sharded blob tree.
    blobs_dir: PathBuf,
    /// Directory holding in-flight staging files.
    staging_dir: PathBuf,
}

impl BlobStore {
    /// Open a blob store rooted at `root`.
    ///
    /// Creates the `blobs/` and `staging/` subtrees when `create_dirs`
    /// is set, and sweeps any staging files orphaned by a previous
    /// crash.  Every startup is a recovery.
    pub fn open(root: impl Into<PathBuf>, create_dirs: bool) -> Result<Self, IngotError> {
        let root = root.into();
        let blobs_dir = root.join("blobs");
        let staging_dir = root.join("staging");

        if create_dirs {
            std::fs::create_dir_all(&blobs_dir)?;
            std::fs::create_dir_all(&staging_dir)?;
        } else if !blobs_dir.is_dir() || !staging_dir.is_dir() {
            return Err(IngotError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("blob store layout missing under {}", root.display()),
            )));
        }

        let store = Self {
            blobs_dir,
            staging_dir,
        };
        store.sweep_staging();
        Ok(store)
    }

    /// Remove all staging files.  Called on open; anything present was
    /// left behind by a crashed or aborted upload in a dead process.
    fn sweep_staging(&self) {
        let entries = match std::fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Cannot read staging directory: {}", err);
                return;
            }
        };
        let mut swept = 0usize;
        for entry in entries.flatten() {
            if let Err(err) = std::fs::remove_file(entry.path()) {
                warn!("Failed to sweep staging file {:?}: {}", entry.path(), err);
            } else {
                swept += 1;
            }
        }
        if swept > 0 {
            debug!("Swept {} orphaned staging files", swept);
        }
    }

    /// Resolve a content hash to its final sharded path.
    ///
    /// Rejects anything that is not a 64-character lowercase hex digest,
    /// so a forged reference can never escape the blob tree.
    fn blob_path(&self, hash: &str) -> Result<PathBuf, IngotError> {
        if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(IngotError::BlobNotFound {
                hash: hash.to_string(),
            });
        }
        Ok(self.blobs_dir.join(&hash[..2]).join(hash))
    }

    /// Start a streaming upload bounded by `limit` bytes.
    pub fn begin(&self, limit: u64) -> Result<UploadSession, IngotError> {
        let tmp_path = self
            .staging_dir
            .join(format!("upload-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::create(&tmp_path)?;
        Ok(UploadSession {
            blobs_dir: self.blobs_dir.clone(),
            tmp_path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            limit,
        })
    }

    /// Store `data` in one call.  Convenience over [`BlobStore::begin`];
    /// idempotent for identical content.
    pub fn put(&self, data: &[u8], limit: u64) -> Result<BlobRef, IngotError> {
        let mut session = self.begin(limit)?;
        session.write(data)?;
        let mut staged = session.commit()?;
        staged.materialize()?;
        Ok(staged.seal())
    }

    /// Read the blob identified by `blob`, verifying integrity.
    ///
    /// Fails with `BlobNotFound` if absent, and `IntegrityViolation` if
    /// the stored bytes no longer hash to the reference — corrupt data
    /// is never silently returned.
    pub fn get(&self, blob: &BlobRef) -> Result<Bytes, IngotError> {
        let path = self.blob_path(&blob.hash)?;
        if !path.is_file() {
            return Err(IngotError::BlobNotFound {
                hash: blob.hash.clone(),
            });
        }
        let data = std::fs::read(&path)?;

        if data.len() as u64 != blob.size {
            return Err(IngotError::IntegrityViolation {
                hash: blob.hash.clone(),
            });
        }
        let actual = hex::encode(Sha256::digest(&data));
        if actual != blob.hash {
            return Err(IngotError::IntegrityViolation {
                hash: blob.hash.clone(),
            });
        }

        Ok(Bytes::from(data))
    }

    /// Check whether the blob exists on disk.
    pub fn exists(&self, blob: &BlobRef) -> Result<bool, IngotError> {
        Ok(self.blob_path(&blob.hash)?.is_file())
    }

    /// Remove the blob file.  Idempotent; reference-count enforcement
    /// lives in the coordinator, which owns both stores.
    pub fn delete(&self, blob: &BlobRef) -> Result<(), IngotError> {
        let path = self.blob_path(&blob.hash)?;
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// In-flight upload: staging file, running hash, byte count.
///
/// Consumed by [`UploadSession::commit`] or [`UploadSession::abort`];
/// dropping an unfinished session removes its staging file.
pub struct UploadSession {
    blobs_dir: PathBuf,
    tmp_path: PathBuf,
    file: Option<std::fs::File>,
    hasher: Sha256,
    written: u64,
    limit: u64,
}

impl UploadSession {
    /// Append a chunk to the staging file, hashing as it goes.
    ///
    /// Fails with `SizeLimitExceeded` the instant the cumulative byte
    /// count exceeds the limit; the staging file is discarded and the
    /// session is dead.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), IngotError> {
        let file = self.file.as_mut().ok_or_else(|| {
            IngotError::Internal(anyhow::anyhow!("write on a finished upload session"))
        })?;

        let new_total = self.written + chunk.len() as u64;
        if new_total > self.limit {
            self.discard();
            return Err(IngotError::SizeLimitExceeded { limit: self.limit });
        }

        file.write_all(chunk)?;
        self.hasher.update(chunk);
        self.written = new_total;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finalize the upload: fsync, move into the content-addressed
    /// location, return a staged blob handle.
    ///
    /// If a blob with the same hash already exists the new bytes are
    /// not renamed into place (dedup), but the staging copy is retained
    /// on the handle: a concurrent delete may unlink the existing file
    /// before the caller publishes a reference to it, and
    /// [`StagedBlob::materialize`] can then restore the blob from the
    /// retained copy.  [`StagedBlob::seal`] discards the copy.
    pub fn commit(mut self) -> Result<StagedBlob, IngotError> {
        let file = self.file.take().ok_or_else(|| {
            IngotError::Internal(anyhow::anyhow!("commit on a finished upload session"))
        })?;
        file.sync_all()?;
        drop(file);

        let hash = hex::encode(std::mem::take(&mut self.hasher).finalize());
        let final_path = self.blobs_dir.join(&hash[..2]).join(&hash);

        let tmp_path = if final_path.is_file() {
            // Identical content already stored; keep the staging copy
            // until the caller seals.
            Some(std::mem::take(&mut self.tmp_path))
        } else {
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&self.tmp_path, &final_path)?;
            None
        };

        Ok(StagedBlob {
            blob: BlobRef {
                hash,
                size: self.written,
            },
            blobs_dir: std::mem::take(&mut self.blobs_dir),
            tmp_path,
        })
    }

    /// Abandon the upload and remove the staging file.
    pub fn abort(mut self) {
        self.discard();
    }

    /// Drop the file handle and remove the staging file, best effort.
    fn discard(&mut self) {
        self.file = None;
        if self.tmp_path.exists() {
            if let Err(err) = std::fs::remove_file(&self.tmp_path) {
                warn!("Failed to remove staging file {:?}: {}", self.tmp_path, err);
            }
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        // Covers client disconnects: an unfinished session leaves no
        // staging residue.
        if self.file.is_some() {
            self.discard();
        }
    }
}

/// A durably committed blob whose staging copy may still be retained.
///
/// Produced by [`UploadSession::commit`].  The retained copy (present
/// only after a dedup hit) lets [`StagedBlob::materialize`] restore the
/// content-addressed file if a concurrent delete unlinked it between
/// the dedup check and the publish of the entry referencing it.
pub struct StagedBlob {
    blob: BlobRef,
    blobs_dir: PathBuf,
    tmp_path: Option<PathBuf>,
}

impl StagedBlob {
    /// The committed blob reference.
    pub fn blob(&self) -> &BlobRef {
        &self.blob
    }

    /// Ensure the content-addressed file exists, renaming the retained
    /// staging copy into place if it was unlinked since commit.
    ///
    /// Fails with `BlobNotFound` only when the file is gone and no
    /// staging copy remains to restore it from.
    pub fn materialize(&mut self) -> Result<(), IngotError> {
        let final_path = self
            .blobs_dir
            .join(&self.blob.hash[..2])
            .join(&self.blob.hash);
        if final_path.is_file() {
            return Ok(());
        }
        let tmp = self
            .tmp_path
            .take()
            .ok_or_else(|| IngotError::BlobNotFound {
                hash: self.blob.hash.clone(),
            })?;
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&tmp, &final_path)?;
        Ok(())
    }

    /// Discard any retained staging copy and return the blob reference.
    pub fn seal(mut self) -> BlobRef {
        self.cleanup();
        self.blob.clone()
    }

    fn cleanup(&mut self) {
        if let Some(tmp) = self.tmp_path.take() {
            if tmp.exists() {
                if let Err(err) = std::fs::remove_file(&tmp) {
                    warn!("Failed to remove staging file {:?}: {}", tmp, err);
                }
            }
        }
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = BlobStore::open(dir.path(), true).expect("failed to open store");
        (dir, store)
    }

    /// SHA-256 of "Hello, World!".
    const HELLO_HASH: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

    #[test]
    fn test_put_and_get_roundtrip() {
        let (_dir, store) = test_store();

        let blob = store.put(b"Hello, World!", 1024).unwrap();
        assert_eq!(blob.hash, HELLO_HASH);
        assert_eq!(blob.size, 13);

        let data = store.get(&blob).unwrap();
        assert_eq!(data, Bytes::from_static(b"Hello, World!"));
    }

    #[test]
    fn test_put_empty_blob() {
        let (_dir, store) = test_store();

        let blob = store.put(b"", 1024).unwrap();
        assert_eq!(blob.size, 0);
        // SHA-256 of the empty string.
        assert_eq!(
            blob.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let data = store.get(&blob).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_sharded_layout() {
        let (dir, store) = test_store();

        let blob = store.put(b"Hello, World!", 1024).unwrap();
        let expected = dir
            .path()
            .join("blobs")
            .join(&blob.hash[..2])
            .join(&blob.hash);
        assert!(expected.is_file());
    }

    #[test]
    fn test_put_dedups_identical_content() {
        let (dir, store) = test_store();

        let a = store.put(b"same bytes", 1024).unwrap();
        let b = store.put(b"same bytes", 1024).unwrap();
        assert_eq!(a, b);

        // Exactly one physical file in the shard.
        let shard = dir.path().join("blobs").join(&a.hash[..2]);
        let count = std::fs::read_dir(&shard).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_size_limit_exceeded_leaves_no_residue() {
        let (dir, store) = test_store();

        let mut session = store.begin(8).unwrap();
        let err = session.write(b"way more than eight bytes").unwrap_err();
        assert!(matches!(err, IngotError::SizeLimitExceeded { limit: 8 }));
        drop(session);

        // Staging directory must be empty afterwards.
        let staging = dir.path().join("staging");
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_limit_breached_across_chunks() {
        let (_dir, store) = test_store();

        let mut session = store.begin(10).unwrap();
        session.write(b"123456").unwrap();
        let err = session.write(b"7890ab").unwrap_err();
        assert!(matches!(err, IngotError::SizeLimitExceeded { .. }));
    }

    #[test]
    fn test_exact_limit_is_allowed() {
        let (_dir, store) = test_store();

        let blob = store.put(b"12345678", 8).unwrap();
        assert_eq!(blob.size, 8);
    }

    #[test]
    fn test_streaming_chunks_match_single_put() {
        let (_dir, store) = test_store();

        let mut session = store.begin(1024).unwrap();
        session.write(b"Hello, ").unwrap();
        session.write(b"World!").unwrap();
        let streamed = session.commit().unwrap().seal();

        let whole = store.put(b"Hello, World!", 1024).unwrap();
        assert_eq!(streamed, whole);
    }

    #[test]
    fn test_abort_removes_staging_file() {
        let (dir, store) = test_store();

        let mut session = store.begin(1024).unwrap();
        session.write(b"partial").unwrap();
        session.abort();

        let staging = dir.path().join("staging");
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_dropped_session_removes_staging_file() {
        let (dir, store) = test_store();

        {
            let mut session = store.begin(1024).unwrap();
            session.write(b"client went away").unwrap();
            // Dropped without commit or abort.
        }

        let staging = dir.path().join("staging");
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_get_nonexistent_is_not_found() {
        let (_dir, store) = test_store();

        let blob = BlobRef {
            hash: "00".repeat(32),
            size: 4,
        };
        let err = store.get(&blob).unwrap_err();
        assert!(matches!(err, IngotError::BlobNotFound { .. }));
    }

    #[test]
    fn test_malformed_hash_is_not_found() {
        let (_dir, store) = test_store();

        let blob = BlobRef {
            hash: "../../../etc/passwd".to_string(),
            size: 4,
        };
        let err = store.get(&blob).unwrap_err();
        assert!(matches!(err, IngotError::BlobNotFound { .. }));
    }

    #[test]
    fn test_corrupted_blob_fails_integrity_check() {
        let (dir, store) = test_store();

        let blob = store.put(b"precious data", 1024).unwrap();
        let path = dir
            .path()
            .join("blobs")
            .join(&blob.hash[..2])
            .join(&blob.hash);
        std::fs::write(&path, b"precious dat4").unwrap();

        let err = store.get(&blob).unwrap_err();
        assert!(matches!(err, IngotError::IntegrityViolation { .. }));
    }

    #[test]
    fn test_size_mismatch_fails_integrity_check() {
        let (dir, store) = test_store();

        let blob = store.put(b"precious data", 1024).unwrap();
        let path = dir
            .path()
            .join("blobs")
            .join(&blob.hash[..2])
            .join(&blob.hash);
        std::fs::write(&path, b"truncated").unwrap();

        let err = store.get(&blob).unwrap_err();
        assert!(matches!(err, IngotError::IntegrityViolation { .. }));
    }

    #[test]
    fn test_staged_dedup_copy_survives_concurrent_delete() {
        let (dir, store) = test_store();

        let existing = store.put(b"shared payload", 1024).unwrap();

        let mut session = store.begin(1024).unwrap();
        session.write(b"shared payload").unwrap();
        let mut staged = session.commit().unwrap();
        assert_eq!(*staged.blob(), existing);

        // The stored copy is unlinked after the dedup hit, before any
        // entry referencing the new upload is published.
        store.delete(&existing).unwrap();
        assert!(!store.exists(&existing).unwrap());

        staged.materialize().unwrap();
        assert_eq!(
            store.get(&existing).unwrap(),
            Bytes::from_static(b"shared payload")
        );

        let blob = staged.seal();
        assert_eq!(blob, existing);
        let staging = dir.path().join("staging");
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_sealed_dedup_leaves_no_staging_residue() {
        let (dir, store) = test_store();

        store.put(b"same bytes", 1024).unwrap();
        let mut session = store.begin(1024).unwrap();
        session.write(b"same bytes").unwrap();
        let staged = session.commit().unwrap();

        // The staging copy is held until seal, then discarded.
        let staging = dir.path().join("staging");
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 1);
        staged.seal();
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = test_store();

        let blob = store.put(b"short lived", 1024).unwrap();
        store.delete(&blob).unwrap();
        assert!(!store.exists(&blob).unwrap());

        // Second delete is a no-op.
        store.delete(&blob).unwrap();
    }

    #[test]
    fn test_open_sweeps_orphaned_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(dir.path().join("blobs")).unwrap();
        std::fs::write(staging.join("upload-orphan"), b"leftover").unwrap();

        let _store = BlobStore::open(dir.path(), true).unwrap();
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_open_without_create_dirs_requires_layout() {
        let dir = tempfile::tempdir().unwrap();
        let result = BlobStore::open(dir.path().join("missing"), false);
        assert!(result.is_err());
    }
}
