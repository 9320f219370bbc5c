//! Upload coordinator: streams bytes into the blob store and publishes
//! namespace entries.
//!
//! A single upload moves through Receiving → Hashing → Publishing →
//! Done; aborts and failures are terminal with no namespace effect.
//! The namespace entry becomes visible only after the blob is durable,
//! so no reader ever observes a name pointing at missing or partial
//! data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::blobstore::{BlobRef, BlobStore, UploadSession};
use crate::errors::IngotError;
use crate::index::store::{NamespaceEntry, NamespaceIndex, RepositorySummary};

/// Outcome of a completed upload: everything the caller needs to verify
/// the write independently.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    /// Repository the entry was published into.
    pub repository: String,
    /// Resolved path of the entry.
    pub path: String,
    /// Content hash and size of the stored blob.
    pub blob: BlobRef,
}

/// The service instance owning the blob store and namespace index.
///
/// Explicitly constructed and explicitly owned — no ambient global.
pub struct UploadService {
    blobs: Arc<BlobStore>,
    index: Arc<dyn NamespaceIndex>,
    max_upload_size: u64,
    /// Per-hash locks serializing blob file removal with publish.
    gc_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Map a namespace index failure into the error taxonomy.
fn index_failure(err: anyhow::Error) -> IngotError {
    IngotError::IoFailure(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("namespace index failure: {err:#}"),
    ))
}

/// Validate a repository name: non-empty, single path segment.
pub fn validate_repository(repository: &str) -> Result<(), IngotError> {
    if repository.is_empty() {
        return Err(IngotError::InvalidName {
            message: "repository name must not be empty".to_string(),
        });
    }
    if repository == "." || repository == ".." {
        return Err(IngotError::InvalidName {
            message: format!("invalid repository name: {repository}"),
        });
    }
    if repository
        .bytes()
        .any(|b| b == b'/' || b == b'\\' || b == 0)
    {
        return Err(IngotError::InvalidName {
            message: format!("repository name contains invalid characters: {repository}"),
        });
    }
    Ok(())
}

/// Validate an entry path: slash-separated, no leading slash, no empty,
/// `.` or `..` segments.
pub fn validate_path(path: &str) -> Result<(), IngotError> {
    if path.is_empty() {
        return Err(IngotError::InvalidName {
            message: "path must not be empty".to_string(),
        });
    }
    if path.starts_with('/') {
        return Err(IngotError::InvalidName {
            message: format!("path must not start with a slash: {path}"),
        });
    }
    if path.bytes().any(|b| b == b'\\' || b == 0) {
        return Err(IngotError::InvalidName {
            message: format!("path contains invalid characters: {path}"),
        });
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(IngotError::InvalidName {
                message: format!("path contains an invalid segment: {path}"),
            });
        }
    }
    Ok(())
}

impl UploadService {
    /// Build a service over the given stores with an upload size limit.
    pub fn new(blobs: Arc<BlobStore>, index: Arc<dyn NamespaceIndex>, max_upload_size: u64) -> Self {
        Self {
            blobs,
            index,
            max_upload_size,
            gc_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Lock guarding the blob file for `hash`.
    ///
    /// Held by [`Upload::finish`] from the dedup re-check until the
    /// namespace entry is visible, and by [`UploadService::sweep`] /
    /// [`UploadService::delete_blob`] around the refcount check and
    /// unlink, so a sweep can never remove a file that an in-flight
    /// publish is about to reference.
    fn hash_lock(&self, hash: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.gc_locks.lock().expect("mutex poisoned");
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(hash.to_string()).or_default())
    }

    /// The configured streaming upload limit in bytes.
    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// Start a streaming upload targeted at (repository, path).
    ///
    /// Names are validated up front so an invalid request fails before
    /// any bytes are accepted.
    pub fn begin(&self, repository: &str, path: &str) -> Result<Upload<'_>, IngotError> {
        validate_repository(repository)?;
        validate_path(path)?;
        let session = self.blobs.begin(self.max_upload_size)?;
        Ok(Upload {
            service: self,
            repository: repository.to_string(),
            path: path.to_string(),
            session: Some(session),
        })
    }

    /// Upload a complete in-memory payload in one call.
    pub async fn upload(
        &self,
        repository: &str,
        path: &str,
        data: &[u8],
    ) -> Result<UploadResult, IngotError> {
        let mut upload = self.begin(repository, path)?;
        upload.write(data)?;
        upload.finish().await
    }

    /// Resolve (repository, path) and read the blob bytes, verifying
    /// integrity.
    pub async fn download(
        &self,
        repository: &str,
        path: &str,
    ) -> Result<(NamespaceEntry, Bytes), IngotError> {
        let entry = self
            .index
            .get(repository, path)
            .await
            .map_err(index_failure)?
            .ok_or_else(|| IngotError::EntryNotFound {
                repository: repository.to_string(),
                path: path.to_string(),
            })?;
        let data = self.blobs.get(&entry.blob)?;
        Ok((entry, data))
    }

    /// List entries in a repository under a path prefix, ordered by path.
    pub async fn list(
        &self,
        repository: &str,
        prefix: &str,
    ) -> Result<Vec<NamespaceEntry>, IngotError> {
        validate_repository(repository)?;
        self.index
            .list(repository, prefix)
            .await
            .map_err(index_failure)
    }

    /// List all repositories that currently hold at least one entry.
    pub async fn repositories(&self) -> Result<Vec<RepositorySummary>, IngotError> {
        self.index.list_repositories().await.map_err(index_failure)
    }

    /// Remove the entry at (repository, path), then garbage-collect any
    /// blob the removal unreferenced.
    pub async fn remove(&self, repository: &str, path: &str) -> Result<NamespaceEntry, IngotError> {
        let outcome = self
            .index
            .delete(repository, path)
            .await
            .map_err(index_failure)?
            .ok_or_else(|| IngotError::EntryNotFound {
                repository: repository.to_string(),
                path: path.to_string(),
            })?;
        self.sweep(&outcome.unreferenced).await;
        Ok(outcome.removed)
    }

    /// Delete a blob directly.  Fails with `StillReferenced` while any
    /// namespace entry points at it.  The hash lock spans the count
    /// check and the unlink so a concurrent publish cannot slip in
    /// between.
    pub async fn delete_blob(&self, blob: &BlobRef) -> Result<(), IngotError> {
        let lock = self.hash_lock(&blob.hash);
        let _guard = lock.lock().await;
        let count = self
            .index
            .ref_count(&blob.hash)
            .await
            .map_err(index_failure)?;
        if count > 0 {
            return Err(IngotError::StillReferenced {
                hash: blob.hash.clone(),
                count,
            });
        }
        self.blobs.delete(blob)
    }

    /// Remove unreferenced blob files.  A failed removal is retried
    /// once; a blob left behind after that is logged and harmless — it
    /// is re-adopted by the next identical upload or a later sweep.
    async fn sweep(&self, unreferenced: &[BlobRef]) {
        for blob in unreferenced {
            let lock = self.hash_lock(&blob.hash);
            let _guard = lock.lock().await;

            // Re-check under the lock: the blob may have been
            // republished since the unreferenced report was produced.
            match self.index.ref_count(&blob.hash).await {
                Ok(0) => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(
                        "Refcount check failed for {}, skipping sweep: {:#}",
                        blob.hash, err
                    );
                    continue;
                }
            }

            match self.blobs.delete(blob) {
                Ok(()) => {
                    counter!(crate::metrics::BLOBS_COLLECTED_TOTAL).increment(1);
                }
                Err(err) => {
                    warn!("Blob cleanup failed for {}, retrying once: {}", blob.hash, err);
                    match self.blobs.delete(blob) {
                        Ok(()) => {
                            counter!(crate::metrics::BLOBS_COLLECTED_TOTAL).increment(1);
                        }
                        Err(err) => {
                            warn!("Blob cleanup retry failed for {}: {}", blob.hash, err);
                        }
                    }
                }
            }
        }
    }
}

/// An in-flight coordinated upload (Receiving/Hashing states).
///
/// Dropping the handle without calling [`Upload::finish`] aborts the
/// upload; staged bytes are cleaned up and the namespace is untouched.
pub struct Upload<'a> {
    service: &'a UploadService,
    repository: String,
    path: String,
    session: Option<UploadSession>,
}

impl Upload<'_> {
    /// Feed a chunk of the request body into the staged blob.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), IngotError> {
        let session = self.session.as_mut().ok_or_else(|| {
            IngotError::Internal(anyhow::anyhow!("write on a finished upload"))
        })?;
        session.write(chunk)
    }

    /// Make the blob durable, then publish the namespace entry.
    ///
    /// A blob shadowed by this overwrite is NOT reclaimed here: a
    /// superseded writer's blob stays independently retrievable through
    /// its own reference until explicitly deleted.
    pub async fn finish(mut self) -> Result<UploadResult, IngotError> {
        let session = self.session.take().ok_or_else(|| {
            IngotError::Internal(anyhow::anyhow!("finish on a finished upload"))
        })?;
        let mut staged = session.commit()?;

        // The hash lock is held from the existence re-check until the
        // entry is visible, so a concurrent sweep cannot unlink the
        // blob file between a dedup hit and the publish.  If a sweep
        // already removed it, materialize restores the file from the
        // retained staging copy.
        let lock = self.service.hash_lock(&staged.blob().hash);
        let _guard = lock.lock().await;
        staged.materialize()?;

        self.service
            .index
            .put(&self.repository, &self.path, staged.blob().clone())
            .await
            .map_err(index_failure)?;
        let blob = staged.seal();

        Ok(UploadResult {
            repository: std::mem::take(&mut self.repository),
            path: std::mem::take(&mut self.path),
            blob,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
