//! Abstract namespace index trait.
//!
//! The namespace is the mutable mapping from (repository, path) names to
//! blobs, with per-blob reference counts.  Any index backend must
//! implement [`NamespaceIndex`].  The trait uses manually desugared
//! async methods (pinned boxed futures) so it can back both the SQLite
//! store and the in-memory store behind one `Arc<dyn _>`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::blobstore::BlobRef;

/// A single namespace entry: one name pointing at one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    /// Repository the entry belongs to.
    pub repository: String,
    /// Slash-separated path within the repository.
    pub path: String,
    /// The referenced blob.
    pub blob: BlobRef,
    /// RFC 3339 timestamp of the last write to this entry.
    pub updated_at: String,
}

/// Result of a namespace `put`.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// The entry previously stored at this key, if any.
    pub previous: Option<NamespaceEntry>,
    /// Blobs whose reference count dropped to zero in this mutation.
    /// The caller owns removing their files from the blob store.
    pub unreferenced: Vec<BlobRef>,
}

/// Result of a namespace `delete`.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    /// The removed entry.
    pub removed: NamespaceEntry,
    /// Blobs whose reference count dropped to zero in this mutation.
    pub unreferenced: Vec<BlobRef>,
}

/// A repository summary: name plus how many entries reference it.
///
/// Repositories are implicit — one exists exactly while at least one
/// entry names it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySummary {
    /// Repository name.
    pub name: String,
    /// Number of namespace entries in the repository.
    pub entries: u64,
}

/// Async namespace index contract.
///
/// Every mutating call must be durable before it returns success, and
/// each mutation maintains reference counts atomically with the entry
/// change — counts never transiently double-count or under-count.
/// The implementation's mutation path is the serialization point for
/// concurrent writes to the same key.
pub trait NamespaceIndex: Send + Sync + 'static {
    /// Atomically replace whatever entry exists at (repository, path),
    /// incrementing the new blob's reference count and decrementing the
    /// old blob's as one logical transaction.
    fn put(
        &self,
        repository: &str,
        path: &str,
        blob: BlobRef,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutOutcome>> + Send + '_>>;

    /// Get the entry at (repository, path).
    fn get(
        &self,
        repository: &str,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<NamespaceEntry>>> + Send + '_>>;

    /// List entries in a repository whose path starts with `prefix`,
    /// ordered lexicographically by path.  Each call yields a fresh
    /// consistent snapshot.
    fn list(
        &self,
        repository: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<NamespaceEntry>>> + Send + '_>>;

    /// Remove the entry at (repository, path) and decrement the
    /// referenced blob's count.  Returns `None` if no entry exists.
    fn delete(
        &self,
        repository: &str,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<DeleteOutcome>>> + Send + '_>>;

    /// Number of namespace entries currently referencing `hash`.
    fn ref_count(
        &self,
        hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// List all implicit repositories with their entry counts, ordered
    /// by name.
    fn list_repositories(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<RepositorySummary>>> + Send + '_>>;
}
