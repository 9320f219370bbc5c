//! In-memory namespace index.
//!
//! Keeps all entries in memory with no persistence.  Useful for tests
//! and ephemeral deployments.  A `BTreeMap` keyed by (repository, path)
//! gives lexicographic listing for free; the `RwLock` write path is the
//! serialization point for concurrent mutations.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use chrono::{SecondsFormat, Utc};

use super::store::{DeleteOutcome, NamespaceEntry, NamespaceIndex, PutOutcome, RepositorySummary};
use crate::blobstore::BlobRef;

type EntryKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<EntryKey, NamespaceEntry>,
    ref_counts: HashMap<String, u64>,
}

impl Inner {
    /// Decrement a blob's count, returning it when no references remain.
    fn release(&mut self, blob: &BlobRef) -> Option<BlobRef> {
        match self.ref_counts.get_mut(&blob.hash) {
            Some(count) if *count > 1 => {
                *count -= 1;
                None
            }
            Some(_) => {
                self.ref_counts.remove(&blob.hash);
                Some(blob.clone())
            }
            None => None,
        }
    }
}

/// Namespace index with no durability guarantees.
#[derive(Default)]
pub struct MemoryNamespaceIndex {
    inner: RwLock<Inner>,
}

impl MemoryNamespaceIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl NamespaceIndex for MemoryNamespaceIndex {
    fn put(
        &self,
        repository: &str,
        path: &str,
        blob: BlobRef,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutOutcome>> + Send + '_>> {
        let repository = repository.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");

            let entry = NamespaceEntry {
                repository: repository.clone(),
                path: path.clone(),
                blob: blob.clone(),
                updated_at: now_rfc3339(),
            };
            *inner.ref_counts.entry(blob.hash.clone()).or_insert(0) += 1;
            let previous = inner.entries.insert((repository, path), entry);

            let mut unreferenced = Vec::new();
            if let Some(prev) = &previous {
                if let Some(orphan) = inner.release(&prev.blob) {
                    unreferenced.push(orphan);
                }
            }

            Ok(PutOutcome {
                previous,
                unreferenced,
            })
        })
    }

    fn get(
        &self,
        repository: &str,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<NamespaceEntry>>> + Send + '_>> {
        let key = (repository.to_string(), path.to_string());
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.entries.get(&key).cloned())
        })
    }

    fn list(
        &self,
        repository: &str,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<NamespaceEntry>>> + Send + '_>> {
        let repository = repository.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            let entries = inner
                .entries
                .range((repository.clone(), String::new())..)
                .take_while(|((repo, _), _)| *repo == repository)
                .filter(|((_, path), _)| path.starts_with(&prefix))
                .map(|(_, entry)| entry.clone())
                .collect();
            Ok(entries)
        })
    }

    fn delete(
        &self,
        repository: &str,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<DeleteOutcome>>> + Send + '_>> {
        let key = (repository.to_string(), path.to_string());
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            let removed = match inner.entries.remove(&key) {
                Some(entry) => entry,
                None => return Ok(None),
            };

            let mut unreferenced = Vec::new();
            if let Some(orphan) = inner.release(&removed.blob) {
                unreferenced.push(orphan);
            }

            Ok(Some(DeleteOutcome {
                removed,
                unreferenced,
            }))
        })
    }

    fn ref_count(
        &self,
        hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let hash = hash.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.ref_counts.get(&hash).copied().unwrap_or(0))
        })
    }

    fn list_repositories(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<RepositorySummary>>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            let mut repositories: Vec<RepositorySummary> = Vec::new();
            for (repo, _) in inner.entries.keys() {
                match repositories.last_mut() {
                    Some(last) if last.name == *repo => last.entries += 1,
                    _ => repositories.push(RepositorySummary {
                        name: repo.clone(),
                        entries: 1,
                    }),
                }
            }
            Ok(repositories)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
