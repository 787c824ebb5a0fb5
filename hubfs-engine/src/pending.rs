use std::time::Duration;

use hubfs_core::{HubClient, HubError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::{PathCache, parse_modified};
use crate::paths::{display_name, normalize_key, parent_of};
use crate::store::{KvStore, StoreError};

pub const PENDING_PREFIX: &str = "pending_";

/// An edit saved while the hub was unreachable, waiting to be replayed.
///
/// `original_last_modified` is the remote timestamp the edit was based on;
/// it decides on replay whether the remote file changed underneath us.
/// `is_new_file` edits have no basis and conflict only if the path now
/// exists remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEdit {
    pub path: String,
    pub content: String,
    pub original_last_modified: i64,
    pub is_new_file: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "schema")]
enum StoredEdit {
    #[serde(rename = "v1")]
    V1 { edit: PendingEdit },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub resolved: usize,
    pub conflicted: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
enum ResolveError {
    #[error(transparent)]
    Remote(#[from] HubError),
    #[error("listing timed out")]
    Timeout,
}

/// Where an edit conflicts, the local version survives under this sibling
/// name and the remote copy is left untouched.
pub fn conflicted_path(path: &str) -> String {
    format!("{path}.conflicted")
}

/// Durable queue of offline edits, at most one per path. Later saves to the
/// same path replace the queued edit but keep its original basis fields.
#[derive(Clone)]
pub struct PendingEditQueue {
    store: KvStore,
}

impl PendingEditQueue {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Upserts the edit for its path. The record is on disk before this
    /// returns, so a crash cannot lose an acknowledged save.
    pub async fn enqueue(&self, edit: PendingEdit) -> Result<(), StoreError> {
        let key = pending_key(&edit.path);
        let record = StoredEdit::V1 { edit };
        let bytes = serde_json::to_vec(&record)?;
        self.store.put(&key, &bytes).await
    }

    pub async fn get(&self, path: &str) -> Result<Option<PendingEdit>, StoreError> {
        let Some(bytes) = self.store.get(&pending_key(path)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<StoredEdit>(&bytes) {
            Ok(StoredEdit::V1 { edit }) => Ok(Some(edit)),
            Err(err) => {
                eprintln!("[hubfs] discarding unreadable pending edit for {path}: {err}");
                Ok(None)
            }
        }
    }

    pub async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.store.delete(&pending_key(path)).await
    }

    pub async fn list(&self) -> Result<Vec<PendingEdit>, StoreError> {
        let mut edits = Vec::new();
        for key in self.store.keys_with_prefix(PENDING_PREFIX).await? {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<StoredEdit>(&bytes) {
                Ok(StoredEdit::V1 { edit }) => edits.push(edit),
                Err(err) => {
                    eprintln!("[hubfs] skipping unreadable pending edit {key}: {err}");
                }
            }
        }
        Ok(edits)
    }

    pub async fn list_paths(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.store.keys_with_prefix(PENDING_PREFIX).await?;
        Ok(keys
            .into_iter()
            .map(|key| key[PENDING_PREFIX.len()..].to_string())
            .collect())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.store.keys_with_prefix(PENDING_PREFIX).await?.is_empty())
    }

    /// Replays every queued edit against the hub, one at a time. Each edit is
    /// checked against the current remote listing of its parent: an unchanged
    /// basis writes in place, a changed one writes to the `.conflicted`
    /// sibling so no remote work is lost. Edits that fail to replay stay
    /// queued for the next drain. Cancelling the token stops the drain at
    /// the next edit boundary; the in-flight edit finishes and the rest
    /// stay queued.
    pub async fn drain(
        &self,
        client: &HubClient,
        cache: &PathCache,
        list_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        for edit in self.list().await? {
            if cancel.is_cancelled() {
                eprintln!("[hubfs] drain preempted, remaining edits stay queued");
                break;
            }
            match resolve_edit(client, list_timeout, &edit).await {
                Ok(save_path) => {
                    let conflicted = save_path != edit.path;
                    self.remove(&edit.path).await?;
                    // The remote copy is now authoritative; drop the stale
                    // local body rather than risk serving it offline.
                    cache.evict_content(&edit.path).await?;
                    if conflicted {
                        report.conflicted += 1;
                        eprintln!(
                            "[hubfs] pending edit for {} conflicted, kept as {save_path}",
                            edit.path
                        );
                    } else {
                        report.resolved += 1;
                        eprintln!("[hubfs] pending edit for {} resolved", edit.path);
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    eprintln!("[hubfs] pending edit for {} not replayed: {err}", edit.path);
                }
            }
        }
        Ok(report)
    }
}

/// Writes one edit, returning the path it actually landed on.
async fn resolve_edit(
    client: &HubClient,
    list_timeout: Duration,
    edit: &PendingEdit,
) -> Result<String, ResolveError> {
    let parent = parent_of(&edit.path);
    let entries = tokio::time::timeout(list_timeout, client.list(&parent))
        .await
        .map_err(|_| ResolveError::Timeout)??;

    let name = display_name(&edit.path);
    let remote = entries.iter().find(|e| e.name == name);

    let save_path = if edit.is_new_file {
        match remote {
            None => edit.path.clone(),
            Some(_) => conflicted_path(&edit.path),
        }
    } else {
        match remote {
            Some(entry) if parse_modified(entry.modified.as_deref()) == edit.original_last_modified => {
                edit.path.clone()
            }
            _ => conflicted_path(&edit.path),
        }
    };

    client.write(&save_path, &edit.content).await?;
    Ok(save_path)
}

fn pending_key(path: &str) -> String {
    format!("{PENDING_PREFIX}{}", normalize_key(path))
}
