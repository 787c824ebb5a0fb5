use std::path::Path;
use std::time::Duration;

use hubfs_core::{HubClient, HubError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{DirEntry, PathCache, sort_listing};
use crate::invalidate::ChangeInvalidator;
use crate::paths::{display_name, normalize_key, parent_of};
use crate::pending::{DrainReport, PendingEdit, PendingEditQueue};
use crate::scope::{Bookmark, BookmarkScope};
use crate::store::{KvStore, StoreError};
use crate::transfer::{ChunkedTransferEngine, TransferError, TransferProgress};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} is not cached and the hub is unreachable")]
    NotCachedOffline(String),
    #[error(transparent)]
    Remote(#[from] HubError),
    #[error("the hub did not answer in time")]
    Timeout,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} is a directory")]
    IsDirectory(String),
    #[error("{0} does not exist on the hub")]
    NotOnRemote(String),
    #[error("no entry found for {0}")]
    MissingEntry(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    OnlineIdle,
    OnlineDraining,
}

/// Inputs fed to [`SyncOrchestrator::run`] by whatever watches the hub.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Connectivity(bool),
    RemoteChanged(String),
}

/// Outputs for the consumer (a UI or another daemon).
#[derive(Debug)]
pub enum ConsumerEvent {
    Offline,
    Online,
    RemoteChangeDetected { name: String },
    DirectoryRefreshed { path: String, entries: Vec<DirEntry> },
    PendingDrained(DrainReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Uploaded,
    Queued,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub list_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let secs = std::env::var("HUBFS_LIST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(15);
        Self {
            list_timeout: Duration::from_secs(secs),
        }
    }
}

struct OpenFile {
    path: String,
    basis_modified: i64,
    is_new: bool,
}

struct DrainTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Ties the cache, bookmark scope, pending queue and transfer engine
/// together behind one connectivity-aware surface. Starts offline; the
/// first `Connectivity(true)` event brings it online and replays any
/// queued edits.
pub struct SyncOrchestrator {
    client: HubClient,
    cache: PathCache,
    scope: BookmarkScope,
    pending: PendingEditQueue,
    transfer: ChunkedTransferEngine,
    invalidator: ChangeInvalidator,
    config: EngineConfig,
    online: bool,
    drain: Option<DrainTask>,
    current_dir: Option<String>,
    open_file: Option<OpenFile>,
    events: mpsc::UnboundedSender<ConsumerEvent>,
}

impl SyncOrchestrator {
    pub async fn new(
        client: HubClient,
        store: KvStore,
        events: mpsc::UnboundedSender<ConsumerEvent>,
    ) -> Result<Self, StoreError> {
        Self::with_config(client, store, events, EngineConfig::default()).await
    }

    pub async fn with_config(
        client: HubClient,
        store: KvStore,
        events: mpsc::UnboundedSender<ConsumerEvent>,
        config: EngineConfig,
    ) -> Result<Self, StoreError> {
        let scope = BookmarkScope::load(store.clone()).await?;
        Ok(Self {
            cache: PathCache::new(store.clone()),
            scope,
            pending: PendingEditQueue::new(store),
            transfer: ChunkedTransferEngine::new(client.clone()),
            invalidator: ChangeInvalidator::new(),
            client,
            config,
            online: false,
            drain: None,
            current_dir: None,
            open_file: None,
            events,
        })
    }

    pub fn state(&self) -> SyncState {
        if !self.online {
            return SyncState::Offline;
        }
        match &self.drain {
            Some(task) if !task.handle.is_finished() => SyncState::OnlineDraining,
            _ => SyncState::OnlineIdle,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Processes hub events until the sender side closes.
    pub async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<HubEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.handle_event(event).await {
                eprintln!("[hubfs] event handling failed: {err}");
            }
        }
    }

    pub async fn handle_event(&mut self, event: HubEvent) -> Result<(), SyncError> {
        match event {
            HubEvent::Connectivity(online) => self.handle_connectivity(online).await,
            HubEvent::RemoteChanged(path) => self.handle_remote_change(&path).await,
        }
    }

    /// Connectivity is edge-triggered: repeating the current state is a
    /// no-op, and queued edits drain once per offline-to-online transition.
    /// The drain runs as its own task so a lost connection preempts it
    /// between edits instead of waiting for the whole queue.
    async fn handle_connectivity(&mut self, online: bool) -> Result<(), SyncError> {
        if online == self.is_online() {
            return Ok(());
        }
        if !online {
            self.online = false;
            if let Some(task) = &self.drain {
                task.cancel.cancel();
            }
            eprintln!("[hubfs] hub connection lost, entering offline mode");
            let _ = self.events.send(ConsumerEvent::Offline);
            return Ok(());
        }

        self.online = true;
        eprintln!("[hubfs] hub connection restored");
        let _ = self.events.send(ConsumerEvent::Online);
        if self.pending.is_empty().await? {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pending = self.pending.clone();
        let client = self.client.clone();
        let cache = self.cache.clone();
        let events = self.events.clone();
        let list_timeout = self.config.list_timeout;
        let handle = tokio::spawn(async move {
            match pending.drain(&client, &cache, list_timeout, &token).await {
                Ok(report) => {
                    eprintln!(
                        "[hubfs] drained pending edits: {} resolved, {} conflicted, {} failed",
                        report.resolved, report.conflicted, report.failed
                    );
                    let _ = events.send(ConsumerEvent::PendingDrained(report));
                }
                Err(err) => eprintln!("[hubfs] drain failed: {err}"),
            }
        });
        self.drain = Some(DrainTask { cancel, handle });
        Ok(())
    }

    async fn handle_remote_change(&mut self, path: &str) -> Result<(), SyncError> {
        let outcome = self
            .invalidator
            .on_remote_change(
                &self.cache,
                path,
                self.open_file.as_ref().map(|f| f.path.as_str()),
                self.current_dir.as_deref(),
            )
            .await?;
        if let Some(name) = outcome.stale_open {
            let _ = self
                .events
                .send(ConsumerEvent::RemoteChangeDetected { name });
        }

        if outcome.refresh_parent && self.is_online() {
            match self.list_remote(&outcome.parent).await {
                Ok(entries) => {
                    if self.scope.is_cacheable(&outcome.parent) {
                        self.cache.put(&outcome.parent, &entries).await?;
                    }
                    let entries = self.enrich(&outcome.parent, entries).await?;
                    let _ = self.events.send(ConsumerEvent::DirectoryRefreshed {
                        path: outcome.parent,
                        entries,
                    });
                }
                Err(err) => {
                    eprintln!("[hubfs] refresh of {} failed: {err}", outcome.parent);
                }
            }
        }
        Ok(())
    }

    /// Lists a directory, remote-first when online with the cache as a
    /// fallback, cache-only (with synthesized ancestors) when offline.
    /// Queued edits appear in the result as placeholder entries.
    pub async fn load_directory(&mut self, path: &str) -> Result<Vec<DirEntry>, SyncError> {
        self.current_dir = Some(normalize_key(path));

        if !self.is_online() {
            let Some(entries) = self.cache.get_or_synthesize(path).await? else {
                return Err(SyncError::NotCachedOffline(path.to_string()));
            };
            return Ok(self.enrich(path, entries).await?);
        }

        match self.list_remote(path).await {
            Ok(entries) => {
                if self.scope.is_cacheable(path) {
                    self.cache.put(path, &entries).await?;
                }
                Ok(self.enrich(path, entries).await?)
            }
            Err(err) => match self.cache.get_or_synthesize(path).await? {
                Some(entries) => {
                    eprintln!("[hubfs] listing {path} from cache, hub unavailable: {err}");
                    Ok(self.enrich(path, entries).await?)
                }
                None => Err(err),
            },
        }
    }

    /// Recursive name search below `path`. Online only.
    pub async fn search(&self, path: &str, query: &str) -> Result<Vec<DirEntry>, SyncError> {
        if !self.is_online() {
            return Err(SyncError::NotCachedOffline(path.to_string()));
        }
        let remote = tokio::time::timeout(
            self.config.list_timeout,
            self.client.search(path, query),
        )
        .await
        .map_err(|_| SyncError::Timeout)??;
        let mut entries: Vec<DirEntry> = remote.iter().map(DirEntry::from_remote).collect();
        sort_listing(&mut entries);
        Ok(entries)
    }

    /// Returns the text content of a file and marks it as the open file.
    /// Queued edits win over both the cache and the remote copy.
    pub async fn open_for_edit(&mut self, path: &str) -> Result<String, SyncError> {
        if let Some(edit) = self.pending.get(path).await? {
            self.open_file = Some(OpenFile {
                path: edit.path,
                basis_modified: edit.original_last_modified,
                is_new: edit.is_new_file,
            });
            return Ok(edit.content);
        }

        if !self.is_online() {
            let Some(content) = self.cache.get_content(path).await? else {
                return Err(SyncError::NotCachedOffline(path.to_string()));
            };
            let basis = self
                .lookup_cached_entry(path)
                .await?
                .map(|e| e.modified)
                .unwrap_or(0);
            self.open_file = Some(OpenFile {
                path: path.to_string(),
                basis_modified: basis,
                is_new: false,
            });
            return Ok(content);
        }

        let entry = self.lookup_entry(path).await?;
        if entry.is_directory {
            return Err(SyncError::IsDirectory(path.to_string()));
        }
        if entry.size < 0 {
            return Err(SyncError::MissingEntry(path.to_string()));
        }
        let content = self.transfer.fetch_text(path, entry.size as u64).await?;
        self.cache.put_content(path, &content).await?;
        self.open_file = Some(OpenFile {
            path: path.to_string(),
            basis_modified: entry.modified,
            is_new: false,
        });
        Ok(content)
    }

    /// Saves new content for `path`. Online saves upload immediately;
    /// offline saves (and online saves that fail for any reason except a
    /// busy transfer slot) are queued for replay and reported as `Queued`.
    pub async fn save_edit(&mut self, path: &str, content: &str) -> Result<SaveOutcome, SyncError> {
        let key = normalize_key(path);
        let (basis, is_new) = match self.open_file.as_ref() {
            Some(open) if normalize_key(&open.path) == key => (open.basis_modified, open.is_new),
            _ => {
                let basis = self
                    .lookup_cached_entry(path)
                    .await?
                    .map(|e| e.modified)
                    .unwrap_or(0);
                (basis, false)
            }
        };

        if self.is_online() {
            match self.transfer.upload(path, content).await {
                Ok(()) => {
                    self.cache.put_content(path, content).await?;
                    return Ok(SaveOutcome::Uploaded);
                }
                Err(TransferError::Busy) => return Err(TransferError::Busy.into()),
                Err(err) => {
                    eprintln!("[hubfs] upload of {path} failed, queueing edit: {err}");
                }
            }
        }

        self.pending
            .enqueue(PendingEdit {
                path: path.to_string(),
                content: content.to_string(),
                original_last_modified: basis,
                is_new_file: is_new,
            })
            .await?;
        self.cache.put_content(path, content).await?;
        Ok(SaveOutcome::Queued)
    }

    /// Creates an empty file in `dir` and returns its full path. The file
    /// is saved through [`save_edit`](Self::save_edit), so offline creation
    /// queues like any other edit.
    pub async fn create_file(&mut self, dir: &str, file_name: &str) -> Result<String, SyncError> {
        let separator = if dir.contains('\\') && !dir.contains('/') {
            '\\'
        } else {
            '/'
        };
        let path = if dir.is_empty() {
            file_name.to_string()
        } else {
            format!("{}{separator}{file_name}", dir.trim_end_matches(separator))
        };
        self.open_file = Some(OpenFile {
            path: path.clone(),
            basis_modified: 0,
            is_new: true,
        });
        self.save_edit(&path, "").await?;
        Ok(path)
    }

    /// Starts a chunked download of a remote file to a local path. Returns
    /// the progress receiver; a second concurrent download is refused.
    pub fn download(
        &self,
        entry: &DirEntry,
        target: &Path,
    ) -> Result<watch::Receiver<TransferProgress>, SyncError> {
        if entry.is_directory {
            return Err(SyncError::IsDirectory(entry.path.clone()));
        }
        if entry.size < 0 {
            return Err(SyncError::NotOnRemote(entry.path.clone()));
        }
        Ok(self
            .transfer
            .start_download(&entry.path, entry.size as u64, target)?)
    }

    pub async fn toggle_bookmark(&mut self, path: &str) -> Result<bool, SyncError> {
        if self.scope.is_bookmarked(path) {
            self.scope.remove(path).await?;
            return Ok(false);
        }
        let name = match display_name(path) {
            name if name.is_empty() => "Root".to_string(),
            name => name,
        };
        self.scope
            .add(Bookmark {
                name,
                path: path.to_string(),
            })
            .await?;
        Ok(true)
    }

    pub fn bookmarks(&self) -> &[Bookmark] {
        self.scope.list()
    }

    pub async fn move_bookmark_up(&mut self, index: usize) -> Result<(), SyncError> {
        Ok(self.scope.move_up(index).await?)
    }

    pub async fn move_bookmark_down(&mut self, index: usize) -> Result<(), SyncError> {
        Ok(self.scope.move_down(index).await?)
    }

    pub async fn pending_paths(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.pending.list_paths().await?)
    }

    pub fn is_recently_changed(&self, path: &str) -> bool {
        self.invalidator.is_recently_changed(path)
    }

    pub fn cancel_transfer(&self) {
        self.transfer.cancel();
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<TransferProgress> {
        self.transfer.subscribe()
    }

    async fn list_remote(&self, path: &str) -> Result<Vec<DirEntry>, SyncError> {
        let remote = tokio::time::timeout(self.config.list_timeout, self.client.list(path))
            .await
            .map_err(|_| SyncError::Timeout)??;
        Ok(remote.iter().map(DirEntry::from_remote).collect())
    }

    /// Folds queued edits into a listing: a queued edit whose file is not in
    /// the listing shows up as a placeholder with the size sentinel `-1`.
    async fn enrich(
        &self,
        dir: &str,
        mut entries: Vec<DirEntry>,
    ) -> Result<Vec<DirEntry>, StoreError> {
        let dir_key = normalize_key(dir);
        for edit in self.pending.list().await? {
            if normalize_key(&parent_of(&edit.path)) != dir_key {
                continue;
            }
            let name = display_name(&edit.path);
            if entries.iter().any(|e| e.name == name) {
                continue;
            }
            entries.push(DirEntry {
                name,
                path: edit.path,
                is_directory: false,
                size: -1,
                modified: edit.original_last_modified,
            });
        }
        sort_listing(&mut entries);
        Ok(entries)
    }

    async fn lookup_cached_entry(&self, path: &str) -> Result<Option<DirEntry>, StoreError> {
        let Some(entries) = self.cache.get(&parent_of(path)).await? else {
            return Ok(None);
        };
        let key = normalize_key(path);
        Ok(entries.into_iter().find(|e| normalize_key(&e.path) == key))
    }

    async fn lookup_entry(&self, path: &str) -> Result<DirEntry, SyncError> {
        if let Some(entry) = self.lookup_cached_entry(path).await? {
            return Ok(entry);
        }
        let entries = self.list_remote(&parent_of(path)).await?;
        let name = display_name(path);
        entries
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| SyncError::NotOnRemote(path.to_string()))
    }
}
