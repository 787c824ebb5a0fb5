use std::path::{Path, PathBuf};
use std::string::FromUtf8Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use hubfs_core::{HubClient, HubError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const DEFAULT_BINARY_CHUNK: u32 = 64 * 1024;
const DEFAULT_TEXT_CHUNK: u32 = 128 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] HubError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("a transfer is already running")]
    Busy,
    #[error("transfer cancelled")]
    Aborted,
    #[error("remote file ended early at {offset} of {total} bytes")]
    Truncated { offset: u64, total: u64 },
    #[error("remote file is not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub binary_chunk_size: u32,
    pub text_chunk_size: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            binary_chunk_size: read_limit("HUBFS_BINARY_CHUNK_BYTES", DEFAULT_BINARY_CHUNK),
            text_chunk_size: read_limit("HUBFS_TEXT_CHUNK_BYTES", DEFAULT_TEXT_CHUNK),
        }
    }
}

fn read_limit(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Snapshot published on the progress channel after every chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferProgress {
    Idle,
    Running {
        path: String,
        percent: i64,
        rate: String,
        transferred: u64,
        total: u64,
    },
    Done {
        path: String,
    },
    Failed {
        path: String,
        error: String,
    },
}

/// Human-readable throughput with decimal unit thresholds.
pub fn format_rate(bytes_per_second: f64) -> String {
    if bytes_per_second >= 1e9 {
        format!("{:.2} GB/s", bytes_per_second / 1e9)
    } else if bytes_per_second >= 1e6 {
        format!("{:.2} MB/s", bytes_per_second / 1e6)
    } else if bytes_per_second >= 1e3 {
        format!("{:.2} KB/s", bytes_per_second / 1e3)
    } else {
        format!("{bytes_per_second:.2} B/s")
    }
}

struct TransferSession {
    target_path: String,
    total_size: u64,
    transferred: u64,
    started_at: Instant,
}

impl TransferSession {
    fn new(target_path: &str, total_size: u64) -> Self {
        Self {
            target_path: target_path.to_string(),
            total_size,
            transferred: 0,
            started_at: Instant::now(),
        }
    }

    fn advance(&mut self, bytes: u64) -> TransferProgress {
        self.transferred += bytes;
        let percent = if self.total_size == 0 {
            100
        } else {
            (self.transferred * 100 / self.total_size) as i64
        };
        let elapsed = self.started_at.elapsed().as_secs_f64().max(1e-6);
        TransferProgress::Running {
            path: self.target_path.clone(),
            percent,
            rate: format_rate(self.transferred as f64 / elapsed),
            transferred: self.transferred,
            total: self.total_size,
        }
    }
}

/// Drives chunked reads against the hub. At most one transfer runs at a
/// time; a second caller gets `Busy` immediately rather than a queue slot.
/// Downloads land in a `.partial` sibling and are renamed into place only
/// after the last byte is flushed.
#[derive(Clone)]
pub struct ChunkedTransferEngine {
    client: HubClient,
    config: TransferConfig,
    active: Arc<AtomicBool>,
    progress: Arc<watch::Sender<TransferProgress>>,
    cancel: Arc<std::sync::Mutex<CancellationToken>>,
}

/// Holds the single-transfer slot; dropping it frees the slot even when the
/// transfer task panics or is aborted.
struct ActiveGuard {
    active: Arc<AtomicBool>,
}

impl ActiveGuard {
    fn acquire(active: &Arc<AtomicBool>) -> Result<Self, TransferError> {
        if active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransferError::Busy);
        }
        Ok(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

impl ChunkedTransferEngine {
    pub fn new(client: HubClient) -> Self {
        Self::with_config(client, TransferConfig::default())
    }

    pub fn with_config(client: HubClient, config: TransferConfig) -> Self {
        let (progress, _) = watch::channel(TransferProgress::Idle);
        Self {
            client,
            config,
            active: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(progress),
            cancel: Arc::new(std::sync::Mutex::new(CancellationToken::new())),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Requests cancellation of the running transfer, if any. The transfer
    /// stops at the next chunk boundary and reports `Aborted`.
    pub fn cancel(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    fn fresh_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(mut slot) => {
                *slot = CancellationToken::new();
                slot.clone()
            }
            Err(_) => CancellationToken::new(),
        }
    }

    /// Downloads `path` (whose remote size is `total_size`) to `target`,
    /// blocking the caller until it finishes. Progress is published on the
    /// watch channel throughout.
    pub async fn download_to_path(
        &self,
        path: &str,
        total_size: u64,
        target: &Path,
    ) -> Result<(), TransferError> {
        let _guard = ActiveGuard::acquire(&self.active)?;
        let token = self.fresh_token();
        self.run_download(path, total_size, target, token).await
    }

    /// Like [`download_to_path`](Self::download_to_path) but returns as soon
    /// as the transfer is admitted; callers follow the returned receiver for
    /// completion. The `Busy` check happens before this returns.
    pub fn start_download(
        &self,
        path: &str,
        total_size: u64,
        target: &Path,
    ) -> Result<watch::Receiver<TransferProgress>, TransferError> {
        let guard = ActiveGuard::acquire(&self.active)?;
        let token = self.fresh_token();
        let engine = self.clone();
        let path = path.to_string();
        let target = target.to_path_buf();
        let receiver = self.progress.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            let _ = engine.run_download(&path, total_size, &target, token).await;
        });
        Ok(receiver)
    }

    /// Fetches a text file into memory using the larger text chunk size.
    pub async fn fetch_text(&self, path: &str, total_size: u64) -> Result<String, TransferError> {
        let _guard = ActiveGuard::acquire(&self.active)?;
        let token = self.fresh_token();
        let mut session = TransferSession::new(path, total_size);
        let mut buffer = Vec::with_capacity(total_size as usize);
        let result = self
            .read_chunks(&mut session, self.config.text_chunk_size, token, |chunk| {
                buffer.extend_from_slice(chunk);
            })
            .await;
        match result {
            Ok(()) => {
                let text = String::from_utf8(buffer)?;
                self.publish(TransferProgress::Done {
                    path: path.to_string(),
                });
                Ok(text)
            }
            Err(err) => {
                self.publish(TransferProgress::Failed {
                    path: path.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Pushes new file content to the hub. Uploads hold the same transfer
    /// slot as downloads.
    pub async fn upload(&self, path: &str, content: &str) -> Result<(), TransferError> {
        let _guard = ActiveGuard::acquire(&self.active)?;
        self.client.write(path, content).await?;
        Ok(())
    }

    async fn run_download(
        &self,
        path: &str,
        total_size: u64,
        target: &Path,
        token: CancellationToken,
    ) -> Result<(), TransferError> {
        match self.download_inner(path, total_size, target, token).await {
            Ok(()) => {
                self.publish(TransferProgress::Done {
                    path: path.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                eprintln!("[hubfs] download of {path} failed: {err}");
                self.publish(TransferProgress::Failed {
                    path: path.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn download_inner(
        &self,
        path: &str,
        total_size: u64,
        target: &Path,
        token: CancellationToken,
    ) -> Result<(), TransferError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = fs::File::create(&partial).await?;

        let mut session = TransferSession::new(path, total_size);
        let result = self
            .stream_to_file(&mut session, &mut file, token)
            .await;
        if let Err(err) = result {
            drop(file);
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&partial, target).await?;
        Ok(())
    }

    async fn stream_to_file(
        &self,
        session: &mut TransferSession,
        file: &mut fs::File,
        token: CancellationToken,
    ) -> Result<(), TransferError> {
        let chunk_size = self.config.binary_chunk_size;
        while session.transferred < session.total_size {
            if token.is_cancelled() {
                return Err(TransferError::Aborted);
            }
            let remaining = session.total_size - session.transferred;
            let length = remaining.min(chunk_size as u64) as u32;
            let chunk = self
                .client
                .read_chunk(&session.target_path, session.transferred, length)
                .await?;
            if chunk.is_empty() {
                return Err(TransferError::Truncated {
                    offset: session.transferred,
                    total: session.total_size,
                });
            }
            file.write_all(&chunk).await?;
            let update = session.advance(chunk.len() as u64);
            self.publish(update);
        }
        if session.total_size == 0 {
            let update = session.advance(0);
            self.publish(update);
        }
        Ok(())
    }

    async fn read_chunks(
        &self,
        session: &mut TransferSession,
        chunk_size: u32,
        token: CancellationToken,
        mut sink: impl FnMut(&[u8]),
    ) -> Result<(), TransferError> {
        while session.transferred < session.total_size {
            if token.is_cancelled() {
                return Err(TransferError::Aborted);
            }
            let remaining = session.total_size - session.transferred;
            let length = remaining.min(chunk_size as u64) as u32;
            let chunk = self
                .client
                .read_chunk(&session.target_path, session.transferred, length)
                .await?;
            if chunk.is_empty() {
                return Err(TransferError::Truncated {
                    offset: session.transferred,
                    total: session.total_size,
                });
            }
            sink(&chunk);
            let update = session.advance(chunk.len() as u64);
            self.publish(update);
        }
        Ok(())
    }

    fn publish(&self, progress: TransferProgress) {
        let _ = self.progress.send(progress);
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}
