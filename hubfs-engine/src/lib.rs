//! Offline-first sync engine for the hub file service.
//!
//! The engine keeps a durable cache of directory listings and file bodies,
//! scoped to bookmarked folders, and replays edits made while offline once
//! the hub is reachable again. [`engine::SyncOrchestrator`] is the main
//! entry point; the other modules are usable on their own.

pub mod cache;
pub mod engine;
pub mod invalidate;
pub mod paths;
pub mod pending;
pub mod scope;
pub mod store;
pub mod transfer;

pub use cache::{DirEntry, PathCache};
pub use engine::{
    ConsumerEvent, EngineConfig, HubEvent, SaveOutcome, SyncError, SyncOrchestrator, SyncState,
};
pub use invalidate::ChangeInvalidator;
pub use pending::{DrainReport, PendingEdit, PendingEditQueue};
pub use scope::{Bookmark, BookmarkScope};
pub use store::{KvStore, StoreError};
pub use transfer::{ChunkedTransferEngine, TransferConfig, TransferError, TransferProgress};
