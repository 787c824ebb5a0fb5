mod client;

pub use client::{EntryKind, HubClient, HubError, RemoteEntry};
