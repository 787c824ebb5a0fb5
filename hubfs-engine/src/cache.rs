use std::collections::BTreeSet;

use hubfs_core::{EntryKind, RemoteEntry};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::paths::{normalize_key, parent_of};
use crate::store::{KvStore, StoreError};

pub const LISTING_PREFIX: &str = "cache_";
pub const CONTENT_PREFIX: &str = "content_";

/// Directory entry as the engine and its consumers see it.
///
/// `size == -1` marks a file that was created locally while offline and has
/// not been confirmed to exist remotely yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: i64,
    pub modified: i64,
}

impl DirEntry {
    pub fn from_remote(remote: &RemoteEntry) -> Self {
        Self {
            name: remote.name.clone(),
            path: remote.path.clone(),
            is_directory: remote.kind == EntryKind::Dir,
            size: remote.size.map(|v| v as i64).unwrap_or(0),
            modified: parse_modified(remote.modified.as_deref()),
        }
    }

    fn parent_link(of: &str) -> Self {
        Self {
            name: "..".to_string(),
            path: parent_of(of),
            is_directory: true,
            size: 0,
            modified: 0,
        }
    }

    fn synthesized_dir(name: String, path: String) -> Self {
        Self {
            name,
            path,
            is_directory: true,
            size: 0,
            modified: 0,
        }
    }
}

/// Unix timestamp of a remote RFC3339 `modified` stamp; 0 when absent or
/// unreadable, which always loses a conflict comparison (the safe direction).
pub fn parse_modified(value: Option<&str>) -> i64 {
    value
        .and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok())
        .map(|t| t.unix_timestamp())
        .unwrap_or(0)
}

/// `".."` first, then directories, then files, names ascending (ordinal).
pub fn sort_listing(entries: &mut [DirEntry]) {
    fn rank(entry: &DirEntry) -> u8 {
        if entry.name == ".." {
            0
        } else if entry.is_directory {
            1
        } else {
            2
        }
    }
    entries.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name)));
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "schema")]
enum StoredListing {
    #[serde(rename = "v1")]
    V1 {
        cached_at: i64,
        entries: Vec<DirEntry>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "schema")]
enum StoredText {
    #[serde(rename = "v1")]
    V1 { saved_at: i64, content: String },
}

/// Persistent last-known directory listings plus the text bodies of files
/// opened for editing. Keys are normalized paths; records are replaced
/// wholesale, never patched. The cache has no notion of bookmark scope;
/// admission policy is the orchestrator's job.
#[derive(Clone)]
pub struct PathCache {
    store: KvStore,
}

impl PathCache {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub async fn put(&self, path: &str, entries: &[DirEntry]) -> Result<(), StoreError> {
        let record = StoredListing::V1 {
            cached_at: now_unix(),
            entries: entries.to_vec(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.store.put(&listing_key(path), &bytes).await
    }

    pub async fn get(&self, path: &str) -> Result<Option<Vec<DirEntry>>, StoreError> {
        let Some(bytes) = self.store.get(&listing_key(path)).await? else {
            return Ok(None);
        };
        let Some(mut entries) = decode_listing(path, &bytes) else {
            return Ok(None);
        };
        sort_listing(&mut entries);
        Ok(Some(entries))
    }

    /// Exact lookup, falling back to a listing synthesized from deeper cached
    /// paths: one directory entry per distinct immediate child segment that
    /// leads toward a cached descendant, plus a `".."` link unless `path` is
    /// the root. `None` when neither exists.
    pub async fn get_or_synthesize(&self, path: &str) -> Result<Option<Vec<DirEntry>>, StoreError> {
        if let Some(entries) = self.get(path).await? {
            return Ok(Some(entries));
        }

        let key = normalize_key(path);
        let descendant_prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };

        let mut children: BTreeSet<String> = BTreeSet::new();
        for stored in self.store.keys_with_prefix(LISTING_PREFIX).await? {
            let cached = &stored[LISTING_PREFIX.len()..];
            if cached.len() <= descendant_prefix.len() || !cached.starts_with(&descendant_prefix) {
                continue;
            }
            let rest = &cached[descendant_prefix.len()..];
            let segment = rest.split('/').next().unwrap_or(rest);
            if !segment.is_empty() {
                children.insert(segment.to_string());
            }
        }
        if children.is_empty() {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(children.len() + 1);
        if !key.is_empty() {
            entries.push(DirEntry::parent_link(path));
        }
        for segment in children {
            let child_path = if key.is_empty() {
                segment.clone()
            } else {
                format!("{key}/{segment}")
            };
            entries.push(DirEntry::synthesized_dir(segment, child_path));
        }
        sort_listing(&mut entries);
        Ok(Some(entries))
    }

    /// Removes the exact record only; descendant records stay.
    pub async fn evict(&self, path: &str) -> Result<(), StoreError> {
        self.store.delete(&listing_key(path)).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        for key in self.store.keys_with_prefix(LISTING_PREFIX).await? {
            self.store.delete(&key).await?;
        }
        for key in self.store.keys_with_prefix(CONTENT_PREFIX).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    pub async fn list_cached_paths(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.store.keys_with_prefix(LISTING_PREFIX).await?;
        Ok(keys
            .into_iter()
            .map(|key| key[LISTING_PREFIX.len()..].to_string())
            .collect())
    }

    pub async fn put_content(&self, path: &str, content: &str) -> Result<(), StoreError> {
        let record = StoredText::V1 {
            saved_at: now_unix(),
            content: content.to_string(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.store.put(&content_key(path), &bytes).await
    }

    pub async fn get_content(&self, path: &str) -> Result<Option<String>, StoreError> {
        let Some(bytes) = self.store.get(&content_key(path)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<StoredText>(&bytes) {
            Ok(StoredText::V1 { content, .. }) => Ok(Some(content)),
            Err(err) => {
                eprintln!("[hubfs] discarding unreadable content record for {path}: {err}");
                Ok(None)
            }
        }
    }

    pub async fn evict_content(&self, path: &str) -> Result<(), StoreError> {
        self.store.delete(&content_key(path)).await
    }
}

fn listing_key(path: &str) -> String {
    format!("{LISTING_PREFIX}{}", normalize_key(path))
}

fn content_key(path: &str) -> String {
    format!("{CONTENT_PREFIX}{}", normalize_key(path))
}

fn decode_listing(path: &str, bytes: &[u8]) -> Option<Vec<DirEntry>> {
    match serde_json::from_slice::<StoredListing>(bytes) {
        Ok(StoredListing::V1 { entries, .. }) => Some(entries),
        Err(err) => {
            eprintln!("[hubfs] discarding unreadable cache record for {path}: {err}");
            None
        }
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn make_cache() -> PathCache {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = KvStore::from_pool(pool);
        store.init().await.unwrap();
        PathCache::new(store)
    }

    fn file(name: &str, dir: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            path: if dir.is_empty() {
                name.to_string()
            } else {
                format!("{dir}/{name}")
            },
            is_directory: false,
            size: 10,
            modified: 1_700_000_000,
        }
    }

    fn dir(name: &str, parent: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            path: if parent.is_empty() {
                name.to_string()
            } else {
                format!("{parent}/{name}")
            },
            is_directory: true,
            size: 0,
            modified: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn put_and_get_replaces_wholesale() {
        let cache = make_cache().await;
        cache.put("docs", &[file("a.txt", "docs")]).await.unwrap();
        cache.put("docs", &[file("b.txt", "docs")]).await.unwrap();

        let entries = cache.get("docs").await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b.txt");
    }

    #[tokio::test]
    async fn keys_are_normalized() {
        let cache = make_cache().await;
        cache
            .put("docs\\notes\\", &[file("a.txt", "docs/notes")])
            .await
            .unwrap();

        assert!(cache.get("docs/notes").await.unwrap().is_some());
        assert_eq!(cache.list_cached_paths().await.unwrap(), vec!["docs/notes"]);
    }

    #[tokio::test]
    async fn listings_are_sorted_dirs_first() {
        let cache = make_cache().await;
        cache
            .put(
                "docs",
                &[
                    file("z.txt", "docs"),
                    dir("b", "docs"),
                    file("a.txt", "docs"),
                    dir("c", "docs"),
                ],
            )
            .await
            .unwrap();

        let names: Vec<String> = cache
            .get("docs")
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b", "c", "a.txt", "z.txt"]);
    }

    #[tokio::test]
    async fn synthesizes_intermediate_directory() {
        let cache = make_cache().await;
        cache
            .put("docs/notes", &[file("a.txt", "docs/notes")])
            .await
            .unwrap();

        let entries = cache.get_or_synthesize("docs").await.unwrap().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["..", "notes"]);
        assert_eq!(entries[0].path, "");
        assert_eq!(entries[1].path, "docs/notes");
        assert!(entries[1].is_directory);
    }

    #[tokio::test]
    async fn synthesized_root_has_no_parent_link() {
        let cache = make_cache().await;
        cache
            .put("docs/notes", &[file("a.txt", "docs/notes")])
            .await
            .unwrap();

        let entries = cache.get_or_synthesize("").await.unwrap().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs"]);
    }

    #[tokio::test]
    async fn synthesis_excludes_unrelated_siblings() {
        let cache = make_cache().await;
        cache
            .put("docs/notes/deep", &[file("a.txt", "docs/notes/deep")])
            .await
            .unwrap();
        cache
            .put("pictures", &[file("cat.png", "pictures")])
            .await
            .unwrap();

        let entries = cache.get_or_synthesize("docs").await.unwrap().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["..", "notes"]);
    }

    #[tokio::test]
    async fn no_match_and_no_descendants_is_none() {
        let cache = make_cache().await;
        cache
            .put("pictures", &[file("cat.png", "pictures")])
            .await
            .unwrap();

        assert!(cache.get_or_synthesize("docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evict_does_not_cascade() {
        let cache = make_cache().await;
        cache.put("docs", &[dir("notes", "docs")]).await.unwrap();
        cache
            .put("docs/notes", &[file("a.txt", "docs/notes")])
            .await
            .unwrap();

        cache.evict("docs").await.unwrap();
        assert!(cache.get("docs").await.unwrap().is_none());
        assert!(cache.get("docs/notes").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_removes_listings_and_content() {
        let cache = make_cache().await;
        cache.put("docs", &[file("a.txt", "docs")]).await.unwrap();
        cache.put_content("docs/a.txt", "hello").await.unwrap();

        cache.clear().await.unwrap();
        assert!(cache.get("docs").await.unwrap().is_none());
        assert!(cache.get_content("docs/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_record_is_a_miss() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = KvStore::from_pool(pool);
        store.init().await.unwrap();
        store.put("cache_docs", b"{not json").await.unwrap();
        store
            .put("content_docs/a.txt", b"{\"schema\":\"v9\"}")
            .await
            .unwrap();

        let cache = PathCache::new(store);
        assert!(cache.get("docs").await.unwrap().is_none());
        assert!(cache.get_content("docs/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_roundtrip() {
        let cache = make_cache().await;
        cache.put_content("docs/a.txt", "hello").await.unwrap();
        assert_eq!(
            cache.get_content("docs/a.txt").await.unwrap().as_deref(),
            Some("hello")
        );

        cache.evict_content("docs/a.txt").await.unwrap();
        assert!(cache.get_content("docs/a.txt").await.unwrap().is_none());
    }

    #[test]
    fn parse_modified_is_lenient() {
        assert_eq!(parse_modified(Some("2024-01-01T00:00:00Z")), 1_704_067_200);
        assert_eq!(parse_modified(Some("not a date")), 0);
        assert_eq!(parse_modified(None), 0);
    }
}
