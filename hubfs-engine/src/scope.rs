use serde::{Deserialize, Serialize};

use crate::paths::normalize_key;
use crate::store::{KvStore, StoreError};

pub const BOOKMARKS_KEY: &str = "bookmarks";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "schema")]
enum StoredBookmarks {
    #[serde(rename = "v1")]
    V1 { folders: Vec<Bookmark> },
}

/// Ordered list of bookmarked folders. Bookmarks double as the cache
/// admission policy: only listings inside a bookmarked subtree (or the root)
/// are worth persisting. Order is user-controlled and preserved.
pub struct BookmarkScope {
    store: KvStore,
    folders: Vec<Bookmark>,
}

impl BookmarkScope {
    /// Loads the persisted list; a missing or unreadable record starts empty.
    pub async fn load(store: KvStore) -> Result<Self, StoreError> {
        let folders = match store.get(BOOKMARKS_KEY).await? {
            Some(bytes) => match serde_json::from_slice::<StoredBookmarks>(&bytes) {
                Ok(StoredBookmarks::V1 { folders }) => folders,
                Err(err) => {
                    eprintln!("[hubfs] discarding unreadable bookmark record: {err}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        Ok(Self { store, folders })
    }

    pub fn list(&self) -> &[Bookmark] {
        &self.folders
    }

    pub fn is_bookmarked(&self, path: &str) -> bool {
        let key = normalize_key(path);
        self.folders.iter().any(|b| normalize_key(&b.path) == key)
    }

    /// True when `path` is the root, a bookmarked folder, or inside one.
    /// Comparison is case-insensitive to match the hub's path semantics.
    pub fn is_cacheable(&self, path: &str) -> bool {
        let key = normalize_key(path).to_ascii_lowercase();
        if key.is_empty() {
            return true;
        }
        self.folders.iter().any(|b| {
            let mark = normalize_key(&b.path).to_ascii_lowercase();
            key == mark || key.starts_with(&format!("{mark}/"))
        })
    }

    /// Appends a bookmark; duplicates (by normalized path) are a no-op.
    /// Returns whether the list changed.
    pub async fn add(&mut self, bookmark: Bookmark) -> Result<bool, StoreError> {
        if self.is_bookmarked(&bookmark.path) {
            return Ok(false);
        }
        self.folders.push(bookmark);
        self.persist().await?;
        Ok(true)
    }

    pub async fn remove(&mut self, path: &str) -> Result<bool, StoreError> {
        let key = normalize_key(path);
        let before = self.folders.len();
        self.folders.retain(|b| normalize_key(&b.path) != key);
        if self.folders.len() == before {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    pub async fn move_up(&mut self, index: usize) -> Result<(), StoreError> {
        if index == 0 || index >= self.folders.len() {
            return Ok(());
        }
        self.folders.swap(index, index - 1);
        self.persist().await
    }

    pub async fn move_down(&mut self, index: usize) -> Result<(), StoreError> {
        if index + 1 >= self.folders.len() {
            return Ok(());
        }
        self.folders.swap(index, index + 1);
        self.persist().await
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let record = StoredBookmarks::V1 {
            folders: self.folders.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.store.put(BOOKMARKS_KEY, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn make_store() -> KvStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = KvStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn mark(name: &str, path: &str) -> Bookmark {
        Bookmark {
            name: name.to_string(),
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn add_persists_and_dedupes() {
        let store = make_store().await;
        let mut scope = BookmarkScope::load(store.clone()).await.unwrap();
        assert!(scope.add(mark("Docs", "docs")).await.unwrap());
        assert!(!scope.add(mark("Docs again", "docs/")).await.unwrap());

        let reloaded = BookmarkScope::load(store).await.unwrap();
        assert_eq!(reloaded.list().len(), 1);
        assert_eq!(reloaded.list()[0].name, "Docs");
    }

    #[tokio::test]
    async fn remove_persists() {
        let store = make_store().await;
        let mut scope = BookmarkScope::load(store.clone()).await.unwrap();
        scope.add(mark("Docs", "docs")).await.unwrap();
        assert!(scope.remove("docs/").await.unwrap());
        assert!(!scope.remove("docs").await.unwrap());

        let reloaded = BookmarkScope::load(store).await.unwrap();
        assert!(reloaded.list().is_empty());
    }

    #[tokio::test]
    async fn cacheable_covers_root_and_subtrees() {
        let store = make_store().await;
        let mut scope = BookmarkScope::load(store).await.unwrap();
        scope.add(mark("Docs", "Docs")).await.unwrap();

        assert!(scope.is_cacheable(""));
        assert!(scope.is_cacheable("docs"));
        assert!(scope.is_cacheable("DOCS/notes"));
        assert!(scope.is_cacheable("docs\\notes\\deep"));
        assert!(!scope.is_cacheable("docsements"));
        assert!(!scope.is_cacheable("pictures"));
    }

    #[tokio::test]
    async fn reorder_preserves_user_order() {
        let store = make_store().await;
        let mut scope = BookmarkScope::load(store.clone()).await.unwrap();
        scope.add(mark("A", "a")).await.unwrap();
        scope.add(mark("B", "b")).await.unwrap();
        scope.add(mark("C", "c")).await.unwrap();

        scope.move_up(2).await.unwrap();
        scope.move_down(0).await.unwrap();
        let names: Vec<&str> = scope.list().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);

        // Out-of-range moves are no-ops.
        scope.move_up(0).await.unwrap();
        scope.move_down(2).await.unwrap();
        scope.move_up(9).await.unwrap();
        let names: Vec<&str> = scope.list().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);

        let reloaded = BookmarkScope::load(store).await.unwrap();
        let names: Vec<&str> = reloaded.list().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn malformed_record_starts_empty() {
        let store = make_store().await;
        store.put(BOOKMARKS_KEY, b"{broken").await.unwrap();
        let scope = BookmarkScope::load(store).await.unwrap();
        assert!(scope.list().is_empty());
    }
}
