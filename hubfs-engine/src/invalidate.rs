use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::cache::PathCache;
use crate::paths::{display_name, normalize_key, parent_of};
use crate::store::StoreError;

/// How long a remotely-changed path is flagged for consumers that want to
/// highlight fresh changes.
pub const HIGHLIGHT_WINDOW: Duration = Duration::from_secs(3);

/// What a consumer should do after a remote change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Parent directory whose listing is now stale.
    pub parent: String,
    /// Set when the changed file is the one currently open for editing.
    pub stale_open: Option<String>,
    /// True when the parent is the directory currently on screen.
    pub refresh_parent: bool,
}

/// Translates remote change notifications into cache evictions and tracks
/// which paths changed recently.
pub struct ChangeInvalidator {
    recent: HashMap<String, Instant>,
    window: Duration,
}

impl ChangeInvalidator {
    pub fn new() -> Self {
        Self::with_window(HIGHLIGHT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            recent: HashMap::new(),
            window,
        }
    }

    /// Evicts the changed file's cached content and its parent's listing,
    /// marks the path recently changed, and reports what else is affected.
    pub async fn on_remote_change(
        &mut self,
        cache: &PathCache,
        path: &str,
        open_path: Option<&str>,
        current_dir: Option<&str>,
    ) -> Result<Invalidation, StoreError> {
        cache.evict_content(path).await?;
        let parent = parent_of(path);
        cache.evict(&parent).await?;
        self.mark(path);

        let key = normalize_key(path);
        let stale_open = open_path
            .filter(|open| normalize_key(open) == key)
            .map(|_| display_name(path));
        let refresh_parent =
            current_dir.is_some_and(|dir| normalize_key(dir) == normalize_key(&parent));
        Ok(Invalidation {
            parent,
            stale_open,
            refresh_parent,
        })
    }

    pub fn is_recently_changed(&self, path: &str) -> bool {
        self.recent
            .get(&normalize_key(path))
            .is_some_and(|at| at.elapsed() < self.window)
    }

    fn mark(&mut self, path: &str) {
        let window = self.window;
        self.recent.retain(|_, at| at.elapsed() < window);
        self.recent.insert(normalize_key(path), Instant::now());
    }
}

impl Default for ChangeInvalidator {
    fn default() -> Self {
        Self::new()
    }
}
