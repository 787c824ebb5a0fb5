//! Helpers for the hub's opaque remote paths.
//!
//! Remote paths may use `/` or `\` separators depending on the host; the
//! empty string is the browse root. Cache keys always use the normalized
//! form so the same directory is never cached twice under two spellings.

/// Normalizes a remote path for use as a cache key: separators unified to
/// `/`, leading and trailing separators stripped. The root normalizes to the
/// empty string.
pub fn normalize_key(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

/// Returns the parent of a remote path, splitting on `/` when present and on
/// `\` otherwise. Drive-letter roots such as `C:\` have no parent and yield
/// the empty (root) path.
pub fn parent_of(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let separator = if path.contains('/') { '/' } else { '\\' };
    if path.len() <= 3 && path.contains(':') {
        return String::new();
    }
    match path.rfind(separator) {
        Some(index) if index > 0 => {
            let parent = &path[..index];
            if parent.ends_with(':') {
                format!("{parent}{separator}")
            } else {
                parent.to_string()
            }
        }
        _ => String::new(),
    }
}

/// Last path segment, empty for the root.
pub fn display_name(path: &str) -> String {
    normalize_key(path)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn is_root(path: &str) -> bool {
    normalize_key(path).is_empty()
}
