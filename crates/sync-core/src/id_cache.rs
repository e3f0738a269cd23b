//! Remote id → local path cache.
//!
//! Avoids scanning the whole sync folder to find the file that holds a given
//! remote note. Entries go stale when files are renamed or deleted outside the
//! sync; nothing invalidates them proactively. Callers use [`IdCache::resolve`],
//! which checks the file's front matter before trusting an entry, and fall back
//! to [`IdCache::rebuild`] on a miss.

use crate::frontmatter;
use crate::fs::{self, FileSystem};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdCache {
    entries: BTreeMap<String, String>,
}

impl IdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw cache lookup. The entry may be stale.
    pub fn lookup(&self, remote_id: &str) -> Option<&str> {
        self.entries.get(remote_id).map(String::as_str)
    }

    /// Insert or replace the path for `remote_id`.
    pub fn record(&mut self, remote_id: impl Into<String>, path: impl Into<String>) {
        self.entries.insert(remote_id.into(), path.into());
    }

    pub fn remove(&mut self, remote_id: &str) -> Option<String> {
        self.entries.remove(remote_id)
    }

    /// Look up `remote_id` and confirm the file still claims it.
    ///
    /// Stale entries (missing file, front matter pointing elsewhere) are
    /// dropped and reported as a miss.
    pub async fn resolve<F: FileSystem + ?Sized>(&mut self, fs: &F, remote_id: &str) -> Option<String> {
        let path = self.lookup(remote_id)?.to_string();

        let claims_id = match fs.read_to_string(&path).await {
            Ok(text) => frontmatter::decode(&text)
                .is_some_and(|note| note.front_matter.remote_id() == Some(remote_id)),
            Err(_) => false,
        };

        if claims_id {
            Some(path)
        } else {
            debug!(remote_id, path = %path, "Dropping stale id cache entry");
            self.remove(remote_id);
            None
        }
    }

    /// Rebuild the cache from every note under `folder`.
    ///
    /// Files that cannot be read are skipped; the previous contents are
    /// replaced entirely.
    pub async fn rebuild<F: FileSystem + ?Sized>(&mut self, fs: &F, folder: &str) -> fs::Result<usize> {
        let files = fs::list_markdown_files(fs, folder).await?;
        let mut entries = BTreeMap::new();

        for path in files {
            let text = match fs.read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping unreadable note during id cache rebuild");
                    continue;
                }
            };
            if let Some(id) = frontmatter::decode(&text)
                .and_then(|note| note.front_matter.remote_id().map(str::to_string))
            {
                if let Some(previous) = entries.insert(id.clone(), path.clone()) {
                    warn!(remote_id = %id, first = %previous, second = %path, "Remote id claimed by two notes");
                }
            }
        }

        debug!(folder, entries = entries.len(), "Rebuilt id cache");
        self.entries = entries;
        Ok(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    async fn note(fs: &InMemoryFs, path: &str, remote_id: &str) {
        let text = format!("---\nremote_id: {}\ntitle: t\n---\n\nbody", remote_id);
        fs.write(path, text.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_valid_entry() {
        let fs = InMemoryFs::new();
        note(&fs, "Sync/a.md", "id-a").await;

        let mut cache = IdCache::new();
        cache.record("id-a", "Sync/a.md");

        assert_eq!(cache.resolve(&fs, "id-a").await.as_deref(), Some("Sync/a.md"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_drops_entry_for_missing_file() {
        let fs = InMemoryFs::new();
        let mut cache = IdCache::new();
        cache.record("id-a", "Sync/gone.md");

        assert!(cache.resolve(&fs, "id-a").await.is_none());
        assert!(cache.lookup("id-a").is_none());
    }

    #[tokio::test]
    async fn test_resolve_drops_entry_when_front_matter_disagrees() {
        let fs = InMemoryFs::new();
        note(&fs, "Sync/a.md", "someone-else").await;

        let mut cache = IdCache::new();
        cache.record("id-a", "Sync/a.md");

        assert!(cache.resolve(&fs, "id-a").await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_scans_folder() {
        let fs = InMemoryFs::new();
        note(&fs, "Sync/a.md", "id-a").await;
        note(&fs, "Sync/work/b.md", "id-b").await;
        fs.write("Sync/plain.md", b"no front matter").await.unwrap();
        note(&fs, "Elsewhere/c.md", "id-c").await;

        let mut cache = IdCache::new();
        cache.record("stale", "Sync/old.md");

        let count = cache.rebuild(&fs, "Sync").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(cache.lookup("id-a"), Some("Sync/a.md"));
        assert_eq!(cache.lookup("id-b"), Some("Sync/work/b.md"));
        assert!(cache.lookup("id-c").is_none());
        assert!(cache.lookup("stale").is_none());
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut cache = IdCache::new();
        cache.record("1", "Sync/one.md");
        let json = serde_json::to_string(&cache).unwrap();
        assert_eq!(json, r#"{"1":"Sync/one.md"}"#);
        let back: IdCache = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cache);
    }
}
