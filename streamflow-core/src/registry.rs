//! Dead stream registry.
//!
//! Tracks streams judged dead in a JSON file keyed by stream URL. URLs are
//! used instead of names because multiple streams can share a name. The
//! registry only records verdicts; detaching a dead stream from its channel
//! is the pipeline's job.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::persist;

/// One dead-stream record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadStreamEntry {
    pub stream_id: i64,
    pub stream_name: String,
    #[serde(default)]
    pub channel_id: Option<i64>,
    pub marked_dead_at: DateTime<Utc>,
    pub url: String,
}

/// Persistent URL -> entry mapping with write-through saves.
///
/// A single mutex protects reads and writes; the durable write happens while
/// the lock is held so the file always matches memory.
pub struct DeadStreamRegistry {
    path: PathBuf,
    entries: Mutex<HashMap<String, DeadStreamEntry>>,
}

impl DeadStreamRegistry {
    /// Load the registry from `path`, starting empty when the file is
    /// missing or corrupt.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let entries: HashMap<String, DeadStreamEntry> = persist::load_state(&path);
        if !entries.is_empty() {
            info!(count = entries.len(), "Loaded dead stream registry");
        }
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn save(&self, entries: &HashMap<String, DeadStreamEntry>) {
        if let Err(err) = persist::save_state(&self.path, entries) {
            warn!(path = %self.path.display(), error = %err, "Failed to save dead stream registry");
        }
    }

    /// Record a dead verdict. Idempotent: re-marking an already dead URL
    /// leaves the registry with a single entry for it.
    pub fn mark_dead(&self, url: &str, stream_id: i64, stream_name: &str, channel_id: Option<i64>) {
        let mut entries = self.entries.lock();
        entries.insert(
            url.to_string(),
            DeadStreamEntry {
                stream_id,
                stream_name: stream_name.to_string(),
                channel_id,
                marked_dead_at: Utc::now(),
                url: url.to_string(),
            },
        );
        self.save(&entries);
        warn!(stream = %stream_name, url = %url, "Marked stream as dead");
    }

    /// Remove a URL from the registry. No error when absent.
    pub fn mark_alive(&self, url: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(url) {
            self.save(&entries);
            info!(stream = %entry.stream_name, url = %url, "Revived stream");
        } else {
            debug!(url = %url, "Stream not in dead list");
        }
    }

    #[must_use]
    pub fn is_dead(&self, url: &str) -> bool {
        self.entries.lock().contains_key(url)
    }

    /// Remove entries whose URL is no longer in the playlist.
    /// Returns the number removed. Invoked after each playlist refresh.
    pub fn cleanup(&self, current_urls: &HashSet<String>) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .keys()
            .filter(|url| !current_urls.contains(*url))
            .cloned()
            .collect();
        for url in &stale {
            entries.remove(url);
        }
        if !stale.is_empty() {
            self.save(&entries);
            info!(
                removed = stale.len(),
                "Cleaned up dead streams no longer in playlist"
            );
        }
        stale.len()
    }

    /// Remove all entries belonging to one channel's URL set so revived
    /// streams can be rediscovered. Invoked at the start of a single-channel
    /// force check.
    pub fn clear_for_channel(&self, channel_urls: &HashSet<String>) -> usize {
        let mut entries = self.entries.lock();
        let to_remove: Vec<String> = entries
            .keys()
            .filter(|url| channel_urls.contains(*url))
            .cloned()
            .collect();
        for url in &to_remove {
            entries.remove(url);
        }
        if !to_remove.is_empty() {
            self.save(&entries);
            info!(
                removed = to_remove.len(),
                "Removed dead streams for channel before refresh"
            );
        }
        to_remove.len()
    }

    /// Number of dead streams attributed to a channel; used by changelog
    /// reporting.
    #[must_use]
    pub fn count_for_channel(&self, channel_id: i64) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.channel_id == Some(channel_id))
            .count()
    }

    /// Copy of all entries
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, DeadStreamEntry> {
        self.entries.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, DeadStreamRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeadStreamRegistry::load(dir.path().join("dead_streams.json"));
        (dir, registry)
    }

    #[test]
    fn test_mark_dead_and_is_dead() {
        let (_dir, registry) = registry();
        assert!(!registry.is_dead("http://x/1"));

        registry.mark_dead("http://x/1", 101, "Stream One", Some(1));
        assert!(registry.is_dead("http://x/1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mark_dead_is_idempotent() {
        let (_dir, registry) = registry();
        registry.mark_dead("http://x/1", 101, "Stream One", Some(1));
        registry.mark_dead("http://x/1", 101, "Stream One", Some(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mark_alive_removes_and_tolerates_absent() {
        let (_dir, registry) = registry();
        registry.mark_dead("http://x/1", 101, "Stream One", None);
        registry.mark_alive("http://x/1");
        assert!(!registry.is_dead("http://x/1"));
        // absent URL is not an error
        registry.mark_alive("http://x/never");
    }

    #[test]
    fn test_cleanup_removes_stale_urls() {
        let (_dir, registry) = registry();
        registry.mark_dead("http://x/1", 101, "One", None);
        registry.mark_dead("http://x/2", 102, "Two", None);
        registry.mark_dead("http://x/3", 103, "Three", None);

        let current: HashSet<String> = ["http://x/1".to_string()].into_iter().collect();
        let removed = registry.cleanup(&current);
        assert_eq!(removed, 2);
        assert!(registry.is_dead("http://x/1"));
        assert!(!registry.is_dead("http://x/2"));
    }

    #[test]
    fn test_clear_for_channel() {
        let (_dir, registry) = registry();
        registry.mark_dead("http://x/4k", 201, "4K Feed", Some(16));
        registry.mark_dead("http://y/other", 301, "Other", Some(17));

        let channel_urls: HashSet<String> = ["http://x/4k".to_string()].into_iter().collect();
        let removed = registry.clear_for_channel(&channel_urls);
        assert_eq!(removed, 1);
        assert!(!registry.is_dead("http://x/4k"));
        assert!(registry.is_dead("http://y/other"));
    }

    #[test]
    fn test_count_for_channel() {
        let (_dir, registry) = registry();
        registry.mark_dead("http://x/1", 101, "One", Some(5));
        registry.mark_dead("http://x/2", 102, "Two", Some(5));
        registry.mark_dead("http://x/3", 103, "Three", Some(6));

        assert_eq!(registry.count_for_channel(5), 2);
        assert_eq!(registry.count_for_channel(6), 1);
        assert_eq!(registry.count_for_channel(7), 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_streams.json");
        {
            let registry = DeadStreamRegistry::load(path.clone());
            registry.mark_dead("http://x/1", 101, "One", Some(1));
        }
        let reloaded = DeadStreamRegistry::load(path);
        assert!(reloaded.is_dead("http://x/1"));
        assert_eq!(reloaded.snapshot()["http://x/1"].stream_id, 101);
    }
}
