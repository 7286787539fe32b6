//! In-memory content buffer
//!
//! Holds the latest content per document together with an update counter and
//! the time of the last distinct update. Writers for the same id are
//! serialized by a single map lock, so concurrent writers always leave one
//! complete value behind.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;

use crate::document::{ContentHash, DEFAULT_LARGE_CONTENT_THRESHOLD};

/// Snapshot of a buffered document
#[derive(Debug, Clone)]
pub struct BufferedContent {
    /// Document the content belongs to
    pub document_id: String,
    /// Latest content
    pub content: String,
    /// Number of distinct updates seen
    pub update_count: u64,
    /// Wall-clock time of the last distinct update
    pub timestamp: DateTime<Utc>,
    /// Hash of the content, kept only for large payloads
    pub content_hash: Option<ContentHash>,
    updated_at: Instant,
}

/// Outcome of [`ContentBuffer::buffer_content`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUpdate {
    /// The id was empty; nothing was stored
    Ignored,
    /// Content matched the buffered value; counter untouched
    Unchanged,
    /// Content replaced; carries the new update count
    Updated(u64),
}

impl BufferUpdate {
    /// Whether the buffered value changed
    pub fn changed(&self) -> bool {
        matches!(self, BufferUpdate::Updated(_))
    }
}

/// Per-document latest-content store
#[derive(Debug)]
pub struct ContentBuffer {
    entries: RwLock<HashMap<String, BufferedContent>>,
    large_threshold: usize,
}

impl Default for ContentBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentBuffer {
    /// Create a buffer with the default large-content threshold
    pub fn new() -> Self {
        Self::with_large_threshold(DEFAULT_LARGE_CONTENT_THRESHOLD)
    }

    /// Create a buffer that hashes payloads larger than `large_threshold` bytes
    pub fn with_large_threshold(large_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            large_threshold,
        }
    }

    /// Store content for a document
    ///
    /// Empty ids are ignored. Identical content does not bump the counter.
    pub fn buffer_content(&self, id: &str, content: &str) -> BufferUpdate {
        if id.trim().is_empty() {
            return BufferUpdate::Ignored;
        }

        let hash = (content.len() > self.large_threshold).then(|| ContentHash::of(content));

        let mut entries = self.entries.write();
        match entries.get_mut(id) {
            Some(entry) => {
                let same = entry.content.len() == content.len()
                    && match (hash, entry.content_hash) {
                        (Some(new), Some(old)) => new == old,
                        _ => entry.content == content,
                    };
                if same {
                    trace!(document_id = id, "Buffered content unchanged");
                    return BufferUpdate::Unchanged;
                }
                entry.content = content.to_string();
                entry.content_hash = hash;
                entry.update_count += 1;
                entry.timestamp = Utc::now();
                entry.updated_at = Instant::now();
                BufferUpdate::Updated(entry.update_count)
            }
            None => {
                entries.insert(
                    id.to_string(),
                    BufferedContent {
                        document_id: id.to_string(),
                        content: content.to_string(),
                        update_count: 1,
                        timestamp: Utc::now(),
                        content_hash: hash,
                        updated_at: Instant::now(),
                    },
                );
                BufferUpdate::Updated(1)
            }
        }
    }

    /// Latest content for a document, if buffered
    pub fn get_latest_content(&self, id: &str) -> Option<String> {
        self.entries.read().get(id).map(|e| e.content.clone())
    }

    /// Full metadata record for a document
    pub fn get_buffered_content(&self, id: &str) -> Option<BufferedContent> {
        self.entries.read().get(id).cloned()
    }

    /// Update counter for a document (0 when not buffered)
    pub fn update_count(&self, id: &str) -> u64 {
        self.entries.read().get(id).map(|e| e.update_count).unwrap_or(0)
    }

    /// Remove a document from the buffer
    pub fn clear_buffer(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    /// Number of buffered documents
    pub fn buffer_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Time elapsed since the last distinct update
    pub fn buffer_age(&self, id: &str) -> Option<Duration> {
        self.entries.read().get(id).map(|e| e.updated_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_identical_content_counts_once() {
        let buffer = ContentBuffer::new();
        for _ in 0..5 {
            buffer.buffer_content("doc", "same text");
        }
        let record = buffer.get_buffered_content("doc").unwrap();
        assert_eq!(record.update_count, 1);
        assert_eq!(record.content, "same text");
    }

    #[test]
    fn test_distinct_updates_increment() {
        let buffer = ContentBuffer::new();
        assert_eq!(buffer.buffer_content("doc", "a"), BufferUpdate::Updated(1));
        assert_eq!(buffer.buffer_content("doc", "b"), BufferUpdate::Updated(2));
        assert_eq!(buffer.buffer_content("doc", "b"), BufferUpdate::Unchanged);
        assert_eq!(buffer.update_count("doc"), 2);
    }

    #[test]
    fn test_empty_id_is_ignored() {
        let buffer = ContentBuffer::new();
        assert_eq!(buffer.buffer_content("", "x"), BufferUpdate::Ignored);
        assert_eq!(buffer.buffer_content("   ", "x"), BufferUpdate::Ignored);
        assert_eq!(buffer.buffer_count(), 0);
    }

    #[test]
    fn test_missing_returns_none() {
        let buffer = ContentBuffer::new();
        assert!(buffer.get_latest_content("nope").is_none());
        assert!(buffer.buffer_age("nope").is_none());
    }

    #[test]
    fn test_clear_and_count() {
        let buffer = ContentBuffer::new();
        buffer.buffer_content("a", "1");
        buffer.buffer_content("b", "2");
        assert_eq!(buffer.buffer_count(), 2);
        assert!(buffer.clear_buffer("a"));
        assert!(!buffer.clear_buffer("a"));
        assert_eq!(buffer.buffer_count(), 1);
        assert!(buffer.get_latest_content("a").is_none());
    }

    #[test]
    fn test_large_payload_uses_hash() {
        let buffer = ContentBuffer::with_large_threshold(1024);
        let big = "z".repeat(4096);
        buffer.buffer_content("doc", &big);
        assert!(buffer.get_buffered_content("doc").unwrap().content_hash.is_some());
        assert_eq!(buffer.buffer_content("doc", &big), BufferUpdate::Unchanged);

        let mut changed = big.clone();
        changed.replace_range(2000..2001, "q");
        assert_eq!(buffer.buffer_content("doc", &changed), BufferUpdate::Updated(2));
    }

    #[test]
    fn test_buffer_age_tracks_wall_clock() {
        let buffer = ContentBuffer::new();
        buffer.buffer_content("doc", "v1");
        std::thread::sleep(Duration::from_millis(100));
        let age = buffer.buffer_age("doc").unwrap();
        assert!(age >= Duration::from_millis(90), "age was {age:?}");
    }

    #[test]
    fn test_concurrent_writers_leave_one_value() {
        let buffer = Arc::new(ContentBuffer::new());
        let values: Vec<String> = (0..10).map(|i| format!("value-{i}-{}", "p".repeat(i * 50))).collect();

        let handles: Vec<_> = values
            .iter()
            .cloned()
            .map(|value| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    buffer.buffer_content("shared", &value);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let final_value = buffer.get_latest_content("shared").unwrap();
        assert!(values.contains(&final_value));
        assert_eq!(buffer.update_count("shared"), 10);
    }
}
