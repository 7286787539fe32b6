//! Document identity and content hashing
//!
//! A [`DocumentId`] is derived from the normalized file path with BLAKE3, so
//! opening the same path twice always yields the same id. Content above the
//! large-document threshold is compared by [`ContentHash`] instead of by
//! string equality.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Number of hash bytes kept in a document id (128 bits)
const ID_BYTES: usize = 16;

/// Content size above which hash comparison replaces string comparison
pub const DEFAULT_LARGE_CONTENT_THRESHOLD: usize = 10 * 1024;

/// Stable, opaque identifier of an open document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Derive the id for a file path
    ///
    /// The path is normalized lexically first, so `notes/./a.md` and
    /// `notes/a.md` map to the same id.
    pub fn from_path(path: &Path) -> Self {
        let normalized = normalize_path(path);
        let key = normalized.to_string_lossy();
        #[cfg(windows)]
        let key = key.to_lowercase();
        let hash = blake3::hash(key.as_bytes());
        Self(hex::encode(&hash.as_bytes()[..ID_BYTES]))
    }

    /// Wrap an existing id string (as read back from the write-ahead log)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// BLAKE3 digest of document content
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a piece of content
    pub fn of(content: &str) -> Self {
        Self(*blake3::hash(content.as_bytes()).as_bytes())
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form of the digest
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

/// Narrow view of an editor that holds note content
///
/// UI controls adapt to this trait; the engine never inspects concrete
/// editor types.
pub trait EditableNote: Send + Sync {
    /// Id of the note the editor is showing
    fn note_id(&self) -> &DocumentId;

    /// Current editor content
    fn content(&self) -> String;

    /// Whether the editor holds edits not yet handed to the engine
    fn is_dirty(&self) -> bool;
}

/// Lexically normalize a path: drop `.` components and fold `..`
///
/// The filesystem is not consulted, so this works for files that do not
/// exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_same_id() {
        let a = DocumentId::from_path(Path::new("/notes/today.md"));
        let b = DocumentId::from_path(Path::new("/notes/today.md"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ID_BYTES * 2);
    }

    #[test]
    fn test_normalized_paths_share_id() {
        let a = DocumentId::from_path(Path::new("/notes/./work/../today.md"));
        let b = DocumentId::from_path(Path::new("/notes/today.md"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_paths_differ() {
        let a = DocumentId::from_path(Path::new("/notes/a.md"));
        let b = DocumentId::from_path(Path::new("/notes/b.md"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_content_hash_detects_single_char() {
        let base = "x".repeat(15_000);
        let mut appended = base.clone();
        appended.push('y');
        assert_ne!(ContentHash::of(&base), ContentHash::of(&appended));
        assert_eq!(ContentHash::of(&base), ContentHash::of(&"x".repeat(15_000)));
    }

    #[test]
    fn test_normalize_keeps_leading_parent() {
        assert_eq!(normalize_path(Path::new("../a/./b")), PathBuf::from("../a/b"));
    }
}
