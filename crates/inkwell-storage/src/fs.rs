//! Filesystem abstraction for note files
//!
//! The engine only touches note files through [`FileSystem`]. The local
//! implementation writes atomically (temp file in the same directory, fsync,
//! rename); the in-memory one lets tests inject read-only files, slow writes
//! and transient failures.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// File operations the engine needs
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read a UTF-8 file
    async fn read_to_string(&self, path: &Path) -> StorageResult<String>;

    /// Replace a file's content so readers see either the old or the new bytes
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> StorageResult<()>;

    /// Whether a file exists
    async fn exists(&self, path: &Path) -> bool;

    /// Remove a file
    async fn remove_file(&self, path: &Path) -> StorageResult<()>;

    /// Copy a file, replacing the destination
    async fn copy(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Move a file
    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Files directly inside `dir`, sorted by path; a missing directory is empty
    async fn list(&self, dir: &Path) -> StorageResult<Vec<PathBuf>>;
}

fn temp_prefix(note: &Path) -> String {
    let name = note
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "note".to_string());
    format!(".{name}.")
}

/// Whether `candidate` is a temp file left by an atomic write of `note`
pub fn is_temp_file_for(note: &Path, candidate: &Path) -> bool {
    if candidate.parent() != note.parent() {
        return false;
    }
    candidate
        .file_name()
        .map(|n| n.to_string_lossy())
        .is_some_and(|n| n.starts_with(&temp_prefix(note)) && n.ends_with(".tmp"))
}

/// [`FileSystem`] backed by the local disk
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }

    fn temp_path(path: &Path) -> PathBuf {
        path.with_file_name(format!(
            "{}{}.tmp",
            temp_prefix(path),
            uuid::Uuid::new_v4().simple()
        ))
    }

    async fn write_temp(temp: &Path, content: &[u8]) -> StorageResult<()> {
        let mut file = tokio::fs::File::create(temp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_to_string(&self, path: &Path) -> StorageResult<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_atomic(&self, path: &Path, content: &[u8]) -> StorageResult<()> {
        // A rename would silently replace a read-only target
        if let Ok(metadata) = tokio::fs::metadata(path).await
            && metadata.permissions().readonly()
        {
            return Err(StorageError::permission_denied(format!(
                "{} is read-only",
                path.display()
            )));
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = Self::temp_path(path);
        if let Err(e) = Self::write_temp(&temp, content).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), bytes = content.len(), "Wrote file");
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        Ok(tokio::fs::remove_file(path).await?)
    }

    async fn copy(&self, from: &Path, to: &Path) -> StorageResult<()> {
        if let Some(parent) = to.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(from, to).await?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        if let Some(parent) = to.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::rename(from, to).await?)
    }

    async fn list(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// In-memory [`FileSystem`] for testing
#[derive(Debug, Default)]
pub struct InMemoryFileSystem {
    files: RwLock<HashMap<PathBuf, String>>,
    read_only: RwLock<HashSet<PathBuf>>,
    write_delay: RwLock<Option<Duration>>,
    fail_next_writes: AtomicU32,
    fail_next_renames: AtomicU32,
    write_attempts: AtomicU64,
    successful_writes: AtomicU64,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a file in place without counting it as a write
    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.write().insert(path.into(), content.into());
    }

    /// Current content of a file
    pub fn get(&self, path: &Path) -> Option<String> {
        self.files.read().get(path).cloned()
    }

    /// Mark a path read-only (or writable again)
    pub fn set_read_only(&self, path: impl Into<PathBuf>, read_only: bool) {
        let path = path.into();
        let mut set = self.read_only.write();
        if read_only {
            set.insert(path);
        } else {
            set.remove(&path);
        }
    }

    /// Delay every write by `delay`
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.write() = delay;
    }

    /// Fail the next `count` writes with a transient I/O error
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` renames, as a move across devices would
    pub fn fail_next_renames(&self, count: u32) {
        self.fail_next_renames.store(count, Ordering::SeqCst);
    }

    /// Writes that reached the filesystem, successful or not
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Writes that changed a file
    pub fn successful_writes(&self) -> u64 {
        self.successful_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystem for InMemoryFileSystem {
    async fn read_to_string(&self, path: &Path) -> StorageResult<String> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(path.display().to_string()))
    }

    async fn write_atomic(&self, path: &Path, content: &[u8]) -> StorageResult<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.write_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.read_only.read().contains(path) {
            return Err(StorageError::permission_denied(format!(
                "{} is read-only",
                path.display()
            )));
        }

        let injected = self
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!(path = %path.display(), "Injected write failure");
            return Err(StorageError::io("injected write failure"));
        }

        let text = String::from_utf8(content.to_vec())
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        self.files.write().insert(path.to_path_buf(), text);
        self.successful_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(path.display().to_string()))
    }

    async fn copy(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let content = self.read_to_string(from).await?;
        self.files.write().insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let injected = self
            .fail_next_renames
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::io("injected rename failure"));
        }
        let mut files = self.files.write();
        let content = files
            .remove(from)
            .ok_or_else(|| StorageError::not_found(from.display().to_string()))?;
        files.insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn list(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = self
            .files
            .read()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.md");
        let fs = LocalFileSystem::new();

        fs.write_atomic(&path, b"first").await.unwrap();
        fs.write_atomic(&path, b"second").await.unwrap();
        assert_eq!(fs.read_to_string(&path).await.unwrap(), "second");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/note.md");
        let fs = LocalFileSystem::new();
        fs.write_atomic(&path, b"hello").await.unwrap();
        assert!(fs.exists(&path).await);
    }

    #[tokio::test]
    async fn test_local_read_only_is_permission_denied() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.md");
        std::fs::write(&path, "original").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let fs = LocalFileSystem::new();
        let err = fs.write_atomic(&path, b"changed").await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_local_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let err = fs.read_to_string(&dir.path().join("missing.md")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_injected_failures() {
        let fs = InMemoryFileSystem::new();
        let path = Path::new("/notes/a.md");
        fs.fail_next_writes(2);

        assert!(fs.write_atomic(path, b"x").await.is_err());
        assert!(fs.write_atomic(path, b"x").await.is_err());
        fs.write_atomic(path, b"x").await.unwrap();

        assert_eq!(fs.write_attempts(), 3);
        assert_eq!(fs.successful_writes(), 1);
        assert_eq!(fs.get(path).as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_local_copy_rename_list_remove() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let a = dir.path().join("a.md");
        let b = dir.path().join("b.md");
        fs.write_atomic(&a, b"text").await.unwrap();
        fs.copy(&a, &b).await.unwrap();
        fs.rename(&a, &dir.path().join("moved/c.md")).await.unwrap();

        assert!(!fs.exists(&a).await);
        assert_eq!(fs.list(dir.path()).await.unwrap(), vec![b.clone()]);
        fs.remove_file(&b).await.unwrap();
        assert!(fs.list(dir.path()).await.unwrap().is_empty());
        assert!(fs.list(&dir.path().join("missing")).await.unwrap().is_empty());
        assert_eq!(
            fs.read_to_string(&dir.path().join("moved/c.md")).await.unwrap(),
            "text"
        );
    }

    #[test]
    fn test_temp_file_matching() {
        let note = Path::new("/notes/today.md");
        let temp = LocalFileSystem::temp_path(note);
        assert!(is_temp_file_for(note, &temp));
        assert!(!is_temp_file_for(note, Path::new("/notes/today.md")));
        assert!(!is_temp_file_for(note, Path::new("/notes/.other.md.abc.tmp")));
        assert!(!is_temp_file_for(note, Path::new("/elsewhere/.today.md.abc.tmp")));
    }

    #[tokio::test]
    async fn test_memory_rename_failure_leaves_source() {
        let fs = InMemoryFileSystem::new();
        let from = Path::new("/notes/a.md");
        fs.insert(from, "text");
        fs.fail_next_renames(1);

        assert!(fs.rename(from, Path::new("/notes/b.md")).await.is_err());
        assert_eq!(fs.get(from).as_deref(), Some("text"));
        fs.rename(from, Path::new("/notes/b.md")).await.unwrap();
        assert!(fs.get(from).is_none());
    }

    #[tokio::test]
    async fn test_memory_read_only() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/notes/locked.md");
        fs.insert(&path, "keep");
        fs.set_read_only(&path, true);

        let err = fs.write_atomic(&path, b"new").await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(fs.get(&path).as_deref(), Some("keep"));

        fs.set_read_only(&path, false);
        fs.write_atomic(&path, b"new").await.unwrap();
        assert_eq!(fs.get(&path).as_deref(), Some("new"));
    }
}
