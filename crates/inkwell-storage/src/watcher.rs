//! External change detection
//!
//! Watches the parent directories of open notes with `notify`, folds bursts
//! of events per path into one check after a quiet period, and reports a
//! [`DetectedChange`] only when the file content differs from what the engine
//! believes is on disk. The engine registers its own writes first, so the
//! events they cause (including the window where the old content is still
//! visible) are suppressed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::WatchConfig;
use crate::document::{ContentHash, DocumentId, normalize_path};
use crate::error::{StorageError, StorageResult};
use crate::fs::FileSystem;

/// A note file whose content changed outside the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChange {
    pub document_id: DocumentId,
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone, Copy)]
struct SelfWrite {
    previous: Option<ContentHash>,
    pending: ContentHash,
    until: Instant,
}

#[derive(Debug, Default)]
struct KnownContent {
    on_disk: Option<ContentHash>,
    self_write: Option<SelfWrite>,
}

#[derive(Debug)]
struct WatchedFile {
    document_id: DocumentId,
    path: PathBuf,
}

/// State shared with the debounce task
struct Shared {
    fs: Arc<dyn FileSystem>,
    watched: DashMap<PathBuf, WatchedFile>,
    known: DashMap<DocumentId, KnownContent>,
    self_write_window: Duration,
}

struct OsWatcher {
    watcher: RecommendedWatcher,
    directories: HashMap<PathBuf, usize>,
}

/// Filesystem watcher with debounce and self-write suppression
pub struct ExternalChangeDetector {
    shared: Arc<Shared>,
    raw_tx: mpsc::UnboundedSender<PathBuf>,
    os: Mutex<Option<OsWatcher>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ExternalChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalChangeDetector")
            .field("watched", &self.shared.watched.len())
            .field("os_watcher", &self.os.lock().is_some())
            .finish()
    }
}

/// Key used to match notify's paths against registered ones
fn watch_key(path: &Path) -> PathBuf {
    let normalized = normalize_path(path);
    match (normalized.parent(), normalized.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or(normalized),
        _ => normalized,
    }
}

impl ExternalChangeDetector {
    /// Start the detector; changes arrive on the returned receiver
    ///
    /// With `config.enabled == false` no OS watcher is created and only
    /// [`notify_path_changed`](Self::notify_path_changed) feeds the detector.
    pub fn start(
        config: &WatchConfig,
        fs: Arc<dyn FileSystem>,
    ) -> (Self, mpsc::UnboundedReceiver<DetectedChange>) {
        let shared = Arc::new(Shared {
            fs,
            watched: DashMap::new(),
            known: DashMap::new(),
            self_write_window: config.self_write_window,
        });
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let os = if config.enabled {
            match Self::create_os_watcher(raw_tx.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, "Filesystem watcher unavailable, external changes will not be detected");
                    None
                }
            }
        } else {
            None
        };

        let task = tokio::spawn(
            debounce_loop(shared.clone(), raw_rx, out_tx, cancel.clone(), config.debounce)
                .instrument(info_span!("change_detector"))
                .with_current_subscriber(),
        );

        (
            Self {
                shared,
                raw_tx,
                os: Mutex::new(os),
                cancel,
                task: Mutex::new(Some(task)),
            },
            out_rx,
        )
    }

    fn create_os_watcher(raw_tx: mpsc::UnboundedSender<PathBuf>) -> StorageResult<OsWatcher> {
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = raw_tx.send(path);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Filesystem watcher error"),
            },
            notify::Config::default(),
        )?;
        Ok(OsWatcher {
            watcher,
            directories: HashMap::new(),
        })
    }

    /// Start watching `path` for `document_id`
    ///
    /// `content` is what the engine just loaded and is taken as the current
    /// on-disk state.
    pub fn watch(&self, path: &Path, document_id: &DocumentId, content: Option<&str>) {
        let key = watch_key(path);
        self.shared.watched.insert(
            key.clone(),
            WatchedFile {
                document_id: document_id.clone(),
                path: path.to_path_buf(),
            },
        );
        self.shared.known.insert(
            document_id.clone(),
            KnownContent {
                on_disk: content.map(ContentHash::of),
                self_write: None,
            },
        );

        let Some(directory) = key.parent().map(Path::to_path_buf) else {
            return;
        };
        let mut os = self.os.lock();
        if let Some(os) = os.as_mut() {
            if !os.directories.contains_key(&directory) {
                if let Err(e) = os.watcher.watch(&directory, RecursiveMode::NonRecursive) {
                    warn!(dir = %directory.display(), error = %e, "Could not watch directory");
                    return;
                }
                debug!(dir = %directory.display(), "Watching directory");
            }
            *os.directories.entry(directory).or_insert(0) += 1;
        }
    }

    /// Stop watching `path`
    pub fn unwatch(&self, path: &Path) {
        let key = watch_key(path);
        let Some((_, file)) = self.shared.watched.remove(&key) else {
            return;
        };
        let still_watched = self
            .shared
            .watched
            .iter()
            .any(|entry| entry.value().document_id == file.document_id);
        if !still_watched {
            self.shared.known.remove(&file.document_id);
        }

        let Some(directory) = key.parent().map(Path::to_path_buf) else {
            return;
        };
        let mut os = self.os.lock();
        if let Some(os) = os.as_mut()
            && let Some(count) = os.directories.get_mut(&directory)
        {
            *count = count.saturating_sub(1);
            if *count == 0 {
                os.directories.remove(&directory);
                if let Err(e) = os.watcher.unwatch(&directory) {
                    trace!(dir = %directory.display(), error = %e, "Unwatch failed");
                }
            }
        }
    }

    /// Document registered for `path`, if any
    pub fn document_for(&self, path: &Path) -> Option<DocumentId> {
        self.shared
            .watched
            .get(&watch_key(path))
            .map(|f| f.document_id.clone())
    }

    /// Announce that the engine is about to write `content`
    pub fn begin_self_write(&self, document_id: &DocumentId, content: &str) {
        let mut known = self.shared.known.entry(document_id.clone()).or_default();
        known.self_write = Some(SelfWrite {
            previous: known.on_disk,
            pending: ContentHash::of(content),
            until: Instant::now() + self.shared.self_write_window,
        });
    }

    /// Settle a write announced with [`begin_self_write`](Self::begin_self_write)
    pub fn finish_self_write(&self, document_id: &DocumentId, succeeded: bool) {
        let Some(mut known) = self.shared.known.get_mut(document_id) else {
            return;
        };
        if !succeeded {
            known.self_write = None;
            return;
        }
        if let Some(mut write) = known.self_write {
            known.on_disk = Some(write.pending);
            write.until = Instant::now() + self.shared.self_write_window;
            known.self_write = Some(write);
        }
    }

    /// Feed a change notification for `path` through the debounce path
    pub fn notify_path_changed(&self, path: &Path) -> StorageResult<()> {
        self.raw_tx
            .send(path.to_path_buf())
            .map_err(|_| StorageError::closed("change detector"))
    }

    /// Stop the OS watcher and the debounce task
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.os.lock().take();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Change detector task failed");
        }
    }
}

impl Drop for ExternalChangeDetector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Shared {
    /// Read the file behind `path` and decide whether it is news
    async fn inspect(&self, path: &Path) -> Option<DetectedChange> {
        let key = watch_key(path);
        let (document_id, note_path) = {
            let file = self.watched.get(&key)?;
            (file.document_id.clone(), file.path.clone())
        };

        let content = match self.fs.read_to_string(&note_path).await {
            Ok(content) => content,
            Err(StorageError::NotFound(_)) => {
                debug!(path = %note_path.display(), "Watched note disappeared");
                return None;
            }
            Err(e) => {
                warn!(path = %note_path.display(), error = %e, "Could not read changed note");
                return None;
            }
        };
        let hash = ContentHash::of(&content);

        let mut known = self.known.entry(document_id.clone()).or_default();
        if let Some(write) = known.self_write {
            if Instant::now() <= write.until {
                if hash == write.pending || Some(hash) == write.previous {
                    trace!(document_id = %document_id, "Suppressed own write");
                    return None;
                }
            } else {
                known.self_write = None;
            }
        }
        if known.on_disk == Some(hash) {
            return None;
        }
        known.on_disk = Some(hash);
        drop(known);

        info!(document_id = %document_id, path = %note_path.display(), "External change detected");
        Some(DetectedChange {
            document_id,
            path: note_path,
            content,
        })
    }
}

async fn debounce_loop(
    shared: Arc<Shared>,
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    out_tx: mpsc::UnboundedSender<DetectedChange>,
    cancel: CancellationToken,
    debounce: Duration,
) {
    let mut deadlines: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let next = deadlines.values().min().copied();
        let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = cancel.cancelled() => break,
            path = raw_rx.recv() => match path {
                Some(path) => {
                    deadlines.insert(path, Instant::now() + debounce);
                }
                None => break,
            },
            _ = tokio::time::sleep_until(wake), if next.is_some() => {
                let now = Instant::now();
                let due: Vec<PathBuf> = deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    deadlines.remove(&path);
                    if let Some(change) = shared.inspect(&path).await
                        && out_tx.send(change).is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
    debug!("Change detector stopped");
}
