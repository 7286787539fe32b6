//! Persistence engine
//!
//! Owns every open note and drives it through `Clean -> Dirty -> Saving ->
//! Clean | Dirty`. Updates are synchronous: they go to the content buffer and
//! the write-ahead log under the note's map entry and never wait on I/O.
//! Saves are async, single-flight per note, gated by the circuit breaker and
//! written atomically through the [`FileSystem`].
//!
//! Background work (auto-save timers, the change listener, the WAL health
//! listener) holds only weak references to the engine and runs under the
//! tracing dispatcher that was current when the engine was built.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, Span, debug, error, info, info_span, instrument, warn};

use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::buffer::ContentBuffer;
use crate::config::PersistenceConfig;
use crate::document::{ContentHash, DocumentId, EditableNote, normalize_path};
use crate::error::{StorageError, StorageResult};
use crate::events::{EventBus, ExternalResolution, PersistenceEvent};
use crate::fs::{FileSystem, LocalFileSystem, is_temp_file_for};
use crate::scheduler::{Admission, DebounceTimers, SaveCoalescer, SavePriority};
use crate::wal::{WalEntry, WalHealth, WriteAheadLog};
use crate::watcher::{DetectedChange, ExternalChangeDetector};

/// Result of a save request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Content was written
    Saved { bytes: usize },
    /// Nothing to write; the note matched what is on disk
    Unchanged,
    /// Another save was in flight and will pick this request up
    Coalesced,
    /// The breaker is open; disk was not touched
    CircuitOpen,
    /// An external change is waiting for [`PersistenceEngine::resolve_external_change`]
    Conflict,
    /// The write failed; the note stays dirty
    Failed { reason: String },
}

impl SaveOutcome {
    /// Whether the note is known to be on disk afterwards
    pub fn succeeded(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. } | SaveOutcome::Unchanged)
    }

    /// Whether this call performed a physical write
    pub fn wrote(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

/// Aggregate of a multi-note save
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSaveResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub failed_document_ids: Vec<DocumentId>,
}

impl BatchSaveResult {
    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }
}

/// Read-only view of an open note
#[derive(Debug, Clone)]
pub struct NoteInfo {
    pub id: DocumentId,
    pub file_path: PathBuf,
    pub content_hash: ContentHash,
    pub is_dirty: bool,
    pub is_saving: bool,
    pub update_count: u64,
    pub last_update_timestamp: Option<DateTime<Utc>>,
    pub has_external_change: bool,
}

/// Content last known to be on disk
#[derive(Debug, Clone)]
struct SavedSnapshot {
    content: String,
    hash: Option<ContentHash>,
}

impl SavedSnapshot {
    fn new(content: String, large_threshold: usize) -> Self {
        let hash = (content.len() > large_threshold).then(|| ContentHash::of(&content));
        Self { content, hash }
    }

    fn matches(&self, content: &str) -> bool {
        if self.content.len() != content.len() {
            return false;
        }
        match self.hash {
            Some(hash) => hash == ContentHash::of(content),
            None => self.content == content,
        }
    }
}

#[derive(Debug)]
struct DocumentState {
    path: PathBuf,
    saved: SavedSnapshot,
    dirty: bool,
    /// WAL sequence of the current in-memory content
    wal_sequence: Option<u64>,
    pending_external: Option<String>,
}

struct EngineInner {
    config: PersistenceConfig,
    fs: Arc<dyn FileSystem>,
    buffer: ContentBuffer,
    wal: WriteAheadLog,
    breaker: CircuitBreaker,
    coalescer: SaveCoalescer,
    timers: DebounceTimers,
    detector: ExternalChangeDetector,
    events: EventBus,
    documents: DashMap<DocumentId, DocumentState>,
    paths: DashMap<PathBuf, DocumentId>,
    recovered: Mutex<HashMap<String, WalEntry>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

/// Durable note-save engine
///
/// Cheap to clone; clones share the same state. Call
/// [`shutdown`](Self::shutdown) before exit to flush dirty notes.
#[derive(Clone)]
pub struct PersistenceEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PersistenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceEngine")
            .field("open_notes", &self.inner.documents.len())
            .field("wal", &self.inner.wal)
            .finish()
    }
}

impl PersistenceEngine {
    /// Create an engine writing notes to the local disk
    pub async fn new(config: PersistenceConfig) -> StorageResult<Self> {
        Self::with_file_system(config, Arc::new(LocalFileSystem::new())).await
    }

    /// Create an engine over a custom [`FileSystem`]
    ///
    /// Replays the write-ahead log; unpersisted content is applied when the
    /// matching note is opened.
    #[instrument(skip_all, fields(wal_dir = %config.wal.directory.display()))]
    pub async fn with_file_system(
        config: PersistenceConfig,
        fs: Arc<dyn FileSystem>,
    ) -> StorageResult<Self> {
        let wal = WriteAheadLog::open(config.wal.clone()).await?;
        let recovered = wal.recover_entries().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Found unsaved changes from a previous session");
        }

        let (detector, changes) = ExternalChangeDetector::start(&config.watch, fs.clone());
        let health = wal.health_events();
        let events = EventBus::new(config.event_channel_capacity);
        let span = info_span!("persistence_engine");

        let inner = Arc::new(EngineInner {
            buffer: ContentBuffer::with_large_threshold(config.large_content_threshold),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
            fs,
            wal,
            coalescer: SaveCoalescer::new(),
            timers: DebounceTimers::new(),
            detector,
            events,
            documents: DashMap::new(),
            paths: DashMap::new(),
            recovered: Mutex::new(recovered),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            span,
        });

        let change_task = tokio::spawn(
            listen_for_changes(Arc::downgrade(&inner), changes, inner.cancel.clone())
                .instrument(inner.span.clone())
                .with_current_subscriber(),
        );
        let health_task = tokio::spawn(
            listen_for_wal_health(inner.events.clone(), health, inner.cancel.clone())
                .instrument(inner.span.clone())
                .with_current_subscriber(),
        );
        inner.tasks.lock().extend([change_task, health_task]);

        info!("Persistence engine started");
        Ok(Self { inner })
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.inner.events.subscribe()
    }

    /// Active configuration
    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    fn ensure_running(&self) -> StorageResult<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(StorageError::closed("persistence engine"));
        }
        Ok(())
    }

    fn note_path(&self, path: &Path) -> PathBuf {
        normalize_path(&self.inner.config.resolve_note_path(path))
    }

    /// Open a note, loading it from disk or starting empty
    ///
    /// Opening an already open path returns the same id without reloading.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn open_note(&self, path: &Path) -> StorageResult<DocumentId> {
        self.ensure_running()?;
        let path = self.note_path(path);
        let id = DocumentId::from_path(&path);
        if self.inner.documents.contains_key(&id) {
            return Ok(id);
        }

        self.remove_stale_temp_files(&path).await;
        let on_disk = match self.inner.fs.read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let saved = on_disk.clone().unwrap_or_default();

        let recovered = self.inner.recovered.lock().remove(id.as_str());
        let (content, wal_sequence) = match recovered {
            Some(entry) if entry.content != saved => (entry.content, Some(entry.sequence)),
            Some(entry) => {
                // Disk already has it
                self.inner.wal.mark_persisted_through(id.as_str(), entry.sequence);
                (saved.clone(), None)
            }
            None => (saved.clone(), None),
        };
        let dirty = wal_sequence.is_some();

        match self.inner.documents.entry(id.clone()) {
            Entry::Occupied(_) => return Ok(id),
            Entry::Vacant(vacant) => {
                self.inner.buffer.buffer_content(id.as_str(), &content);
                vacant.insert(DocumentState {
                    path: path.clone(),
                    saved: SavedSnapshot::new(saved, self.inner.config.large_content_threshold),
                    dirty,
                    wal_sequence,
                    pending_external: None,
                });
            }
        }
        self.inner.paths.insert(path.clone(), id.clone());
        self.inner.detector.watch(&path, &id, on_disk.as_deref());

        if dirty {
            info!(document_id = %id, "Restored unsaved content");
            self.inner.events.publish(PersistenceEvent::Recovered {
                document_id: id.clone(),
            });
        }
        debug!(document_id = %id, exists = on_disk.is_some(), "Opened note");
        Ok(id)
    }

    /// Delete temp files an interrupted atomic write left next to `path`
    async fn remove_stale_temp_files(&self, path: &Path) {
        let Some(dir) = path.parent() else {
            return;
        };
        let files = match self.inner.fs.list(dir).await {
            Ok(files) => files,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Cannot list note directory");
                return;
            }
        };
        for stale in files.iter().filter(|f| is_temp_file_for(path, f)) {
            match self.inner.fs.remove_file(stale).await {
                Ok(()) => info!(temp = %stale.display(), "Removed leftover temp file"),
                Err(e) => {
                    warn!(temp = %stale.display(), error = %e, "Cannot remove leftover temp file")
                }
            }
        }
    }

    /// Replace a note's in-memory content
    ///
    /// Returns `Ok(true)` for a distinct update, `Ok(false)` for identical
    /// content or an empty id. Never waits on I/O.
    pub fn update_content(&self, id: &DocumentId, content: &str) -> StorageResult<bool> {
        if id.as_str().trim().is_empty() {
            return Ok(false);
        }
        self.ensure_running()?;

        let dirty = {
            let mut doc = self
                .inner
                .documents
                .get_mut(id)
                .ok_or_else(|| StorageError::document_not_found(id.as_str()))?;

            if !self.inner.buffer.buffer_content(id.as_str(), content).changed() {
                return Ok(false);
            }
            let sequence = self.inner.wal.log_change(id.as_str(), content);
            let dirty = !doc.saved.matches(content);
            doc.wal_sequence = sequence;
            doc.dirty = dirty;
            if !doc.dirty
                && let Some(sequence) = sequence
            {
                // Edited back to what is on disk
                self.inner.wal.mark_persisted_through(id.as_str(), sequence);
            }
            doc.dirty
        };

        if dirty && self.inner.config.auto_save {
            self.schedule_auto_save(id);
        } else if !dirty {
            self.inner.timers.cancel(id.as_str());
        }
        Ok(true)
    }

    /// Pull content from an editor that reports unsynced edits
    pub fn sync_from(&self, note: &dyn EditableNote) -> StorageResult<bool> {
        if !note.is_dirty() {
            return Ok(false);
        }
        self.update_content(note.note_id(), &note.content())
    }

    fn schedule_auto_save(&self, id: &DocumentId) {
        let weak = Arc::downgrade(&self.inner);
        let task_id = id.clone();
        self.inner.timers.schedule(
            id.as_str(),
            self.inner.config.auto_save_delay,
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let engine = PersistenceEngine { inner };
                match engine
                    .save_note_with_priority(&task_id, SavePriority::AutoSave)
                    .await
                {
                    Ok(outcome) => debug!(document_id = %task_id, ?outcome, "Auto-save finished"),
                    Err(e) => debug!(document_id = %task_id, error = %e, "Auto-save skipped"),
                }
            }
            .instrument(self.inner.span.clone()),
        );
    }

    /// Save a note now
    pub async fn save_note(&self, id: &DocumentId) -> StorageResult<SaveOutcome> {
        self.save_note_with_priority(id, SavePriority::Manual).await
    }

    /// Reset the breaker for a note and save it
    ///
    /// For use after the user fixed the cause of repeated failures.
    pub async fn retry_save(&self, id: &DocumentId) -> StorageResult<SaveOutcome> {
        self.inner.breaker.reset(id.as_str());
        self.save_note_with_priority(id, SavePriority::Manual).await
    }

    /// Save a note with an explicit priority
    ///
    /// Manual and shutdown saves cancel a pending auto-save timer. A request
    /// that coalesces into an in-flight save returns
    /// [`SaveOutcome::Coalesced`]; the in-flight saver makes one more pass if
    /// the note is still dirty when it finishes.
    ///
    /// The save runs on its own task. Dropping the returned future does not
    /// stop it, and the note's permit stays held until the write and its
    /// bookkeeping are done.
    #[instrument(skip_all, fields(document_id = %id, ?priority))]
    pub async fn save_note_with_priority(
        &self,
        id: &DocumentId,
        priority: SavePriority,
    ) -> StorageResult<SaveOutcome> {
        if !self.inner.documents.contains_key(id) {
            return Err(StorageError::document_not_found(id.as_str()));
        }
        if priority != SavePriority::AutoSave {
            self.inner.timers.cancel(id.as_str());
        }

        let engine = self.clone();
        let task_id = id.clone();
        let saves = tokio::spawn(
            async move { engine.run_saves(&task_id, priority).await }
                .in_current_span()
                .with_current_subscriber(),
        );
        match saves.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(error = %e, "Save task did not complete");
                Ok(SaveOutcome::Failed {
                    reason: format!("save task failed: {e}"),
                })
            }
        }
    }

    /// Admit and run passes until the note is clean or a pass fails
    async fn run_saves(&self, id: &DocumentId, priority: SavePriority) -> SaveOutcome {
        let mut admission = self.inner.coalescer.admit(id.as_str(), priority).await;
        let mut last = None;
        loop {
            let permit = match admission {
                Admission::Acquired(permit) => permit,
                Admission::Coalesced => return last.unwrap_or(SaveOutcome::Coalesced),
            };
            let outcome = self.save_pass(id).await;
            let rerun = permit.release();

            let again = rerun
                && matches!(outcome, SaveOutcome::Saved { .. } | SaveOutcome::Unchanged)
                && self.is_note_dirty(id);
            last = Some(outcome.clone());
            if !again {
                return outcome;
            }
            debug!("Running coalesced save");
            admission = self
                .inner
                .coalescer
                .admit(id.as_str(), SavePriority::AutoSave)
                .await;
        }
    }

    /// One physical save attempt; the caller holds the note's permit
    async fn save_pass(&self, id: &DocumentId) -> SaveOutcome {
        if self.inner.breaker.is_open(id.as_str()) {
            debug!(
                retry_in = ?self.inner.breaker.remaining_cool_down(id.as_str()),
                "Circuit open, skipping write"
            );
            self.inner.events.publish(PersistenceEvent::SaveFailed {
                document_id: id.clone(),
                reason: "circuit breaker open".to_string(),
            });
            return SaveOutcome::CircuitOpen;
        }

        let (path, content, wal_sequence, update_count) = {
            let Some(doc) = self.inner.documents.get(id) else {
                return SaveOutcome::Failed {
                    reason: "note was closed".to_string(),
                };
            };
            if !doc.dirty {
                return SaveOutcome::Unchanged;
            }
            if doc.pending_external.is_some() {
                return SaveOutcome::Conflict;
            }
            let Some(content) = self.inner.buffer.get_latest_content(id.as_str()) else {
                return SaveOutcome::Unchanged;
            };
            (
                doc.path.clone(),
                content,
                doc.wal_sequence,
                self.inner.buffer.update_count(id.as_str()),
            )
        };

        self.inner.events.publish(PersistenceEvent::SaveStarted {
            document_id: id.clone(),
        });
        let bytes = self.inner.config.conversion.apply(&content);
        let byte_count = bytes.len();
        self.inner.detector.begin_self_write(id, &bytes);

        // A panicking filesystem must still reach the failure bookkeeping
        let fs = self.inner.fs.clone();
        let target = path.clone();
        let write = tokio::spawn(
            async move { fs.write_atomic(&target, bytes.as_bytes()).await }
                .in_current_span()
                .with_current_subscriber(),
        );
        let result = match write.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Save task did not complete");
                Err(StorageError::io(format!("save task failed: {e}")))
            }
        };

        match result {
            Ok(()) => {
                self.inner.detector.finish_self_write(id, true);
                self.inner.breaker.record_success(id.as_str());
                if let Some(mut doc) = self.inner.documents.get_mut(id) {
                    doc.saved =
                        SavedSnapshot::new(content, self.inner.config.large_content_threshold);
                    // Edits that arrived during the write keep the note dirty
                    let edited = self.inner.buffer.update_count(id.as_str()) != update_count
                        && self
                            .inner
                            .buffer
                            .get_latest_content(id.as_str())
                            .is_some_and(|latest| !doc.saved.matches(&latest));
                    doc.dirty = edited;
                    if !doc.dirty {
                        doc.wal_sequence = None;
                    }
                }
                if let Some(sequence) = wal_sequence {
                    self.inner
                        .wal
                        .mark_persisted_through(id.as_str(), sequence);
                }
                info!(path = %path.display(), bytes = byte_count, "Saved note");
                self.inner.events.publish(PersistenceEvent::Saved {
                    document_id: id.clone(),
                    path,
                    bytes: byte_count,
                });
                SaveOutcome::Saved { bytes: byte_count }
            }
            Err(e) => {
                self.inner.detector.finish_self_write(id, false);
                let tripped = self.inner.breaker.record_failure(id.as_str());
                if e.is_permanent() {
                    warn!(path = %path.display(), error = %e, "Save failed, note is not writable");
                } else {
                    warn!(path = %path.display(), error = %e, "Save failed");
                }
                let reason = e.to_string();
                self.inner.events.publish(PersistenceEvent::SaveFailed {
                    document_id: id.clone(),
                    reason: reason.clone(),
                });
                if tripped {
                    self.inner.events.publish(PersistenceEvent::CircuitOpened {
                        document_id: id.clone(),
                        failure_count: self.inner.breaker.failure_count(id.as_str()),
                    });
                }
                SaveOutcome::Failed { reason }
            }
        }
    }

    /// Save every dirty note concurrently
    ///
    /// Individual failures are counted, never returned as errors.
    pub async fn save_all_dirty(&self) -> BatchSaveResult {
        let ids = self.get_dirty_note_ids();
        let outcomes = join_all(
            ids.iter()
                .map(|id| self.save_note_with_priority(id, SavePriority::Shutdown)),
        )
        .await;

        let mut result = BatchSaveResult::default();
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(outcome) if outcome.succeeded() => result.success_count += 1,
                Ok(outcome) => {
                    debug!(document_id = %id, ?outcome, "Batch save did not persist note");
                    result.failure_count += 1;
                    result.failed_document_ids.push(id);
                }
                // Closed while the batch ran
                Err(StorageError::DocumentNotFound(_)) => result.success_count += 1,
                Err(e) => {
                    debug!(document_id = %id, error = %e, "Batch save failed");
                    result.failure_count += 1;
                    result.failed_document_ids.push(id);
                }
            }
        }
        if result.failure_count > 0 {
            warn!(
                saved = result.success_count,
                failed = result.failure_count,
                "Some notes could not be saved"
            );
        }
        result
    }

    /// Close a note
    ///
    /// A dirty note gets a final save first. Returns `Ok(false)` and keeps
    /// the note open when its content could not be persisted.
    #[instrument(skip_all, fields(document_id = %id))]
    pub async fn close_note(&self, id: &DocumentId) -> StorageResult<bool> {
        if !self.inner.documents.contains_key(id) {
            return Ok(true);
        }
        self.inner.timers.cancel(id.as_str());

        if self.is_note_dirty(id) {
            let outcome = self
                .save_note_with_priority(id, SavePriority::Shutdown)
                .await?;
            if !outcome.succeeded() {
                warn!(?outcome, "Keeping note open, unsaved edits remain");
                return Ok(false);
            }
        }

        let Some((_, doc)) = self.inner.documents.remove_if(id, |_, doc| !doc.dirty) else {
            if self.inner.documents.contains_key(id) {
                warn!("Note changed while closing, keeping it open");
                return Ok(false);
            }
            return Ok(true);
        };
        self.forget(id, &doc.path);

        if let Err(e) = self.inner.wal.flush().await {
            warn!(error = %e, "Write-ahead log flush after close failed");
        }
        debug!("Closed note");
        Ok(true)
    }

    /// Close a note and throw away unsaved edits
    pub async fn discard_note(&self, id: &DocumentId) -> StorageResult<()> {
        self.inner.timers.cancel(id.as_str());
        let (_, doc) = self
            .inner
            .documents
            .remove(id)
            .ok_or_else(|| StorageError::document_not_found(id.as_str()))?;
        self.inner.wal.mark_persisted(id.as_str());
        self.forget(id, &doc.path);
        if doc.dirty {
            info!(document_id = %id, "Discarded unsaved edits");
        }
        self.inner.wal.flush().await
    }

    fn forget(&self, id: &DocumentId, path: &Path) {
        self.inner.paths.remove(path);
        self.inner.detector.unwatch(path);
        self.inner.buffer.clear_buffer(id.as_str());
        self.inner.breaker.reset(id.as_str());
        self.inner.coalescer.forget(id.as_str());
    }

    /// Move a note's file and keep its id
    #[instrument(skip_all, fields(document_id = %id, to = %new_path.display()))]
    pub async fn remap_note_path(&self, id: &DocumentId, new_path: &Path) -> StorageResult<()> {
        self.ensure_running()?;
        let new_path = self.note_path(new_path);
        let old_path = self
            .get_file_path(id)
            .ok_or_else(|| StorageError::document_not_found(id.as_str()))?;
        if new_path == old_path {
            return Ok(());
        }
        if let Some(other) = self.inner.paths.get(&new_path)
            && other.value() != id
        {
            return Err(StorageError::io(format!(
                "{} is already open",
                new_path.display()
            )));
        }

        // No save may write the old path while it moves
        let permit = match self
            .inner
            .coalescer
            .admit(id.as_str(), SavePriority::Shutdown)
            .await
        {
            Admission::Acquired(permit) => permit,
            Admission::Coalesced => return Err(StorageError::closed("save gate")),
        };

        if self.inner.fs.exists(&old_path).await
            && let Err(e) = self.inner.fs.rename(&old_path, &new_path).await
        {
            if e.is_permanent() {
                return Err(e);
            }
            // Moves across devices cannot rename
            debug!(error = %e, "Rename failed, copying instead");
            self.inner.fs.copy(&old_path, &new_path).await?;
            self.inner.fs.remove_file(&old_path).await?;
        }

        let saved = {
            let mut doc = self
                .inner
                .documents
                .get_mut(id)
                .ok_or_else(|| StorageError::document_not_found(id.as_str()))?;
            doc.path = new_path.clone();
            doc.saved.content.clone()
        };
        self.inner.paths.remove(&old_path);
        self.inner.paths.insert(new_path.clone(), id.clone());
        self.inner.detector.unwatch(&old_path);
        self.inner.detector.watch(&new_path, id, Some(&saved));
        let rerun = permit.release();

        info!(from = %old_path.display(), "Moved note");
        if rerun && self.is_note_dirty(id) {
            self.schedule_auto_save(id);
        }
        Ok(())
    }

    /// Settle a pending external change
    pub fn resolve_external_change(
        &self,
        id: &DocumentId,
        resolution: ExternalResolution,
    ) -> StorageResult<()> {
        let schedule = {
            let mut doc = self
                .inner
                .documents
                .get_mut(id)
                .ok_or_else(|| StorageError::document_not_found(id.as_str()))?;
            let Some(external) = doc.pending_external.take() else {
                debug!(document_id = %id, "No external change pending");
                return Ok(());
            };

            match resolution {
                ExternalResolution::KeepExternal => {
                    self.inner.buffer.buffer_content(id.as_str(), &external);
                    doc.saved =
                        SavedSnapshot::new(external, self.inner.config.large_content_threshold);
                    doc.dirty = false;
                    doc.wal_sequence = None;
                    self.inner.wal.mark_persisted(id.as_str());
                    false
                }
                ExternalResolution::KeepLocal => {
                    doc.saved =
                        SavedSnapshot::new(external, self.inner.config.large_content_threshold);
                    doc.dirty = true;
                    true
                }
            }
        };

        if schedule && self.inner.config.auto_save {
            self.schedule_auto_save(id);
        } else if !schedule {
            self.inner.timers.cancel(id.as_str());
        }
        info!(document_id = %id, ?resolution, "Resolved external change");
        self.inner.events.publish(PersistenceEvent::ExternalChangeResolved {
            document_id: id.clone(),
            resolution,
        });
        Ok(())
    }

    /// Feed a filesystem notification for `path` to the change detector
    pub fn notify_external_change(&self, path: &Path) -> StorageResult<()> {
        self.inner.detector.notify_path_changed(&self.note_path(path))
    }

    fn apply_external_change(&self, change: DetectedChange) {
        let conflict = {
            let Some(mut doc) = self.inner.documents.get_mut(&change.document_id) else {
                return;
            };
            if doc.dirty {
                doc.pending_external = Some(change.content);
                true
            } else {
                self.inner
                    .buffer
                    .buffer_content(change.document_id.as_str(), &change.content);
                doc.saved =
                    SavedSnapshot::new(change.content, self.inner.config.large_content_threshold);
                doc.pending_external = None;
                false
            }
        };

        if conflict {
            warn!(document_id = %change.document_id, "External change conflicts with unsaved edits");
        } else {
            info!(document_id = %change.document_id, "Reloaded note changed on disk");
        }
        self.inner.events.publish(PersistenceEvent::ExternalChangeDetected {
            document_id: change.document_id,
            path: change.path,
            conflict,
        });
    }

    /// Latest in-memory content
    pub fn get_content(&self, id: &DocumentId) -> Option<String> {
        self.inner.buffer.get_latest_content(id.as_str())
    }

    /// Content as of the last successful save or load
    pub fn get_last_saved_content(&self, id: &DocumentId) -> Option<String> {
        self.inner
            .documents
            .get(id)
            .map(|doc| doc.saved.content.clone())
    }

    pub fn get_file_path(&self, id: &DocumentId) -> Option<PathBuf> {
        self.inner.documents.get(id).map(|doc| doc.path.clone())
    }

    /// Id of the open note at `path`
    pub fn get_note_id_for_path(&self, path: &Path) -> Option<DocumentId> {
        self.inner
            .paths
            .get(&self.note_path(path))
            .map(|id| id.value().clone())
    }

    pub fn is_note_dirty(&self, id: &DocumentId) -> bool {
        self.inner.documents.get(id).is_some_and(|doc| doc.dirty)
    }

    pub fn is_saving(&self, id: &DocumentId) -> bool {
        self.inner.coalescer.is_saving(id.as_str())
    }

    pub fn has_pending_external_change(&self, id: &DocumentId) -> bool {
        self.inner
            .documents
            .get(id)
            .is_some_and(|doc| doc.pending_external.is_some())
    }

    pub fn get_dirty_note_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .inner
            .documents
            .iter()
            .filter(|doc| doc.dirty)
            .map(|doc| doc.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn open_note_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .inner
            .documents
            .iter()
            .map(|doc| doc.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of an open note's state
    pub fn note_info(&self, id: &DocumentId) -> Option<NoteInfo> {
        let (file_path, is_dirty, has_external_change) = {
            let doc = self.inner.documents.get(id)?;
            (doc.path.clone(), doc.dirty, doc.pending_external.is_some())
        };
        let buffered = self.inner.buffer.get_buffered_content(id.as_str())?;
        Some(NoteInfo {
            id: id.clone(),
            file_path,
            content_hash: buffered
                .content_hash
                .unwrap_or_else(|| ContentHash::of(&buffered.content)),
            is_dirty,
            is_saving: self.is_saving(id),
            update_count: buffered.update_count,
            last_update_timestamp: Some(buffered.timestamp),
            has_external_change,
        })
    }

    /// Breaker state for a note, if it has failed recently
    pub fn breaker_status(&self, id: &DocumentId) -> Option<BreakerStatus> {
        self.inner.breaker.status(id.as_str())
    }

    /// Whether the write-ahead log can currently protect this note
    pub fn is_recovery_degraded(&self, id: &DocumentId) -> bool {
        self.inner.wal.is_degraded(id.as_str())
    }

    /// Unpersisted WAL content per note id, as on disk
    pub async fn recover_unpersisted_changes(&self) -> StorageResult<HashMap<String, String>> {
        self.inner.wal.recover_unpersisted_changes().await
    }

    /// Force queued WAL records to disk
    pub async fn flush_log(&self) -> StorageResult<()> {
        self.inner.wal.flush().await
    }

    /// Stop background work and save every dirty note
    ///
    /// Timers and the watcher stop first; the final save pass waits for any
    /// in-flight save of the same note. Later calls return an empty result.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> BatchSaveResult {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return BatchSaveResult::default();
        }
        info!("Shutting down persistence engine");

        self.inner.timers.cancel_all();
        self.inner.detector.shutdown().await;

        let result = self.save_all_dirty().await;

        self.inner.cancel.cancel();
        if let Err(e) = self.inner.wal.shutdown().await {
            error!(error = %e, "Write-ahead log did not shut down cleanly");
        }
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!(
            saved = result.success_count,
            failed = result.failure_count,
            "Persistence engine stopped"
        );
        result
    }
}

async fn listen_for_changes(
    engine: Weak<EngineInner>,
    mut changes: mpsc::UnboundedReceiver<DetectedChange>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };
        let Some(inner) = engine.upgrade() else {
            break;
        };
        PersistenceEngine { inner }.apply_external_change(change);
    }
}

async fn listen_for_wal_health(
    events: EventBus,
    mut health: broadcast::Receiver<WalHealth>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = health.recv() => update,
        };
        match update {
            Ok(WalHealth::Degraded { document_id }) => {
                warn!(document_id = %document_id, "Crash recovery degraded");
                events.publish(PersistenceEvent::RecoveryDegraded {
                    document_id: DocumentId::from_raw(document_id),
                });
            }
            Ok(WalHealth::Restored { document_id }) => {
                info!(document_id = %document_id, "Crash recovery restored");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed write-ahead log health updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
