//! Write-ahead log of unpersisted note content
//!
//! [`WriteAheadLog::log_change`] never touches disk: it records the latest
//! content per document in memory and queues a record for a background writer
//! that flushes batches at least every `flush_interval`. Once a save succeeds
//! the engine calls [`WriteAheadLog::mark_persisted_through`] and the entry
//! drops out of recovery.
//!
//! When the active segment grows past `max_segment_size` the writer starts a
//! new segment seeded with the live entries only and deletes the old ones.
//! Repeated flush failures are tracked per document with a [`CircuitBreaker`]
//! and reported as [`WalHealth`] events.

mod segment;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::config::{BreakerConfig, WalConfig};
use crate::error::{StorageError, StorageResult};
use segment::{ActiveSegment, WalRecord, encode_record, list_segments, replay_dir};

/// Latest logged content for a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub document_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub persisted: bool,
    /// Monotonic position of this change in the log
    pub sequence: u64,
}

/// Health transitions of the log for a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalHealth {
    /// Flushes keep failing; crash recovery for this document is at risk
    Degraded { document_id: String },
    /// A flush succeeded again after degradation
    Restored { document_id: String },
}

enum WalCommand {
    Append(WalRecord),
    Flush(oneshot::Sender<StorageResult<()>>),
    Clear(oneshot::Sender<StorageResult<()>>),
    Shutdown(oneshot::Sender<StorageResult<()>>),
}

/// Durable log of pending content changes
pub struct WriteAheadLog {
    directory: PathBuf,
    next_sequence: AtomicU64,
    pending: Arc<DashMap<String, WalEntry>>,
    health: Arc<CircuitBreaker>,
    health_tx: broadcast::Sender<WalHealth>,
    commands: mpsc::UnboundedSender<WalCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("directory", &self.directory)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl WriteAheadLog {
    /// Open the log in `config.directory`, replaying existing segments
    ///
    /// Must be called from within a tokio runtime; the background writer is
    /// spawned here and inherits the current tracing dispatcher.
    #[instrument(skip_all, fields(dir = %config.directory.display()))]
    pub async fn open(config: WalConfig) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&config.directory).await?;
        let replay = replay_dir(&config.directory).await?;

        let pending = Arc::new(DashMap::new());
        for (id, entry) in replay.unpersisted() {
            pending.insert(id, entry);
        }
        info!(
            records = replay.records,
            unpersisted = pending.len(),
            "Opened write-ahead log"
        );

        let health = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: config.failure_threshold,
            cool_down: None,
        }));
        let (health_tx, _) = broadcast::channel(64);
        let (commands, rx) = mpsc::unbounded_channel();

        let writer = Writer {
            config: config.clone(),
            active: None,
            batch: Vec::new(),
            pending: pending.clone(),
            health: health.clone(),
            health_tx: health_tx.clone(),
        };
        let handle = tokio::spawn(
            writer
                .run(rx)
                .instrument(info_span!("wal_writer"))
                .with_current_subscriber(),
        );

        Ok(Self {
            directory: config.directory,
            next_sequence: AtomicU64::new(replay.max_sequence + 1),
            pending,
            health,
            health_tx,
            commands,
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Directory holding the segments
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Record new content for a document
    ///
    /// Returns the sequence assigned to the change, or `None` for an empty
    /// id. Never blocks on I/O; a stopped writer is logged, not returned.
    pub fn log_change(&self, id: &str, content: &str) -> Option<u64> {
        if id.trim().is_empty() {
            return None;
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let entry = WalEntry {
            document_id: id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            persisted: false,
            sequence,
        };
        let record = WalRecord::change(&entry);

        self.pending
            .entry(id.to_string())
            .and_modify(|existing| {
                if existing.sequence < sequence {
                    *existing = entry.clone();
                }
            })
            .or_insert(entry);

        if self.commands.send(WalCommand::Append(record)).is_err() {
            warn!(document_id = id, sequence, "Write-ahead log writer stopped, change kept in memory only");
        }
        Some(sequence)
    }

    /// Mark everything logged for `id` so far as persisted
    pub fn mark_persisted(&self, id: &str) {
        let through = self.next_sequence.load(Ordering::SeqCst).saturating_sub(1);
        self.mark_persisted_through(id, through);
    }

    /// Mark changes up to and including `sequence` as persisted
    ///
    /// A newer change logged while a save was in flight stays pending.
    pub fn mark_persisted_through(&self, id: &str, sequence: u64) {
        if id.trim().is_empty() {
            return;
        }
        self.pending
            .remove_if(id, |_, entry| entry.sequence <= sequence);

        let record = WalRecord::Persisted {
            document_id: id.to_string(),
            through_sequence: sequence,
            timestamp_millis: Utc::now().timestamp_millis(),
        };
        if self.commands.send(WalCommand::Append(record)).is_err() {
            warn!(document_id = id, "Write-ahead log writer stopped, persisted mark not logged");
        }
    }

    /// Write every queued record to disk
    pub async fn flush(&self) -> StorageResult<()> {
        self.request(WalCommand::Flush).await
    }

    /// Latest unpersisted content per document, as read back from disk
    pub async fn recover_unpersisted_changes(&self) -> StorageResult<HashMap<String, String>> {
        Ok(self
            .recover_entries()
            .await?
            .into_iter()
            .map(|(id, entry)| (id, entry.content))
            .collect())
    }

    /// Like [`recover_unpersisted_changes`](Self::recover_unpersisted_changes)
    /// but with full entries
    pub async fn recover_entries(&self) -> StorageResult<HashMap<String, WalEntry>> {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Flush before recovery failed, reading what is on disk");
        }
        Ok(replay_dir(&self.directory).await?.unpersisted())
    }

    /// Delete every segment and forget all pending entries
    pub async fn clear_log(&self) -> StorageResult<()> {
        self.pending.clear();
        self.health.reset_all();
        self.request(WalCommand::Clear).await
    }

    /// Pending entry for a document, if any
    pub fn pending_entry(&self, id: &str) -> Option<WalEntry> {
        self.pending.get(id).map(|e| e.value().clone())
    }

    /// Number of documents with unpersisted changes
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether flushes for `id` have failed past the health threshold
    pub fn is_degraded(&self, id: &str) -> bool {
        self.health.is_open(id)
    }

    /// Subscribe to health transitions
    pub fn health_events(&self) -> broadcast::Receiver<WalHealth> {
        self.health_tx.subscribe()
    }

    /// Flush, close the active segment and stop the writer
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let Some(handle) = self.writer.lock().take() else {
            return Ok(());
        };
        let result = self.request(WalCommand::Shutdown).await;
        if let Err(e) = handle.await {
            error!(error = %e, "Write-ahead log writer panicked");
        }
        result
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<StorageResult<()>>) -> WalCommand,
    ) -> StorageResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| StorageError::closed("write-ahead log writer"))?;
        rx.await
            .map_err(|_| StorageError::closed("write-ahead log writer"))?
    }
}

/// Background task owning the active segment
struct Writer {
    config: WalConfig,
    active: Option<ActiveSegment>,
    batch: Vec<WalRecord>,
    pending: Arc<DashMap<String, WalEntry>>,
    health: Arc<CircuitBreaker>,
    health_tx: broadcast::Sender<WalHealth>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WalCommand>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(WalCommand::Append(record)) => self.batch.push(record),
                    Some(WalCommand::Flush(reply)) => {
                        let _ = reply.send(self.flush().await);
                    }
                    Some(WalCommand::Clear(reply)) => {
                        let _ = reply.send(self.clear().await);
                    }
                    Some(WalCommand::Shutdown(reply)) => {
                        let result = self.flush().await;
                        self.close_active().await;
                        let _ = reply.send(result);
                        break;
                    }
                    None => {
                        let _ = self.flush().await;
                        self.close_active().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.batch.is_empty()
                        && let Err(e) = self.flush().await
                    {
                        warn!(error = %e, "Periodic write-ahead log flush failed");
                    }
                }
            }
        }
        debug!("Write-ahead log writer stopped");
    }

    async fn flush(&mut self) -> StorageResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        let mut rejected = HashSet::new();
        let mut rejection = None;
        for record in std::mem::take(&mut self.batch) {
            match encode_record(&record, self.config.max_record_size, &mut buf) {
                Ok(()) => self.batch.push(record),
                Err(e) => {
                    let id = record.document_id().to_string();
                    error!(
                        document_id = %id,
                        error = %e,
                        "Change too large for the write-ahead log"
                    );
                    if self.health.trip(&id) {
                        let _ = self.health_tx.send(WalHealth::Degraded {
                            document_id: id.clone(),
                        });
                    }
                    rejected.insert(id);
                    rejection = Some(e);
                }
            }
        }
        let ids: HashSet<String> = self
            .batch
            .iter()
            .map(|r| r.document_id().to_string())
            .filter(|id| !rejected.contains(id))
            .collect();
        if self.batch.is_empty() {
            return rejection.map_or(Ok(()), Err);
        }

        match self.write(&buf).await {
            Ok(()) => {
                debug!(records = self.batch.len(), bytes = buf.len(), "Flushed write-ahead log");
                self.batch.clear();
                for id in &ids {
                    self.note_success(id);
                }
                if self
                    .active
                    .as_ref()
                    .is_some_and(|s| s.size > self.config.max_segment_size)
                    && let Err(e) = self.rotate().await
                {
                    warn!(error = %e, "Write-ahead log rotation failed");
                }
                rejection.map_or(Ok(()), Err)
            }
            Err(e) => {
                error!(error = %e, records = self.batch.len(), "Write-ahead log flush failed");
                // The segment may now end in a partial frame; continue in a fresh one
                self.active = None;
                for id in &ids {
                    if self.health.record_failure(id) {
                        let _ = self.health_tx.send(WalHealth::Degraded {
                            document_id: id.clone(),
                        });
                    }
                }
                Err(e)
            }
        }
    }

    fn note_success(&self, id: &str) {
        if self.health.failure_count(id) == 0 {
            return;
        }
        let was_open = self.health.is_open(id);
        self.health.record_success(id);
        if was_open {
            let _ = self.health_tx.send(WalHealth::Restored {
                document_id: id.to_string(),
            });
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> StorageResult<()> {
        if self.active.is_none() {
            self.active = Some(ActiveSegment::create(&self.config.directory).await?);
        }
        match self.active.as_mut() {
            Some(segment) => segment.append(bytes, self.config.sync_on_flush).await,
            None => Err(StorageError::closed("write-ahead log segment")),
        }
    }

    /// Start a new segment holding only live entries and drop the rest
    async fn rotate(&mut self) -> StorageResult<()> {
        let mut fresh = ActiveSegment::create(&self.config.directory).await?;

        let mut buf = Vec::new();
        for entry in self.pending.iter() {
            let record = WalRecord::change(entry.value());
            if let Err(e) = encode_record(&record, self.config.max_record_size, &mut buf) {
                warn!(
                    document_id = %entry.key(),
                    error = %e,
                    "Leaving change out of compacted segment"
                );
            }
        }
        fresh.append(&buf, true).await?;

        if let Some(old) = self.active.replace(fresh) {
            let _ = old.close().await;
        }
        let keep = self.active.as_ref().map(|s| s.path.clone());
        let mut removed = 0;
        for path in list_segments(&self.config.directory).await? {
            if Some(&path) != keep.as_ref() {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        info!(live = self.pending.len(), removed, "Compacted write-ahead log");
        Ok(())
    }

    async fn clear(&mut self) -> StorageResult<()> {
        self.batch.clear();
        if let Some(segment) = self.active.take() {
            let _ = segment.close().await;
        }
        for path in list_segments(&self.config.directory).await? {
            tokio::fs::remove_file(&path).await?;
        }
        info!("Cleared write-ahead log");
        Ok(())
    }

    async fn close_active(&mut self) {
        if let Some(segment) = self.active.take()
            && let Err(e) = segment.close().await
        {
            warn!(error = %e, "Failed to close write-ahead log segment");
        }
    }
}
