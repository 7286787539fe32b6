//! Subcommand implementations
//!
//! Each command builds its own engine or log handle from the loaded
//! configuration and tears it down before returning.

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use inkwell_storage::{
    BatchSaveResult, PersistenceConfig, PersistenceEngine, PersistenceEvent, SaveOutcome,
    StorageResult, WatchConfig, WriteAheadLog,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// An unsaved change found in the write-ahead log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableChange {
    pub document_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub bytes: usize,
}

/// Config for commands that run once: no auto-save timers, no OS watcher
fn one_shot(config: &PersistenceConfig) -> PersistenceConfig {
    config.clone().with_auto_save(false).with_watch(WatchConfig {
        enabled: false,
        ..config.watch.clone()
    })
}

/// Unsaved changes in the log, oldest first
pub async fn list_recoverable(config: &PersistenceConfig) -> StorageResult<Vec<RecoverableChange>> {
    let wal = WriteAheadLog::open(config.wal.clone()).await?;
    let entries = wal.recover_entries().await;
    wal.shutdown().await?;

    let mut changes: Vec<RecoverableChange> = entries?
        .into_values()
        .map(|entry| RecoverableChange {
            bytes: entry.content.len(),
            document_id: entry.document_id,
            sequence: entry.sequence,
            timestamp: entry.timestamp,
        })
        .collect();
    changes.sort_by_key(|c| (c.timestamp, c.sequence));
    Ok(changes)
}

/// Open each note, letting the engine apply recovered content, and save it
pub async fn restore_notes(
    config: &PersistenceConfig,
    paths: &[PathBuf],
) -> StorageResult<Vec<(PathBuf, SaveOutcome)>> {
    let engine = PersistenceEngine::new(one_shot(config)).await?;
    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let outcome = match engine.open_note(path).await {
            Ok(id) if engine.is_note_dirty(&id) => engine.save_note(&id).await,
            Ok(_) => Ok(SaveOutcome::Unchanged),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(outcome) => results.push((path.clone(), outcome)),
            Err(e) => {
                engine.shutdown().await;
                return Err(e);
            }
        }
    }
    engine.shutdown().await;
    Ok(results)
}

/// Delete the log; returns how many unsaved changes were dropped
pub async fn clear_log(config: &PersistenceConfig) -> StorageResult<usize> {
    let wal = WriteAheadLog::open(config.wal.clone()).await?;
    let dropped = wal.pending_count();
    let cleared = wal.clear_log().await;
    wal.shutdown().await?;
    cleared?;
    if dropped > 0 {
        warn!(dropped, "Cleared write-ahead log with unsaved changes");
    } else {
        info!("Cleared write-ahead log");
    }
    Ok(dropped)
}

/// Replace a note's content and save it
pub async fn save_note(
    config: &PersistenceConfig,
    path: &Path,
    content: &str,
) -> StorageResult<SaveOutcome> {
    let engine = PersistenceEngine::new(one_shot(config)).await?;
    let result = async {
        let id = engine.open_note(path).await?;
        engine.update_content(&id, content)?;
        engine.save_note(&id).await
    }
    .await;
    engine.shutdown().await;
    result
}

/// Open notes, report engine events until `stop` resolves, then shut down
pub async fn watch_notes<F>(
    config: &PersistenceConfig,
    paths: &[PathBuf],
    stop: F,
    mut on_event: impl FnMut(&PersistenceEvent),
) -> StorageResult<BatchSaveResult>
where
    F: Future<Output = ()>,
{
    let engine = PersistenceEngine::new(config.clone()).await?;
    let mut events = engine.subscribe();
    for path in paths {
        if let Err(e) = engine.open_note(path).await {
            engine.shutdown().await;
            return Err(e);
        }
    }
    info!(notes = paths.len(), "Watching notes");

    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Ok(event) => on_event(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(engine.shutdown().await)
}

/// One-line description of an engine event
pub fn describe(event: &PersistenceEvent) -> String {
    let id = event.document_id().short();
    match event {
        PersistenceEvent::SaveStarted { .. } => format!("{id} saving"),
        PersistenceEvent::Saved { path, bytes, .. } => {
            format!("{id} saved {bytes} bytes to {}", path.display())
        }
        PersistenceEvent::SaveFailed { reason, .. } => format!("{id} save failed: {reason}"),
        PersistenceEvent::CircuitOpened { failure_count, .. } => {
            format!("{id} paused after {failure_count} failed saves")
        }
        PersistenceEvent::ExternalChangeDetected { path, conflict, .. } => {
            if *conflict {
                format!("{id} changed on disk, conflicts with unsaved edits ({})", path.display())
            } else {
                format!("{id} reloaded from disk ({})", path.display())
            }
        }
        PersistenceEvent::ExternalChangeResolved { resolution, .. } => {
            format!("{id} external change resolved: {resolution:?}")
        }
        PersistenceEvent::Recovered { .. } => format!("{id} restored unsaved content"),
        PersistenceEvent::RecoveryDegraded { .. } => {
            format!("{id} crash recovery unavailable, save soon")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_storage::DocumentId;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> PersistenceConfig {
        one_shot(&PersistenceConfig::with_data_dir(dir.join("data")))
    }

    /// Leave an unsaved edit in the log, as a crashed session would
    async fn leave_unsaved(config: &PersistenceConfig, path: &Path, content: &str) {
        let engine = PersistenceEngine::new(config.clone()).await.unwrap();
        let id = engine.open_note(path).await.unwrap();
        engine.update_content(&id, content).unwrap();
        engine.flush_log().await.unwrap();
        drop(engine);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_save_writes_file() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let path = temp.path().join("notes").join("today.md");

        let outcome = save_note(&config, &path, "# Today").await.unwrap();
        assert_eq!(outcome, SaveOutcome::Saved { bytes: 7 });
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# Today");
        assert!(list_recoverable(&config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_restore() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let path = temp.path().join("a.md");
        std::fs::write(&path, "old").unwrap();
        leave_unsaved(&config, &path, "unsaved words").await;

        let changes = list_recoverable(&config).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].document_id, DocumentId::from_path(&path).as_str());
        assert_eq!(changes[0].bytes, "unsaved words".len());

        let results = restore_notes(&config, std::slice::from_ref(&path))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.wrote());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "unsaved words");
        assert!(list_recoverable(&config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_log_drops_changes() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let path = temp.path().join("a.md");
        leave_unsaved(&config, &path, "gone").await;

        assert_eq!(clear_log(&config).await.unwrap(), 1);
        assert!(list_recoverable(&config).await.unwrap().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_watch_stops_and_reports_shutdown() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let path = temp.path().join("a.md");
        std::fs::write(&path, "watched").unwrap();

        let mut seen = Vec::new();
        let result = watch_notes(
            &config,
            std::slice::from_ref(&path),
            tokio::time::sleep(Duration::from_millis(50)),
            |event| seen.push(describe(event)),
        )
        .await
        .unwrap();
        assert!(result.all_succeeded());
        assert!(seen.is_empty());
    }

    #[test]
    fn test_describe_conflict() {
        let event = PersistenceEvent::ExternalChangeDetected {
            document_id: DocumentId::from_raw("0123456789abcdef"),
            path: PathBuf::from("/notes/a.md"),
            conflict: true,
        };
        let line = describe(&event);
        assert!(line.starts_with("01234567 "));
        assert!(line.contains("conflicts"));
    }
}
