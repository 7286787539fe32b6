//! # Inkwell Storage
//!
//! Durable note-save engine for the Inkwell desktop notes app.
//!
//! Takes in-memory editor content, coalesces rapid edits, writes notes to
//! disk atomically with crash recovery, notices when note files change on
//! disk and keeps working when some files cannot be written.
//!
//! ## Features
//!
//! - **ContentBuffer**: latest content per note with distinct-update counters
//! - **WriteAheadLog**: batched, compacting log of unsaved content for crash recovery
//! - **CircuitBreaker**: per-note failure counting that stops hammering broken files
//! - **SaveCoalescer / DebounceTimers**: single-flight saves and cancellable auto-save
//! - **ExternalChangeDetector**: debounced `notify` watcher with self-write suppression
//! - **PersistenceEngine**: orchestrates all of the above behind an async API
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use inkwell_storage::{PersistenceConfig, PersistenceEngine, PersistenceEvent};
//!
//! #[tokio::main]
//! async fn main() -> inkwell_storage::StorageResult<()> {
//!     let engine = PersistenceEngine::new(PersistenceConfig::default()).await?;
//!     let mut events = engine.subscribe();
//!
//!     let id = engine.open_note(Path::new("/home/me/notes/today.md")).await?;
//!     engine.update_content(&id, "# Today\n\n- ship it\n")?;
//!
//!     let outcome = engine.save_note(&id).await?;
//!     assert!(outcome.succeeded());
//!     assert!(matches!(events.recv().await, Ok(PersistenceEvent::SaveStarted { .. })));
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod buffer;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod fs;
pub mod scheduler;
pub mod wal;
pub mod watcher;

// Re-exports
pub use breaker::{BreakerState, BreakerStatus, CircuitBreaker};
pub use buffer::{BufferUpdate, BufferedContent, ContentBuffer};
pub use config::{
    BreakerConfig, LineEndings, PersistenceConfig, SaveConversion, WalConfig, WatchConfig,
    default_data_dir,
};
pub use document::{ContentHash, DocumentId, EditableNote};
pub use engine::{BatchSaveResult, NoteInfo, PersistenceEngine, SaveOutcome};
pub use error::{StorageError, StorageResult};
pub use events::{ExternalResolution, PersistenceEvent};
pub use fs::{FileSystem, InMemoryFileSystem, LocalFileSystem};
pub use scheduler::SavePriority;
pub use wal::{WalEntry, WalHealth, WriteAheadLog};
pub use watcher::{DetectedChange, ExternalChangeDetector};
