//! Configuration for the persistence engine
//!
//! Read once at startup, either built in code with the `with_*` setters or
//! loaded from a TOML file. Durations are written in milliseconds in TOML
//! (`flush_interval_ms = 1000`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::DEFAULT_LARGE_CONTENT_THRESHOLD;
use crate::error::{StorageError, StorageResult};

/// Application directory name under the platform data directory
pub const APP_DIR_NAME: &str = "inkwell";

/// Default base directory for engine-private state
///
/// Uses the platform's local (non-roaming, non-synced) data directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Root folder of the user's notes; relative note paths resolve here
    pub notes_root: Option<PathBuf>,
    /// Quiet period after the last edit before an automatic save
    #[serde(rename = "auto_save_delay_ms", with = "duration_ms")]
    pub auto_save_delay: Duration,
    /// Whether distinct edits schedule an automatic save at all
    pub auto_save: bool,
    /// Content size (bytes) above which hashes replace string comparison
    pub large_content_threshold: usize,
    /// Capacity of the engine event channel
    pub event_channel_capacity: usize,
    /// Write-ahead log settings
    pub wal: WalConfig,
    /// Circuit breaker policy for note writes
    pub breaker: BreakerConfig,
    /// External change detection settings
    pub watch: WatchConfig,
    /// Conversions applied to the bytes written on save
    pub conversion: SaveConversion,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            notes_root: None,
            auto_save_delay: Duration::from_secs(2),
            auto_save: true,
            large_content_threshold: DEFAULT_LARGE_CONTENT_THRESHOLD,
            event_channel_capacity: 256,
            wal: WalConfig::default(),
            breaker: BreakerConfig::default(),
            watch: WatchConfig::default(),
            conversion: SaveConversion::default(),
        }
    }
}

impl PersistenceConfig {
    /// Create a configuration keeping engine state under `data_dir`
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            wal: WalConfig::with_directory(data_dir.as_ref().join("persistence")),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StorageError::config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(raw: &str) -> StorageResult<Self> {
        toml::from_str(raw).map_err(|e| StorageError::config(e.to_string()))
    }

    /// Set the notes root
    pub fn with_notes_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.notes_root = Some(root.into());
        self
    }

    /// Set the auto-save delay
    pub fn with_auto_save_delay(mut self, delay: Duration) -> Self {
        self.auto_save_delay = delay;
        self
    }

    /// Enable or disable automatic saves
    pub fn with_auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }

    /// Set the write-ahead log configuration
    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Set the breaker policy
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the watch configuration
    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Set the save conversion
    pub fn with_conversion(mut self, conversion: SaveConversion) -> Self {
        self.conversion = conversion;
        self
    }

    /// Resolve a note path against the notes root
    pub fn resolve_note_path(&self, path: &Path) -> PathBuf {
        match &self.notes_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Write-ahead log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding `persistence-*.log` segments
    pub directory: PathBuf,
    /// Upper bound on how long an appended change stays in memory
    #[serde(rename = "flush_interval_ms", with = "duration_ms")]
    pub flush_interval: Duration,
    /// Segment size that triggers rotation with compaction
    pub max_segment_size: u64,
    /// Whether flushes call `sync_data`
    pub sync_on_flush: bool,
    /// Consecutive failed flushes before a document's recovery is degraded
    pub failure_threshold: u32,
    /// Largest encoded change the log accepts; bigger ones degrade recovery
    /// for their note instead of being written
    pub max_record_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self::with_directory(default_data_dir().join("persistence"))
    }
}

impl WalConfig {
    /// Default settings with a custom directory
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            flush_interval: Duration::from_secs(1),
            max_segment_size: 8 * 1024 * 1024, // 8MB
            sync_on_flush: true,
            failure_threshold: 3,
            max_record_size: 64 * 1024 * 1024, // 64MB
        }
    }

    /// Set the flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the rotation size
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the largest accepted record
    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }
}

/// Circuit breaker policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time after which an open breaker allows one trial write
    #[serde(rename = "cool_down_ms", with = "duration_ms_opt")]
    pub cool_down: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Some(Duration::from_secs(30)),
        }
    }
}

/// External change detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Start an OS filesystem watcher for open notes
    pub enabled: bool,
    /// Quiet period that folds a burst of events into one notification
    #[serde(rename = "debounce_ms", with = "duration_ms")]
    pub debounce: Duration,
    /// How long the pre-save content of a file is still treated as our own
    #[serde(rename = "self_write_window_ms", with = "duration_ms")]
    pub self_write_window: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(500),
            self_write_window: Duration::from_secs(2),
        }
    }
}

/// Line ending policy applied when writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEndings {
    /// Write content as-is
    #[default]
    Preserve,
    /// Convert to `\n`
    Lf,
    /// Convert to `\r\n`
    Crlf,
}

/// Conversions applied to the bytes written on save
///
/// In-memory content is never changed; dirty tracking compares against the
/// unconverted text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConversion {
    pub line_endings: LineEndings,
    pub ensure_trailing_newline: bool,
}

impl SaveConversion {
    /// Produce the on-disk form of `content`
    pub fn apply(&self, content: &str) -> String {
        let mut out = match self.line_endings {
            LineEndings::Preserve => content.to_string(),
            LineEndings::Lf => content.replace("\r\n", "\n"),
            LineEndings::Crlf => content.replace("\r\n", "\n").replace('\n', "\r\n"),
        };
        if self.ensure_trailing_newline && !out.is_empty() && !out.ends_with('\n') {
            match self.line_endings {
                LineEndings::Crlf => out.push_str("\r\n"),
                _ => out.push('\n'),
            }
        }
        out
    }

    /// Whether `apply` can change anything
    pub fn is_identity(&self) -> bool {
        self.line_endings == LineEndings::Preserve && !self.ensure_trailing_newline
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
