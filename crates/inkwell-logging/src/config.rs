//! What to log and where

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// `<local data dir>/inkwell/logs`, or `./inkwell/logs` when the platform has none
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("inkwell")
        .join("logs")
}

/// Logging setup for an Inkwell host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `"info"` or `"warn,inkwell_storage=debug"`
    pub filter: String,
    /// Console sink; `None` disables it
    pub console: Option<ConsoleOutput>,
    /// Rolling file sink; `None` disables it
    pub file: Option<FileOutput>,
    /// Layout of JSON lines, shared by every JSON sink
    pub json: JsonFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            console: Some(ConsoleOutput::default()),
            file: None,
            json: JsonFormat::default(),
        }
    }
}

impl LogConfig {
    /// Debug-level, colored, human-readable console
    pub fn development() -> Self {
        Self {
            filter: "debug".into(),
            console: Some(ConsoleOutput {
                format: ConsoleFormat::Pretty,
                ansi: true,
                filter: None,
            }),
            ..Self::default()
        }
    }

    /// Daily JSON files under `log_dir`; only warnings reach the console
    pub fn production(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            filter: "info".into(),
            console: Some(ConsoleOutput {
                filter: Some("warn".into()),
                ..ConsoleOutput::default()
            }),
            file: Some(FileOutput::in_dir(log_dir)),
            json: JsonFormat::default(),
        }
    }

    /// Warnings and errors only, no colors
    pub fn testing() -> Self {
        Self {
            filter: "warn".into(),
            ..Self::default()
        }
    }
}

/// How console lines look
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    #[default]
    Json,
    Pretty,
}

/// Console sink (stderr)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleOutput {
    pub format: ConsoleFormat,
    /// Colors; only honored by the pretty format
    pub ansi: bool,
    /// Narrower directives for the console alone
    pub filter: Option<String>,
}

/// Rolling file sink, always JSON lines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOutput {
    pub dir: PathBuf,
    /// File names are `<file_prefix>.<date>.log`, or `<file_prefix>.log` with [`RollEvery::Never`]
    pub file_prefix: String,
    pub roll: RollEvery,
    /// Old files kept after rolling; `None` keeps all
    pub keep: Option<usize>,
}

impl Default for FileOutput {
    fn default() -> Self {
        Self::in_dir(default_log_dir())
    }
}

impl FileOutput {
    /// Daily files named `inkwell.*.log` in `dir`, two weeks kept
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file_prefix: "inkwell".into(),
            roll: RollEvery::Day,
            keep: Some(14),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollEvery {
    #[default]
    Day,
    Hour,
    /// One file that keeps growing
    Never,
}

/// JSON line layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFormat {
    /// Event fields at the top level instead of under `fields`
    pub flatten: bool,
    /// Add the stack of entered spans under `spans`
    pub span_list: bool,
    /// Add `filename` and `line_number`
    pub source_location: bool,
}

impl Default for JsonFormat {
    fn default() -> Self {
        Self {
            flatten: true,
            span_list: true,
            source_location: false,
        }
    }
}
