//! Structured logging setup for Inkwell
//!
//! Builds a [`tracing::Dispatch`] from a [`LogConfig`] instead of installing
//! a process-wide subscriber behind the caller's back. The host decides
//! whether to install it globally or only for a scope.
//!
//! # Features
//!
//! - **JSONL Output**: structured JSON lines for log files and machine-read consoles
//! - **Pretty Console**: human-readable output for development
//! - **File Rotation**: daily/hourly rolling files via tracing-appender
//! - **RUST_LOG**: env filter directives override the configured level
//!
//! # Quick Start
//!
//! ```ignore
//! use inkwell_logging::{InkwellSubscriberBuilder, LogConfig};
//!
//! let logging = InkwellSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .build()?;
//! logging.install_global()?;
//!
//! tracing::info!(path = "today.md", "Saved note");
//! ```

pub mod config;

pub use config::{
    ConsoleFormat, ConsoleOutput, FileOutput, JsonFormat, LogConfig, RollEvery, default_log_dir,
};

use std::fmt;

use thiserror::Error;
use tracing::Dispatch;
use tracing::dispatcher::DefaultGuard;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Errors from building or installing a subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid filter directive: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Cannot open log file: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("Cannot create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("A global subscriber is already installed")]
    AlreadyInstalled,
}

/// A built subscriber plus the guard keeping its file writer alive
///
/// Dropping it flushes buffered file output; hold it until the program exits
/// when a file sink is configured.
pub struct Logging {
    dispatch: Dispatch,
    file_guard: Option<WorkerGuard>,
}

impl Logging {
    /// The dispatcher, for `tracing::dispatcher::with_default` or injection
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Make this the process-wide default subscriber
    pub fn install_global(&self) -> Result<(), LoggingError> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())
            .map_err(|_| LoggingError::AlreadyInstalled)
    }

    /// Make this the default for the current thread until the guard drops
    pub fn set_default(&self) -> DefaultGuard {
        tracing::dispatcher::set_default(&self.dispatch)
    }
}

impl fmt::Debug for Logging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logging")
            .field("file_sink", &self.file_guard.is_some())
            .finish()
    }
}

/// Builder for the Inkwell tracing subscriber
#[derive(Debug, Clone)]
pub struct InkwellSubscriberBuilder {
    config: LogConfig,
    use_env: bool,
}

impl InkwellSubscriberBuilder {
    /// JSON lines to stderr at `info`, RUST_LOG honored
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
            use_env: true,
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the filter directives
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.filter = filter.into();
        self
    }

    /// Turn the console sink on or off
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console = match (enabled, self.config.console.take()) {
            (false, _) => None,
            (true, existing) => Some(existing.unwrap_or_default()),
        };
        self
    }

    /// Pretty, colored console lines instead of JSON
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        let console = self.config.console.get_or_insert_with(ConsoleOutput::default);
        console.format = if pretty {
            ConsoleFormat::Pretty
        } else {
            ConsoleFormat::Json
        };
        console.ansi = pretty;
        self
    }

    pub fn with_file_output(mut self, file: FileOutput) -> Self {
        self.config.file = Some(file);
        self
    }

    /// Ignore RUST_LOG and use the configured filter only
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Build the subscriber without installing it
    pub fn build(self) -> Result<Logging, LoggingError> {
        let filter = self.env_filter()?;
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = &self.config.console {
            let layer = match console.format {
                ConsoleFormat::Pretty => tracing_subscriber::fmt::layer()
                    .with_ansi(console.ansi)
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .boxed(),
                ConsoleFormat::Json => json_layer(&self.config.json, std::io::stderr),
            };
            layers.push(match &console.filter {
                Some(directives) => layer.with_filter(EnvFilter::try_new(directives)?).boxed(),
                None => layer,
            });
        }

        let file_guard = match &self.config.file {
            Some(file) => {
                let (writer, guard) = open_file(file)?;
                layers.push(json_layer(&self.config.json, writer));
                Some(guard)
            }
            None => None,
        };

        let subscriber = Registry::default().with(layers).with(filter);
        Ok(Logging {
            dispatch: Dispatch::new(subscriber),
            file_guard,
        })
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if self.use_env
            && let Ok(filter) = EnvFilter::try_from_default_env()
        {
            return Ok(filter);
        }
        Ok(EnvFilter::try_new(&self.config.filter)?)
    }
}

impl Default for InkwellSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn json_layer<W>(format: &JsonFormat, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(format.span_list)
        .flatten_event(format.flatten)
        .with_file(format.source_location)
        .with_line_number(format.source_location)
        .with_writer(writer)
        .boxed()
}

fn open_file(file: &FileOutput) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    std::fs::create_dir_all(&file.dir)?;
    let rotation = match file.roll {
        RollEvery::Day => Rotation::DAILY,
        RollEvery::Hour => Rotation::HOURLY,
        RollEvery::Never => Rotation::NEVER,
    };
    let mut appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file.file_prefix.as_str())
        .filename_suffix("log");
    if let Some(keep) = file.keep {
        appender = appender.max_log_files(keep);
    }
    Ok(tracing_appender::non_blocking(appender.build(&file.dir)?))
}

/// Install quiet console logging for tests; later calls are no-ops
pub fn init_testing() {
    if let Ok(logging) = InkwellSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .build()
    {
        let _ = logging.install_global();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = InkwellSubscriberBuilder::new();
        assert_eq!(builder.config.filter, "info");
        assert!(builder.use_env);
    }

    #[test]
    fn test_pretty_creates_console_sink() {
        let builder = InkwellSubscriberBuilder::new()
            .with_console(false)
            .with_pretty(true);
        let console = builder.config.console.unwrap();
        assert_eq!(console.format, ConsoleFormat::Pretty);
        assert!(console.ansi);
    }

    #[test]
    fn test_console_can_be_disabled() {
        let builder = InkwellSubscriberBuilder::new()
            .with_config(LogConfig::development())
            .with_console(false);
        assert!(builder.config.console.is_none());
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let result = InkwellSubscriberBuilder::new()
            .with_filter("inkwell=loud")
            .without_env()
            .build();
        assert!(matches!(result, Err(LoggingError::Filter(_))));
    }

    #[test]
    fn test_scoped_default_does_not_install_global() {
        let logging = InkwellSubscriberBuilder::new()
            .with_console(false)
            .without_env()
            .build()
            .unwrap();
        let _guard = logging.set_default();
        tracing::info!("only seen by the scoped subscriber");
    }
}
