use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use inkwell_logging::{InkwellSubscriberBuilder, LogConfig};
use inkwell_storage::{PersistenceConfig, default_data_dir};

/// Name of the config file looked up in the data directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Parser)]
#[command(name = "inkwell", about = "Durable note saving, recovery and file watching")]
pub struct Cli {
    /// Path to a TOML config file (default: <data dir>/inkwell/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or directives); overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Human-readable log output instead of JSON lines
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List unsaved changes left by a previous session, or restore notes
    Recover {
        /// Notes to restore from the write-ahead log and save
        paths: Vec<PathBuf>,
    },
    /// Delete every write-ahead log segment
    ClearLog {
        /// Confirm that unsaved changes may be lost
        #[arg(long)]
        yes: bool,
    },
    /// Save content to a note through the engine
    Save {
        /// Note path
        path: PathBuf,
        /// Content to write (read from stdin when omitted)
        #[arg(long)]
        content: Option<String>,
    },
    /// Watch notes for external changes until Ctrl-C
    Watch {
        /// Notes to open and watch
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

impl Cli {
    /// Logging builder for the global flags
    pub fn log_builder(&self) -> InkwellSubscriberBuilder {
        let builder = InkwellSubscriberBuilder::new()
            .with_config(LogConfig::default())
            .with_filter("warn,inkwell_storage=info,inkwell_cli=info")
            .with_pretty(self.pretty);
        match &self.log_level {
            Some(level) => builder.with_filter(level.clone()).without_env(),
            None => builder,
        }
    }

    /// Persistence config from `--config`, the default file, or defaults
    pub fn load_config(&self) -> anyhow::Result<PersistenceConfig> {
        match &self.config {
            Some(path) => PersistenceConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display())),
            None => {
                let path = default_data_dir().join(CONFIG_FILE_NAME);
                if path.exists() {
                    PersistenceConfig::load(&path)
                        .with_context(|| format!("loading config from {}", path.display()))
                } else {
                    Ok(PersistenceConfig::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_save_with_global_flags() {
        let cli = Cli::try_parse_from([
            "inkwell",
            "save",
            "notes/today.md",
            "--content",
            "hello",
            "--log-level",
            "debug",
            "--pretty",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.pretty);
        match cli.command {
            Command::Save { path, content } => {
                assert_eq!(path, PathBuf::from("notes/today.md"));
                assert_eq!(content.as_deref(), Some("hello"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_recover_without_paths() {
        let cli = Cli::try_parse_from(["inkwell", "recover"]).unwrap();
        assert!(matches!(cli.command, Command::Recover { paths } if paths.is_empty()));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_clear_log_flag() {
        let cli = Cli::try_parse_from(["inkwell", "clear-log", "--yes"]).unwrap();
        assert!(matches!(cli.command, Command::ClearLog { yes: true }));
    }

    #[test]
    fn test_watch_requires_paths() {
        assert!(Cli::try_parse_from(["inkwell", "watch"]).is_err());
        let cli = Cli::try_parse_from(["inkwell", "watch", "a.md", "b.md"]).unwrap();
        assert!(matches!(cli.command, Command::Watch { paths } if paths.len() == 2));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "auto_save_delay_ms = 750").unwrap();
        writeln!(file, "[breaker]").unwrap();
        writeln!(file, "failure_threshold = 5").unwrap();

        let path = file.path().to_string_lossy().to_string();
        let cli = Cli::try_parse_from(["inkwell", "--config", &path, "recover"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.auto_save_delay.as_millis(), 750);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli =
            Cli::try_parse_from(["inkwell", "--config", "/does/not/exist.toml", "recover"]).unwrap();
        assert!(cli.load_config().is_err());
    }
}
