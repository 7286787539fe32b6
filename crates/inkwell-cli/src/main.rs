use clap::Parser;
use inkwell_cli::commands;
use inkwell_cli::config::{Cli, Command};
use inkwell_storage::SaveOutcome;
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = cli.log_builder().build()?;
    logging.install_global()?;
    let config = cli.load_config()?;

    match cli.command {
        Command::Recover { paths } if paths.is_empty() => {
            let changes = commands::list_recoverable(&config).await?;
            if changes.is_empty() {
                println!("No unsaved changes in {}", config.wal.directory.display());
            }
            for change in changes {
                println!(
                    "{}  {}  {} bytes  (#{})",
                    change.document_id,
                    change.timestamp.to_rfc3339(),
                    change.bytes,
                    change.sequence
                );
            }
        }

        Command::Recover { paths } => {
            for (path, outcome) in commands::restore_notes(&config, &paths).await? {
                match outcome {
                    SaveOutcome::Saved { bytes } => {
                        println!("Restored {} ({bytes} bytes)", path.display())
                    }
                    SaveOutcome::Unchanged => {
                        println!("Nothing to restore for {}", path.display())
                    }
                    other => println!("Could not restore {}: {other:?}", path.display()),
                }
            }
        }

        Command::ClearLog { yes } => {
            if !yes {
                anyhow::bail!("clear-log deletes unsaved changes; pass --yes to confirm");
            }
            let dropped = commands::clear_log(&config).await?;
            println!("Cleared write-ahead log ({dropped} unsaved changes dropped)");
        }

        Command::Save { path, content } => {
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };
            match commands::save_note(&config, &path, &content).await? {
                SaveOutcome::Saved { bytes } => println!("Saved {bytes} bytes to {}", path.display()),
                SaveOutcome::Unchanged => println!("{} is already up to date", path.display()),
                other => anyhow::bail!("save of {} did not complete: {other:?}", path.display()),
            }
        }

        Command::Watch { paths } => {
            let stop = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Cannot listen for Ctrl-C");
                }
            };
            let result = commands::watch_notes(&config, &paths, stop, |event| {
                println!("{}", commands::describe(event))
            })
            .await?;
            if !result.all_succeeded() {
                anyhow::bail!(
                    "{} notes could not be saved on exit",
                    result.failure_count
                );
            }
        }
    }

    Ok(())
}
