//! File output tests for inkwell-logging
//!
//! Builds real subscribers writing JSONL into a temporary directory and
//! reads the lines back.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use inkwell_logging::{FileOutput, InkwellSubscriberBuilder, RollEvery};

fn file_output(dir: &Path) -> FileOutput {
    FileOutput {
        dir: dir.to_path_buf(),
        file_prefix: "test".to_string(),
        roll: RollEvery::Never,
        keep: None,
    }
}

fn read_lines(dir: &Path) -> Vec<serde_json::Value> {
    let raw = fs::read_to_string(dir.join("test.log")).unwrap();
    raw.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_file_output_is_jsonl_with_flattened_fields() {
    let temp = TempDir::new().unwrap();
    let logging = InkwellSubscriberBuilder::new()
        .with_console(false)
        .with_file_output(file_output(temp.path()))
        .with_filter("info")
        .without_env()
        .build()
        .unwrap();

    tracing::dispatcher::with_default(logging.dispatch(), || {
        tracing::info!(document_id = "abc123", bytes = 42, "Saved note");
        tracing::debug!("filtered out");
    });
    // Dropping the guard flushes the non-blocking writer
    drop(logging);

    let lines = read_lines(temp.path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["message"], "Saved note");
    assert_eq!(lines[0]["document_id"], "abc123");
    assert_eq!(lines[0]["bytes"], 42);
    assert_eq!(lines[0]["level"], "INFO");
}

#[test]
fn test_span_fields_are_recorded() {
    let temp = TempDir::new().unwrap();
    let logging = InkwellSubscriberBuilder::new()
        .with_console(false)
        .with_file_output(file_output(temp.path()))
        .with_filter("debug")
        .without_env()
        .build()
        .unwrap();

    tracing::dispatcher::with_default(logging.dispatch(), || {
        let span = tracing::info_span!("save_note", document_id = "abc123");
        let _entered = span.enter();
        tracing::debug!("Running coalesced save");
    });
    drop(logging);

    let lines = read_lines(temp.path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["span"]["name"], "save_note");
    assert_eq!(lines[0]["span"]["document_id"], "abc123");
}

#[test]
fn test_target_directives_narrow_output() {
    let temp = TempDir::new().unwrap();
    let logging = InkwellSubscriberBuilder::new()
        .with_console(false)
        .with_file_output(file_output(temp.path()))
        .with_filter("warn,inkwell_storage=debug")
        .without_env()
        .build()
        .unwrap();

    tracing::dispatcher::with_default(logging.dispatch(), || {
        tracing::debug!(target: "inkwell_storage::engine", "Opened note");
        tracing::info!(target: "other_crate", "noise");
        tracing::warn!(target: "other_crate", "Something odd");
    });
    drop(logging);

    let messages: Vec<String> = read_lines(temp.path())
        .iter()
        .map(|line| line["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages, vec!["Opened note", "Something odd"]);
}
