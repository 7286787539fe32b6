//! On-disk segment format
//!
//! A segment is a sequence of `[4-byte big-endian length][postcard record]`
//! frames. Segments are named `persistence-<timestamp>.log`. Replay does not
//! depend on file order: every change carries a sequence number and a
//! document's change is unpersisted when its sequence is above the highest
//! `Persisted` mark seen for that document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::WalEntry;
use crate::error::{StorageError, StorageResult};

pub(crate) const SEGMENT_PREFIX: &str = "persistence-";
pub(crate) const SEGMENT_SUFFIX: &str = ".log";

/// Frames larger than this are treated as corruption
pub(crate) const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// A single framed record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) enum WalRecord {
    /// New authoritative content for a document
    Change {
        document_id: String,
        sequence: u64,
        timestamp_millis: i64,
        content: String,
    },
    /// Every change up to `through_sequence` reached the note file
    Persisted {
        document_id: String,
        through_sequence: u64,
        timestamp_millis: i64,
    },
}

impl WalRecord {
    pub(crate) fn document_id(&self) -> &str {
        match self {
            WalRecord::Change { document_id, .. } | WalRecord::Persisted { document_id, .. } => {
                document_id
            }
        }
    }

    pub(crate) fn change(entry: &WalEntry) -> Self {
        WalRecord::Change {
            document_id: entry.document_id.clone(),
            sequence: entry.sequence,
            timestamp_millis: entry.timestamp.timestamp_millis(),
            content: entry.content.clone(),
        }
    }
}

/// Append a framed record to `buf`
///
/// Bodies over `max_len` (never more than [`MAX_RECORD_LEN`]) are rejected
/// and leave `buf` untouched; replay would stop reading the segment at them.
pub(crate) fn encode_record(
    record: &WalRecord,
    max_len: usize,
    buf: &mut Vec<u8>,
) -> StorageResult<()> {
    let body =
        postcard::to_allocvec(record).map_err(|e| StorageError::serialization(e.to_string()))?;
    let limit = max_len.min(MAX_RECORD_LEN);
    if body.len() > limit {
        return Err(StorageError::serialization(format!(
            "record for {} is {} bytes, limit is {limit}",
            record.document_id(),
            body.len()
        )));
    }
    let len = u32::try_from(body.len()).map_err(|_| {
        StorageError::serialization(format!("record of {} bytes cannot be framed", body.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

/// Result of replaying every segment in a directory
#[derive(Debug, Default)]
pub(crate) struct Replay {
    latest: HashMap<String, WalEntry>,
    persisted_through: HashMap<String, u64>,
    pub(crate) max_sequence: u64,
    pub(crate) records: usize,
}

impl Replay {
    fn apply(&mut self, record: WalRecord) {
        self.records += 1;
        match record {
            WalRecord::Change {
                document_id,
                sequence,
                timestamp_millis,
                content,
            } => {
                self.max_sequence = self.max_sequence.max(sequence);
                let newer = self
                    .latest
                    .get(&document_id)
                    .is_none_or(|existing| existing.sequence < sequence);
                if newer {
                    self.latest.insert(
                        document_id.clone(),
                        WalEntry {
                            document_id,
                            content,
                            timestamp: timestamp_from_millis(timestamp_millis),
                            persisted: false,
                            sequence,
                        },
                    );
                }
            }
            WalRecord::Persisted {
                document_id,
                through_sequence,
                ..
            } => {
                self.max_sequence = self.max_sequence.max(through_sequence);
                let mark = self.persisted_through.entry(document_id).or_insert(0);
                *mark = (*mark).max(through_sequence);
            }
        }
    }

    /// Latest entry per document, with `persisted` resolved
    pub(crate) fn entries(&self) -> HashMap<String, WalEntry> {
        self.latest
            .iter()
            .map(|(id, entry)| {
                let mark = self.persisted_through.get(id).copied().unwrap_or(0);
                let mut entry = entry.clone();
                entry.persisted = entry.sequence <= mark;
                (id.clone(), entry)
            })
            .collect()
    }

    /// Latest unpersisted entry per document
    pub(crate) fn unpersisted(&self) -> HashMap<String, WalEntry> {
        self.entries()
            .into_iter()
            .filter(|(_, entry)| !entry.persisted)
            .collect()
    }
}

fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

/// Whether a file name looks like one of our segments
pub(crate) fn is_segment_name(name: &str) -> bool {
    name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX)
}

/// Segment files in `dir`, sorted by name
pub(crate) async fn list_segments(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if is_segment_name(&entry.file_name().to_string_lossy()) {
            segments.push(entry.path());
        }
    }
    segments.sort();
    Ok(segments)
}

/// Read every segment in `dir`
pub(crate) async fn replay_dir(dir: &Path) -> StorageResult<Replay> {
    let mut replay = Replay::default();
    for path in list_segments(dir).await? {
        replay_segment(&path, &mut replay).await?;
    }
    debug!(
        dir = %dir.display(),
        records = replay.records,
        max_sequence = replay.max_sequence,
        "Replayed write-ahead log"
    );
    Ok(replay)
}

/// Read one segment, stopping quietly at a torn or corrupt tail
async fn replay_segment(path: &Path, replay: &mut Replay) -> StorageResult<()> {
    let file = match File::open(path).await {
        Ok(file) => file,
        // Removed by a concurrent compaction
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_RECORD_LEN {
            warn!(path = %path.display(), offset, len, "Invalid record length, stopping replay");
            break;
        }

        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            warn!(path = %path.display(), offset, "Truncated record, stopping replay");
            break;
        }

        match postcard::from_bytes::<WalRecord>(&body) {
            Ok(record) => replay.apply(record),
            Err(e) => {
                warn!(path = %path.display(), offset, error = %e, "Undecodable record, stopping replay");
                break;
            }
        }
        offset += 4 + len as u64;
    }
    Ok(())
}

/// The segment currently being appended to
#[derive(Debug)]
pub(crate) struct ActiveSegment {
    pub(crate) path: PathBuf,
    file: File,
    pub(crate) size: u64,
}

impl ActiveSegment {
    /// Create a fresh, uniquely named segment in `dir`
    pub(crate) async fn create(dir: &Path) -> StorageResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%3f").to_string();

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{SEGMENT_PREFIX}{stamp}{SEGMENT_SUFFIX}")
            } else {
                format!("{SEGMENT_PREFIX}{stamp}-{attempt}{SEGMENT_SUFFIX}")
            };
            let path = dir.join(name);
            match OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    info!(path = %path.display(), "Opened write-ahead log segment");
                    return Ok(Self {
                        path,
                        file,
                        size: 0,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 1000 => {
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Append pre-framed bytes
    pub(crate) async fn append(&mut self, bytes: &[u8], sync: bool) -> StorageResult<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        if sync {
            self.file.sync_data().await?;
        }
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Flush and fsync before dropping
    pub(crate) async fn close(mut self) -> StorageResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn change(id: &str, sequence: u64, content: &str) -> WalRecord {
        WalRecord::Change {
            document_id: id.to_string(),
            sequence,
            timestamp_millis: 1_700_000_000_000,
            content: content.to_string(),
        }
    }

    async fn write_records(dir: &Path, records: &[WalRecord]) -> PathBuf {
        let mut segment = ActiveSegment::create(dir).await.unwrap();
        let mut buf = Vec::new();
        for record in records {
            encode_record(record, MAX_RECORD_LEN, &mut buf).unwrap();
        }
        segment.append(&buf, true).await.unwrap();
        let path = segment.path.clone();
        segment.close().await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_replay_latest_wins() {
        let dir = TempDir::new().unwrap();
        write_records(dir.path(), &[change("a", 1, "v1"), change("a", 2, "v2")]).await;

        let replay = replay_dir(dir.path()).await.unwrap();
        let unpersisted = replay.unpersisted();
        assert_eq!(unpersisted["a"].content, "v2");
        assert_eq!(replay.max_sequence, 2);
    }

    #[tokio::test]
    async fn test_persisted_mark_excludes_older_changes_only() {
        let dir = TempDir::new().unwrap();
        write_records(
            dir.path(),
            &[
                change("a", 1, "v1"),
                change("b", 2, "b1"),
                WalRecord::Persisted {
                    document_id: "a".into(),
                    through_sequence: 1,
                    timestamp_millis: 0,
                },
                WalRecord::Persisted {
                    document_id: "b".into(),
                    through_sequence: 1,
                    timestamp_millis: 0,
                },
            ],
        )
        .await;

        let replay = replay_dir(dir.path()).await.unwrap();
        let unpersisted = replay.unpersisted();
        assert!(!unpersisted.contains_key("a"));
        assert_eq!(unpersisted["b"].content, "b1");
        assert!(replay.entries()["a"].persisted);
    }

    #[tokio::test]
    async fn test_oversized_record_is_rejected_before_framing() {
        let dir = TempDir::new().unwrap();
        let mut buf = Vec::new();
        encode_record(&change("a", 1, "small"), 256, &mut buf).unwrap();
        let framed = buf.len();

        let err = encode_record(&change("big", 2, &"x".repeat(1024)), 256, &mut buf).unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
        assert_eq!(buf.len(), framed);

        encode_record(&change("b", 3, "after"), 256, &mut buf).unwrap();
        let mut segment = ActiveSegment::create(dir.path()).await.unwrap();
        segment.append(&buf, true).await.unwrap();
        segment.close().await.unwrap();

        let unpersisted = replay_dir(dir.path()).await.unwrap().unpersisted();
        assert_eq!(unpersisted["a"].content, "small");
        assert_eq!(unpersisted["b"].content, "after");
        assert!(!unpersisted.contains_key("big"));
    }

    #[tokio::test]
    async fn test_torn_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), &[change("a", 1, "complete")]).await;

        // Append half of a second frame
        let mut buf = Vec::new();
        encode_record(&change("a", 2, "never finished"), MAX_RECORD_LEN, &mut buf).unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&buf[..buf.len() / 2]);
        std::fs::write(&path, raw).unwrap();

        let replay = replay_dir(dir.path()).await.unwrap();
        assert_eq!(replay.unpersisted()["a"].content, "complete");
        assert_eq!(replay.records, 1);
    }

    #[tokio::test]
    async fn test_replay_is_order_independent_across_segments() {
        let dir = TempDir::new().unwrap();
        write_records(dir.path(), &[change("a", 5, "newest")]).await;
        write_records(dir.path(), &[change("a", 3, "older")]).await;

        let replay = replay_dir(dir.path()).await.unwrap();
        assert_eq!(replay.unpersisted()["a"].content, "newest");
    }

    #[tokio::test]
    async fn test_missing_dir_replays_empty() {
        let dir = TempDir::new().unwrap();
        let replay = replay_dir(&dir.path().join("absent")).await.unwrap();
        assert!(replay.unpersisted().is_empty());
        assert_eq!(replay.max_sequence, 0);
    }

    #[tokio::test]
    async fn test_segment_names_are_unique() {
        let dir = TempDir::new().unwrap();
        let a = ActiveSegment::create(dir.path()).await.unwrap();
        let b = ActiveSegment::create(dir.path()).await.unwrap();
        assert_ne!(a.path, b.path);
        let listed = list_segments(dir.path()).await.unwrap();
        assert_eq!(listed.len(), 2);
        for path in listed {
            assert!(is_segment_name(&path.file_name().unwrap().to_string_lossy()));
        }
    }
}
