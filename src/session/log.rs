//! Append-only JSONL journal backing a session's context.
//!
//! Each line is one [`LogRecord`]. Appends are flushed and synced before they
//! return, so a record is durable before the caller builds anything on top of
//! it. The file carries an exclusive advisory lock for as long as the
//! [`SessionLog`] lives, which keeps a second process from writing to it.

use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{SoulError, SoulResult};
use crate::types::{Checkpoint, ContextEntry};

/// One line of the session journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Entry(ContextEntry),
    Checkpoint(Checkpoint),
}

pub struct SessionLog {
    path: PathBuf,
    file: tokio::fs::File,
    /// Length of the well-formed prefix
    len: u64,
    /// Set when a failed write could not be rolled back
    poisoned: bool,
}

impl SessionLog {
    /// Open (creating if needed) and lock the journal, returning it together
    /// with every record it already holds.
    ///
    /// A torn final line left by a crash mid-write is dropped and truncated
    /// away; damage anywhere else is reported as `Corrupt`.
    pub async fn open(path: impl AsRef<Path>) -> SoulResult<(Self, Vec<LogRecord>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let std_file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        if std_file.try_lock_exclusive().is_err() {
            return Err(SoulError::SessionLocked { path });
        }

        let mut file = tokio::fs::File::from_std(std_file);
        let mut content = String::new();
        file.read_to_string(&mut content).await?;

        let (records, valid_len) = parse_records(&content)?;
        let mut len = content.len() as u64;
        if valid_len < content.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = content.len() - valid_len,
                "Dropping torn record at end of session log"
            );
            file.set_len(valid_len as u64).await?;
            len = valid_len as u64;
        } else if !content.is_empty() && !content.ends_with('\n') {
            // Complete last record missing its newline
            file.write_all(b"\n").await?;
            file.flush().await?;
            len += 1;
        }

        tracing::debug!(path = %path.display(), records = records.len(), "Opened session log");
        Ok((
            Self {
                path,
                file,
                len,
                poisoned: false,
            },
            records,
        ))
    }

    /// Read records without taking the writer lock
    pub async fn read_records(path: impl AsRef<Path>) -> SoulResult<Vec<LogRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let (records, _) = parse_records(&content)?;
        Ok(records)
    }

    /// Durably append one record.
    ///
    /// A failed write is cut back to the last whole record so the journal
    /// stays replayable. If even that fails the log refuses further appends.
    pub async fn append(&mut self, record: &LogRecord) -> SoulResult<()> {
        if self.poisoned {
            return Err(SoulError::Session(format!(
                "session log {} is unusable after a failed write",
                self.path.display()
            )));
        }

        let line = serde_json::to_string(record)? + "\n";
        match self.write_line(line.as_bytes()).await {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Session log write failed");
                self.rollback().await;
                Err(e.into())
            }
        }
    }

    async fn write_line(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    /// Drop anything past the last whole record
    async fn rollback(&mut self) {
        let truncated = async {
            self.file.set_len(self.len).await?;
            self.file.sync_data().await
        }
        .await;
        if let Err(e) = truncated {
            tracing::error!(path = %self.path.display(), error = %e, "Cannot roll back session log");
            self.poisoned = true;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse journal text, returning the records and the byte length of the
/// well-formed prefix.
fn parse_records(content: &str) -> SoulResult<(Vec<LogRecord>, usize)> {
    let mut records = Vec::new();
    let mut offset = 0;
    let mut lines = content.split_inclusive('\n').enumerate().peekable();

    while let Some((index, raw)) = lines.next() {
        let terminated = raw.ends_with('\n');
        let line = raw.trim();
        if line.is_empty() {
            offset += raw.len();
            continue;
        }

        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) if terminated => {
                records.push(record);
                offset += raw.len();
            }
            // A complete record missing only its newline is still valid
            Ok(record) => {
                records.push(record);
                return Ok((records, content.len()));
            }
            Err(_) if lines.peek().is_none() && !terminated => {
                return Ok((records, offset));
            }
            Err(e) => {
                return Err(SoulError::Corrupt {
                    line: index + 1,
                    reason: e.to_string(),
                })
            }
        }
    }

    Ok((records, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;
    use chrono::Utc;

    fn entry(seq: u64, text: &str) -> LogRecord {
        LogRecord::Entry(ContextEntry {
            seq,
            timestamp: Utc::now(),
            tokens: 5,
            kind: EntryKind::user(text),
        })
    }

    #[tokio::test]
    async fn append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let (mut log, records) = SessionLog::open(&path).await.unwrap();
        assert!(records.is_empty());

        let first = entry(1, "hello");
        let second = LogRecord::Checkpoint(Checkpoint {
            seq: 1,
            tokens_after: 3,
            summary: "greeting".into(),
            timestamp: Utc::now(),
        });
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();
        drop(log);

        let (_log, records) = SessionLog::open(&path).await.unwrap();
        assert_eq!(records, vec![first, second]);
    }

    #[tokio::test]
    async fn second_writer_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let (_held, _) = SessionLog::open(&path).await.unwrap();
        let err = SessionLog::open(&path).await.err().unwrap();
        assert!(matches!(err, SoulError::SessionLocked { .. }));
    }

    #[tokio::test]
    async fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let (held, _) = SessionLog::open(&path).await.unwrap();
        drop(held);
        assert!(SessionLog::open(&path).await.is_ok());
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let good = serde_json::to_string(&entry(1, "kept")).unwrap();
        std::fs::write(&path, format!("{good}\n{{\"record\":\"entry\",\"seq\":2,")).unwrap();

        let (mut log, records) = SessionLog::open(&path).await.unwrap();
        assert_eq!(records.len(), 1);

        log.append(&entry(2, "after crash")).await.unwrap();
        drop(log);

        let records = SessionLog::read_records(&path).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn corruption_mid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let good = serde_json::to_string(&entry(1, "ok")).unwrap();
        std::fs::write(&path, format!("not json\n{good}\n")).unwrap();

        let err = SessionLog::open(&path).await.err().unwrap();
        assert!(matches!(err, SoulError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = SessionLog::read_records(dir.path().join("none.jsonl"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn failed_write_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let (mut log, _) = SessionLog::open(&path).await.unwrap();
        log.append(&entry(1, "before")).await.unwrap();

        // A write that died partway through
        log.file
            .write_all(br#"{"record":"entry","seq":2,"ti"#)
            .await
            .unwrap();
        log.file.flush().await.unwrap();
        log.rollback().await;
        assert!(!log.poisoned);

        log.append(&entry(2, "retried")).await.unwrap();
        log.append(&entry(3, "after")).await.unwrap();
        drop(log);

        let (_log, records) = SessionLog::open(&path).await.unwrap();
        assert_eq!(records.len(), 3);
        let LogRecord::Entry(second) = &records[1] else {
            panic!("expected an entry record");
        };
        assert_eq!(second.kind, EntryKind::user("retried"));
    }

    #[tokio::test]
    async fn poisoned_log_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let (mut log, _) = SessionLog::open(&path).await.unwrap();
        log.append(&entry(1, "kept")).await.unwrap();
        log.poisoned = true;

        let err = log.append(&entry(2, "refused")).await.unwrap_err();
        assert!(matches!(err, SoulError::Session(_)));
        drop(log);

        assert_eq!(SessionLog::read_records(&path).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unterminated_last_record_is_kept_and_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");

        let good = serde_json::to_string(&entry(1, "no newline")).unwrap();
        std::fs::write(&path, good).unwrap();

        let (mut log, records) = SessionLog::open(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        log.append(&entry(2, "next")).await.unwrap();
        drop(log);

        assert_eq!(SessionLog::read_records(&path).await.unwrap().len(), 2);
    }
}
