//! Append-only partition log
//!
//! One JSON object per line. Every accepted write appends exactly one record;
//! opening a partition replays the file from the start. A record that fails to
//! reach disk is cut off again so the file never holds a partial line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;
use crate::revision::{Revision, RevisionRef};

const LOG_FILE_NAME: &str = "changes.jsonl";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(super) struct LogRecord {
    pub seq: u64,
    pub id: String,
    pub revision: Revision,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestry: Vec<RevisionRef>,
}

pub(super) struct ChangeLog {
    path: PathBuf,
    file: File,
    len: u64,
    sync: bool,
}

impl ChangeLog {
    /// Open (or create) the log in `dir` and return every intact record.
    ///
    /// Reading stops at the first torn or unparsable line; the file is
    /// truncated there so later appends start on a clean boundary.
    pub fn open(dir: &Path, sync: bool) -> Result<(Self, Vec<LogRecord>), StoreError> {
        fs::create_dir_all(dir).map_err(io_error)?;
        let path = dir.join(LOG_FILE_NAME);

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_error(e)),
        };

        let mut records = Vec::new();
        let mut valid_len = 0usize;
        for line in data.split_inclusive(|b| *b == b'\n') {
            let Some(content) = line.strip_suffix(b"\n") else {
                log::warn!("{}: discarding torn trailing record", path.display());
                break;
            };
            match serde_json::from_slice::<LogRecord>(content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!(
                        "{}: unreadable record at byte {}, dropping the rest: {}",
                        path.display(),
                        valid_len,
                        e
                    );
                    break;
                }
            }
            valid_len += line.len();
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        if valid_len < data.len() {
            file.set_len(valid_len as u64).map_err(io_error)?;
        }

        Ok((
            Self {
                path,
                file,
                len: valid_len as u64,
                sync,
            },
            records,
        ))
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let written = self.file.write_all(&line).and_then(|_| {
            if self.sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(trunc) = self.file.set_len(self.len) {
                log::error!("{}: failed to roll back partial append: {}", self.path.display(), trunc);
            }
            return Err(io_error(e));
        }

        self.len += line.len() as u64;
        Ok(())
    }
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::next_revision;
    use serde_json::json;

    fn record(seq: u64, id: &str) -> LogRecord {
        let body = json!({"seq": seq});
        LogRecord {
            seq,
            id: id.to_string(),
            revision: next_revision(None, &body, false),
            deleted: false,
            body,
            ancestry: Vec::new(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, records) = ChangeLog::open(dir.path(), true).unwrap();
            assert!(records.is_empty());
            log.append(&record(1, "a")).unwrap();
            log.append(&record(2, "b")).unwrap();
        }
        let (_, records) = ChangeLog::open(dir.path(), true).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut log, _) = ChangeLog::open(dir.path(), false).unwrap();
            log.append(&record(1, "a")).unwrap();
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"id\":\"b\"").unwrap();
        drop(file);

        let (mut log, records) = ChangeLog::open(dir.path(), false).unwrap();
        assert_eq!(records.len(), 1);
        log.append(&record(2, "c")).unwrap();
        drop(log);

        let (_, records) = ChangeLog::open(dir.path(), false).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
