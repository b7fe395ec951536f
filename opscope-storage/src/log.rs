// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Append-only operation log
//!
//! # File Layout
//!
//! ```text
//! magic: b"OPSL" (4)
//! schema_version: u32 LE
//! frame*:
//!   len: u32 LE
//!   crc32: u32 LE       (of the payload)
//!   payload: JSON LogEntry
//! ```
//!
//! A frame that is cut short or fails its checksum ends replay; the file is
//! truncated back to the last good frame.

use crate::error::{Result, StoreError};
use crate::schema::CURRENT_SCHEMA_VERSION;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use opscope_core::OperationRecord;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

pub(crate) const LOG_MAGIC: &[u8; 4] = b"OPSL";
const HEADER_LEN: u64 = 8;
const FRAME_OVERHEAD: usize = 8;

/// One durable mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogEntry<'a> {
    Put { records: Cow<'a, [OperationRecord]> },
    Delete { ids: Cow<'a, [String]> },
}

/// Result of reading an existing log.
pub(crate) struct Replay {
    pub version: u32,
    pub entries: Vec<LogEntry<'static>>,
}

pub(crate) struct OperationLog {
    path: PathBuf,
    file: File,
    size: u64,
    sync_writes: bool,
}

impl OperationLog {
    /// Open the log at `path`, creating it at the current schema version if
    /// missing, and replay its entries.
    pub(crate) fn open(path: &Path, sync_writes: bool) -> Result<(Self, Replay)> {
        let exists = path.exists() && fs::metadata(path)?.len() > 0;
        if !exists {
            let log = Self::create(path, CURRENT_SCHEMA_VERSION, std::iter::empty(), sync_writes)?;
            let replay = Replay {
                version: CURRENT_SCHEMA_VERSION,
                entries: Vec::new(),
            };
            return Ok((log, replay));
        }

        let bytes = fs::read(path)?;
        let (version, entries, good_len) = decode(&bytes)?;

        if (good_len as usize) < bytes.len() {
            warn!(
                path = %path.display(),
                kept = good_len,
                dropped = bytes.len() as u64 - good_len,
                "Truncating torn or corrupt tail of operation log"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(good_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(path)?;
        debug!(path = %path.display(), version, entries = entries.len(), "Replayed operation log");
        let log = Self {
            path: path.to_path_buf(),
            file,
            size: good_len,
            sync_writes,
        };
        Ok((log, Replay { version, entries }))
    }

    /// Write a fresh log holding `records` under `version`, replacing any
    /// existing file atomically.
    pub(crate) fn create<'r, I>(
        path: &Path,
        version: u32,
        records: I,
        sync_writes: bool,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = &'r OperationRecord>,
    {
        let tmp = path.with_extension("log.tmp");
        let mut buf = Vec::new();
        buf.write_all(LOG_MAGIC)?;
        buf.write_u32::<LittleEndian>(version)?;

        let records: Vec<OperationRecord> = records.into_iter().cloned().collect();
        if !records.is_empty() {
            encode_frame(
                &mut buf,
                &LogEntry::Put {
                    records: Cow::Owned(records),
                },
            )?;
        }

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size: buf.len() as u64,
            sync_writes,
        })
    }

    /// Append one entry as a single frame.
    ///
    /// A failed write is cut back to the last good frame so later appends
    /// never land behind a torn one.
    pub(crate) fn append(&mut self, entry: &LogEntry<'_>) -> Result<()> {
        let mut buf = Vec::new();
        encode_frame(&mut buf, entry)?;
        if let Err(e) = self.write_frame(&buf) {
            self.rollback();
            return Err(e.into());
        }
        self.size += buf.len() as u64;
        Ok(())
    }

    fn write_frame(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all(buf)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop anything past the last acknowledged frame.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.size) {
            error!(
                path = %self.path.display(),
                size = self.size,
                error = %e,
                "Failed to roll back partial log write"
            );
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_frame(buf: &mut Vec<u8>, entry: &LogEntry<'_>) -> Result<()> {
    let payload = serde_json::to_vec(entry)?;
    buf.reserve(payload.len() + FRAME_OVERHEAD);
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    buf.write_all(&payload)?;
    Ok(())
}

/// Decode header and frames. Returns the schema version, the good entries
/// and the byte length covered by them.
fn decode(bytes: &[u8]) -> Result<(u32, Vec<LogEntry<'static>>, u64)> {
    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| StoreError::Corrupt("log shorter than header".into()))?;
    if &magic != LOG_MAGIC {
        return Err(StoreError::Corrupt("bad magic".into()));
    }
    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| StoreError::Corrupt("log shorter than header".into()))?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let mut entries = Vec::new();
    let mut good_len = HEADER_LEN;
    loop {
        let Ok(len) = cursor.read_u32::<LittleEndian>() else {
            break;
        };
        let Ok(stored_crc) = cursor.read_u32::<LittleEndian>() else {
            break;
        };
        let remaining = bytes.len() as u64 - cursor.position();
        if len as u64 > remaining {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        if cursor.read_exact(&mut payload).is_err() {
            break;
        }
        if crc32fast::hash(&payload) != stored_crc {
            warn!(offset = good_len, "CRC mismatch in operation log");
            break;
        }
        match serde_json::from_slice::<LogEntry<'static>>(&payload) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(offset = good_len, error = %e, "Undecodable operation log entry");
                break;
            }
        }
        good_len = cursor.position();
    }

    Ok((version, entries, good_len))
}

/// Write a header-only log at `version` followed by raw JSON payloads.
/// Used to fabricate logs written by older builds.
#[cfg(test)]
pub(crate) fn write_raw_log(path: &Path, version: u32, payloads: &[&str]) -> Result<()> {
    let mut buf = Vec::new();
    buf.write_all(LOG_MAGIC)?;
    buf.write_u32::<LittleEndian>(version)?;
    for payload in payloads {
        let payload = payload.as_bytes();
        buf.write_u32::<LittleEndian>(payload.len() as u32)?;
        buf.write_u32::<LittleEndian>(crc32fast::hash(payload))?;
        buf.write_all(payload)?;
    }
    fs::write(path, buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str) -> OperationRecord {
        OperationRecord::new(id, Utc::now())
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("operations.log");

        let (mut log, replay) = OperationLog::open(&path, false).unwrap();
        assert_eq!(replay.version, CURRENT_SCHEMA_VERSION);
        assert!(replay.entries.is_empty());

        let records = vec![record("a"), record("b")];
        log.append(&LogEntry::Put {
            records: Cow::Borrowed(&records),
        })
        .unwrap();
        let ids = vec!["a".to_string()];
        log.append(&LogEntry::Delete {
            ids: Cow::Borrowed(&ids),
        })
        .unwrap();
        let size = log.size();
        drop(log);

        assert_eq!(fs::metadata(&path).unwrap().len(), size);
        let (_, replay) = OperationLog::open(&path, false).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert!(matches!(&replay.entries[0], LogEntry::Put { records } if records.len() == 2));
        assert!(matches!(&replay.entries[1], LogEntry::Delete { ids } if ids[0] == "a"));
    }

    #[test]
    fn test_bad_crc_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("operations.log");
        let (mut log, _) = OperationLog::open(&path, false).unwrap();
        let first = vec![record("a")];
        log.append(&LogEntry::Put {
            records: Cow::Borrowed(&first),
        })
        .unwrap();
        let good = log.size();
        let second = vec![record("b")];
        log.append(&LogEntry::Put {
            records: Cow::Borrowed(&second),
        })
        .unwrap();
        drop(log);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let (log, replay) = OperationLog::open(&path, false).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(log.size(), good);
        assert_eq!(fs::metadata(&path).unwrap().len(), good);
    }

    #[test]
    fn test_partial_frame_rolled_back_before_next_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("operations.log");
        let (mut log, _) = OperationLog::open(&path, false).unwrap();
        let first = vec![record("a")];
        log.append(&LogEntry::Put {
            records: Cow::Borrowed(&first),
        })
        .unwrap();

        // A write that died after the first few bytes of a frame
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[40, 0, 0]).unwrap();
        }
        log.rollback();
        assert_eq!(fs::metadata(&path).unwrap().len(), log.size());

        let second = vec![record("b")];
        log.append(&LogEntry::Put {
            records: Cow::Borrowed(&second),
        })
        .unwrap();
        drop(log);

        let (_, replay) = OperationLog::open(&path, false).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert!(matches!(&replay.entries[1], LogEntry::Put { records } if records[0].id == "b"));
    }

    #[test]
    fn test_oversized_length_treated_as_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("operations.log");
        let (mut log, _) = OperationLog::open(&path, false).unwrap();
        let first = vec![record("a")];
        log.append(&LogEntry::Put {
            records: Cow::Borrowed(&first),
        })
        .unwrap();
        let good = log.size();
        drop(log);

        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        fs::write(&path, bytes).unwrap();

        let (log, replay) = OperationLog::open(&path, false).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(log.size(), good);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("operations.log");
        fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(matches!(
            OperationLog::open(&path, false),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_newer_schema_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("operations.log");
        write_raw_log(&path, CURRENT_SCHEMA_VERSION + 1, &[]).unwrap();
        assert!(matches!(
            OperationLog::open(&path, false),
            Err(StoreError::SchemaTooNew { .. })
        ));
    }
}
