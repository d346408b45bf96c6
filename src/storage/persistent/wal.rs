//! Write-ahead log for the durable token store.
//!
//! Every mutation is appended (and optionally fsynced) before it is applied to
//! the in-memory index. On open the log is replayed in order, each entry at the
//! timestamp it was written, so TTLs keep counting across restarts.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-framed WalEntry]
//! [ENTRY 2: codec-framed WalEntry]
//! ...
//! ```
//! Compaction writes a single `Snapshot` entry to a sibling file and renames
//! it over the log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::ErrorRecord;
use crate::storage::memory::StateSnapshot;
use crate::storage::traits::EntityKind;
use crate::token::{Offset, Token};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When the mutation was made; replay applies it at this instant.
    pub timestamp: DateTime<Utc>,
    /// The mutation.
    pub kind: WalEntryKind,
}

/// The logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum WalEntryKind {
    OffsetPut { token: Token, offset: Offset },
    OffsetDelete { token: Token },
    ErrorAppend { token: Token, record: ErrorRecord },
    ErrorDrain { token: Token },
    MarkComplete { kind: EntityKind, token: Token },
    /// Live state at compaction time; always the first entry of a compacted log.
    Snapshot(StateSnapshot),
}

/// Counts bytes consumed so replay knows where the valid prefix ends.
struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

struct Writer {
    out: BufWriter<File>,
    sequence: u64,
}

/// Append-only mutation log.
///
/// Thread-safe via an internal mutex; appends are serialized.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<Writer>,
    sync_on_write: bool,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "write-ahead log mutex poisoned")
}

impl WriteAheadLog {
    /// Open or create a log file.
    ///
    /// A torn or corrupt tail left by a crash is cut off so that new appends
    /// follow the last valid entry.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let is_new = fs::metadata(path).map(|m| m.len() < codec::HEADER_LEN).unwrap_or(true);
        if is_new {
            let mut file = File::create(path)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
        }

        let (sequence, valid_len) = Self::scan(path)?;
        let file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(path = %path.display(), valid_len, "truncating corrupt write-ahead log tail");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Writer {
                out: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, Writer>> {
        self.writer.lock().map_err(|_| poisoned())
    }

    /// Append an entry stamped `timestamp`. Returns its sequence number.
    pub fn append(&self, timestamp: DateTime<Utc>, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.lock()?;
        let entry = WalEntry {
            sequence: writer.sequence + 1,
            timestamp,
            kind,
        };
        let encoded = codec::encode(&entry)?;
        writer.out.write_all(&encoded)?;
        writer.out.flush()?;
        if self.sync_on_write {
            writer.out.get_ref().sync_data()?;
        }
        writer.sequence = entry.sequence;
        Ok(entry.sequence)
    }

    /// Read every valid entry in order.
    pub fn entries(&self) -> IoResult<Vec<WalEntry>> {
        let mut out = Vec::new();
        Self::for_each_valid(&self.path, |entry| out.push(entry))?;
        Ok(out)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Log size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Replace the log with a single snapshot entry.
    ///
    /// The new log is written beside the old one and renamed into place, so a
    /// crash mid-compaction leaves either the old or the new log intact.
    pub fn compact(&self, timestamp: DateTime<Utc>, snapshot: StateSnapshot) -> IoResult<()> {
        let mut writer = self.lock()?;
        writer.out.flush()?;

        let tmp = self.path.with_extension("wal.compact");
        {
            let mut file = File::create(&tmp)?;
            codec::write_header(&mut file)?;
            let entry = WalEntry {
                sequence: 1,
                timestamp,
                kind: WalEntryKind::Snapshot(snapshot),
            };
            file.write_all(&codec::encode(&entry)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        writer.out = BufWriter::new(file);
        writer.sequence = 1;
        Ok(())
    }

    /// Returns (last valid sequence, byte length of the valid prefix).
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut last = 0;
        let valid_len = Self::for_each_valid(path, |entry| last = entry.sequence)?;
        Ok((last, valid_len))
    }

    fn for_each_valid(path: &Path, mut f: impl FnMut(WalEntry)) -> IoResult<u64> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = CountingReader {
            inner: BufReader::new(file),
            consumed: 0,
        };
        codec::read_header(&mut reader)?;

        let mut valid_len = reader.consumed;
        while valid_len < file_len {
            match codec::decode::<WalEntry>(&mut reader) {
                Ok(entry) => {
                    valid_len = reader.consumed;
                    f(entry);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), offset = valid_len, error = %e, "write-ahead log replay stopped");
                    break;
                }
            }
        }
        Ok(valid_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn token(s: &str) -> Token {
        Token::new(s).unwrap()
    }

    #[test]
    fn append_and_read_back_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.wal");

        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(Utc::now(), WalEntryKind::OffsetPut { token: token("t1"), offset: Offset::new(5) })
                .unwrap();
            wal.append(Utc::now(), WalEntryKind::ErrorDrain { token: token("t1") }).unwrap();
            assert_eq!(wal.current_sequence().unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::OffsetPut { offset, .. } if offset == Offset::new(5)));
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn torn_tail_is_truncated_and_appends_continue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.wal");

        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            for i in 0..3 {
                wal.append(Utc::now(), WalEntryKind::OffsetPut { token: token("t"), offset: Offset::new(i) })
                    .unwrap();
            }
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 4).unwrap();

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        wal.append(Utc::now(), WalEntryKind::OffsetDelete { token: token("t") }).unwrap();

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[2].kind, WalEntryKind::OffsetDelete { .. }));
    }

    #[test]
    fn compact_leaves_single_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        for i in 0..10 {
            wal.append(Utc::now(), WalEntryKind::OffsetPut { token: token("t"), offset: Offset::new(i) })
                .unwrap();
        }
        let before = wal.size_bytes().unwrap();

        wal.compact(Utc::now(), StateSnapshot::default()).unwrap();
        assert!(wal.size_bytes().unwrap() < before);
        assert_eq!(wal.current_sequence().unwrap(), 1);

        wal.append(Utc::now(), WalEntryKind::OffsetDelete { token: token("t") }).unwrap();
        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::Snapshot(_)));
    }
}
