//! Durable raft log.
//!
//! Append-only file of CRC-protected frames:
//! `[MAGIC:4][LEN:4][bincode(LogEntry)][CRC32:4]`
//!
//! The full retained window is also held in memory (the catalog's command
//! volume is small and snapshots bound the window); the file exists so a
//! restart replays exactly what was acknowledged. Replay stops at the first
//! corrupt frame, dropping a torn tail write.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::common::{crc32, Error, Result};

const LOG_MAGIC: [u8; 4] = [0x54, 0x53, 0x4C, 0x31]; // "TSL1"

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Leader no-op, appended on election to commit prior-term entries
    Noop,
    /// Serialized catalog [`Command`](crate::meta::types::Command)
    Command(Vec<u8>),
    /// Membership change: the complete post-change voter set, so a joining
    /// node learns every member from one applied entry
    Membership(Vec<crate::meta::rpc::Peer>),
}

/// A single replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Leader clock at append; the FSM's only time source
    pub timestamp_ms: u64,
    pub payload: EntryPayload,
}

/// File-backed raft log with an in-memory window
pub struct RaftLog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Retained entries, ascending by index; entries[0].index == first_index
    entries: Vec<LogEntry>,
    /// Index of the first retained entry (after compaction); 1 on a fresh log
    first_index: u64,
}

impl RaftLog {
    /// Open or create the log, replaying any retained entries.
    ///
    /// `first_index_hint` seeds the window start when the file holds no
    /// entries (a freshly compacted log after restart): pass
    /// `snapshot_last_index + 1`, or 1 with no snapshot.
    pub fn open(path: impl AsRef<Path>, first_index_hint: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        match File::open(&path) {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                loop {
                    match Self::read_frame(&mut reader) {
                        Ok(Some(entry)) => entries.push(entry),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("log replay stopped at corrupt frame: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let first_index = entries
            .first()
            .map(|e| e.index)
            .unwrap_or(first_index_hint.max(1));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::info!(
            entries = entries.len(),
            first_index,
            "raft log opened"
        );

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            entries,
            first_index,
        })
    }

    fn write_frame(writer: &mut impl Write, entry: &LogEntry) -> Result<()> {
        let payload = bincode::serialize(entry)
            .map_err(|e| Error::Internal(format!("log serialize error: {}", e)))?;

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.write_all(&crc32(&payload).to_le_bytes())?;
        Ok(())
    }

    fn read_frame<R: Read>(reader: &mut R) -> Result<Option<LogEntry>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::LogCorrupted("invalid frame magic".into()));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        if u32::from_le_bytes(crc_bytes) != crc32(&payload) {
            return Err(Error::LogCorrupted("frame checksum mismatch".into()));
        }

        let entry: LogEntry = bincode::deserialize(&payload)
            .map_err(|e| Error::LogCorrupted(format!("frame decode error: {}", e)))?;

        Ok(Some(entry))
    }

    /// Atomically rewrite the on-disk file from the in-memory window
    fn rewrite(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(&file);
            for entry in &self.entries {
                Self::write_frame(&mut writer, entry)?;
            }
            writer.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Append entries; they must continue the log contiguously
    pub fn append(&mut self, new_entries: &[LogEntry]) -> Result<()> {
        for entry in new_entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(Error::Raft(format!(
                    "non-contiguous append: got index {}, expected {}",
                    entry.index, expected
                )));
            }
            Self::write_frame(&mut self.writer, entry)?;
            self.entries.push(entry.clone());
        }

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Drop every entry at `from_index` and beyond (conflict resolution)
    pub fn truncate_from(&mut self, from_index: u64) -> Result<()> {
        if from_index > self.last_index() {
            return Ok(());
        }
        let keep = from_index.saturating_sub(self.first_index) as usize;
        self.entries.truncate(keep);
        self.rewrite()
    }

    /// Discard the prefix up to and including `through_index` (post-snapshot
    /// compaction)
    pub fn compact_through(&mut self, through_index: u64) -> Result<()> {
        if through_index < self.first_index {
            return Ok(());
        }
        let drop = (through_index - self.first_index + 1) as usize;
        let drop = drop.min(self.entries.len());
        self.entries.drain(..drop);
        self.first_index = through_index + 1;
        self.rewrite()
    }

    /// Discard everything: the snapshot at `last_included_index` supersedes
    /// the whole window (snapshot install from the leader)
    pub fn reset_to(&mut self, last_included_index: u64) -> Result<()> {
        self.entries.clear();
        self.first_index = last_included_index + 1;
        self.rewrite()
    }

    /// Index of the first retained entry
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index of the newest entry, or `first_index - 1` when empty
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.first_index - 1)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// Entries from `from_index` (inclusive), capped at `max`
    pub fn entries_from(&self, from_index: u64, max: usize) -> Vec<LogEntry> {
        if from_index < self.first_index {
            return Vec::new();
        }
        let start = (from_index - self.first_index) as usize;
        self.entries
            .iter()
            .skip(start)
            .take(max)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            timestamp_ms: 1000 + index,
            payload: EntryPayload::Command(vec![index as u8]),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");

        {
            let mut log = RaftLog::open(&path, 1).unwrap();
            log.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
            assert_eq!(log.last_index(), 3);
        }

        let log = RaftLog::open(&path, 1).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.get(2).unwrap().timestamp_ms, 1002);
    }

    #[test]
    fn test_non_contiguous_append_rejected() {
        let dir = tempdir().unwrap();
        let mut log = RaftLog::open(dir.path().join("log.bin"), 1).unwrap();

        log.append(&[entry(1, 1)]).unwrap();
        assert!(log.append(&[entry(3, 1)]).is_err());
    }

    #[test]
    fn test_truncate_from() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");

        let mut log = RaftLog::open(&path, 1).unwrap();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 2)])
            .unwrap();

        log.truncate_from(3).unwrap();
        assert_eq!(log.last_index(), 2);

        // Survives reopen
        drop(log);
        let log = RaftLog::open(&path, 1).unwrap();
        assert_eq!(log.last_index(), 2);
        assert!(log.get(3).is_none());
    }

    #[test]
    fn test_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");

        let mut log = RaftLog::open(&path, 1).unwrap();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();

        log.compact_through(2).unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 4);
        assert!(log.get(2).is_none());

        // New appends continue from the compacted window
        log.append(&[entry(5, 2)]).unwrap();

        drop(log);
        let log = RaftLog::open(&path, 1).unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn test_corrupt_tail_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");

        {
            let mut log = RaftLog::open(&path, 1).unwrap();
            log.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        }

        // Simulate a torn write
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&LOG_MAGIC).unwrap();
            file.write_all(&[0xde, 0xad]).unwrap();
        }

        let log = RaftLog::open(&path, 1).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_entries_from() {
        let dir = tempdir().unwrap();
        let mut log = RaftLog::open(dir.path().join("log.bin"), 1).unwrap();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();

        let slice = log.entries_from(2, 10);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].index, 2);

        assert!(log.entries_from(9, 10).is_empty());
    }
}
