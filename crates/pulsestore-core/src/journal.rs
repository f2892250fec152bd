//! Repair journal for failed compensations
//!
//! When a rollback after a partial dual write cannot be completed, the pair
//! is appended here so the relation sweep can force the fast-store mirror
//! back to durable truth, even across a restart.
//!
//! Record layout (little-endian):
//!
//! ```text
//!   [0..4]   magic:    "PLSJ"
//!   [4..8]   length:   u32  payload length
//!   [8..12]  checksum: u32  CRC32C of payload
//!   [12..16] reserved: zero
//!   payload: kind tag (u8) + actor (i64) + target (i64)
//! ```
//!
//! Appends are synced before returning. Recovery stops at a torn tail and
//! resynchronizes on the next magic after a corrupt record.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::JournalError;
use crate::types::{RelationEdge, RelationKind, UserId};

const MAGIC: [u8; 4] = *b"PLSJ";
const HEADER_SIZE: usize = 16;
const PAYLOAD_SIZE: usize = 1 + 8 + 8;

/// A relation pair whose fast-store mirror may disagree with durable truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepairRecord {
    pub kind: RelationKind,
    pub actor: UserId,
    pub target: i64,
}

impl RepairRecord {
    pub fn edge(&self) -> RelationEdge {
        RelationEdge::new(self.kind, self.actor, self.target)
    }

    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PAYLOAD_SIZE);
        payload.push(self.kind.tag());
        payload.extend_from_slice(&self.actor.to_le_bytes());
        payload.extend_from_slice(&self.target.to_le_bytes());

        let mut buf = Vec::with_capacity(HEADER_SIZE + PAYLOAD_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&payload);
        buf
    }

    fn decode(payload: &[u8], offset: u64) -> Result<Self, JournalError> {
        if payload.len() != PAYLOAD_SIZE {
            return Err(JournalError::Malformed {
                offset,
                reason: format!("payload is {} bytes, expected {PAYLOAD_SIZE}", payload.len()),
            });
        }
        let kind = RelationKind::from_tag(payload[0]).ok_or_else(|| JournalError::Malformed {
            offset,
            reason: format!("unknown relation tag {}", payload[0]),
        })?;
        let mut actor = [0u8; 8];
        actor.copy_from_slice(&payload[1..9]);
        let mut target = [0u8; 8];
        target.copy_from_slice(&payload[9..17]);
        Ok(Self {
            kind,
            actor: i64::from_le_bytes(actor),
            target: i64::from_le_bytes(target),
        })
    }
}

impl From<RelationEdge> for RepairRecord {
    fn from(edge: RelationEdge) -> Self {
        Self { kind: edge.kind, actor: edge.actor, target: edge.target }
    }
}

/// Append-only, checksummed journal file.
pub struct RepairJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl RepairJournal {
    /// Open or create the journal, creating parent directories as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| JournalError::io(parent, e, "create journal directory"))?;
        }
        let file = open_append(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it before returning.
    pub fn append(&self, record: &RepairRecord) -> Result<(), JournalError> {
        let bytes = record.encode();
        let mut file = self.file.lock();
        file.write_all(&bytes).map_err(|e| JournalError::io(&self.path, e, "append record"))?;
        durable_sync(&file).map_err(|e| JournalError::io(&self.path, e, "sync journal"))?;
        debug!(kind = %record.kind, actor = record.actor, target = record.target, "repair record appended");
        Ok(())
    }

    /// Every intact record, in append order.
    pub fn recover(&self) -> Result<Vec<RepairRecord>, JournalError> {
        let _guard = self.file.lock();
        self.read_all()
    }

    /// Drop the given records (one occurrence each) and rewrite the journal
    /// atomically. Returns the number of records left.
    pub fn retain(&self, resolved: &[RepairRecord]) -> Result<usize, JournalError> {
        let mut file = self.file.lock();
        let mut pending: HashMap<RepairRecord, usize> = HashMap::new();
        for record in resolved {
            *pending.entry(*record).or_default() += 1;
        }

        let mut kept = Vec::new();
        for record in self.read_all()? {
            match pending.get_mut(&record) {
                Some(n) if *n > 0 => *n -= 1,
                _ => kept.push(record),
            }
        }

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| JournalError::io(&tmp_path, e, "create temp journal"))?;
            for record in &kept {
                tmp.write_all(&record.encode())
                    .map_err(|e| JournalError::io(&tmp_path, e, "write temp journal"))?;
            }
            durable_sync(&tmp).map_err(|e| JournalError::io(&tmp_path, e, "sync temp journal"))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| JournalError::io(&self.path, e, "replace journal"))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = File::open(parent).map_err(|e| JournalError::io(parent, e, "open journal directory"))?;
            durable_sync(&dir).map_err(|e| JournalError::io(parent, e, "sync journal directory"))?;
        }

        // the old handle still points at the replaced inode
        *file = open_append(&self.path)?;
        Ok(kept.len())
    }

    fn read_all(&self) -> Result<Vec<RepairRecord>, JournalError> {
        let mut buffer = Vec::new();
        File::open(&self.path)
            .and_then(|mut f| f.read_to_end(&mut buffer))
            .map_err(|e| JournalError::io(&self.path, e, "read journal"))?;
        Ok(decode_all(&buffer))
    }
}

fn open_append(path: &Path) -> Result<File, JournalError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| JournalError::io(path, e, "open journal"))
}

fn decode_all(buffer: &[u8]) -> Vec<RepairRecord> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset + HEADER_SIZE <= buffer.len() {
        if buffer[offset..offset + 4] != MAGIC {
            warn!(offset, "bad magic in repair journal, resyncing");
            match find_next_magic(buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        let length = u32::from_le_bytes([
            buffer[offset + 4],
            buffer[offset + 5],
            buffer[offset + 6],
            buffer[offset + 7],
        ]) as usize;
        let end = offset + HEADER_SIZE + length;
        if end > buffer.len() {
            warn!(offset, "torn record at end of repair journal");
            break;
        }

        let expected = u32::from_le_bytes([
            buffer[offset + 8],
            buffer[offset + 9],
            buffer[offset + 10],
            buffer[offset + 11],
        ]);
        let payload = &buffer[offset + HEADER_SIZE..end];
        let actual = crc32c::crc32c(payload);
        let decoded = if actual == expected {
            RepairRecord::decode(payload, offset as u64)
        } else {
            Err(JournalError::ChecksumMismatch { offset: offset as u64, expected, actual })
        };

        match decoded {
            Ok(record) => {
                records.push(record);
                offset = end;
            }
            Err(e) => {
                warn!(error = %e, "skipping corrupt repair record");
                match find_next_magic(buffer, offset + 1) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }
    }
    records
}

fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    buffer
        .get(start..)?
        .windows(MAGIC.len())
        .position(|w| w == MAGIC)
        .map(|p| start + p)
}

/// Flush file contents to stable storage with the strongest primitive the
/// platform offers.
fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File`.
        let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // plain fsync stops at the drive cache on Apple hardware
        // SAFETY: the descriptor comes from a live `File`.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rec(kind: RelationKind, actor: i64, target: i64) -> RepairRecord {
        RepairRecord { kind, actor, target }
    }

    fn record_len() -> usize {
        HEADER_SIZE + PAYLOAD_SIZE
    }

    #[test]
    fn test_append_and_recover() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("repair.journal");

        let journal = RepairJournal::open(&path).unwrap();
        journal.append(&rec(RelationKind::LikesPost, 7, 9)).unwrap();
        journal.append(&rec(RelationKind::FollowsUser, -3, i64::MAX)).unwrap();
        drop(journal);

        let journal = RepairJournal::open(&path).unwrap();
        let records = journal.recover().unwrap();
        assert_eq!(
            records,
            vec![rec(RelationKind::LikesPost, 7, 9), rec(RelationKind::FollowsUser, -3, i64::MAX)]
        );
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("repair.journal");
        let journal = RepairJournal::open(&path).unwrap();
        for i in 0..3 {
            journal.append(&rec(RelationKind::LikesPost, i, i + 100)).unwrap();
        }
        drop(journal);

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..2 * record_len() + 10]).unwrap();

        let journal = RepairJournal::open(&path).unwrap();
        let records = journal.recover().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], rec(RelationKind::LikesPost, 1, 101));
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("repair.journal");
        let journal = RepairJournal::open(&path).unwrap();
        for i in 0..3 {
            journal.append(&rec(RelationKind::FollowsUser, i, i + 1)).unwrap();
        }
        drop(journal);

        let mut data = fs::read(&path).unwrap();
        data[record_len() + HEADER_SIZE + 3] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let journal = RepairJournal::open(&path).unwrap();
        let records = journal.recover().unwrap();
        assert_eq!(
            records,
            vec![rec(RelationKind::FollowsUser, 0, 1), rec(RelationKind::FollowsUser, 2, 3)]
        );
    }

    #[test]
    fn test_retain_drops_one_occurrence_each() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("repair.journal");
        let journal = RepairJournal::open(&path).unwrap();
        let a = rec(RelationKind::LikesPost, 1, 2);
        let b = rec(RelationKind::LikesPost, 3, 4);
        journal.append(&a).unwrap();
        journal.append(&b).unwrap();
        journal.append(&a).unwrap();

        let left = journal.retain(&[a]).unwrap();
        assert_eq!(left, 2);
        assert_eq!(journal.recover().unwrap(), vec![b, a]);

        // appends after a rewrite land in the new file
        journal.append(&b).unwrap();
        assert_eq!(journal.recover().unwrap(), vec![b, a, b]);
        assert!(!path.with_extension("compact").exists());
    }

    #[test]
    fn test_empty_journal_recovers_nothing() {
        let temp = TempDir::new().unwrap();
        let journal = RepairJournal::open(temp.path().join("j")).unwrap();
        assert!(journal.recover().unwrap().is_empty());
        assert_eq!(journal.retain(&[]).unwrap(), 0);
    }
}
