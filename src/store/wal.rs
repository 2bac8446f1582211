use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::Reservation;

/// One reservation row as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: i64,
    pub room_id: String,
    pub start: i64,
    pub end: i64,
}

impl From<&Reservation> for RowRecord {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            room_id: r.room_id.as_str().to_owned(),
            start: r.interval.start().timestamp(),
            end: r.interval.end().timestamp(),
        }
    }
}

/// All rows inserted by one committed transaction. A torn write drops the
/// whole transaction, never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub rows: Vec<RowRecord>,
}

/// Encode one entry, returning the number of bytes written.
fn encode_record(writer: &mut impl Write, record: &CommitRecord) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + payload.len() as u64)
}

/// Result of reading a log: the intact records and the byte length they
/// occupy. Anything past `valid_len` is a torn or corrupt tail.
#[derive(Debug, Default)]
pub struct Replayed {
    pub records: Vec<CommitRecord>,
    pub valid_len: u64,
}

/// Append-only reservation log.
///
/// Format per entry: `[u32: len][bincode: CommitRecord][u32: crc32]`
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    synced_len: u64,
    /// Bytes handed to the writer since then.
    unsynced: u64,
}

impl Wal {
    /// Open for appending, cutting the file back to `valid_len` first so new
    /// entries never land behind a torn tail.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "truncating {} torn bytes from {}",
                on_disk - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len: on_disk.min(valid_len),
            unsynced: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &CommitRecord) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing. Follow with `flush_sync()`.
    pub fn append_buffered(&mut self, record: &CommitRecord) -> io::Result<()> {
        self.unsynced += encode_record(&mut self.writer, record)?;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced;
        self.unsynced = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both
    /// the buffered bytes and whatever already reached the file.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it
        let (_, _discarded) = stale.into_parts();
        self.unsynced = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every valid record. Truncated or corrupt trailing entries are discarded.
    pub fn replay(path: &Path) -> io::Result<Replayed> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replayed::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<CommitRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        Ok(Replayed { records, valid_len })
    }
}
