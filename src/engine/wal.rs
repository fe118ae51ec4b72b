//! Redo log for the ordered-map engine.
//!
//! Mutations buffered by the engine are appended as framed records and
//! closed by a commit marker; replay applies only batches that end in a
//! valid marker, so a torn tail from a crash is discarded rather than
//! half-applied. Framing is `[u32 len][payload][u64 crc]` with the CRC
//! computed over the payload bytes.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::hasher::Hasher;
use crate::{errdata, Error};

/// Upper bound on a single record, to catch corrupt length prefixes
/// before they turn into huge allocations.
const MAX_RECORD_LEN: u32 = 1 << 30;

const KIND_PUT: u8 = 1;
const KIND_REMOVE: u8 = 2;
const KIND_CLEAR: u8 = 3;
const KIND_OPEN_MAP: u8 = 4;
const KIND_COMMIT: u8 = 5;

/// One logical redo record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Put { map_id: u32, key: Vec<u8>, value: Vec<u8> },
    Remove { map_id: u32, key: Vec<u8> },
    Clear { map_id: u32 },
    OpenMap { map_id: u32, name: String },
    Commit { version: u64 },
}

impl Record {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Record::Put { map_id, key, value } => {
                buf.push(KIND_PUT);
                write_u32(&mut buf, *map_id);
                write_bytes(&mut buf, key);
                write_bytes(&mut buf, value);
            }
            Record::Remove { map_id, key } => {
                buf.push(KIND_REMOVE);
                write_u32(&mut buf, *map_id);
                write_bytes(&mut buf, key);
            }
            Record::Clear { map_id } => {
                buf.push(KIND_CLEAR);
                write_u32(&mut buf, *map_id);
            }
            Record::OpenMap { map_id, name } => {
                buf.push(KIND_OPEN_MAP);
                write_u32(&mut buf, *map_id);
                write_bytes(&mut buf, name.as_bytes());
            }
            Record::Commit { version } => {
                buf.push(KIND_COMMIT);
                buf.extend_from_slice(&version.to_be_bytes());
            }
        }
        buf
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = payload;
        let kind = r.read_u8()?;
        match kind {
            KIND_PUT => {
                let map_id = r.read_u32::<BigEndian>()?;
                let key = read_bytes(&mut r)?;
                let value = read_bytes(&mut r)?;
                Ok(Record::Put { map_id, key, value })
            }
            KIND_REMOVE => {
                let map_id = r.read_u32::<BigEndian>()?;
                let key = read_bytes(&mut r)?;
                Ok(Record::Remove { map_id, key })
            }
            KIND_CLEAR => {
                let map_id = r.read_u32::<BigEndian>()?;
                Ok(Record::Clear { map_id })
            }
            KIND_OPEN_MAP => {
                let map_id = r.read_u32::<BigEndian>()?;
                let name = read_bytes(&mut r)?;
                let name = String::from_utf8(name)
                    .map_err(|_| Error::InvalidData("map name is not utf-8".to_string()))?;
                Ok(Record::OpenMap { map_id, name })
            }
            KIND_COMMIT => {
                let version = r.read_u64::<BigEndian>()?;
                Ok(Record::Commit { version })
            }
            other => errdata!("unknown log record kind {other}"),
        }
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn read_bytes(r: &mut &[u8]) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()?;
    if len > MAX_RECORD_LEN {
        return errdata!("log field length {len} exceeds limit");
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Append-only log file handle.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Opens the log for appending, creating it if missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().create(true).read(true).append(true).open(path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self { writer, file, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record and returns the number of bytes written.
    pub fn append(&mut self, record: &Record) -> Result<usize> {
        let payload = record.encode();
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(&payload)?;
        self.writer.write_u64::<BigEndian>(Hasher::checksum(&payload))?;
        Ok(payload.len() + 12)
    }

    /// Flushes buffered records to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and makes the log durable against process and OS loss.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Discards the whole log. Used after a snapshot has captured its
    /// contents.
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |m| m.len())
    }
}

/// Outcome of scanning a log file during recovery.
pub struct Replay {
    /// Batches closed by a valid commit marker, in commit order. The
    /// commit record itself is the last element of each batch.
    pub batches: Vec<Vec<Record>>,
    /// Bytes of torn or corrupt tail that were discarded.
    pub discarded_bytes: u64,
}

/// Scans a log file, collecting committed batches and measuring the
/// discarded tail. Absent file reads as empty.
pub fn replay(path: &Path) -> Result<Replay> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Replay { batches: Vec::new(), discarded_bytes: 0 })
        }
        Err(e) => return Err(e.into()),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut committed_offset = 0u64;
    let mut offset = 0u64;

    loop {
        match read_record(&mut reader) {
            Ok(Some((record, len))) => {
                offset += len;
                let is_commit = matches!(record, Record::Commit { .. });
                current.push(record);
                if is_commit {
                    batches.push(std::mem::take(&mut current));
                    committed_offset = offset;
                }
            }
            Ok(None) => break,
            Err(_) => break, // torn or corrupt tail; stop here
        }
    }

    Ok(Replay { batches, discarded_bytes: total - committed_offset })
}

/// Reads one framed record, returning None at a clean EOF.
fn read_record(reader: &mut impl Read) -> Result<Option<(Record, u64)>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_RECORD_LEN {
        return errdata!("log record length {len} exceeds limit");
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    let stored_crc = reader.read_u64::<BigEndian>()?;
    if stored_crc != Hasher::checksum(&payload) {
        return errdata!("log record checksum mismatch");
    }
    let record = Record::decode(&payload)?;
    Ok(Some((record, len as u64 + 12)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::OpenMap { map_id: 1, name: "obs_store:obs_records".to_string() },
            Record::Put { map_id: 1, key: vec![1, 2, 3], value: vec![9; 100] },
            Record::Remove { map_id: 1, key: vec![1, 2, 3] },
            Record::Clear { map_id: 1 },
            Record::Commit { version: 1 },
        ]
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("store.log");

        let records = sample_records();
        let mut wal = Wal::open(&path).expect("open");
        for record in &records {
            wal.append(record).expect("append");
        }
        wal.sync().expect("sync");

        let replayed = replay(&path).expect("replay");
        assert_eq!(replayed.batches.len(), 1);
        assert_eq!(replayed.batches[0], records);
        assert_eq!(replayed.discarded_bytes, 0);
    }

    #[test]
    fn test_uncommitted_tail_discarded() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("store.log");

        let mut wal = Wal::open(&path).expect("open");
        wal.append(&Record::Put { map_id: 1, key: vec![1], value: vec![2] }).expect("append");
        wal.append(&Record::Commit { version: 1 }).expect("append");
        // A batch that never commits
        wal.append(&Record::Put { map_id: 1, key: vec![3], value: vec![4] }).expect("append");
        wal.sync().expect("sync");

        let replayed = replay(&path).expect("replay");
        assert_eq!(replayed.batches.len(), 1);
        assert!(replayed.discarded_bytes > 0);
    }

    #[test]
    fn test_torn_record_discarded() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("store.log");

        let mut wal = Wal::open(&path).expect("open");
        wal.append(&Record::Put { map_id: 1, key: vec![1], value: vec![2; 64] }).expect("append");
        wal.append(&Record::Commit { version: 1 }).expect("append");
        wal.append(&Record::Put { map_id: 1, key: vec![5], value: vec![6; 64] }).expect("append");
        wal.append(&Record::Commit { version: 2 }).expect("append");
        wal.sync().expect("sync");
        let full = wal.size();

        // Truncate into the middle of the second batch
        drop(wal);
        let file = File::options().write(true).open(&path).expect("reopen");
        file.set_len(full - 10).expect("truncate");

        let replayed = replay(&path).expect("replay");
        assert_eq!(replayed.batches.len(), 1);
        assert_eq!(
            replayed.batches[0].last(),
            Some(&Record::Commit { version: 1 })
        );
        assert!(replayed.discarded_bytes > 0);
    }

    #[test]
    fn test_replay_missing_file() {
        let dir = TempDir::new().expect("temp dir");
        let replayed = replay(&dir.path().join("absent.log")).expect("replay");
        assert!(replayed.batches.is_empty());
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("store.log");

        let mut wal = Wal::open(&path).expect("open");
        wal.append(&Record::Commit { version: 1 }).expect("append");
        wal.sync().expect("sync");
        assert!(wal.size() > 0);

        wal.truncate().expect("truncate");
        assert_eq!(wal.size(), 0);
        assert!(replay(&path).expect("replay").batches.is_empty());
    }
}
