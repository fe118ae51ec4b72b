//! Snapshot persistence and startup recovery.
//!
//! On open, the engine state is rebuilt as: snapshot (if present) plus a
//! replay of the redo log on top of it. Compaction writes a fresh snapshot
//! and truncates the log, so the pair is always sufficient. The snapshot
//! file is written to a temp name and renamed into place.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{info, warn};

use super::tree::Tree;
use super::wal::{self, Record};
use crate::error::Result;
use crate::hasher::Hasher;
use crate::{errdata, Error};

const SNAPSHOT_MAGIC: &[u8; 4] = b"OBSN";
const SNAPSHOT_FORMAT: u8 = 1;
const FLAG_COMPRESSED: u8 = 0x01;

/// Engine state rebuilt from disk.
pub struct Recovered {
    pub map_ids: HashMap<String, u32>,
    pub trees: HashMap<u32, Tree>,
    pub version: u64,
    pub next_map_id: u32,
}

/// Writes a snapshot of the committed maps to `path` via a temp file.
pub fn write_snapshot(
    path: &Path,
    maps: &[(String, u32, Tree)],
    version: u64,
    compress: bool,
) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(SNAPSHOT_MAGIC)?;
    writer.write_u8(SNAPSHOT_FORMAT)?;
    writer.write_u8(if compress { FLAG_COMPRESSED } else { 0 })?;
    writer.write_u32::<BigEndian>(maps.len() as u32)?;
    writer.write_u64::<BigEndian>(version)?;

    for (name, map_id, tree) in maps {
        let mut section = Vec::new();
        for (key, value) in tree.iter() {
            section.write_u32::<BigEndian>(key.len() as u32)?;
            section.write_all(&key)?;
            section.write_u32::<BigEndian>(value.len() as u32)?;
            section.write_all(&value)?;
        }
        let stored = if compress {
            lz4_flex::compress_prepend_size(&section)
        } else {
            section
        };

        writer.write_u16::<BigEndian>(name.len() as u16)?;
        writer.write_all(name.as_bytes())?;
        writer.write_u32::<BigEndian>(*map_id)?;
        writer.write_u64::<BigEndian>(tree.len())?;
        writer.write_u32::<BigEndian>(stored.len() as u32)?;
        writer.write_all(&stored)?;
        writer.write_u64::<BigEndian>(Hasher::checksum(&stored))?;
    }

    writer.flush()?;
    writer.into_inner().map_err(|e| Error::IO(e.to_string()))?.sync_data()?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Loads a snapshot, returning None when the file does not exist.
pub fn load_snapshot(path: &Path) -> Result<Option<(Vec<(String, u32, Tree)>, u64)>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(Error::Corruption("snapshot magic mismatch".to_string()));
    }
    let format = reader.read_u8()?;
    if format != SNAPSHOT_FORMAT {
        return errdata!("unsupported snapshot format {format}");
    }
    let flags = reader.read_u8()?;
    let compressed = flags & FLAG_COMPRESSED != 0;
    let map_count = reader.read_u32::<BigEndian>()?;
    let version = reader.read_u64::<BigEndian>()?;

    let mut maps = Vec::with_capacity(map_count as usize);
    for _ in 0..map_count {
        let name_len = reader.read_u16::<BigEndian>()?;
        let mut name = vec![0u8; name_len as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::Corruption("snapshot map name is not utf-8".to_string()))?;
        let map_id = reader.read_u32::<BigEndian>()?;
        let entry_count = reader.read_u64::<BigEndian>()?;
        let stored_len = reader.read_u32::<BigEndian>()?;
        let mut stored = vec![0u8; stored_len as usize];
        reader.read_exact(&mut stored)?;
        let crc = reader.read_u64::<BigEndian>()?;
        if crc != Hasher::checksum(&stored) {
            return Err(Error::Corruption(format!("snapshot section {name} checksum mismatch")));
        }

        let section = if compressed {
            lz4_flex::decompress_size_prepended(&stored)
                .map_err(|e| Error::Corruption(format!("snapshot section {name}: {e}")))?
        } else {
            stored
        };

        let mut tree = Tree::new();
        let mut r: &[u8] = &section;
        while !r.is_empty() {
            let key = read_field(&mut r)?;
            let value = read_field(&mut r)?;
            tree.insert(&key, &value);
        }
        if tree.len() != entry_count {
            return Err(Error::Corruption(format!(
                "snapshot section {name} holds {} entries, expected {entry_count}",
                tree.len()
            )));
        }
        maps.push((name, map_id, tree));
    }

    Ok(Some((maps, version)))
}

fn read_field(r: &mut &[u8]) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()?;
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Rebuilds the committed engine state from the snapshot and log files.
pub fn recover(snapshot_path: &Path, log_path: &Path) -> Result<Recovered> {
    let mut map_ids = HashMap::new();
    let mut trees = HashMap::new();
    let mut version = 0u64;

    if let Some((maps, snapshot_version)) = load_snapshot(snapshot_path)? {
        for (name, map_id, tree) in maps {
            map_ids.insert(name, map_id);
            trees.insert(map_id, tree);
        }
        version = snapshot_version;
        info!(version, maps = map_ids.len(), "loaded snapshot");
    }

    let replayed = wal::replay(log_path)?;
    let batch_count = replayed.batches.len();
    for batch in replayed.batches {
        for record in batch {
            match record {
                Record::OpenMap { map_id, name } => {
                    map_ids.insert(name, map_id);
                    trees.entry(map_id).or_default();
                }
                Record::Put { map_id, key, value } => {
                    trees.entry(map_id).or_default().insert(&key, &value);
                }
                Record::Remove { map_id, key } => {
                    trees.entry(map_id).or_default().remove(&key);
                }
                Record::Clear { map_id } => {
                    trees.entry(map_id).or_default().clear();
                }
                Record::Commit { version: v } => version = v,
            }
        }
    }
    if replayed.discarded_bytes > 0 {
        warn!(
            bytes = replayed.discarded_bytes,
            "discarded uncommitted log tail during recovery"
        );
    }
    info!(version, batches = batch_count, "log replay complete");

    let next_map_id = map_ids.values().max().map_or(1, |max| max + 1);
    Ok(Recovered { map_ids, trees, version, next_map_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn sample_tree(n: u32) -> Tree {
        let mut tree = Tree::new();
        for i in 0..n {
            tree.insert(&i.to_be_bytes(), format!("value-{i}").as_bytes());
        }
        tree
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("snapshot");

        let maps = vec![
            ("a".to_string(), 1, sample_tree(100)),
            ("b".to_string(), 2, Tree::new()),
        ];
        write_snapshot(&path, &maps, 42, false).expect("write");

        let (loaded, version) = load_snapshot(&path).expect("load").expect("present");
        assert_eq!(version, 42);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].2.len(), 100);
        assert_eq!(loaded[0].2.get(&7u32.to_be_bytes()), Some(b"value-7".to_vec()));
        assert_eq!(loaded[1].2.len(), 0);
    }

    #[test]
    fn test_snapshot_round_trip_compressed() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("snapshot");

        let maps = vec![("a".to_string(), 1, sample_tree(500))];
        write_snapshot(&path, &maps, 7, true).expect("write");

        let (loaded, version) = load_snapshot(&path).expect("load").expect("present");
        assert_eq!(version, 7);
        assert_eq!(loaded[0].2.len(), 500);
    }

    #[test]
    fn test_corrupt_snapshot_detected() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("snapshot");

        write_snapshot(&path, &[("a".to_string(), 1, sample_tree(10))], 1, false)
            .expect("write");

        let mut bytes = std::fs::read(&path).expect("read");
        let len = bytes.len();
        bytes[len - 20] ^= 0xFF;
        std::fs::write(&path, bytes).expect("rewrite");

        assert!(matches!(load_snapshot(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_recover_from_snapshot_and_log() {
        let dir = TempDir::new().expect("temp dir");
        let snapshot_path = dir.path().join("snapshot");
        let log_path = dir.path().join("store.log");

        write_snapshot(&snapshot_path, &[("a".to_string(), 1, sample_tree(10))], 3, false)
            .expect("write");

        let mut wal = wal::Wal::open(&log_path).expect("open");
        wal.append(&Record::Put { map_id: 1, key: vec![0xAA], value: vec![0xBB] })
            .expect("append");
        wal.append(&Record::OpenMap { map_id: 2, name: "b".to_string() }).expect("append");
        wal.append(&Record::Commit { version: 4 }).expect("append");
        wal.sync().expect("sync");

        let recovered = recover(&snapshot_path, &log_path).expect("recover");
        assert_eq!(recovered.version, 4);
        assert_eq!(recovered.next_map_id, 3);
        assert_eq!(recovered.trees[&1].len(), 11);
        assert!(recovered.map_ids.contains_key("b"));
    }
}
