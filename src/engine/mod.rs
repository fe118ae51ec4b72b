//! Versioned store of named ordered maps.
//!
//! This is the "paged ordered map" collaborator the observation stores are
//! built on: named byte-key maps with point lookups, floor/ceiling probes,
//! range cursors and O(log n) rank queries, plus transactional commit with
//! point-in-time rollback of uncommitted changes.
//!
//! # Write path
//!
//! Mutations apply to the working tree roots and accumulate as redo
//! records. `commit` appends the batch and a commit marker to the log and
//! publishes the working roots as the new committed state; `rollback_to`
//! restores the committed roots and drops the batch. Readers always see
//! the last committed roots, so a crash or rollback can never expose a
//! half-applied write.
//!
//! # Durability
//!
//! `commit` makes the batch part of the replayable log; `commit_and_sync`
//! additionally fsyncs, which is the durability point the database-level
//! `commit()` promises. When the accumulated batch exceeds the configured
//! buffer size, the engine commits implicitly at the next transaction
//! boundary, never inside an open transaction.

pub mod cursor;
pub mod recovery;
pub mod tree;
pub mod wal;

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use cursor::Cursor;
pub use tree::Tree;

use crate::error::{Error, Result};
use crate::flock::FileLock;
use wal::{Record, Wal};

const DEFAULT_AUTO_COMMIT_BYTES: usize = 4 << 20;

const LOCK_FILE: &str = "store.lock";
const LOG_FILE: &str = "store.log";
const SNAPSHOT_FILE: &str = "snapshot";
const META_FILE: &str = "engine.meta";

/// Options fixed when an engine directory is opened.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub dir: PathBuf,
    /// Buffered batch bytes before an implicit commit (0 = default)
    pub auto_commit_buffer_bytes: usize,
    /// Compress snapshot sections; immutable after creation
    pub use_compression: bool,
    /// Advisory cache budget in KiB; recorded, not enforced
    pub memory_cache_kb: u32,
}

/// Creation-time facts persisted next to the data files. Options that are
/// immutable for the life of the store are validated against this on every
/// open.
#[derive(Debug, Serialize, Deserialize)]
struct EngineMeta {
    format_version: u32,
    use_compression: bool,
}

struct EngineState {
    map_ids: HashMap<String, u32>,
    working: HashMap<u32, Tree>,
    committed: HashMap<u32, Tree>,
    version: u64,
    pending: Vec<Record>,
    pending_bytes: usize,
    next_map_id: u32,
    /// Map registrations already written to the log. Registrations are
    /// logged at commit time rather than buffered in `pending`, so a
    /// rollback cannot separate a live map from its log record.
    persisted_maps: HashSet<u32>,
}

struct EngineInner {
    options: EngineOptions,
    auto_commit_bytes: usize,
    state: RwLock<EngineState>,
    wal: Mutex<Wal>,
    /// Transaction gate: reentrant so `execute_transaction` can wrap the
    /// per-operation gates; the cell tracks nesting depth.
    gate: ReentrantMutex<Cell<usize>>,
    closed: AtomicBool,
    _lock: FileLock,
}

/// Handle to an open engine directory. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Opens or creates an engine directory, recovering committed state
    /// from the snapshot and log files.
    pub fn open(options: EngineOptions) -> Result<Engine> {
        std::fs::create_dir_all(&options.dir)
            .map_err(|e| Error::Unavailable(format!("cannot create {}: {e}", options.dir.display())))?;

        let lock = FileLock::lock(options.dir.join(LOCK_FILE)).map_err(|e| {
            Error::Unavailable(format!("store {} is locked: {e}", options.dir.display()))
        })?;

        Self::check_meta(&options)?;

        let snapshot_path = options.dir.join(SNAPSHOT_FILE);
        let log_path = options.dir.join(LOG_FILE);
        let recovered = recovery::recover(&snapshot_path, &log_path)?;
        let wal = Wal::open(&log_path)?;

        info!(
            dir = %options.dir.display(),
            version = recovered.version,
            maps = recovered.map_ids.len(),
            "opened engine"
        );

        let auto_commit_bytes = match options.auto_commit_buffer_bytes {
            0 => DEFAULT_AUTO_COMMIT_BYTES,
            n => n,
        };
        let persisted_maps = recovered.map_ids.values().copied().collect();
        let state = EngineState {
            map_ids: recovered.map_ids,
            working: recovered.trees.clone(),
            committed: recovered.trees,
            version: recovered.version,
            pending: Vec::new(),
            pending_bytes: 0,
            next_map_id: recovered.next_map_id,
            persisted_maps,
        };

        Ok(Engine {
            inner: Arc::new(EngineInner {
                options,
                auto_commit_bytes,
                state: RwLock::new(state),
                wal: Mutex::new(wal),
                gate: ReentrantMutex::new(Cell::new(0)),
                closed: AtomicBool::new(false),
                _lock: lock,
            }),
        })
    }

    /// Validates immutable creation-time options against the recorded
    /// meta file, writing it on first creation.
    fn check_meta(options: &EngineOptions) -> Result<()> {
        let meta_path = options.dir.join(META_FILE);
        match std::fs::read(&meta_path) {
            Ok(bytes) => {
                let meta: EngineMeta = crate::encoding::bincode::deserialize(&bytes)?;
                if meta.use_compression != options.use_compression {
                    return Err(Error::Unavailable(format!(
                        "store was created with use_compression={}, cannot reopen with {}",
                        meta.use_compression, options.use_compression
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let meta = EngineMeta {
                    format_version: 1,
                    use_compression: options.use_compression,
                };
                std::fs::write(&meta_path, crate::encoding::bincode::serialize(&meta)?)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Unavailable("engine is closed".to_string()));
        }
        Ok(())
    }

    /// Opens (or creates) a named map.
    pub fn open_map(&self, name: &str) -> Result<MapHandle> {
        self.check_open()?;
        let mut state = self.inner.state.write()?;
        let map_id = match state.map_ids.get(name).copied() {
            Some(id) => id,
            None => {
                let id = state.next_map_id;
                state.next_map_id += 1;
                state.map_ids.insert(name.to_string(), id);
                state.working.insert(id, Tree::new());
                state.committed.insert(id, Tree::new());
                debug!(name, map_id = id, "created map");
                id
            }
        };
        Ok(MapHandle { engine: self.inner.clone(), map_id })
    }

    /// Version of the last committed state.
    pub fn current_version(&self) -> u64 {
        self.inner.state.read().map(|s| s.version).unwrap_or(0)
    }

    /// Commits the pending batch, making it replayable (flushed, not yet
    /// fsynced). No-op when nothing is pending.
    pub fn commit(&self) -> Result<u64> {
        self.check_open()?;
        self.inner.commit(false)
    }

    /// Commits and fsyncs: once this returns, the batch survives process
    /// loss.
    pub fn commit_and_sync(&self) -> Result<u64> {
        self.check_open()?;
        self.inner.commit(true)
    }

    /// Discards uncommitted changes, restoring the given committed
    /// version. Only the current committed version can be restored.
    pub fn rollback_to(&self, version: u64) -> Result<()> {
        let mut state = self.inner.state.write()?;
        if state.version != version {
            return crate::errdata!(
                "cannot roll back to version {version}, committed version is {}",
                state.version
            );
        }
        state.working = state.committed.clone();
        state.pending.clear();
        state.pending_bytes = 0;
        debug!(version, "rolled back uncommitted changes");
        Ok(())
    }

    /// Runs `f` under the store-wide write gate. On error, the engine is
    /// rolled back to its version at entry and the error is rethrown.
    /// Reentrant: a transaction may invoke operations that themselves
    /// take the gate; implicit commits are deferred to the outermost
    /// exit.
    pub fn transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        // Restores the nesting depth even if `f` unwinds
        struct DepthRestore<'a> {
            cell: &'a Cell<usize>,
            depth: usize,
        }
        impl Drop for DepthRestore<'_> {
            fn drop(&mut self) {
                self.cell.set(self.depth);
            }
        }

        self.check_open()?;
        let guard = self.inner.gate.lock();
        let depth = guard.get();
        guard.set(depth + 1);
        let restore = DepthRestore { cell: &*guard, depth };
        let start_version = self.current_version();

        let result = f();
        drop(restore);

        match result {
            Ok(value) => {
                if depth == 0 {
                    self.maybe_auto_commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                self.rollback_to(start_version)?;
                Err(e)
            }
        }
    }

    fn maybe_auto_commit(&self) -> Result<()> {
        let over = {
            let state = self.inner.state.read()?;
            state.pending_bytes >= self.inner.auto_commit_bytes
        };
        if over {
            self.inner.commit(false)?;
        }
        Ok(())
    }

    /// Writes a fresh snapshot of the committed state and truncates the
    /// log. Serialized against writers through the gate.
    pub fn compact(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.inner.gate.lock();
        self.inner.commit(true)?;

        let (maps, version) = {
            let state = self.inner.state.read()?;
            let maps: Vec<(String, u32, Tree)> = state
                .map_ids
                .iter()
                .map(|(name, id)| {
                    let tree = state.committed.get(id).cloned().unwrap_or_default();
                    (name.clone(), *id, tree)
                })
                .collect();
            (maps, state.version)
        };

        let snapshot_path = self.inner.options.dir.join(SNAPSHOT_FILE);
        recovery::write_snapshot(&snapshot_path, &maps, version, self.inner.options.use_compression)?;
        self.inner.wal.lock()?.truncate()?;
        info!(version, "compacted engine");
        Ok(())
    }

    /// Commits, syncs and marks the engine closed. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.commit(true)?;
        info!(dir = %self.inner.options.dir.display(), "closed engine");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }
}

impl EngineInner {
    fn commit(&self, sync: bool) -> Result<u64> {
        let mut state = self.state.write()?;
        let unlogged: Vec<(u32, String)> = state
            .map_ids
            .iter()
            .filter(|(_, id)| !state.persisted_maps.contains(*id))
            .map(|(name, id)| (*id, name.clone()))
            .collect();
        if state.pending.is_empty() && unlogged.is_empty() {
            if sync {
                self.wal.lock()?.sync()?;
            }
            return Ok(state.version);
        }

        let next_version = state.version + 1;
        {
            let mut wal = self.wal.lock()?;
            for (map_id, name) in &unlogged {
                wal.append(&Record::OpenMap { map_id: *map_id, name: name.clone() })?;
            }
            for record in &state.pending {
                wal.append(record)?;
            }
            wal.append(&Record::Commit { version: next_version })?;
            if sync {
                wal.sync()?;
            } else {
                wal.flush()?;
            }
        }

        state.persisted_maps.extend(unlogged.into_iter().map(|(id, _)| id));
        state.committed = state.working.clone();
        state.version = next_version;
        state.pending.clear();
        state.pending_bytes = 0;
        debug!(version = next_version, "committed batch");
        Ok(next_version)
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.commit(true) {
                tracing::warn!("final commit on drop failed: {e}");
            }
        }
    }
}

/// Handle to one named map. Cheap to clone.
#[derive(Clone)]
pub struct MapHandle {
    engine: Arc<EngineInner>,
    map_id: u32,
}

impl MapHandle {
    /// Point-in-time snapshot of the current map state, including
    /// not-yet-committed writes. A cursor over a snapshot is unaffected
    /// by later mutations, so long scans observe one consistent view;
    /// commit only governs durability. Uncommitted entries can still
    /// vanish through `rollback_to`, which is why every write path runs
    /// under the transaction gate.
    pub fn snapshot(&self) -> Result<Tree> {
        let state = self.engine.state.read()?;
        state
            .working
            .get(&self.map_id)
            .cloned()
            .ok_or_else(|| Error::Corruption(format!("map {} has no working root", self.map_id)))
    }

    /// Point lookup on the current state.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot()?.get(key))
    }

    /// Number of entries in the current state.
    pub fn len(&self) -> Result<u64> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Inserts or replaces, returning the previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.engine.state.write()?;
        let map_id = self.map_id;
        let tree = state
            .working
            .get_mut(&map_id)
            .ok_or_else(|| Error::Corruption(format!("map {map_id} has no working root")))?;
        let old = tree.insert(key, value);
        state.pending_bytes += key.len() + value.len() + 16;
        state.pending.push(Record::Put { map_id, key: key.to_vec(), value: value.to_vec() });
        Ok(old)
    }

    /// Removes a key, returning the previous value.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.engine.state.write()?;
        let map_id = self.map_id;
        let tree = state
            .working
            .get_mut(&map_id)
            .ok_or_else(|| Error::Corruption(format!("map {map_id} has no working root")))?;
        let old = tree.remove(key);
        if old.is_some() {
            state.pending_bytes += key.len() + 16;
            state.pending.push(Record::Remove { map_id, key: key.to_vec() });
        }
        Ok(old)
    }

    /// Removes every entry.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.engine.state.write()?;
        let map_id = self.map_id;
        let tree = state
            .working
            .get_mut(&map_id)
            .ok_or_else(|| Error::Corruption(format!("map {map_id} has no working root")))?;
        tree.clear();
        state.pending_bytes += 16;
        state.pending.push(Record::Clear { map_id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn options(dir: &TempDir) -> EngineOptions {
        EngineOptions {
            dir: dir.path().to_path_buf(),
            auto_commit_buffer_bytes: 0,
            use_compression: false,
            memory_cache_kb: 0,
        }
    }

    #[test]
    fn test_put_commit_reopen() {
        let dir = TempDir::new().expect("temp dir");

        {
            let engine = Engine::open(options(&dir)).expect("open");
            let map = engine.open_map("m").expect("map");
            for i in 0..100u32 {
                map.put(&i.to_be_bytes(), b"v").expect("put");
            }
            engine.commit_and_sync().expect("commit");
            engine.close().expect("close");
        }

        let engine = Engine::open(options(&dir)).expect("reopen");
        let map = engine.open_map("m").expect("map");
        assert_eq!(map.len().expect("len"), 100);
        assert_eq!(map.get(&42u32.to_be_bytes()).expect("get"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Engine::open(options(&dir)).expect("open");
        let map = engine.open_map("m").expect("map");

        // Writes are visible to new snapshots right away; commit is about
        // durability, not visibility
        map.put(b"k", b"v").expect("put");
        assert_eq!(map.get(b"k").expect("get"), Some(b"v".to_vec()));

        // A snapshot taken before a write never sees it
        let before = map.snapshot().expect("snapshot");
        map.put(b"k2", b"v2").expect("put");
        assert_eq!(before.get(b"k2"), None);
        assert_eq!(map.get(b"k2").expect("get"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_transaction_rollback_on_error() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Engine::open(options(&dir)).expect("open");
        let map = engine.open_map("m").expect("map");

        map.put(b"kept", b"v").expect("put");
        engine.commit().expect("commit");

        let result: Result<()> = engine.transaction(|| {
            map.put(b"discarded", b"v")?;
            crate::errinput!("boom")
        });
        assert!(result.is_err());

        engine.commit().expect("commit");
        assert_eq!(map.get(b"kept").expect("get"), Some(b"v".to_vec()));
        assert_eq!(map.get(b"discarded").expect("get"), None);
    }

    #[test]
    fn test_nested_transaction_rolls_back_to_outer() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Engine::open(options(&dir)).expect("open");
        let map = engine.open_map("m").expect("map");

        let result: Result<()> = engine.transaction(|| {
            map.put(b"outer", b"v")?;
            let inner: Result<()> = engine.transaction(|| {
                map.put(b"inner", b"v")?;
                crate::errinput!("inner failure")
            });
            assert!(inner.is_err());
            // Inner rollback discarded both uncommitted writes
            assert_eq!(map.get(b"outer")?, None);
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_auto_commit_at_transaction_boundary() {
        let dir = TempDir::new().expect("temp dir");
        let mut opts = options(&dir);
        opts.auto_commit_buffer_bytes = 64;
        let engine = Engine::open(opts).expect("open");
        let map = engine.open_map("m").expect("map");

        engine
            .transaction(|| {
                map.put(b"key-1", &[0u8; 128])?;
                // Past the buffer size, but never committed mid-transaction
                assert_eq!(engine.current_version(), 0);
                Ok(())
            })
            .expect("txn");

        // Committed implicitly at the transaction boundary
        assert_eq!(engine.current_version(), 1);
        assert!(map.get(b"key-1").expect("get").is_some());
    }

    #[test]
    fn test_uncommitted_lost_on_reopen() {
        let dir = TempDir::new().expect("temp dir");

        {
            let engine = Engine::open(options(&dir)).expect("open");
            let map = engine.open_map("m").expect("map");
            map.put(b"committed", b"v").expect("put");
            engine.commit_and_sync().expect("commit");

            map.put(b"pending", b"v").expect("put");
            // Mark closed without committing, as a crash would leave it
            engine.inner.closed.store(true, Ordering::Release);
        }

        let engine = Engine::open(options(&dir)).expect("reopen");
        let map = engine.open_map("m").expect("map");
        assert_eq!(map.get(b"committed").expect("get"), Some(b"v".to_vec()));
        assert_eq!(map.get(b"pending").expect("get"), None);
    }

    #[test]
    fn test_compact_then_reopen() {
        let dir = TempDir::new().expect("temp dir");

        {
            let engine = Engine::open(options(&dir)).expect("open");
            let map = engine.open_map("m").expect("map");
            for i in 0..500u32 {
                map.put(&i.to_be_bytes(), &i.to_be_bytes()).expect("put");
            }
            engine.commit().expect("commit");
            map.remove(&0u32.to_be_bytes()).expect("remove");
            engine.compact().expect("compact");
            engine.close().expect("close");
        }

        let engine = Engine::open(options(&dir)).expect("reopen");
        let map = engine.open_map("m").expect("map");
        assert_eq!(map.len().expect("len"), 499);
    }

    #[test]
    fn test_compression_flag_immutable() {
        let dir = TempDir::new().expect("temp dir");

        {
            let engine = Engine::open(options(&dir)).expect("open");
            engine.close().expect("close");
        }

        let mut opts = options(&dir);
        opts.use_compression = true;
        assert!(matches!(Engine::open(opts), Err(Error::Unavailable(_))));
    }

    #[test]
    fn test_rank_via_map() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Engine::open(options(&dir)).expect("open");
        let map = engine.open_map("m").expect("map");
        for i in 0..100u32 {
            map.put(&i.to_be_bytes(), b"v").expect("put");
        }
        engine.commit().expect("commit");

        let snapshot = map.snapshot().expect("snapshot");
        assert_eq!(snapshot.rank(&50u32.to_be_bytes()), 50);
    }
}
