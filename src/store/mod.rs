//! Database assembly: the engine, the three sub-stores and their wiring.
//!
//! An [`ObsDatabase`] owns one engine directory and three sub-stores:
//! systems ("proc_store"), features of interest ("foi_store") and
//! observations with their stream registry ("obs_store"). The sub-stores
//! cross-reference each other (stream removal cascades into observations,
//! observation queries resolve fois); those links are wired once after
//! every sub-store is open, then frozen.

pub mod fois;
pub mod keys;
pub mod obs;
pub mod stats;
pub mod streams;
pub mod systems;

use std::sync::Arc;

use tracing::info;

use crate::config::{DbConfig, StreamIdStrategy};
use crate::encoding::bincode;
use crate::engine::{Engine, EngineOptions};
use crate::error::{Error, Result};
use crate::model::SystemInfo;

pub use fois::FoiStore;
pub use keys::{RecordKey, SeriesKey};
pub use obs::{ObsIter, ObsStore};
pub use stats::{auto_bin_size, ObsStats, BIN_SIZE_LADDER};
pub use streams::DataStreamStore;
pub use systems::SystemStore;

const DB_META_MAP: &str = "db_meta";
const META_KEY_ID_STRATEGY: &[u8] = b"stream_id_strategy";

/// A persistent observation database over one storage directory.
pub struct ObsDatabase {
    config: DbConfig,
    engine: Engine,
    systems: Arc<SystemStore>,
    fois: Arc<FoiStore>,
    obs: Arc<ObsStore>,
}

impl ObsDatabase {
    /// Validates the configuration, opens (or creates) the engine
    /// directory, recovers committed state, opens the sub-stores and
    /// freezes their cross-references.
    pub fn open(config: DbConfig) -> Result<Self> {
        config.validate()?;
        let dir = match (&config.storage_root, config.storage_path.is_absolute()) {
            (Some(root), false) => root.join(&config.storage_path),
            _ => config.storage_path.clone(),
        };

        let engine = Engine::open(EngineOptions {
            dir,
            auto_commit_buffer_bytes: config.auto_commit_buffer_bytes as usize,
            use_compression: config.use_compression,
            memory_cache_kb: config.memory_cache_kb,
        })?;
        Self::check_db_meta(&engine, &config)?;

        let systems = Arc::new(SystemStore::open(&engine)?);
        let fois = Arc::new(FoiStore::open(&engine)?);
        let streams = Arc::new(DataStreamStore::open(&engine, config.stream_id_strategy)?);
        let obs = ObsStore::open(&engine, streams)?;

        // Wire the cross-references, then the graph is frozen
        obs.data_streams().link_obs(Arc::downgrade(&obs));
        obs.link_fois(Arc::downgrade(&fois));

        // Persist map registrations and creation-time meta
        engine.commit_and_sync()?;

        info!(
            database_id = config.database_id,
            records = obs.num_records()?,
            streams = obs.data_streams().len()?,
            "observation database started"
        );
        Ok(Self { config, engine, systems, fois, obs })
    }

    /// The id strategy is immutable for the life of a store directory.
    fn check_db_meta(engine: &Engine, config: &DbConfig) -> Result<()> {
        let meta = engine.open_map(DB_META_MAP)?;
        match meta.snapshot()?.get(META_KEY_ID_STRATEGY) {
            Some(bytes) => {
                let stored: StreamIdStrategy = bincode::deserialize(&bytes)?;
                if stored != config.stream_id_strategy {
                    return Err(Error::Unavailable(format!(
                        "store was created with stream id strategy {stored:?}, cannot reopen with {:?}",
                        config.stream_id_strategy
                    )));
                }
            }
            None => {
                meta.put(META_KEY_ID_STRATEGY, &bincode::serialize(&config.stream_id_strategy)?)?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Unique tag of this store among all stores mounted on the host.
    pub fn database_id(&self) -> u32 {
        self.config.database_id
    }

    pub fn system_store(&self) -> &Arc<SystemStore> {
        &self.systems
    }

    pub fn foi_store(&self) -> &Arc<FoiStore> {
        &self.fois
    }

    pub fn observation_store(&self) -> &Arc<ObsStore> {
        &self.obs
    }

    pub fn data_streams(&self) -> &Arc<DataStreamStore> {
        self.obs.data_streams()
    }

    /// Durable flush: once this returns, previously acknowledged writes
    /// survive process loss.
    pub fn commit(&self) -> Result<()> {
        self.engine.commit_and_sync()?;
        Ok(())
    }

    /// Runs `f` under the store-wide write gate with rollback on error,
    /// so multiple modifications apply atomically.
    pub fn execute_transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.engine.transaction(f)
    }

    /// Explicit maintenance pass: collects empty observation series, then
    /// rewrites the engine snapshot and truncates the log.
    pub fn compact(&self) -> Result<()> {
        self.obs.compact_series()?;
        self.engine.compact()
    }

    /// Removes a system and cascades through its data streams into their
    /// series and observations.
    pub fn remove_system(&self, system_id: u64) -> Result<Option<SystemInfo>> {
        self.engine.transaction(|| {
            let removed = self.systems.remove(system_id)?;
            if removed.is_some() {
                for stream_id in self.data_streams().ids_by_system(system_id)? {
                    self.data_streams().remove(stream_id)?;
                }
            }
            Ok(removed)
        })
    }

    /// Closes the engine, flushing first. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.engine.close()
    }

    /// Engine handle, for maintenance tooling and tests.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}
