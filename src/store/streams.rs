//! Data stream registry.
//!
//! One stream per `(system, output, valid-time start)`; the unit of schema
//! for observations. Lives inside the observation store ("obs_store" map
//! namespace) because stream removal cascades into the series and record
//! indexes.

use std::sync::{OnceLock, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_128;

use crate::config::StreamIdStrategy;
use crate::encoding::{keycode, Value};
use crate::engine::{Engine, MapHandle};
use crate::error::{Error, Result};
use crate::model::DataStreamInfo;
use crate::query::StreamFilter;

use super::obs::ObsStore;

const STREAMS_MAP: &str = "obs_store:data_streams";
const STREAMS_BY_SYSTEM_MAP: &str = "obs_store:data_streams_by_system";

/// Deterministic ids keep only the low 48 bits of the hash.
const UID_HASH_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Stream registry with pluggable id assignment.
pub struct DataStreamStore {
    engine: Engine,
    streams: MapHandle,
    by_system: MapHandle,
    id_strategy: StreamIdStrategy,
    /// Set once during database wiring; needed for cascade removal.
    obs_link: OnceLock<Weak<ObsStore>>,
}

impl DataStreamStore {
    pub fn open(engine: &Engine, id_strategy: StreamIdStrategy) -> Result<Self> {
        Ok(Self {
            engine: engine.clone(),
            streams: engine.open_map(STREAMS_MAP)?,
            by_system: engine.open_map(STREAMS_BY_SYSTEM_MAP)?,
            id_strategy,
            obs_link: OnceLock::new(),
        })
    }

    pub(crate) fn link_obs(&self, obs: Weak<ObsStore>) {
        let _ = self.obs_link.set(obs);
    }

    pub fn id_strategy(&self) -> StreamIdStrategy {
        self.id_strategy
    }

    /// Registers a stream, returning its id. Registering the same
    /// `(system, output, valid-time start)` again is idempotent and
    /// returns the existing id.
    pub fn get_or_create(&self, info: DataStreamInfo) -> Result<u64> {
        self.engine.transaction(|| {
            let lookup_key =
                system_key(info.system_id, &info.output_name, info.valid_time_begin)?;
            if let Some(bytes) = self.by_system.snapshot()?.get(&lookup_key) {
                return u64::decode(&bytes);
            }

            let stream_id = match self.id_strategy {
                StreamIdStrategy::Sequential => super::systems::next_sequential_id(&self.streams)?,
                StreamIdStrategy::UidHash => self.probe_hash_id(&info)?,
            };

            self.streams.put(&id_key(stream_id), &info.encode()?)?;
            self.by_system.put(&lookup_key, &stream_id.encode()?)?;
            debug!(
                stream_id,
                system_id = info.system_id,
                output = %info.output_name,
                "registered data stream"
            );
            Ok(stream_id)
        })
    }

    /// 48-bit deterministic id over `(system id, output name, valid time
    /// millis)`, probing upward past occupied slots.
    fn probe_hash_id(&self, info: &DataStreamInfo) -> Result<u64> {
        let mut input = Vec::with_capacity(info.output_name.len() + 16);
        keycode::encode_u64_into(&mut input, info.system_id);
        input.extend_from_slice(info.output_name.as_bytes());
        input.extend_from_slice(&info.valid_time_begin.timestamp_millis().to_be_bytes());

        let mut id = (xxh3_128(&input) as u64) & UID_HASH_MASK;
        if id == 0 {
            id = 1;
        }
        let streams = self.streams.snapshot()?;
        while streams.contains_key(&id_key(id)) {
            id += 1;
        }
        Ok(id)
    }

    pub fn get(&self, stream_id: u64) -> Result<Option<DataStreamInfo>> {
        match self.streams.get(&id_key(stream_id))? {
            Some(bytes) => Ok(Some(DataStreamInfo::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolves `(system, output, valid-time start)` to a stream id.
    pub fn lookup(
        &self,
        system_id: u64,
        output_name: &str,
        valid_time_begin: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let key = system_key(system_id, output_name, valid_time_begin)?;
        match self.by_system.get(&key)? {
            Some(bytes) => Ok(Some(u64::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Streams matching the filter, with their descriptions.
    pub fn list(&self, filter: &StreamFilter) -> Result<Vec<(u64, DataStreamInfo)>> {
        if let Some(ids) = &filter.internal_ids {
            let mut streams = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(info) = self.get(*id)? {
                    if filter.matches(&info) {
                        streams.push((*id, info));
                    }
                }
            }
            return Ok(streams);
        }

        let mut streams = Vec::new();
        for (key, value) in self.streams.snapshot()?.iter() {
            let info = DataStreamInfo::decode(&value)?;
            if filter.matches(&info) {
                streams.push((keycode::decode_u64(&key)?, info));
            }
        }
        Ok(streams)
    }

    /// Stream ids matching the filter, for the query planner.
    pub fn select_ids(&self, filter: &StreamFilter) -> Result<Vec<u64>> {
        Ok(self.list(filter)?.into_iter().map(|(id, _)| id).collect())
    }

    /// Stream ids of one system, for the system-removal cascade.
    pub(crate) fn ids_by_system(&self, system_id: u64) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for (key, value) in self.streams.snapshot()?.iter() {
            let info = DataStreamInfo::decode(&value)?;
            if info.system_id == system_id {
                ids.push(keycode::decode_u64(&key)?);
            }
        }
        Ok(ids)
    }

    /// Closes the stream's valid time: it accepts no further writes but
    /// remains fully queryable.
    pub fn retire(&self, stream_id: u64, valid_time_end: DateTime<Utc>) -> Result<()> {
        self.engine.transaction(|| {
            let mut info = self
                .get(stream_id)?
                .ok_or(Error::UnknownStream(stream_id))?;
            info.valid_time_end = Some(valid_time_end);
            self.streams.put(&id_key(stream_id), &info.encode()?)?;
            info!(stream_id, "retired data stream");
            Ok(())
        })
    }

    /// Removes the stream and everything under it: all its series and all
    /// observations in those series.
    pub fn remove(&self, stream_id: u64) -> Result<Option<DataStreamInfo>> {
        self.engine.transaction(|| {
            let old = match self.streams.remove(&id_key(stream_id))? {
                Some(bytes) => DataStreamInfo::decode(&bytes)?,
                None => return Ok(None),
            };
            let lookup_key =
                system_key(old.system_id, &old.output_name, old.valid_time_begin)?;
            self.by_system.remove(&lookup_key)?;

            let obs = self
                .obs_link
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| Error::Corruption("stream registry has no observation store link".to_string()))?;
            obs.remove_all_obs_and_series(stream_id)?;

            info!(stream_id, "removed data stream and cascaded observations");
            Ok(Some(old))
        })
    }

    pub fn len(&self) -> Result<u64> {
        self.streams.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.streams.is_empty()
    }
}

fn id_key(stream_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    keycode::encode_u64_into(&mut key, stream_id);
    key
}

/// Lookup key: `u64(system) . string(output) . instant(valid begin)`.
fn system_key(system_id: u64, output_name: &str, valid_time_begin: DateTime<Utc>) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(output_name.len() + 21);
    keycode::encode_u64_into(&mut key, system_id);
    keycode::encode_string_into(&mut key, output_name)?;
    keycode::encode_instant_into(&mut key, valid_time_begin);
    Ok(key)
}
