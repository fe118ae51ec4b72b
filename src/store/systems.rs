//! Registry of observing systems ("proc_store").

use tracing::debug;

use crate::encoding::{bincode, keycode};
use crate::engine::{Engine, MapHandle};
use crate::error::Result;
use crate::model::SystemInfo;

const SYSTEMS_MAP: &str = "proc_store:systems";
const SYSTEMS_BY_UID_MAP: &str = "proc_store:systems_by_uid";

/// System descriptions keyed by internal id, with a unique-string-id
/// lookup index. Ids are sequential.
pub struct SystemStore {
    engine: Engine,
    systems: MapHandle,
    by_uid: MapHandle,
}

impl SystemStore {
    pub fn open(engine: &Engine) -> Result<Self> {
        Ok(Self {
            engine: engine.clone(),
            systems: engine.open_map(SYSTEMS_MAP)?,
            by_uid: engine.open_map(SYSTEMS_BY_UID_MAP)?,
        })
    }

    /// Registers a system, or updates the stored description when the uid
    /// is already known. Returns the internal id.
    pub fn add(&self, info: SystemInfo) -> Result<u64> {
        self.engine.transaction(|| {
            let by_uid = self.by_uid.snapshot()?;
            let id = match by_uid.get(info.uid.as_bytes()) {
                Some(bytes) => bincode::deserialize::<u64>(&bytes)?,
                None => {
                    let id = next_sequential_id(&self.systems)?;
                    self.by_uid.put(info.uid.as_bytes(), &bincode::serialize(&id)?)?;
                    debug!(id, uid = %info.uid, "registered system");
                    id
                }
            };
            let mut key = Vec::with_capacity(8);
            keycode::encode_u64_into(&mut key, id);
            self.systems.put(&key, &bincode::serialize(&info)?)?;
            Ok(id)
        })
    }

    pub fn get(&self, id: u64) -> Result<Option<SystemInfo>> {
        let mut key = Vec::with_capacity(8);
        keycode::encode_u64_into(&mut key, id);
        match self.systems.get(&key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_uid(&self, uid: &str) -> Result<Option<(u64, SystemInfo)>> {
        let id = match self.by_uid.get(uid.as_bytes())? {
            Some(bytes) => bincode::deserialize::<u64>(&bytes)?,
            None => return Ok(None),
        };
        Ok(self.get(id)?.map(|info| (id, info)))
    }

    pub fn list(&self) -> Result<Vec<(u64, SystemInfo)>> {
        let mut systems = Vec::new();
        for (key, value) in self.systems.snapshot()?.iter() {
            systems.push((keycode::decode_u64(&key)?, bincode::deserialize(&value)?));
        }
        Ok(systems)
    }

    /// Removes the description and uid index entry. Cascading removal of
    /// the system's data streams is orchestrated by the database.
    pub fn remove(&self, id: u64) -> Result<Option<SystemInfo>> {
        self.engine.transaction(|| {
            let mut key = Vec::with_capacity(8);
            keycode::encode_u64_into(&mut key, id);
            let old = match self.systems.remove(&key)? {
                Some(bytes) => bincode::deserialize::<SystemInfo>(&bytes)?,
                None => return Ok(None),
            };
            self.by_uid.remove(old.uid.as_bytes())?;
            Ok(Some(old))
        })
    }

    pub fn len(&self) -> Result<u64> {
        self.systems.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.systems.is_empty()
    }
}

/// Next id from the tail of an id-keyed map: last key + 1, starting at 1.
pub(crate) fn next_sequential_id(map: &MapHandle) -> Result<u64> {
    Ok(match map.snapshot()?.last() {
        Some((key, _)) => keycode::decode_u64(&key)? + 1,
        None => 1,
    })
}
