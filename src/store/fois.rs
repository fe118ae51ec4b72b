//! Registry of features of interest ("foi_store").

use tracing::debug;

use crate::encoding::{bincode, keycode};
use crate::engine::{Engine, MapHandle};
use crate::error::Result;
use crate::model::FoiInfo;
use crate::query::FoiFilter;

const FOIS_MAP: &str = "foi_store:fois";
const FOIS_BY_UID_MAP: &str = "foi_store:fois_by_uid";

/// Feature descriptions keyed by internal id, with a unique-string-id
/// lookup index. Ids are sequential. Geometry is stored opaquely; spatial
/// lookup beyond identifier selection belongs to other layers.
pub struct FoiStore {
    engine: Engine,
    fois: MapHandle,
    by_uid: MapHandle,
}

impl FoiStore {
    pub fn open(engine: &Engine) -> Result<Self> {
        Ok(Self {
            engine: engine.clone(),
            fois: engine.open_map(FOIS_MAP)?,
            by_uid: engine.open_map(FOIS_BY_UID_MAP)?,
        })
    }

    /// Registers a feature, or updates the stored description when the
    /// uid is already known. Returns the internal id.
    pub fn add(&self, info: FoiInfo) -> Result<u64> {
        self.engine.transaction(|| {
            let by_uid = self.by_uid.snapshot()?;
            let id = match by_uid.get(info.uid.as_bytes()) {
                Some(bytes) => bincode::deserialize::<u64>(&bytes)?,
                None => {
                    let id = super::systems::next_sequential_id(&self.fois)?;
                    self.by_uid.put(info.uid.as_bytes(), &bincode::serialize(&id)?)?;
                    debug!(id, uid = %info.uid, "registered foi");
                    id
                }
            };
            let mut key = Vec::with_capacity(8);
            keycode::encode_u64_into(&mut key, id);
            self.fois.put(&key, &bincode::serialize(&info)?)?;
            Ok(id)
        })
    }

    pub fn get(&self, id: u64) -> Result<Option<FoiInfo>> {
        let mut key = Vec::with_capacity(8);
        keycode::encode_u64_into(&mut key, id);
        match self.fois.get(&key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_uid(&self, uid: &str) -> Result<Option<(u64, FoiInfo)>> {
        let id = match self.by_uid.get(uid.as_bytes())? {
            Some(bytes) => bincode::deserialize::<u64>(&bytes)?,
            None => return Ok(None),
        };
        Ok(self.get(id)?.map(|info| (id, info)))
    }

    pub fn list(&self) -> Result<Vec<(u64, FoiInfo)>> {
        let mut fois = Vec::new();
        for (key, value) in self.fois.snapshot()?.iter() {
            fois.push((keycode::decode_u64(&key)?, bincode::deserialize(&value)?));
        }
        Ok(fois)
    }

    /// Resolves a foi filter to internal ids, for the query planner.
    pub fn select_ids(&self, filter: &FoiFilter) -> Result<Vec<u64>> {
        if let Some(ids) = &filter.internal_ids {
            return Ok(ids.clone());
        }
        if let Some(uids) = &filter.uids {
            let mut ids = Vec::with_capacity(uids.len());
            for uid in uids {
                if let Some((id, _)) = self.get_by_uid(uid)? {
                    ids.push(id);
                }
            }
            return Ok(ids);
        }
        Ok(self.list()?.into_iter().map(|(id, _)| id).collect())
    }

    pub fn remove(&self, id: u64) -> Result<Option<FoiInfo>> {
        self.engine.transaction(|| {
            let mut key = Vec::with_capacity(8);
            keycode::encode_u64_into(&mut key, id);
            let old = match self.fois.remove(&key)? {
                Some(bytes) => bincode::deserialize::<FoiInfo>(&bytes)?,
                None => return Ok(None),
            };
            self.by_uid.remove(old.uid.as_bytes())?;
            Ok(Some(old))
        })
    }

    pub fn len(&self) -> Result<u64> {
        self.fois.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.fois.is_empty()
    }
}
