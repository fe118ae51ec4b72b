//! Read-only federation over several observation databases.
//!
//! When more than one store is mounted under one logical database, the
//! federated store exposes the same read API: a filter is narrowed per
//! member using a dispatch map pre-resolved from the member registries,
//! executed locally on each member, and the member streams are merged by
//! the same phenomenon-time k-way merge used inside a store. Writes go to
//! the single writable member, when one is designated.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ObsId, Observation};
use crate::query::merge::{MergeIterator, ObsEntryIter};
use crate::query::{ObsFilter, StatsQuery, StreamFilter};
use crate::store::{ObsDatabase, ObsIter, ObsStats};

/// An ordered set of member databases behind one read API.
pub struct FederatedObsStore {
    members: Vec<Arc<ObsDatabase>>,
    /// Index of the member accepting writes, if any.
    writable: Option<usize>,
    /// Stream id to owning member, resolved at mount time.
    stream_dispatch: HashMap<u64, usize>,
    /// Foi id to owning member, resolved at mount time.
    foi_dispatch: HashMap<u64, usize>,
}

impl FederatedObsStore {
    /// Mounts the members and resolves the dispatch maps from their
    /// registries. Ids are expected to be disjoint across members (the
    /// deterministic id strategy, or disjoint `database_id` planning);
    /// on a clash the first member wins.
    pub fn mount(members: Vec<Arc<ObsDatabase>>, writable: Option<usize>) -> Result<Self> {
        if let Some(w) = writable {
            if w >= members.len() {
                return crate::errinput!("writable member index {w} out of range");
            }
        }
        let mut store = Self {
            members,
            writable,
            stream_dispatch: HashMap::new(),
            foi_dispatch: HashMap::new(),
        };
        store.refresh_dispatch()?;
        Ok(store)
    }

    /// Rebuilds the dispatch maps from the member registries. Call after
    /// registering new streams or fois on the writable member.
    pub fn refresh_dispatch(&mut self) -> Result<()> {
        self.stream_dispatch.clear();
        self.foi_dispatch.clear();
        for (index, member) in self.members.iter().enumerate() {
            for (stream_id, _) in member.data_streams().list(&StreamFilter::new())? {
                self.stream_dispatch.entry(stream_id).or_insert(index);
            }
            for (foi_id, _) in member.foi_store().list()? {
                self.foi_dispatch.entry(foi_id).or_insert(index);
            }
        }
        debug!(
            streams = self.stream_dispatch.len(),
            fois = self.foi_dispatch.len(),
            members = self.members.len(),
            "resolved federation dispatch"
        );
        Ok(())
    }

    pub fn members(&self) -> &[Arc<ObsDatabase>] {
        &self.members
    }

    /// Narrows a filter to the ids a member owns. None means the member
    /// cannot contribute and is skipped entirely.
    fn narrow(&self, filter: &ObsFilter, member: usize) -> Option<ObsFilter> {
        let mut narrowed = filter.clone();

        if let Some(streams) = &filter.streams {
            if let Some(ids) = &streams.internal_ids {
                let local: Vec<u64> = ids
                    .iter()
                    .copied()
                    .filter(|id| self.stream_dispatch.get(id) == Some(&member))
                    .collect();
                if local.is_empty() {
                    return None;
                }
                let mut local_filter = streams.clone();
                local_filter.internal_ids = Some(local);
                narrowed.streams = Some(local_filter);
            }
        }

        if let Some(fois) = &filter.fois {
            if let Some(ids) = &fois.internal_ids {
                let local: Vec<u64> = ids
                    .iter()
                    .copied()
                    .filter(|id| self.foi_dispatch.get(id) == Some(&member))
                    .collect();
                if local.is_empty() {
                    return None;
                }
                let mut local_filter = fois.clone();
                local_filter.internal_ids = Some(local);
                narrowed.fois = Some(local_filter);
            }
        }

        Some(narrowed)
    }

    /// Selects entries across all members, merged by phenomenon time.
    /// The limit applies to the merged stream, not per member.
    pub fn select_entries(&self, filter: &ObsFilter) -> Result<ObsIter> {
        let mut sources: Vec<ObsEntryIter> = Vec::with_capacity(self.members.len());
        for (index, member) in self.members.iter().enumerate() {
            let narrowed = match self.narrow(filter, index) {
                Some(mut narrowed) => {
                    // The member must not truncate before the global merge
                    narrowed.limit = None;
                    narrowed
                }
                None => continue,
            };
            sources.push(Box::new(member.observation_store().select_entries(&narrowed)?));
        }
        let merged = MergeIterator::new(sources);
        let inner: Box<dyn Iterator<Item = Result<(ObsId, Observation)>> + Send> =
            match filter.limit {
                Some(n) => Box::new(merged.take(n)),
                None => Box::new(merged),
            };
        Ok(ObsIter::new(inner))
    }

    /// Fetches by opaque id, trying members in mount order.
    pub fn get(&self, id: &ObsId) -> Result<Option<Observation>> {
        for member in &self.members {
            if let Some(obs) = member.observation_store().get(id)? {
                return Ok(Some(obs));
            }
        }
        Ok(None)
    }

    pub fn count_matching_entries(&self, filter: &ObsFilter) -> Result<u64> {
        let mut total = 0u64;
        for (index, member) in self.members.iter().enumerate() {
            if let Some(narrowed) = self.narrow(filter, index) {
                total += member.observation_store().count_matching_entries(&narrowed)?;
            }
        }
        Ok(total)
    }

    pub fn get_statistics(&self, query: &StatsQuery) -> Result<Vec<ObsStats>> {
        let mut stats = Vec::new();
        for (index, member) in self.members.iter().enumerate() {
            if let Some(narrowed) = self.narrow(&query.filter, index) {
                let mut member_query = query.clone();
                member_query.filter = narrowed;
                stats.extend(member.observation_store().get_statistics(&member_query)?);
            }
        }
        Ok(stats)
    }

    pub fn select_observed_fois(&self, filter: &ObsFilter) -> Result<Vec<u64>> {
        let mut seen = std::collections::BTreeSet::new();
        let mut fois = Vec::new();
        for (index, member) in self.members.iter().enumerate() {
            if let Some(narrowed) = self.narrow(filter, index) {
                for foi_id in member.observation_store().select_observed_fois(&narrowed)? {
                    if seen.insert(foi_id) {
                        fois.push(foi_id);
                    }
                }
            }
        }
        Ok(fois)
    }

    pub fn num_records(&self) -> Result<u64> {
        let mut total = 0u64;
        for member in &self.members {
            total += member.observation_store().num_records()?;
        }
        Ok(total)
    }

    /// Routes a write to the writable member.
    pub fn add(&self, obs: &Observation) -> Result<ObsId> {
        let writable = self.writable.ok_or(Error::ReadOnly)?;
        self.members[writable].observation_store().add(obs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::model::{DataBlock, DataComponent, DataStreamInfo, SystemInfo};
    use crate::query::TemporalFilter;
    use crate::tmpfs::TempDir;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("instant")
    }

    /// One member holding a single stream with `count` ramp observations.
    fn member(dir: &TempDir, name: &str, count: i64) -> (Arc<ObsDatabase>, u64) {
        let db = ObsDatabase::open(DbConfig::new(dir.path().join(name)))
            .expect("open member");
        let system_id = db
            .system_store()
            .add(SystemInfo::new(&format!("urn:s:{name}"), name, t(0)).with_output("temp"))
            .expect("system");
        let stream_id = db
            .data_streams()
            .get_or_create(DataStreamInfo::new(
                system_id,
                "temp",
                DataComponent::quantity("temp", "Cel"),
                t(0),
            ))
            .expect("stream");
        for i in 0..count {
            db.observation_store()
                .add(&Observation::new(stream_id, t(i * 2), DataBlock::Double(i as f64)))
                .expect("add");
        }
        db.commit().expect("commit");
        (Arc::new(db), stream_id)
    }

    #[test]
    fn test_merged_reads_across_members() {
        let dir = TempDir::new().expect("temp dir");
        let (a, _) = member(&dir, "a", 10);
        let (b, _) = member(&dir, "b", 10);

        let federated = FederatedObsStore::mount(vec![a, b], None).expect("mount");
        assert_eq!(federated.num_records().expect("num records"), 20);

        let times: Vec<i64> = federated
            .select_entries(&ObsFilter::new())
            .expect("select")
            .map(|r| r.expect("entry").1.phenomenon_time.timestamp())
            .collect();
        assert_eq!(times.len(), 20);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(federated.count_matching_entries(&ObsFilter::new()).expect("count"), 20);
    }

    #[test]
    fn test_filter_narrowing_by_stream_id() {
        let dir = TempDir::new().expect("temp dir");
        // Sequential ids clash across members; the dispatch map still
        // routes each id to the member that owns it first
        let (a, stream_a) = member(&dir, "a", 5);
        let (b, _) = member(&dir, "b", 7);

        let federated = FederatedObsStore::mount(vec![a.clone(), b], None).expect("mount");
        let filter = ObsFilter::new().with_stream_ids([stream_a]);
        let count = federated.count_matching_entries(&filter).expect("count");
        assert_eq!(
            count,
            a.observation_store().count_matching_entries(&filter).expect("count")
        );
    }

    #[test]
    fn test_writes_require_writable_member() {
        let dir = TempDir::new().expect("temp dir");
        let (a, stream_a) = member(&dir, "a", 1);
        let (b, _) = member(&dir, "b", 1);

        let obs = Observation::new(stream_a, t(100), DataBlock::Double(1.0));

        let read_only =
            FederatedObsStore::mount(vec![a.clone(), b.clone()], None).expect("mount");
        assert!(matches!(read_only.add(&obs), Err(Error::ReadOnly)));

        let writable = FederatedObsStore::mount(vec![a, b], Some(0)).expect("mount");
        let id = writable.add(&obs).expect("add");
        writable.members()[0].commit().expect("commit");
        assert!(writable.get(&id).expect("get").is_some());
    }

    #[test]
    fn test_statistics_fan_out() {
        let dir = TempDir::new().expect("temp dir");
        let (a, _) = member(&dir, "a", 10);
        let (b, _) = member(&dir, "b", 10);

        let federated = FederatedObsStore::mount(vec![a, b], None).expect("mount");
        let query = StatsQuery::new(
            ObsFilter::new().with_phenomenon_time(TemporalFilter::Range(t(0), t(100))),
        );
        let stats = federated.get_statistics(&query).expect("stats");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.iter().map(|s| s.total_obs_count).sum::<u64>(), 20);
    }
}
