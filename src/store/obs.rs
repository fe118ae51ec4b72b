//! Observation store: the three correlated indexes and everything that
//! reads or writes them.
//!
//! - `obs_records`: primary map, `(series, phenomenon time)` to record
//! - `obs_series`: series lookup by `(stream, foi, result time)`
//! - `obs_series_foi`: inverted series lookup by foi
//!
//! The three maps are mutated as one unit under the engine's write gate;
//! any failure rolls the engine back to its version at entry. Queries plan
//! a set of per-series range scans over consistent snapshots and merge
//! them by phenomenon time.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use crate::encoding::{bincode, keycode, Key as _};
use crate::engine::{Engine, MapHandle, Tree};
use crate::error::{Error, Result};
use crate::model::{ObsId, Observation, TimeRange};
use crate::query::merge::{MergeIterator, ObsEntryIter};
use crate::query::{HistogramBinning, ObsFilter, StatsQuery, TemporalFilter};

use super::fois::FoiStore;
use super::keys::{RecordKey, SeriesKey};
use super::stats::{auto_bin_size, ObsStats};
use super::streams::DataStreamStore;

const RECORDS_MAP: &str = "obs_store:obs_records";
const SERIES_MAP: &str = "obs_store:obs_series";
const SERIES_FOI_MAP: &str = "obs_store:obs_series_foi";

/// Cap on the number of series one query may select.
const MAX_SELECTED_SERIES: usize = 10_000;

/// Cap on histogram buckets, so an absurd range/width pair fails instead
/// of allocating without bound.
const MAX_HISTOGRAM_BINS: usize = 1_000_000;

/// Time constraints extracted from a filter once per query.
struct QueryTimes {
    phenomenon: TimeRange,
    result: TimeRange,
    current_time_only: bool,
    latest_result_only: bool,
}

impl QueryTimes {
    fn new(filter: &ObsFilter, now: DateTime<Utc>) -> Self {
        let phenomenon = filter
            .phenomenon_time
            .map_or_else(TimeRange::all, |f| f.to_range(now));
        let result = filter
            .result_time
            .map_or_else(TimeRange::all, |f| f.to_range(now));
        Self {
            phenomenon,
            result,
            current_time_only: matches!(filter.phenomenon_time, Some(TemporalFilter::CurrentTime)),
            latest_result_only: matches!(filter.result_time, Some(TemporalFilter::LatestTime))
                || matches!(filter.phenomenon_time, Some(TemporalFilter::LatestTime)),
        }
    }
}

/// One selected series: its assigned id and grouping key.
#[derive(Debug, Clone, Copy)]
struct SeriesInfo {
    id: u64,
    key: SeriesKey,
}

/// Lazy observation entry stream. Dropping (or explicitly closing) the
/// iterator releases the underlying cursors and merge buffers.
pub struct ObsIter {
    inner: Box<dyn Iterator<Item = Result<(ObsId, Observation)>> + Send>,
}

impl ObsIter {
    pub(crate) fn new(inner: Box<dyn Iterator<Item = Result<(ObsId, Observation)>> + Send>) -> Self {
        Self { inner }
    }

    /// Releases the iterator's cursors. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Iterator for ObsIter {
    type Item = Result<(ObsId, Observation)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// The observation store.
pub struct ObsStore {
    engine: Engine,
    records: MapHandle,
    series_main: MapHandle,
    series_foi: MapHandle,
    streams: Arc<DataStreamStore>,
    foi_link: OnceLock<Weak<FoiStore>>,
    /// Next series id; unique and monotone, re-derived by a full scan of
    /// the series index at open.
    next_series_id: AtomicU64,
    max_selected_series: usize,
}

impl ObsStore {
    pub fn open(engine: &Engine, streams: Arc<DataStreamStore>) -> Result<Arc<Self>> {
        let records = engine.open_map(RECORDS_MAP)?;
        let series_main = engine.open_map(SERIES_MAP)?;
        let series_foi = engine.open_map(SERIES_FOI_MAP)?;

        let mut max_series_id = 0u64;
        for (_, value) in series_main.snapshot()?.iter() {
            max_series_id = max_series_id.max(bincode::deserialize::<u64>(&value)?);
        }

        Ok(Arc::new(Self {
            engine: engine.clone(),
            records,
            series_main,
            series_foi,
            streams,
            foi_link: OnceLock::new(),
            next_series_id: AtomicU64::new(max_series_id + 1),
            max_selected_series: MAX_SELECTED_SERIES,
        }))
    }

    pub(crate) fn link_fois(&self, fois: Weak<FoiStore>) {
        let _ = self.foi_link.set(fois);
    }

    pub fn data_streams(&self) -> &Arc<DataStreamStore> {
        &self.streams
    }

    // ---- write path ----

    /// Stores an observation and returns its opaque identifier.
    pub fn add(&self, obs: &Observation) -> Result<ObsId> {
        self.engine.transaction(|| {
            let stream = self
                .streams
                .get(obs.stream_id)?
                .ok_or(Error::UnknownStream(obs.stream_id))?;
            if stream.is_retired() {
                return crate::errinput!("data stream {} is retired", obs.stream_id);
            }

            let series_key = SeriesKey::for_observation(obs);
            let series_id = self.get_or_create_series(&series_key)?;

            let record_key = RecordKey::new(series_id, obs.phenomenon_time);
            self.records.put(&record_key.encode(), &bincode::serialize(obs)?)?;
            Ok(record_key.to_obs_id())
        })
    }

    /// Resolves the series for a key, lazily creating it (in both series
    /// indexes) on first use.
    fn get_or_create_series(&self, key: &SeriesKey) -> Result<u64> {
        let main_key = key.encode_by_stream();
        if let Some(bytes) = self.series_main.snapshot()?.get(&main_key) {
            return bincode::deserialize::<u64>(&bytes);
        }
        let series_id = self.next_series_id.fetch_add(1, Ordering::SeqCst);
        self.series_main.put(&main_key, &bincode::serialize(&series_id)?)?;
        self.series_foi.put(&key.encode_by_foi(), &[])?;
        debug!(series_id, stream_id = key.stream_id, foi_id = key.foi_id, "created series");
        Ok(series_id)
    }

    /// Replaces an existing observation. Returns the previous record, or
    /// None (without mutating) when the id is malformed or unknown.
    pub fn put(&self, id: &ObsId, obs: &Observation) -> Result<Option<Observation>> {
        let record_key = match RecordKey::from_obs_id(id) {
            Some(key) => key,
            None => return Ok(None),
        };
        if obs.phenomenon_time != record_key.phenomenon_time {
            return crate::errinput!(
                "replacement observation must keep the phenomenon time of its key"
            );
        }
        self.engine.transaction(|| {
            let encoded = record_key.encode();
            if self.records.snapshot()?.get(&encoded).is_none() {
                return Ok(None);
            }
            let old = self.records.put(&encoded, &bincode::serialize(obs)?)?;
            match old {
                Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    /// Removes an observation by id. The series entry always stays; empty
    /// series are collected only by the explicit compaction pass, because
    /// sensors routinely resurrect them.
    pub fn remove(&self, id: &ObsId) -> Result<Option<Observation>> {
        let record_key = match RecordKey::from_obs_id(id) {
            Some(key) => key,
            None => return Ok(None),
        };
        self.engine.transaction(|| {
            match self.records.remove(&record_key.encode())? {
                Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    /// Removes every observation and series. The stream registry is
    /// untouched.
    pub fn clear(&self) -> Result<()> {
        self.engine.transaction(|| {
            self.records.clear()?;
            self.series_foi.clear()?;
            self.series_main.clear()?;
            Ok(())
        })?;
        self.next_series_id.store(1, Ordering::SeqCst);
        info!("cleared observation store");
        Ok(())
    }

    /// Removes all series of a stream and every observation under them.
    /// Runs inside the caller's transaction.
    pub(crate) fn remove_all_obs_and_series(&self, stream_id: u64) -> Result<()> {
        let main = self.series_main.snapshot()?;
        let first = SeriesKey::new(stream_id, 0, keycode::min_instant()).encode_by_stream();
        let last =
            SeriesKey::new(stream_id, u64::MAX, keycode::max_instant()).encode_by_stream();

        for (main_key, value) in main.range(Bound::Included(first), Bound::Included(last)) {
            let series_key = SeriesKey::decode_by_stream(&main_key)?;
            let series_id: u64 = bincode::deserialize(&value)?;

            let records = self.records.snapshot()?;
            let start = RecordKey::new(series_id, keycode::min_instant()).encode();
            let end = RecordKey::new(series_id, keycode::max_instant()).encode();
            for (record_key, _) in records.range(Bound::Included(start), Bound::Included(end)) {
                self.records.remove(&record_key)?;
            }

            self.series_main.remove(&main_key)?;
            self.series_foi.remove(&series_key.encode_by_foi())?;
        }
        Ok(())
    }

    /// Explicit garbage collection of series with no remaining records.
    /// Returns the number of series removed.
    pub fn compact_series(&self) -> Result<u64> {
        let removed = self.engine.transaction(|| {
            let main = self.series_main.snapshot()?;
            let records = self.records.snapshot()?;
            let mut removed = 0u64;
            for (main_key, value) in main.iter() {
                let series_id: u64 = bincode::deserialize(&value)?;
                if !series_has_records(&records, series_id)? {
                    let series_key = SeriesKey::decode_by_stream(&main_key)?;
                    self.series_main.remove(&main_key)?;
                    self.series_foi.remove(&series_key.encode_by_foi())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })?;
        info!(removed, "compacted empty series");
        Ok(removed)
    }

    // ---- point reads ----

    /// Fetches an observation by opaque id. Malformed ids read as absent.
    pub fn get(&self, id: &ObsId) -> Result<Option<Observation>> {
        let record_key = match RecordKey::from_obs_id(id) {
            Some(key) => key,
            None => return Ok(None),
        };
        match self.records.get(&record_key.encode())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, id: &ObsId) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// Total number of stored observation records.
    pub fn num_records(&self) -> Result<u64> {
        self.records.len()
    }

    pub fn len(&self) -> Result<u64> {
        self.records.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.records.is_empty()
    }

    // ---- query planning ----

    /// Selects the series matching the filter. The driving index follows
    /// the smallest available restriction: streams, fois, their join, or
    /// a full series scan.
    fn select_series(&self, filter: &ObsFilter, times: &QueryTimes) -> Result<Vec<SeriesInfo>> {
        let main = self.series_main.snapshot()?;

        let series = match (&filter.streams, &filter.fois) {
            (None, None) => all_series(&main, &times.result)?,
            (Some(stream_filter), None) => {
                let mut series = Vec::new();
                for stream_id in self.streams.select_ids(stream_filter)? {
                    series.extend(series_by_stream(
                        &main,
                        stream_id,
                        times.result,
                        times.latest_result_only,
                    )?);
                }
                series
            }
            (None, Some(foi_filter)) => {
                let foi_index = self.series_foi.snapshot()?;
                let mut series = Vec::new();
                for foi_id in self.resolve_fois(foi_filter)? {
                    series.extend(series_by_foi(
                        &foi_index,
                        &main,
                        foi_id,
                        times.result,
                        times.latest_result_only,
                        None,
                    )?);
                }
                series
            }
            (Some(stream_filter), Some(foi_filter)) => {
                let stream_ids = self.streams.select_ids(stream_filter)?;
                if stream_ids.len() >= 100 * self.max_selected_series {
                    return Err(Error::TooBroad(
                        "too many data streams selected, refine the filter".to_string(),
                    ));
                }
                if stream_ids.is_empty() {
                    return Ok(Vec::new());
                }
                let stream_set: HashSet<u64> = stream_ids.into_iter().collect();
                let foi_index = self.series_foi.snapshot()?;
                let mut series = Vec::new();
                for foi_id in self.resolve_fois(foi_filter)? {
                    series.extend(series_by_foi(
                        &foi_index,
                        &main,
                        foi_id,
                        times.result,
                        times.latest_result_only,
                        Some(&stream_set),
                    )?);
                }
                series
            }
        };

        if series.len() > self.max_selected_series {
            return Err(Error::TooBroad(format!(
                "query selects {} series, the limit is {}",
                series.len(),
                self.max_selected_series
            )));
        }
        Ok(series)
    }

    fn resolve_fois(&self, filter: &crate::query::FoiFilter) -> Result<Vec<u64>> {
        let fois = self
            .foi_link
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Corruption("observation store has no foi store link".to_string()))?;
        fois.select_ids(filter)
    }

    /// The per-series entry stream, per the series kind and time params.
    fn series_entries(
        &self,
        records: &Tree,
        series: SeriesInfo,
        times: &QueryTimes,
        now: DateTime<Utc>,
    ) -> ObsEntryIter {
        if series.key.has_implicit_result_time() {
            // Result time equals phenomenon time for every record
            if times.current_time_only {
                return floor_entry_iter(records, series.id, now);
            }
            if times.latest_result_only {
                return floor_entry_iter(records, series.id, keycode::max_instant());
            }
            let range = match times.result.intersection(&times.phenomenon) {
                Some(range) => range,
                None => return Box::new(std::iter::empty()),
            };
            range_entry_iter(records, series.id, range)
        } else {
            range_entry_iter(records, series.id, times.phenomenon)
        }
    }

    // ---- queries ----

    /// Selects `(id, observation)` entries, merged in phenomenon-time
    /// order with a deterministic tie-break.
    pub fn select_entries(&self, filter: &ObsFilter) -> Result<ObsIter> {
        let now = Utc::now();

        // Explicit ids short-circuit planning
        if let Some(ids) = &filter.internal_ids {
            let records = self.records.snapshot()?;
            let mut entries: Vec<Result<(ObsId, Observation)>> = Vec::with_capacity(ids.len());
            for id in ids {
                let record_key = match RecordKey::from_obs_id(id) {
                    Some(key) => key,
                    None => continue,
                };
                if let Some(bytes) = records.get(&record_key.encode()) {
                    entries.push(
                        bincode::deserialize::<Observation>(&bytes).map(|obs| (id.clone(), obs)),
                    );
                }
            }
            let post = filter.clone();
            let iter = entries
                .into_iter()
                .filter(move |r| r.as_ref().map_or(true, |(_, obs)| post.passes_post_filters(obs)));
            return Ok(ObsIter::new(apply_limit(Box::new(iter), filter.limit)));
        }

        let times = QueryTimes::new(filter, now);
        let series = self.select_series(filter, &times)?;
        let records = self.records.snapshot()?;

        let mut sources: Vec<ObsEntryIter> = Vec::with_capacity(series.len());
        for info in series {
            let entries = self.series_entries(&records, info, &times, now);
            let post = filter.clone();
            sources.push(Box::new(entries.filter(move |r| {
                r.as_ref().map_or(true, |(_, obs)| post.passes_post_filters(obs))
            })));
        }

        let merged = MergeIterator::new(sources);
        Ok(ObsIter::new(apply_limit(Box::new(merged), filter.limit)))
    }

    /// Selects only the opaque ids.
    pub fn select_keys(&self, filter: &ObsFilter) -> Result<impl Iterator<Item = Result<ObsId>> + Send> {
        Ok(self.select_entries(filter)?.map(|r| r.map(|(id, _)| id)))
    }

    /// Selects only the result payloads.
    pub fn select_results(
        &self,
        filter: &ObsFilter,
    ) -> Result<impl Iterator<Item = Result<crate::model::DataBlock>> + Send> {
        Ok(self.select_entries(filter)?.map(|r| r.map(|(_, obs)| obs.result)))
    }

    /// Distinct foi ids among selected series whose phenomenon-time range
    /// intersects the filter.
    pub fn select_observed_fois(&self, filter: &ObsFilter) -> Result<Vec<u64>> {
        let now = Utc::now();
        let times = QueryTimes::new(filter, now);
        let series = self.select_series(filter, &times)?;
        let records = self.records.snapshot()?;

        let mut seen = BTreeSet::new();
        let mut fois = Vec::new();
        for info in series {
            if let Some(range) = series_phenomenon_range(&records, info.id)? {
                if range.is_connected(&times.phenomenon) && seen.insert(info.key.foi_id) {
                    fois.push(info.key.foi_id);
                }
            }
        }
        Ok(fois)
    }

    /// Counts matching entries. With no post-decode filter the count is
    /// pure rank arithmetic on the primary index; otherwise it falls back
    /// to draining the key stream.
    pub fn count_matching_entries(&self, filter: &ObsFilter) -> Result<u64> {
        if filter.internal_ids.is_some() || filter.has_post_filter() {
            let mut count = 0u64;
            for key in self.select_keys(filter)? {
                key?;
                count += 1;
            }
            return Ok(count);
        }

        let now = Utc::now();
        let times = QueryTimes::new(filter, now);
        let series = self.select_series(filter, &times)?;
        let records = self.records.snapshot()?;

        let mut total = 0u64;
        for info in series {
            total += series_count(&records, info.id, &times.phenomenon)?;
        }
        Ok(total)
    }

    // ---- statistics ----

    /// One statistics row per selected series, or per `(stream, result
    /// time)` bucket when fois are aggregated.
    pub fn get_statistics(&self, query: &StatsQuery) -> Result<Vec<ObsStats>> {
        let now = Utc::now();
        let times = QueryTimes::new(&query.filter, now);
        let series = self.select_series(&query.filter, &times)?;
        let records = self.records.snapshot()?;

        if query.aggregate_fois && query.histogram.is_some() && times.phenomenon.is_unbounded() {
            // Aggregation sums bins element-wise, which is only defined
            // when every series uses the same histogram range.
            return crate::errinput!(
                "aggregating foi histograms requires a bounded phenomenon time filter"
            );
        }

        let mut rows: Vec<(SeriesKey, ObsStats)> = Vec::new();
        for info in series {
            let series_range = match series_phenomenon_range(&records, info.id)? {
                Some(range) => range,
                None => continue,
            };
            let stats_range = match times.phenomenon.intersection(&series_range) {
                Some(range) => range,
                None => continue,
            };
            let result_time_range = if info.key.has_implicit_result_time() {
                stats_range
            } else {
                TimeRange::singleton(info.key.result_time)
            };
            let total_obs_count = series_count(&records, info.id, &stats_range)?;

            let mut stats = ObsStats {
                stream_id: info.key.stream_id,
                foi_id: info.key.foi_id,
                phenomenon_time_range: stats_range,
                result_time_range,
                total_obs_count,
                obs_counts_by_time: None,
                histogram_bin_size: None,
            };

            if let Some(binning) = query.histogram {
                let histogram_range = if times.phenomenon.is_unbounded() {
                    series_range
                } else {
                    times.phenomenon
                };
                let bin_size = match binning {
                    HistogramBinning::Fixed(width) => width,
                    HistogramBinning::Auto => auto_bin_size(histogram_range.duration_seconds()),
                };
                stats.obs_counts_by_time =
                    Some(series_histogram(&records, info.id, &histogram_range, bin_size)?);
                stats.histogram_bin_size = Some(bin_size);
            }

            rows.push((info.key, stats));
        }

        if !query.aggregate_fois {
            return Ok(rows.into_iter().map(|(_, stats)| stats).collect());
        }

        // Sum per-foi rows into one bucket per (stream, stored result
        // time). Bin widths and ranges are identical within a bucket by
        // construction: a query carries exactly one binning.
        let mut buckets: BTreeMap<(u64, DateTime<Utc>), ObsStats> = BTreeMap::new();
        for (key, stats) in rows {
            match buckets.entry((key.stream_id, key.result_time)) {
                std::collections::btree_map::Entry::Vacant(entry) => {
                    let mut aggregated = stats;
                    aggregated.foi_id = 0;
                    entry.insert(aggregated);
                }
                std::collections::btree_map::Entry::Occupied(mut entry) => {
                    let bucket = entry.get_mut();
                    bucket.total_obs_count += stats.total_obs_count;
                    bucket.phenomenon_time_range = merge_ranges(
                        bucket.phenomenon_time_range,
                        stats.phenomenon_time_range,
                    );
                    bucket.result_time_range =
                        merge_ranges(bucket.result_time_range, stats.result_time_range);
                    if let (Some(acc), Some(counts)) =
                        (bucket.obs_counts_by_time.as_mut(), stats.obs_counts_by_time)
                    {
                        for (a, c) in acc.iter_mut().zip(counts) {
                            *a += c;
                        }
                    }
                }
            }
        }
        Ok(buckets.into_values().collect())
    }

    // ---- invariants ----

    /// Verifies that the two series indexes hold the same key set.
    /// Surfaced as corruption, never repaired.
    pub fn verify_index_coherence(&self) -> Result<()> {
        let main: BTreeSet<SeriesKey> = self
            .series_main
            .snapshot()?
            .iter()
            .map(|(key, _)| SeriesKey::decode_by_stream(&key))
            .collect::<Result<_>>()?;
        let by_foi: BTreeSet<SeriesKey> = self
            .series_foi
            .snapshot()?
            .iter()
            .map(|(key, _)| SeriesKey::decode_by_foi(&key))
            .collect::<Result<_>>()?;
        if main != by_foi {
            return Err(Error::Corruption(format!(
                "series indexes diverge: {} stream-major vs {} foi-major entries",
                main.len(),
                by_foi.len()
            )));
        }
        Ok(())
    }
}

fn merge_ranges(a: TimeRange, b: TimeRange) -> TimeRange {
    TimeRange::new(a.begin().min(b.begin()), a.end().max(b.end()))
}

fn apply_limit(
    iter: Box<dyn Iterator<Item = Result<(ObsId, Observation)>> + Send>,
    limit: Option<usize>,
) -> Box<dyn Iterator<Item = Result<(ObsId, Observation)>> + Send> {
    match limit {
        Some(n) => Box::new(iter.take(n)),
        None => iter,
    }
}

/// All series whose result time falls in the range. Sensor series carry
/// the -infinity sentinel, which only the unbounded range contains.
fn all_series(main: &Tree, result_range: &TimeRange) -> Result<Vec<SeriesInfo>> {
    let first = SeriesKey::new(0, 0, result_range.begin()).encode_by_stream();
    let last = SeriesKey::new(u64::MAX, u64::MAX, result_range.end()).encode_by_stream();

    let mut series = Vec::new();
    for (key, value) in main.range(Bound::Included(first), Bound::Included(last)) {
        let series_key = SeriesKey::decode_by_stream(&key)?;
        if result_range.contains(series_key.result_time) {
            series.push(SeriesInfo { id: bincode::deserialize(&value)?, key: series_key });
        }
    }
    Ok(series)
}

/// Series of one stream whose result time matches. Sensor series always
/// match; a latest-result request narrows to the stream's last series key.
fn series_by_stream(
    main: &Tree,
    stream_id: u64,
    result_range: TimeRange,
    latest_result_only: bool,
) -> Result<Vec<SeriesInfo>> {
    let mut result_range = result_range;
    if latest_result_only {
        let probe = SeriesKey::new(stream_id, u64::MAX, keycode::max_instant()).encode_by_stream();
        match main.floor(&probe) {
            Some((key, _)) => {
                let last_key = SeriesKey::decode_by_stream(&key)?;
                if last_key.stream_id != stream_id {
                    return Ok(Vec::new());
                }
                result_range = TimeRange::singleton(last_key.result_time);
            }
            None => return Ok(Vec::new()),
        }
    }

    let first = SeriesKey::new(stream_id, 0, keycode::min_instant()).encode_by_stream();
    let last = SeriesKey::new(stream_id, u64::MAX, result_range.end()).encode_by_stream();

    let mut series = Vec::new();
    for (key, value) in main.range(Bound::Included(first), Bound::Included(last)) {
        let series_key = SeriesKey::decode_by_stream(&key)?;
        if series_key.has_implicit_result_time() || result_range.contains(series_key.result_time) {
            series.push(SeriesInfo { id: bincode::deserialize(&value)?, key: series_key });
        }
    }
    Ok(series)
}

/// Series observing one foi, resolved through the inverted index. A
/// foi-index entry without a main-index entry is surfaced as corruption.
fn series_by_foi(
    foi_index: &Tree,
    main: &Tree,
    foi_id: u64,
    result_range: TimeRange,
    latest_result_only: bool,
    stream_set: Option<&HashSet<u64>>,
) -> Result<Vec<SeriesInfo>> {
    let mut result_range = result_range;
    if latest_result_only {
        let probe = SeriesKey::new(u64::MAX, foi_id, keycode::max_instant()).encode_by_foi();
        match foi_index.floor(&probe) {
            Some((key, _)) => {
                let last_key = SeriesKey::decode_by_foi(&key)?;
                if last_key.foi_id != foi_id {
                    return Ok(Vec::new());
                }
                result_range = TimeRange::singleton(last_key.result_time);
            }
            None => return Ok(Vec::new()),
        }
    }

    let first = SeriesKey::new(0, foi_id, keycode::min_instant()).encode_by_foi();
    let last = SeriesKey::new(u64::MAX, foi_id, result_range.end()).encode_by_foi();

    let mut series = Vec::new();
    for (key, _) in foi_index.range(Bound::Included(first), Bound::Included(last)) {
        let series_key = SeriesKey::decode_by_foi(&key)?;
        if !series_key.has_implicit_result_time() && !result_range.contains(series_key.result_time)
        {
            continue;
        }
        if let Some(streams) = stream_set {
            if !streams.contains(&series_key.stream_id) {
                continue;
            }
        }
        let value = main.get(&series_key.encode_by_stream()).ok_or_else(|| {
            Error::Corruption(format!(
                "foi index entry {} has no main series entry (stream {}, foi {})",
                crate::encoding::format::Raw::bytes(&key),
                series_key.stream_id,
                series_key.foi_id
            ))
        })?;
        series.push(SeriesInfo { id: bincode::deserialize(&value)?, key: series_key });
    }
    Ok(series)
}

/// Single-entry stream: the record at or right before the probe instant.
fn floor_entry_iter(records: &Tree, series_id: u64, probe: DateTime<Utc>) -> ObsEntryIter {
    let probe_key = RecordKey::new(series_id, probe).encode();
    let entry = records.floor(&probe_key).and_then(|(key, value)| {
        match RecordKey::decode(&key) {
            Ok(record_key) if record_key.series_id == series_id => {
                Some(decode_entry(key, &value))
            }
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    });
    Box::new(entry.into_iter())
}

/// Ordered stream of a series' records within a closed phenomenon range.
fn range_entry_iter(records: &Tree, series_id: u64, range: TimeRange) -> ObsEntryIter {
    let start = RecordKey::new(series_id, range.begin()).encode();
    let end = RecordKey::new(series_id, range.end()).encode();
    Box::new(
        records
            .range(Bound::Included(start), Bound::Included(end))
            .map(|(key, value)| decode_entry(key, &value)),
    )
}

fn decode_entry(key: Vec<u8>, value: &[u8]) -> Result<(ObsId, Observation)> {
    let obs: Observation = bincode::deserialize(value)?;
    Ok((ObsId::from_bytes(key), obs))
}

/// Phenomenon-time extent of one series, from its first and last record.
fn series_phenomenon_range(records: &Tree, series_id: u64) -> Result<Option<TimeRange>> {
    let first = records.ceiling(&RecordKey::new(series_id, keycode::min_instant()).encode());
    let last = records.floor(&RecordKey::new(series_id, keycode::max_instant()).encode());
    match (first, last) {
        (Some((first_key, _)), Some((last_key, _))) => {
            let first = RecordKey::decode(&first_key)?;
            let last = RecordKey::decode(&last_key)?;
            if first.series_id != series_id || last.series_id != series_id {
                return Ok(None);
            }
            Ok(Some(TimeRange::new(first.phenomenon_time, last.phenomenon_time)))
        }
        _ => Ok(None),
    }
}

/// Whether a series has at least one record, by a single ceiling probe.
fn series_has_records(records: &Tree, series_id: u64) -> Result<bool> {
    let probe = RecordKey::new(series_id, keycode::min_instant()).encode();
    match records.ceiling(&probe) {
        Some((key, _)) => Ok(RecordKey::decode(&key)?.series_id == series_id),
        None => Ok(false),
    }
}

/// Records of a series inside a closed phenomenon range, counted by rank
/// arithmetic: two key probes and two ranks, never a scan.
fn series_count(records: &Tree, series_id: u64, range: &TimeRange) -> Result<u64> {
    let first = records.ceiling(&RecordKey::new(series_id, range.begin()).encode());
    let last = records.floor(&RecordKey::new(series_id, range.end()).encode());
    match (first, last) {
        (Some((first_key, _)), Some((last_key, _))) => {
            let first = RecordKey::decode(&first_key)?;
            let last = RecordKey::decode(&last_key)?;
            if first.series_id != series_id || last.series_id != series_id || last_key < first_key {
                return Ok(0);
            }
            Ok(records.rank(&last_key) - records.rank(&first_key) + 1)
        }
        _ => Ok(0),
    }
}

/// Fixed-width histogram over a series. Each bin costs two key probes and
/// two ranks; a bin with no key inside it stays zero.
fn series_histogram(
    records: &Tree,
    series_id: u64,
    range: &TimeRange,
    bin_size: Duration,
) -> Result<Vec<u64>> {
    let start = range.begin().timestamp();
    let end = range.end().timestamp();
    let dt = bin_size.as_secs() as i64;
    if dt <= 0 {
        return crate::errinput!("histogram bin width must be at least one second");
    }

    let span = (end - start).max(0);
    let num_bins = (span as f64 / dt as f64).ceil() as usize;
    if num_bins > MAX_HISTOGRAM_BINS {
        return Err(Error::TooBroad(format!(
            "histogram would need {num_bins} bins, narrow the range or widen the bins"
        )));
    }

    let mut counts = vec![0u64; num_bins];
    let mut t = start;
    for count in counts.iter_mut() {
        let bin_begin = instant_at(t)?;
        let k1 = records.ceiling(&RecordKey::new(series_id, bin_begin).encode());
        t += dt;
        let bin_end = instant_at(t)?;
        let k2 = records.floor(&RecordKey::new(series_id, bin_end).encode());

        if let (Some((first_key, _)), Some((last_key, _))) = (k1, k2) {
            let first = RecordKey::decode(&first_key)?;
            let last = RecordKey::decode(&last_key)?;
            if first.series_id == series_id && last.series_id == series_id {
                let idx1 = records.rank(&first_key);
                let idx2 = records.rank(&last_key);
                // No rank gap means no key landed inside this bin
                if idx2 >= idx1 {
                    let mut n = idx2 - idx1;
                    // Count the end key unless it sits exactly on the bin
                    // boundary, where the next bin owns it
                    if last.phenomenon_time != bin_end {
                        n += 1;
                    }
                    *count = n;
                }
            }
        }
    }
    Ok(counts)
}

fn instant_at(epoch_seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(epoch_seconds, 0)
        .single()
        .ok_or_else(|| Error::InvalidData(format!("instant out of range: {epoch_seconds}s")))
}
