//! Declarative observation filters and statistics queries.

pub mod merge;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geo_types::{Point, Rect};

use crate::model::{ObsId, Observation, TimeRange};

/// Temporal constraint variants shared by phenomenon-time and result-time
/// filters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemporalFilter {
    /// No constraint.
    AllTimes,
    /// The single observation at or right before the wall clock.
    CurrentTime,
    /// The most recent observation (sensors) or latest run (models).
    LatestTime,
    /// Closed range `[begin, end]`.
    Range(DateTime<Utc>, DateTime<Utc>),
    /// Exactly the given instant.
    At(DateTime<Utc>),
}

impl TemporalFilter {
    /// The scan range this filter restricts to. `now` anchors the
    /// current-time variant; latest-time is narrowed later, by probing.
    pub fn to_range(&self, now: DateTime<Utc>) -> TimeRange {
        match self {
            TemporalFilter::AllTimes | TemporalFilter::LatestTime => TimeRange::all(),
            TemporalFilter::CurrentTime => TimeRange::singleton(now),
            TemporalFilter::Range(begin, end) => TimeRange::new(*begin, *end),
            TemporalFilter::At(t) => TimeRange::singleton(*t),
        }
    }
}

/// Predicate applied to decoded observations after index scans.
pub type ValuePredicate = Arc<dyn Fn(&Observation) -> bool + Send + Sync>;

/// Selects data streams from the registry.
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    pub internal_ids: Option<Vec<u64>>,
    pub system_ids: Option<Vec<u64>>,
    pub output_names: Option<Vec<String>>,
    pub valid_at: Option<DateTime<Utc>>,
}

impl StreamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_system_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.system_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_output_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.output_names = Some(names.into_iter().collect());
        self
    }

    pub fn with_valid_at(mut self, t: DateTime<Utc>) -> Self {
        self.valid_at = Some(t);
        self
    }

    /// Whether a registry entry passes the metadata criteria. Internal-id
    /// selection is applied separately, before entries are fetched.
    pub fn matches(&self, info: &crate::model::DataStreamInfo) -> bool {
        if let Some(system_ids) = &self.system_ids {
            if !system_ids.contains(&info.system_id) {
                return false;
            }
        }
        if let Some(names) = &self.output_names {
            if !names.iter().any(|n| n == &info.output_name) {
                return false;
            }
        }
        if let Some(t) = self.valid_at {
            if !info.valid_at(t) {
                return false;
            }
        }
        true
    }
}

/// Selects features of interest.
#[derive(Debug, Clone, Default)]
pub struct FoiFilter {
    pub internal_ids: Option<Vec<u64>>,
    pub uids: Option<Vec<String>>,
}

impl FoiFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_uids(mut self, uids: impl IntoIterator<Item = String>) -> Self {
        self.uids = Some(uids.into_iter().collect());
        self
    }
}

/// Declarative observation selection.
#[derive(Clone, Default)]
pub struct ObsFilter {
    /// Short-circuits planning: decode and fetch each id directly.
    pub internal_ids: Option<Vec<ObsId>>,
    pub streams: Option<StreamFilter>,
    pub fois: Option<FoiFilter>,
    pub phenomenon_time: Option<TemporalFilter>,
    pub result_time: Option<TemporalFilter>,
    pub value_predicate: Option<ValuePredicate>,
    /// Bounding box on the sampling geometry, applied post-decode.
    pub phenomenon_location: Option<Rect<f64>>,
    /// Applied after the merge; None = unlimited.
    pub limit: Option<usize>,
}

impl fmt::Debug for ObsFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObsFilter")
            .field("internal_ids", &self.internal_ids.as_ref().map(|v| v.len()))
            .field("streams", &self.streams)
            .field("fois", &self.fois)
            .field("phenomenon_time", &self.phenomenon_time)
            .field("result_time", &self.result_time)
            .field("value_predicate", &self.value_predicate.is_some())
            .field("phenomenon_location", &self.phenomenon_location)
            .field("limit", &self.limit)
            .finish()
    }
}

impl ObsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = ObsId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_streams(mut self, filter: StreamFilter) -> Self {
        self.streams = Some(filter);
        self
    }

    /// Shorthand for selecting specific stream ids.
    pub fn with_stream_ids(self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.with_streams(StreamFilter::new().with_internal_ids(ids))
    }

    pub fn with_fois(mut self, filter: FoiFilter) -> Self {
        self.fois = Some(filter);
        self
    }

    /// Shorthand for selecting specific foi ids.
    pub fn with_foi_ids(self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.with_fois(FoiFilter::new().with_internal_ids(ids))
    }

    pub fn with_phenomenon_time(mut self, filter: TemporalFilter) -> Self {
        self.phenomenon_time = Some(filter);
        self
    }

    pub fn with_result_time(mut self, filter: TemporalFilter) -> Self {
        self.result_time = Some(filter);
        self
    }

    pub fn with_value_predicate(
        mut self,
        predicate: impl Fn(&Observation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.value_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_phenomenon_location(mut self, bounds: Rect<f64>) -> Self {
        self.phenomenon_location = Some(bounds);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether any post-decode filter is active. Rank-based counting is
    /// only valid without one.
    pub fn has_post_filter(&self) -> bool {
        self.value_predicate.is_some() || self.phenomenon_location.is_some()
    }

    /// Applies the post-decode filters to one observation.
    pub fn passes_post_filters(&self, obs: &Observation) -> bool {
        if let Some(predicate) = &self.value_predicate {
            if !predicate(obs) {
                return false;
            }
        }
        if let Some(bounds) = &self.phenomenon_location {
            match &obs.sampling_geometry {
                Some(point) => {
                    if !rect_contains(bounds, point) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

fn rect_contains(rect: &Rect<f64>, point: &Point<f64>) -> bool {
    let (min, max) = (rect.min(), rect.max());
    point.x() >= min.x && point.x() <= max.x && point.y() >= min.y && point.y() <= max.y
}

/// Histogram bin sizing for statistics queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistogramBinning {
    /// Caller-fixed bin width.
    Fixed(Duration),
    /// Width picked from the round-unit ladder to land near 100 bins.
    Auto,
}

/// Statistics request: per-series counts and time ranges, with an
/// optional time-bucketed histogram.
#[derive(Debug, Clone, Default)]
pub struct StatsQuery {
    pub filter: ObsFilter,
    pub histogram: Option<HistogramBinning>,
    /// Sum per-foi rows into one bucket per (stream, result time).
    pub aggregate_fois: bool,
}

impl StatsQuery {
    pub fn new(filter: ObsFilter) -> Self {
        Self { filter, histogram: None, aggregate_fois: false }
    }

    pub fn with_histogram(mut self, binning: HistogramBinning) -> Self {
        self.histogram = Some(binning);
        self
    }

    pub fn aggregate_fois(mut self, aggregate: bool) -> Self {
        self.aggregate_fois = aggregate;
        self
    }
}
