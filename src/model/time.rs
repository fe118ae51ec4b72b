use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoding::keycode;

/// A closed instant range `[begin, end]`. The -inf/+inf sentinels make the
/// unbounded range representable without a separate variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates `[begin, end]`. Reversed bounds are rejected by callers
    /// before reaching here; an equal pair is a singleton.
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    /// The range covering all representable instants.
    pub fn all() -> Self {
        Self { begin: keycode::min_instant(), end: keycode::max_instant() }
    }

    /// The single-instant range `[t, t]`.
    pub fn singleton(t: DateTime<Utc>) -> Self {
        Self { begin: t, end: t }
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.begin
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.begin <= t && t <= self.end
    }

    /// Whether the two closed ranges touch or overlap.
    pub fn is_connected(&self, other: &TimeRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    /// Intersection of two connected ranges; None when disjoint.
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.is_connected(other) {
            return None;
        }
        Some(TimeRange {
            begin: self.begin.max(other.begin),
            end: self.end.min(other.end),
        })
    }

    /// Whether either bound is an infinity sentinel.
    pub fn is_unbounded(&self) -> bool {
        self.begin == keycode::min_instant() || self.end == keycode::max_instant()
    }

    /// Span in whole seconds, saturating at the sentinel bounds.
    pub fn duration_seconds(&self) -> i64 {
        self.end.timestamp().saturating_sub(self.begin.timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid instant")
    }

    #[test]
    fn test_contains() {
        let range = TimeRange::new(t(10), t(20));
        assert!(range.contains(t(10)));
        assert!(range.contains(t(20)));
        assert!(!range.contains(t(21)));
    }

    #[test]
    fn test_intersection() {
        let a = TimeRange::new(t(0), t(100));
        let b = TimeRange::new(t(50), t(150));
        let i = a.intersection(&b).expect("connected");
        assert_eq!(i.begin(), t(50));
        assert_eq!(i.end(), t(100));

        let c = TimeRange::new(t(200), t(300));
        assert!(a.intersection(&c).is_none());
        assert!(!a.is_connected(&c));
    }

    #[test]
    fn test_touching_ranges_are_connected() {
        let a = TimeRange::new(t(0), t(10));
        let b = TimeRange::new(t(10), t(20));
        assert!(a.is_connected(&b));
        let i = a.intersection(&b).expect("touching");
        assert_eq!(i, TimeRange::singleton(t(10)));
    }

    #[test]
    fn test_all_contains_everything() {
        let all = TimeRange::all();
        assert!(all.contains(t(0)));
        assert!(all.contains(keycode::min_instant()));
        assert!(all.contains(keycode::max_instant()));
        assert!(all.is_unbounded());
    }
}
