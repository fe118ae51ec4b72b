//! Per-series statistics rows and histogram bin sizing.

use std::time::Duration;

use crate::model::TimeRange;

/// Statistics for one observation series (or one aggregated
/// `(stream, result time)` bucket when fois are aggregated).
#[derive(Debug, Clone, PartialEq)]
pub struct ObsStats {
    pub stream_id: u64,
    /// 0 when no foi applies or when rows were aggregated across fois.
    pub foi_id: u64,
    pub phenomenon_time_range: TimeRange,
    pub result_time_range: TimeRange,
    pub total_obs_count: u64,
    /// Observation counts per fixed-width time bucket, when requested.
    pub obs_counts_by_time: Option<Vec<u64>>,
    /// Width of the histogram buckets, when a histogram was computed.
    pub histogram_bin_size: Option<Duration>,
}

/// Bin widths that produce round time slots, in seconds: 1s to 30s,
/// minutes to 30min, hours to 12h, days to 365d.
pub const BIN_SIZE_LADDER: [u64; 29] = [
    1,
    5,
    10,
    20,
    30,
    60,
    120,
    300,
    600,
    900,
    1200,
    1800,
    3600,
    3600 * 2,
    3600 * 4,
    3600 * 6,
    3600 * 8,
    3600 * 12,
    86400,
    86400 * 2,
    86400 * 4,
    86400 * 7,
    86400 * 14,
    86400 * 30,
    86400 * 60,
    86400 * 90,
    86400 * 120,
    86400 * 180,
    86400 * 365,
];

/// Picks the ladder width nearest to `duration / 100`, clamped to the
/// ladder bounds. Lands near 100 buckets for plotting, within the ladder's
/// granularity.
pub fn auto_bin_size(duration_seconds: i64) -> Duration {
    let exact = ((duration_seconds.max(0) as f64) / 100.0).round() as u64;
    let width = match BIN_SIZE_LADDER.binary_search(&exact) {
        Ok(i) => BIN_SIZE_LADDER[i],
        Err(0) => BIN_SIZE_LADDER[0],
        Err(i) if i >= BIN_SIZE_LADDER.len() => BIN_SIZE_LADDER[BIN_SIZE_LADDER.len() - 1],
        Err(i) => {
            // Between two rungs; take the nearer one, the larger on a tie
            let (below, above) = (BIN_SIZE_LADDER[i - 1], BIN_SIZE_LADDER[i]);
            if exact - below < above - exact {
                below
            } else {
                above
            }
        }
    };
    Duration::from_secs(width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_is_sorted() {
        assert!(BIN_SIZE_LADDER.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_exact_rung() {
        // 1000s range: 10s bins, 100 buckets
        assert_eq!(auto_bin_size(1000), Duration::from_secs(10));
    }

    #[test]
    fn test_between_rungs_picks_nearest() {
        // 1500s / 100 = 15 -> between 10 and 20, nearer 10? equidistant -> larger
        assert_eq!(auto_bin_size(1500), Duration::from_secs(20));
        // 1200s / 100 = 12 -> nearer 10
        assert_eq!(auto_bin_size(1200), Duration::from_secs(10));
    }

    #[test]
    fn test_clamped_at_bounds() {
        assert_eq!(auto_bin_size(0), Duration::from_secs(1));
        assert_eq!(auto_bin_size(50), Duration::from_secs(1));
        assert_eq!(auto_bin_size(i64::MAX), Duration::from_secs(86400 * 365));
    }

    #[test]
    fn test_day_scale() {
        // 90 days of data: 90*86400/100 = 77760 -> between 12h and 1d
        let picked = auto_bin_size(90 * 86400);
        assert_eq!(picked, Duration::from_secs(86400));
    }
}
