//! Row selection ahead of standardization.
//!
//! A recording is analysed only when its mouse speed was measured and enough
//! trajectories were observed for the per-session features to be meaningful.

use crate::data::Dataset;

/// Default minimum number of trajectories per session.
pub const DEFAULT_MIN_TRAJECTORIES: u32 = 10;

/// Thresholds visited by the sensitivity analysis.
pub const DEFAULT_SWEEP_THRESHOLDS: [u32; 8] = [2, 5, 10, 15, 20, 30, 50, 100];

/// Bookkeeping for one filtering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSummary {
    pub threshold: u32,
    pub rows_in: usize,
    pub rows_kept: usize,
    pub dropped_missing_speed: usize,
    pub dropped_below_threshold: usize,
    pub users_kept: usize,
}

/// Keeps recordings whose speed is present and whose trajectory count is at
/// least `min_trajectories`. The boundary is inclusive; a threshold of zero
/// reduces to the speed check.
pub fn filter_recordings(dataset: &Dataset, min_trajectories: u32) -> Dataset {
    dataset.retain_where(|r| r.speed.is_some() && r.n_traj >= min_trajectories)
}

/// Like [`filter_recordings`] but also reports what was removed and why.
/// Rows lacking speed are counted under the missing-speed reason even when
/// they also fall below the threshold.
pub fn filter_with_summary(dataset: &Dataset, min_trajectories: u32) -> (Dataset, FilterSummary) {
    let filtered = filter_recordings(dataset, min_trajectories);
    let dropped_missing_speed = dataset
        .recordings
        .iter()
        .filter(|r| r.speed.is_none())
        .count();
    let summary = FilterSummary {
        threshold: min_trajectories,
        rows_in: dataset.len(),
        rows_kept: filtered.len(),
        dropped_missing_speed,
        dropped_below_threshold: dataset.len() - filtered.len() - dropped_missing_speed,
        users_kept: filtered.users().len(),
    };
    log::info!(
        "Filter n_traj >= {}: kept {}/{} recordings from {} users ({} without speed, {} below threshold)",
        summary.threshold,
        summary.rows_kept,
        summary.rows_in,
        summary.users_kept,
        summary.dropped_missing_speed,
        summary.dropped_below_threshold
    );
    (filtered, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Recording;

    fn recording(row: usize, user: &str, n_traj: u32, speed: Option<f64>) -> Recording {
        Recording {
            row,
            user: user.to_string(),
            n_traj,
            speed,
            accuracy: Some(0.5),
            wheels: Some(1.0),
            clicks: Some(3.0),
            daytime: None,
            weekday: None,
            valence: Some(4.0),
            arousal: Some(4.0),
            stress: false,
            extras: Vec::new(),
        }
    }

    fn three_users() -> Dataset {
        Dataset::new(
            vec![
                recording(0, "a", 5, None),
                recording(1, "b", 12, Some(1.2)),
                recording(2, "c", 20, Some(0.8)),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn null_speed_is_dropped_regardless_of_threshold() {
        let dataset = three_users();
        for threshold in [0, 5, 10] {
            let kept = filter_recordings(&dataset, threshold);
            assert!(kept.recordings.iter().all(|r| r.user != "a"));
        }
    }

    #[test]
    fn boundary_is_inclusive() {
        let dataset = three_users();
        assert_eq!(filter_recordings(&dataset, 10).len(), 2);
        assert_eq!(filter_recordings(&dataset, 12).len(), 2);
        assert_eq!(filter_recordings(&dataset, 13).len(), 1);
        assert_eq!(filter_recordings(&dataset, 20).len(), 1);
        assert_eq!(filter_recordings(&dataset, 21).len(), 0);
        assert_eq!(filter_recordings(&dataset, 5).len(), 2);
        assert_eq!(filter_recordings(&dataset, 0).len(), 2);
    }

    #[test]
    fn retained_rows_satisfy_both_criteria() {
        let dataset = three_users();
        for threshold in DEFAULT_SWEEP_THRESHOLDS {
            let kept = filter_recordings(&dataset, threshold);
            assert!(
                kept.recordings
                    .iter()
                    .all(|r| r.speed.is_some() && r.n_traj >= threshold)
            );
        }
    }

    #[test]
    fn summary_attributes_drop_reasons() {
        let (kept, summary) = filter_with_summary(&three_users(), 15);
        assert_eq!(kept.len(), 1);
        assert_eq!(summary.rows_in, 3);
        assert_eq!(summary.rows_kept, 1);
        assert_eq!(summary.dropped_missing_speed, 1);
        assert_eq!(summary.dropped_below_threshold, 1);
        assert_eq!(summary.users_kept, 1);
    }
}
