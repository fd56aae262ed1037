//! Pools the day's passing candidates, re-validates small pools, rejects
//! outliers and averages what is left into the final overlap curve.

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gradient::relative_gradient_magnitude;
use crate::interval::IntervalReport;
use crate::reference::ReferenceCurve;
use crate::stats::{nan_max, nan_mean, nan_median, nan_std, prctile};
use crate::window::FittingWindow;
use crate::DayProfiles;

/// A candidate that passed all four gates, with its provenance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SurvivingCandidate {
    pub interval: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window: FittingWindow,
    pub internal_temperature: f64,
    pub curve: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Contributor {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window_start: f64,
    pub window_end: f64,
    pub internal_temperature: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FinalOverlap {
    pub curve: Vec<f64>,
    pub contributors: Vec<Contributor>,
    /// Curves behind the mean, in contributor order.
    pub curves: Vec<Vec<f64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DayResult {
    pub intervals: Vec<IntervalReport>,
    /// Candidates that passed every gate.
    pub surviving: usize,
    pub revalidation_dropped: usize,
    pub outliers_dropped: usize,
    /// `None` when nothing survived.
    pub final_overlap: Option<FinalOverlap>,
}

pub fn collect_survivors(intervals: &[IntervalReport]) -> Vec<SurvivingCandidate> {
    intervals
        .iter()
        .enumerate()
        .flat_map(|(idx, report)| {
            report.passing_rows().filter_map(move |row| {
                row.curve.as_ref().map(|curve| SurvivingCandidate {
                    interval: idx,
                    start: report.start,
                    end: report.end,
                    window: row.window,
                    internal_temperature: row.internal_temperature,
                    curve: curve.clone(),
                })
            })
        })
        .collect()
}

/// Second look at one candidate against its own raw signal.
#[derive(Clone, Debug, PartialEq)]
pub struct Revalidation {
    pub variance_ratio: f64,
    pub gradient_max: f64,
    pub gradient_mean: f64,
    pub passed: bool,
}

/// Applies the candidate's curve to the uncorrected signal of its own span
/// and window and repeats the variance and gradient tests on the result.
pub fn revalidate(
    candidate: &SurvivingCandidate,
    day: &DayProfiles,
    reference: &ReferenceCurve,
    config: &Config,
) -> Revalidation {
    let t = &config.thresholds;
    let range = day.range();
    let stop = candidate.window.stop();
    let bins: Vec<usize> = (0..range.len())
        .filter(|&i| range[i] >= t.min_range_std_over_mean && range[i] <= stop)
        .collect();
    let times = day.times();

    let corrected_log = |profiles: &[usize]| -> Array2<f64> {
        Array2::from_shape_fn((bins.len(), profiles.len()), |(row, col)| {
            let bin = bins[row];
            let raw = day.profiles()[profiles[col]].rcs[bin] * reference.values()[bin];
            (raw / candidate.curve[bin]).abs().log10()
        })
    };

    // variance over [start, end)
    let span: Vec<usize> = (0..times.len())
        .filter(|&k| times[k] >= candidate.start && times[k] < candidate.end)
        .collect();
    let log = corrected_log(&span);
    let per_window = day
        .time_step()
        .map(|step| {
            let sliding = crate::precheck::minutes(t.dt_sliding_variance);
            (sliding.num_milliseconds() as f64 / step.num_milliseconds() as f64).round() as usize
        })
        .unwrap_or(0)
        .max(1);
    let medians: Vec<f64> = log
        .outer_iter()
        .map(|row| nan_median(&row.to_vec()))
        .collect();
    let mut ratios = Vec::new();
    if per_window <= span.len() {
        for first in 0..=span.len() - per_window {
            for (row, values) in log.outer_iter().enumerate() {
                let window: Vec<f64> = values
                    .iter()
                    .skip(first)
                    .take(per_window)
                    .copied()
                    .collect();
                ratios.push(nan_std(&window) / medians[row]);
            }
        }
    }
    let variance_ratio = nan_max(ratios.iter().copied());

    // gradient over [start, end]
    let span_closed: Vec<usize> = (0..times.len())
        .filter(|&k| times[k] >= candidate.start && times[k] <= candidate.end)
        .collect();
    // border rows and columns dropped; the top border row is the window end
    let magnitude = relative_gradient_magnitude(corrected_log(&span_closed).view());
    let (rows, cols) = magnitude.dim();
    let mut peak = f64::NAN;
    let mut row_means = Vec::new();
    for row in 1..rows.saturating_sub(1) {
        let interior: Vec<f64> = (1..cols.saturating_sub(1))
            .map(|col| magnitude[[row, col]])
            .filter(|v| v.is_finite())
            .collect();
        if interior.is_empty() {
            continue;
        }
        peak = nan_max(interior.iter().copied().chain(std::iter::once(peak)));
        row_means.push(nan_mean(interior.iter().copied()));
    }
    let gradient_mean = nan_mean(row_means.iter().copied());

    let passed = variance_ratio < t.max_std_over_mean
        && peak <= t.max_relgrad
        && gradient_mean <= t.max_relgrad_mean;
    Revalidation {
        variance_ratio,
        gradient_max: peak,
        gradient_mean,
        passed,
    }
}

/// Per-bin Tukey fence `median ± whiskers × IQR` with Matlab-style
/// percentiles.
#[derive(Clone, Debug, PartialEq)]
pub struct Fence {
    pub lower: Vec<f64>,
    pub median: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Fence {
    pub fn new(curves: &[&[f64]], whiskers: f64) -> Option<Self> {
        let bins = curves.first()?.len();
        let mut fence = Fence {
            lower: Vec::with_capacity(bins),
            median: Vec::with_capacity(bins),
            upper: Vec::with_capacity(bins),
        };
        for bin in 0..bins {
            let column: Vec<f64> = curves.iter().map(|c| c[bin]).collect();
            let (q25, q50, q75) = (
                prctile(&column, 25.0),
                prctile(&column, 50.0),
                prctile(&column, 75.0),
            );
            let spread = whiskers * (q75 - q25);
            fence.lower.push(q50 - spread);
            fence.median.push(q50);
            fence.upper.push(q50 + spread);
        }
        Some(fence)
    }

    /// No bin strictly outside the fence.
    pub fn contains(&self, curve: &[f64]) -> bool {
        curve
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .all(|(v, (lo, hi))| !(v < lo || v > hi))
    }
}

/// Bin-wise mean.
fn mean_curve(curves: &[&[f64]]) -> Vec<f64> {
    let bins = curves.first().map_or(0, |c| c.len());
    (0..bins)
        .map(|bin| nan_mean(curves.iter().map(|c| c[bin])))
        .collect()
}

pub fn aggregate_day(
    day: &DayProfiles,
    reference: &ReferenceCurve,
    config: &Config,
    intervals: Vec<IntervalReport>,
) -> DayResult {
    let pool = collect_survivors(&intervals);
    let surviving = pool.len();

    let checked: Vec<SurvivingCandidate> =
        if surviving > 0 && surviving <= config.thresholds.min_nb_samples_for_skipping_good_test {
            pool.into_iter()
                .filter(|c| {
                    let outcome = revalidate(c, day, reference, config);
                    if !outcome.passed {
                        debug!(
                            start = %c.start,
                            window_start = c.window.start,
                            variance = outcome.variance_ratio,
                            gradient_max = outcome.gradient_max,
                            gradient_mean = outcome.gradient_mean,
                            "dropped on re-validation"
                        );
                    }
                    outcome.passed
                })
                .collect()
        } else {
            pool
        };
    let revalidation_dropped = surviving - checked.len();

    let curves: Vec<&[f64]> = checked.iter().map(|c| c.curve.as_slice()).collect();
    let keep: Vec<bool> = match Fence::new(&curves, config.thresholds.whiskers_length) {
        Some(fence) => curves.iter().map(|c| fence.contains(c)).collect(),
        None => Vec::new(),
    };
    let kept: Vec<&SurvivingCandidate> = checked
        .iter()
        .zip(&keep)
        .filter(|&(_, &k)| k)
        .map(|(c, _)| c)
        .collect();
    let outliers_dropped = checked.len() - kept.len();

    let final_overlap = if kept.is_empty() {
        warn!(surviving, "no overlap curve for this day");
        None
    } else {
        let kept_curves: Vec<&[f64]> = kept.iter().map(|c| c.curve.as_slice()).collect();
        Some(FinalOverlap {
            curve: mean_curve(&kept_curves),
            contributors: kept
                .iter()
                .map(|c| Contributor {
                    start: c.start,
                    end: c.end,
                    window_start: c.window.start,
                    window_end: c.window.stop(),
                    internal_temperature: c.internal_temperature,
                })
                .collect(),
            curves: kept.iter().map(|c| c.curve.clone()).collect(),
        })
    };

    info!(
        intervals = intervals.len(),
        surviving,
        revalidation_dropped,
        outliers_dropped,
        contributors = final_overlap.as_ref().map_or(0, |f| f.contributors.len()),
        "day aggregated"
    );
    DayResult {
        intervals,
        surviving,
        revalidation_dropped,
        outliers_dropped,
        final_overlap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::{CandidateRow, IntervalCandidates, Stage};
    use crate::interval::IntervalReport;
    use crate::precheck::PreCheckReport;
    use crate::test_support::{clear_day, generous_config, reference_for};

    fn candidate(curve: Vec<f64>, day: &DayProfiles) -> SurvivingCandidate {
        let times = day.times();
        SurvivingCandidate {
            interval: 0,
            start: times[0],
            end: times[30],
            window: FittingWindow {
                start: 300.0,
                length: 240.0,
            },
            internal_temperature: 20.0,
            curve,
        }
    }

    /// Reference with a fourfold jump at full overlap.
    fn stepped_curve(reference: &ReferenceCurve, range: &[f64]) -> Vec<f64> {
        reference
            .values()
            .iter()
            .zip(range)
            .map(|(v, &r)| if r >= 450.0 { v * 4.0 } else { *v })
            .collect()
    }

    fn passing_row(curve: Vec<f64>) -> CandidateRow {
        CandidateRow {
            window: FittingWindow {
                start: 300.0,
                length: 240.0,
            },
            last_window_bin: 35,
            fit: Stage::Passed(Default::default()),
            overlap: Stage::Passed(Default::default()),
            homogeneity: Stage::Passed(Default::default()),
            monotonic: Stage::Passed(Default::default()),
            internal_temperature: 20.0,
            curve: Some(curve),
        }
    }

    #[test]
    fn test_perturbed_curve_is_fenced_out() {
        let base: Vec<f64> = vec![0.25, 0.5, 0.75, 1.0, 1.0];
        let mut perturbed = base.clone();
        perturbed[2] += 0.5;
        let mut curves: Vec<&[f64]> = vec![base.as_slice(); 5];
        curves.push(perturbed.as_slice());
        let fence = Fence::new(&curves, 1.5).unwrap();
        assert!(fence.contains(&base));
        assert!(!fence.contains(&perturbed));
        let kept: Vec<&[f64]> = curves.iter().copied().filter(|c| fence.contains(c)).collect();
        assert_eq!(kept.len(), 5);
        assert_eq!(mean_curve(&kept), base);
    }

    #[test]
    fn test_fence_uses_matlab_quartiles() {
        let columns: Vec<Vec<f64>> = [1.0, 2.0, 3.0, 4.0].iter().map(|&v| vec![v]).collect();
        let curves: Vec<&[f64]> = columns.iter().map(|c| c.as_slice()).collect();
        let fence = Fence::new(&curves, 1.0).unwrap();
        // quartiles 1.5 and 3.5, median 2.5
        assert_eq!(fence.median, vec![2.5]);
        assert_eq!(fence.lower, vec![0.5]);
        assert_eq!(fence.upper, vec![4.5]);
        assert!(Fence::new(&[], 1.0).is_none());
    }

    #[test]
    fn test_revalidation_accepts_consistent_curve() {
        let cfg = generous_config();
        let day = clear_day(48);
        let reference = reference_for(day.range());
        let c = candidate(reference.values().to_vec(), &day);
        let outcome = revalidate(&c, &day, &reference, &cfg);
        assert!(outcome.passed, "{outcome:?}");
        assert!(outcome.variance_ratio < 1e-12);
    }

    #[test]
    fn test_revalidation_rejects_stepped_curve() {
        let cfg = generous_config();
        let day = clear_day(48);
        let reference = reference_for(day.range());
        let c = candidate(stepped_curve(&reference, day.range()), &day);
        let outcome = revalidate(&c, &day, &reference, &cfg);
        assert!(!outcome.passed);
        assert!(outcome.variance_ratio < 1e-12);
        assert!(outcome.gradient_max > cfg.thresholds.max_relgrad);
    }

    #[test]
    fn test_revalidation_rejects_flickering_signal() {
        let cfg = generous_config();
        let mut day = clear_day(48);
        for (k, p) in day.profiles_mut().iter_mut().enumerate() {
            if k % 2 == 1 {
                p.rcs.iter_mut().for_each(|v| *v *= 10.0);
            }
        }
        let reference = reference_for(day.range());
        let c = candidate(reference.values().to_vec(), &day);
        let outcome = revalidate(&c, &day, &reference, &cfg);
        assert!(!outcome.passed);
        assert!(outcome.variance_ratio >= cfg.thresholds.max_std_over_mean);
    }

    #[test]
    fn test_small_pool_drops_candidates_failing_revalidation() {
        let cfg = generous_config();
        let day = clear_day(48);
        let reference = reference_for(day.range());
        let times = day.times();
        let rows = vec![
            passing_row(reference.values().to_vec()),
            passing_row(stepped_curve(&reference, day.range())),
            passing_row(reference.values().to_vec()),
        ];
        let report = IntervalReport {
            start: times[0],
            end: times[30],
            start_index: 0,
            end_index: 30,
            prechecks: PreCheckReport::default(),
            candidates: Some(IntervalCandidates {
                rows,
                ..Default::default()
            }),
        };
        assert!(3 <= cfg.thresholds.min_nb_samples_for_skipping_good_test);

        let result = aggregate_day(&day, &reference, &cfg, vec![report]);
        assert_eq!(result.surviving, 3);
        assert_eq!(result.revalidation_dropped, 1);
        assert_eq!(result.outliers_dropped, 0);
        let overlap = result.final_overlap.unwrap();
        assert_eq!(overlap.contributors.len(), 2);
        assert_eq!(overlap.curves.len(), 2);
        // mean of the two consistent curves
        assert_eq!(overlap.curve, reference.values());
        for c in &overlap.contributors {
            assert_eq!((c.start, c.end), (times[0], times[30]));
            assert_eq!((c.window_start, c.window_end), (300.0, 540.0));
        }
    }

    #[test]
    fn test_empty_pool_gives_no_curve() {
        let cfg = generous_config();
        let day = clear_day(48);
        let reference = reference_for(day.range());
        let result = aggregate_day(&day, &reference, &cfg, Vec::new());
        assert_eq!(result.surviving, 0);
        assert!(result.final_overlap.is_none());
    }
}
