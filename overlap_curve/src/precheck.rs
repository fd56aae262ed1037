//! Five-stage pre-check cascade that bounds the usable altitude range of one
//! time interval.
//!
//! Each stage either narrows the range or fails the interval. A failure stops
//! the cascade; the later stages then report `false` with zeroed diagnostics
//! and never run.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Config, GradientOffset};
use crate::gradient::{sobel, GradientAxis};
use crate::stats::{max_propagate, maximum, nan_max, nan_mean, nan_median, nan_std};
use crate::Profile;

/// Cloud base assumed when a layer reports nothing usable.
pub const NO_CLOUD_BASE: f64 = 15000.0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum PreCheckFailure {
    NoData,
    NotClearSky,
    CloudTooLow {
        lowest_cloud_base: f64,
        required: f64,
    },
    Variance {
        ratio: f64,
        range: f64,
    },
    Gradient {
        time_gradient: f64,
        time_limit: f64,
        altitude_gradient: f64,
        altitude_limit: f64,
        final_range: f64,
    },
}

impl fmt::Display for PreCheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreCheckFailure::NoData => write!(f, "contains no data"),
            PreCheckFailure::NotClearSky => write!(f, "at least one sky condition != 0"),
            PreCheckFailure::CloudTooLow {
                lowest_cloud_base,
                required,
            } => write!(
                f,
                "lowest cloud base is {lowest_cloud_base:.1} m, needs {required:.1} m"
            ),
            PreCheckFailure::Variance { ratio, range } => {
                write!(f, "failed variance check {ratio:.3} at {range:.1} m")
            }
            PreCheckFailure::Gradient {
                time_gradient,
                time_limit,
                altitude_gradient,
                altitude_limit,
                final_range,
            } => write!(
                f,
                "failed gradient check: time gradient {time_gradient:.3} limits range to \
                 {time_limit:.1} m, altitude gradient {altitude_gradient:.3} limits range to \
                 {altitude_limit:.1} m, final range {final_range:.1} m"
            ),
        }
    }
}

/// Outcome of the cascade for one interval.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PreCheckReport {
    pub checks: [bool; 5],
    /// Range after the cloud-base check.
    pub cloud_range: f64,
    /// Range after the running-variance check.
    pub variance_range: f64,
    /// Range after the gradient check; the usable range when all passed.
    pub max_available_fit_range: f64,
    pub variance_ratio: f64,
    pub time_gradient: f64,
    pub altitude_gradient: f64,
    pub altitude_gradient_limit: f64,
    pub time_gradient_limit: f64,
    pub homogeneity_limit: f64,
    pub failure: Option<PreCheckFailure>,
}

impl PreCheckReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none() && self.checks.iter().all(|&c| c)
    }
}

/// Runs the cascade. `rcs` is the interval's signal block laid out
/// (altitude × time), one column per entry of `profiles`.
pub fn run_prechecks(
    profiles: &[Profile],
    rcs: ArrayView2<f64>,
    range: &[f64],
    config: &Config,
) -> PreCheckReport {
    let mut report = PreCheckReport::default();

    if !profiles.iter().any(|p| p.valid) {
        report.failure = Some(PreCheckFailure::NoData);
        return report;
    }
    report.checks[0] = true;

    if profiles.iter().any(|p| p.sky_condition != 0) {
        report.failure = Some(PreCheckFailure::NotClearSky);
        return report;
    }
    report.checks[1] = true;

    let (cloud_ok, cloud_range) = cloud_base_clearance(profiles, config);
    report.cloud_range = cloud_range;
    if !cloud_ok {
        report.failure = Some(PreCheckFailure::CloudTooLow {
            lowest_cloud_base: cloud_range,
            required: config.min_required_range(),
        });
        return report;
    }
    report.checks[2] = true;

    let times: Vec<DateTime<Utc>> = profiles.iter().map(|p| p.time).collect();
    let variance = running_variance(rcs, range, &times, config, cloud_range);
    report.variance_range = variance.range;
    report.variance_ratio = variance.ratio;
    if variance.range < config.min_required_range() {
        report.failure = Some(PreCheckFailure::Variance {
            ratio: variance.ratio,
            range: variance.range,
        });
        return report;
    }
    report.checks[3] = true;

    let grads = gradient_limits(rcs, range, config, variance.range);
    report.max_available_fit_range = grads.range;
    report.time_gradient = grads.time_gradient;
    report.altitude_gradient = grads.altitude_gradient;
    report.altitude_gradient_limit = grads.altitude_limit;
    report.time_gradient_limit = grads.time_limit;
    report.homogeneity_limit = grads.homogeneity_limit;
    if grads.range < config.min_required_range() {
        report.failure = Some(PreCheckFailure::Gradient {
            time_gradient: grads.time_gradient,
            time_limit: grads.time_limit,
            altitude_gradient: grads.altitude_gradient,
            altitude_limit: grads.altitude_limit,
            final_range: grads.range,
        });
        return report;
    }
    report.checks[4] = true;

    debug!(
        cloud = cloud_range,
        variance = variance.range,
        gradient = grads.range,
        "pre-checks passed"
    );
    report
}

/// Lowest cloud base over the interval, clipped at `max_fit_range`, and
/// whether every profile clears the minimum fit range.
fn cloud_base_clearance(profiles: &[Profile], config: &Config) -> (bool, f64) {
    let required = config.min_required_range();
    let lowest: Vec<f64> = profiles
        .iter()
        .map(|p| {
            p.cloud_base
                .iter()
                .map(|&c| if c.is_finite() && c >= 0.0 { c } else { NO_CLOUD_BASE })
                .fold(f64::INFINITY, f64::min)
        })
        .collect();
    let passed = lowest.iter().all(|&c| c >= required);
    let clipped = lowest
        .iter()
        .map(|&c| c.min(config.thresholds.max_fit_range))
        .fold(f64::INFINITY, f64::min);
    (passed, clipped)
}

fn last_index_where<F: Fn(f64) -> bool>(values: &[f64], predicate: F) -> Option<usize> {
    values.iter().rposition(|&v| predicate(v))
}

fn first_index_where<F: Fn(f64) -> bool>(values: &[f64], predicate: F) -> Option<usize> {
    values.iter().position(|&v| predicate(v))
}

pub(crate) fn minutes(m: f64) -> Duration {
    Duration::milliseconds((m * 60_000.0).round() as i64)
}

#[derive(Debug)]
struct VarianceOutcome {
    range: f64,
    ratio: f64,
}

/// Sliding-window ratio of the temporal standard deviation of log-signal to
/// its median over the interval. The first bin reaching `max_std_over_mean`
/// becomes the new range.
fn running_variance(
    rcs: ArrayView2<f64>,
    range: &[f64],
    times: &[DateTime<Utc>],
    config: &Config,
    max_available_fit_range: f64,
) -> VarianceOutcome {
    let t = &config.thresholds;
    let lo = last_index_where(range, |r| r <= t.min_range_std_over_mean).unwrap_or(0);
    let Some(hi) = last_index_where(range, |r| r <= max_available_fit_range) else {
        return VarianceOutcome {
            range: max_available_fit_range,
            ratio: 0.0,
        };
    };
    if hi <= lo || times.is_empty() {
        return VarianceOutcome {
            range: max_available_fit_range,
            ratio: 0.0,
        };
    }

    let log = rcs.slice(s![lo..hi, ..]).mapv(|v| v.abs().log10());
    let medians: Vec<f64> = log
        .outer_iter()
        .map(|row| nan_median(&row.to_vec()))
        .collect();

    let sliding = minutes(t.dt_sliding_variance);
    let last = times[times.len() - 1];
    let mut ratio = vec![0.0; hi - lo];
    for (start, &ts) in times.iter().enumerate() {
        if ts > last - sliding {
            continue;
        }
        let end = times
            .iter()
            .rposition(|&x| x <= ts + sliding)
            .unwrap_or(start);
        for (bin, row) in log.outer_iter().enumerate() {
            let window: Vec<f64> = row.slice(s![start..end.max(start)]).to_vec();
            let r = nan_std(&window) / medians[bin];
            ratio[bin] = maximum(ratio[bin], r);
        }
    }

    match ratio.iter().position(|&r| r >= t.max_std_over_mean) {
        Some(ind) => VarianceOutcome {
            range: range[lo + ind],
            ratio: ratio[ind],
        },
        None => VarianceOutcome {
            range: max_available_fit_range,
            ratio: 0.0,
        },
    }
}

#[derive(Debug)]
struct GradientOutcome {
    range: f64,
    time_gradient: f64,
    altitude_gradient: f64,
    altitude_limit: f64,
    time_limit: f64,
    homogeneity_limit: f64,
}

/// Limits from relative altitude and time gradients (m1, m2) and from the
/// highest homogeneous sub-range (m3).
fn gradient_limits(
    rcs: ArrayView2<f64>,
    range: &[f64],
    config: &Config,
    max_available_fit_range: f64,
) -> GradientOutcome {
    let t = &config.thresholds;
    let policy = t.precheck_policy;
    let mut out = GradientOutcome {
        range: max_available_fit_range,
        time_gradient: 0.0,
        altitude_gradient: 0.0,
        altitude_limit: max_available_fit_range,
        time_limit: max_available_fit_range,
        homogeneity_limit: max_available_fit_range,
    };

    let lo = first_index_where(range, |r| r >= t.min_range_std_over_mean);
    let hi = last_index_where(range, |r| r <= max_available_fit_range);
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return out;
    };
    // Border rows and columns are dropped, so at least three of each.
    if hi < lo + 3 || rcs.ncols() < 3 {
        return out;
    }
    let rconv = &range[lo + 1..hi - 1];

    let log: Array2<f64> = rcs.slice(s![lo..hi, ..]).mapv(|v| v.abs().log10());
    let grad_alt = sobel(log.view(), GradientAxis::Altitude);
    let grad_time = sobel(log.view(), GradientAxis::Time);
    let inner_log = log.slice(s![1..-1, 1..-1]);
    let inner_alt = grad_alt.slice(s![1..-1, 1..-1]);
    let inner_time = grad_time.slice(s![1..-1, 1..-1]);

    let per_bin_max = |grad: &ndarray::ArrayView2<f64>| -> Vec<f64> {
        grad.outer_iter()
            .zip(inner_log.outer_iter())
            .map(|(g, l)| max_propagate(g.iter().zip(l.iter()).map(|(g, l)| g.abs() / l.abs())))
            .collect()
    };
    let alt_max = per_bin_max(&inner_alt);
    let time_max = per_bin_max(&inner_time);

    let magnitude = Array2::from_shape_fn(inner_log.dim(), |(i, j)| {
        let (a, b) = (inner_alt[[i, j]], inner_time[[i, j]]);
        (a * a + b * b).sqrt() / inner_log[[i, j]].abs()
    });

    let last = rconv.len() - 1;
    let first_grad = config.first_range_grad_altitude;

    let alt_subset = first_index_where(rconv, |r| r >= first_grad).unwrap_or(rconv.len());
    let alt_hits: Vec<usize> = (alt_subset..rconv.len())
        .filter(|&i| alt_max[i] >= t.max_relgrad)
        .map(|i| i - alt_subset)
        .collect();
    if alt_hits.len() >= policy.min_exceedances.max(1) {
        let first = alt_hits[0];
        let (value_idx, limit_idx) = match policy.altitude_gradient_offset {
            GradientOffset::Fixed(offset) => (first, first + offset),
            GradientOffset::SubsetAligned => (alt_subset + first, alt_subset + first),
        };
        out.altitude_gradient = alt_max[value_idx.min(last)];
        out.altitude_limit = rconv[limit_idx.min(last)];
    }

    let time_subset =
        first_index_where(rconv, |r| r >= t.min_range_std_over_mean).unwrap_or(rconv.len());
    let time_hits: Vec<usize> = (time_subset..rconv.len())
        .filter(|&i| time_max[i] >= t.max_relgrad)
        .collect();
    if time_hits.len() >= policy.min_exceedances.max(1) {
        let first = time_hits[0];
        out.time_gradient = time_max[first];
        out.time_limit = rconv[first];
    }

    let eligible: Vec<usize> = (0..rconv.len())
        .filter(|&i| rconv[i] >= first_grad && rconv[i] <= max_available_fit_range)
        .collect();
    for k in (2..eligible.len()).rev() {
        let chunk = magnitude.slice(s![eligible[0]..eligible[k], ..]);
        let peak = nan_max(chunk.iter().copied());
        let mean = nan_mean(chunk.iter().copied());
        if peak <= t.max_relgrad && mean <= t.max_relgrad_mean {
            out.homogeneity_limit = rconv[eligible[k] - 1];
            break;
        }
    }

    out.range = max_available_fit_range
        .min(out.altitude_limit)
        .min(out.time_limit)
        .min(out.homogeneity_limit);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{clear_day, generous_config};
    use crate::DayProfiles;

    fn block(day: &DayProfiles, start: usize, end: usize) -> (Vec<Profile>, Array2<f64>) {
        let profiles = day.profiles()[start..end].to_vec();
        let rcs = day.signal_block(start, end);
        (profiles, rcs)
    }

    #[test]
    fn test_clean_interval_passes_and_narrows() {
        let cfg = generous_config();
        let day = clear_day(48);
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert!(report.passed(), "{:?}", report.failure);
        assert_eq!(report.cloud_range, cfg.thresholds.max_fit_range);
        assert_eq!(report.variance_range, report.cloud_range);
        assert!(report.max_available_fit_range <= report.variance_range);
        assert!(report.max_available_fit_range >= cfg.min_required_range());
        assert_eq!(report.variance_ratio, 0.0);
    }

    #[test]
    fn test_gap_filled_interval_has_no_data() {
        let cfg = generous_config();
        let mut day = clear_day(48);
        let bins = day.range().len();
        for p in day.profiles_mut()[..30].iter_mut() {
            *p = Profile::gap_filled(p.time, bins);
        }
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert_eq!(report.checks, [false; 5]);
        assert_eq!(report.failure, Some(PreCheckFailure::NoData));
        assert_eq!(report.max_available_fit_range, 0.0);
    }

    #[test]
    fn test_one_cloudy_profile_fails_sky_check() {
        let cfg = generous_config();
        let mut day = clear_day(48);
        day.profiles_mut()[4].sky_condition = 1;
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert_eq!(report.checks, [true, false, false, false, false]);
        let reason = report.failure.as_ref().map(|f| f.to_string());
        assert_eq!(reason.as_deref(), Some("at least one sky condition != 0"));
    }

    #[test]
    fn test_low_cloud_fails_and_reports_base() {
        let cfg = generous_config();
        let mut day = clear_day(48);
        day.profiles_mut()[7].cloud_base = vec![-999.0, 320.0, 2000.0];
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert_eq!(report.checks, [true, true, false, false, false]);
        match report.failure {
            Some(PreCheckFailure::CloudTooLow { lowest_cloud_base, required }) => {
                assert_eq!(lowest_cloud_base, 320.0);
                assert_eq!(required, cfg.min_required_range());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_high_cloud_clips_range() {
        let cfg = generous_config();
        let mut day = clear_day(48);
        day.profiles_mut()[3].cloud_base = vec![600.0, f64::NAN, -1.0];
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert!(report.checks[2]);
        assert_eq!(report.cloud_range, 600.0);
        assert!(report.max_available_fit_range <= 600.0);
    }

    #[test]
    fn test_noisy_layer_stops_variance_range() {
        let cfg = generous_config();
        let mut day = clear_day(48);
        let range = day.range().to_vec();
        let noisy_from = range.iter().position(|&r| r >= 450.0).unwrap();
        for (k, p) in day.profiles_mut().iter_mut().enumerate() {
            for bin in noisy_from..range.len() {
                p.rcs[bin] *= if k % 2 == 0 { 10.0 } else { 0.1 };
            }
        }
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert!(report.checks[3]);
        assert_eq!(report.variance_range, range[noisy_from]);
        assert!(report.variance_ratio >= cfg.thresholds.max_std_over_mean);
        assert!(report.max_available_fit_range <= report.variance_range);
    }

    /// Constant-in-time signal that drops a hundredfold above `altitude`.
    fn step_day(altitude: f64) -> DayProfiles {
        let mut day = clear_day(48);
        let range = day.range().to_vec();
        for p in day.profiles_mut() {
            for (v, &r) in p.rcs.iter_mut().zip(&range) {
                if r > altitude {
                    *v = 1e3;
                }
            }
        }
        day
    }

    #[test]
    fn test_altitude_step_limits_range() {
        let cfg = generous_config();
        let day = step_day(600.0);
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert_eq!(report.checks, [true; 5]);
        assert_eq!(report.variance_range, 700.0);
        // the reported gradient sits ten bins below the limiting one
        assert_eq!(report.altitude_gradient, 0.0);
        assert_eq!(report.altitude_gradient_limit, 600.0);
        assert_eq!(report.time_gradient, 0.0);
        assert_eq!(report.time_gradient_limit, 700.0);
        // highest step-free chunk ends just below 600 m
        assert_eq!(report.homogeneity_limit, 585.0);
        assert_eq!(report.max_available_fit_range, 585.0);
    }

    #[test]
    fn test_subset_aligned_offset_reports_limiting_gradient() {
        let mut cfg = generous_config();
        cfg.thresholds.precheck_policy.altitude_gradient_offset = GradientOffset::SubsetAligned;
        let day = step_day(600.0);
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert!(report.passed());
        // 4 * (3 - 5) / 5
        assert!((report.altitude_gradient - 1.6).abs() < 1e-12);
        assert_eq!(report.altitude_gradient_limit, 600.0);
        assert_eq!(report.max_available_fit_range, 585.0);
    }

    #[test]
    fn test_single_exceedance_needs_lower_count() {
        let mut cfg = generous_config();
        // only the bin above the step (8/3) exceeds
        cfg.thresholds.max_relgrad = 2.0;
        let day = step_day(600.0);
        let (profiles, rcs) = block(&day, 0, 30);

        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert_eq!(cfg.thresholds.precheck_policy.min_exceedances, 2);
        assert_eq!(report.altitude_gradient_limit, 700.0);
        assert_eq!(report.max_available_fit_range, 585.0);

        cfg.thresholds.precheck_policy.min_exceedances = 1;
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert_eq!(report.altitude_gradient_limit, 615.0);
        assert_eq!(report.altitude_gradient, 0.0);
        assert_eq!(report.max_available_fit_range, 585.0);
    }

    #[test]
    fn test_low_altitude_step_fails_gradient_check() {
        let cfg = generous_config();
        let day = step_day(300.0);
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert_eq!(report.checks, [true, true, true, true, false]);
        assert_eq!(report.max_available_fit_range, 285.0);
        let failure = report.failure.unwrap();
        assert_eq!(
            failure,
            PreCheckFailure::Gradient {
                time_gradient: 0.0,
                time_limit: 700.0,
                altitude_gradient: 0.0,
                altitude_limit: 300.0,
                final_range: 285.0,
            }
        );
        assert_eq!(
            failure.to_string(),
            "failed gradient check: time gradient 0.000 limits range to 700.0 m, \
             altitude gradient 0.000 limits range to 300.0 m, final range 285.0 m"
        );
    }

    #[test]
    fn test_range_is_non_increasing_through_cascade() {
        let cfg = generous_config();
        let mut day = step_day(600.0);
        day.profiles_mut()[5].cloud_base = vec![650.0, -999.0, -999.0];
        let (profiles, rcs) = block(&day, 0, 30);
        let report = run_prechecks(&profiles, rcs.view(), day.range(), &cfg);
        assert!(report.passed(), "{:?}", report.failure);
        assert_eq!(report.cloud_range, 650.0);
        assert_eq!(report.variance_range, 650.0);
        assert_eq!(report.max_available_fit_range, 585.0);
        assert!(report.cloud_range <= cfg.thresholds.max_fit_range);
        assert!(report.variance_range <= report.cloud_range);
        assert!(report.max_available_fit_range <= report.variance_range);
    }

    #[test]
    fn test_failure_messages() {
        let f = PreCheckFailure::Variance {
            ratio: 0.12345,
            range: 650.0,
        };
        assert_eq!(f.to_string(), "failed variance check 0.123 at 650.0 m");
        assert_eq!(PreCheckFailure::NoData.to_string(), "contains no data");
    }
}
