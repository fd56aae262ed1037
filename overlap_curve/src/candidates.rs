//! Grid search over fitting windows with the four quality gates.
//!
//! Gates run in order: fit plausibility, overlap plausibility,
//! spatio-temporal homogeneity, monotonicity. A candidate that fails a gate
//! is [`Stage::Skipped`] for every later one and its report fields stay zero.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::gradient::relative_gradient_magnitude;
use crate::reference::ReferenceCurve;
use crate::savgol::savgol_derivative;
use crate::stats::{max_propagate, nan_argmin, nan_max, nan_mean};
use crate::window::{candidate_grid, FittingWindow, WindowMasks};
use crate::OvError;

/// Result of one gate for one candidate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Stage<T> {
    Passed(T),
    Failed(T),
    /// An earlier gate failed; nothing was computed.
    Skipped,
}

impl<T> Stage<T> {
    fn checked(passed: bool, value: T) -> Self {
        if passed {
            Stage::Passed(value)
        } else {
            Stage::Failed(value)
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Stage::Passed(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Stage::Passed(v) | Stage::Failed(v) => Some(v),
            Stage::Skipped => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FitDiagnostics {
    /// Bins inside the window.
    pub included_bins: usize,
    pub slope: f64,
    pub intercept: f64,
    /// RMS residual inside the window.
    pub residual: f64,
    pub residual_threshold: f64,
    /// Largest relative residual from `min_fit_range` up to the window end.
    pub whole_zone_residual: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OverlapDiagnostics {
    pub max_overlap: f64,
    pub relative_error: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HomogeneityDiagnostics {
    pub gradient_max: f64,
    pub gradient_mean: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MonotonicDiagnostics {
    pub min_derivative: f64,
    pub min_derivative_index: usize,
}

/// Thresholds the gates were evaluated against; shared by all rows of one
/// interval.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GateThresholds {
    pub min_slope_fit: f64,
    pub max_slope_fit: f64,
    pub min_intercept: f64,
    pub max_intercept: f64,
    pub whole_zone_residual: f64,
    pub max_overlap: f64,
    pub relative_error: f64,
    pub gradient_max: f64,
    pub gradient_mean: f64,
    pub min_derivative: f64,
}

impl GateThresholds {
    fn new(config: &Config, reference: &ReferenceCurve) -> Self {
        let t = &config.thresholds;
        Self {
            min_slope_fit: config.min_expected_slope,
            max_slope_fit: config.max_expected_slope,
            min_intercept: t.min_expected_zero_fit_value,
            max_intercept: t.max_expected_zero_fit_value,
            whole_zone_residual: t.thresh_resid_whole_zone,
            max_overlap: t.max_overlap_value * reference.max(),
            relative_error: t.thresh_overlap_valid_rel_error,
            gradient_max: t.max_relgrad,
            gradient_mean: t.max_relgrad_mean,
            min_derivative: config.min_slope,
        }
    }
}

/// One report row per grid candidate, failures included.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CandidateRow {
    pub window: FittingWindow,
    /// Index of the highest bin inside the window.
    pub last_window_bin: usize,
    pub fit: Stage<FitDiagnostics>,
    pub overlap: Stage<OverlapDiagnostics>,
    pub homogeneity: Stage<HomogeneityDiagnostics>,
    pub monotonic: Stage<MonotonicDiagnostics>,
    pub internal_temperature: f64,
    /// Corrected overlap curve; `None` when the fit gate failed.
    pub curve: Option<Vec<f64>>,
}

impl CandidateRow {
    pub fn pass_all(&self) -> bool {
        self.fit.passed()
            && self.overlap.passed()
            && self.homogeneity.passed()
            && self.monotonic.passed()
    }

    /// Curve with the zero fill applied.
    pub fn curve_or_zeros(&self, bins: usize) -> Vec<f64> {
        self.curve.clone().unwrap_or_else(|| vec![0.0; bins])
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct IntervalCandidates {
    pub rows: Vec<CandidateRow>,
    pub thresholds: GateThresholds,
    pub mean_temperature: f64,
}

impl IntervalCandidates {
    pub fn passing(&self) -> impl Iterator<Item = &CandidateRow> {
        self.rows.iter().filter(|r| r.pass_all())
    }
}

/// Evaluates the whole window grid for one interval. `rcs` is laid out
/// (altitude × time).
pub fn evaluate_candidates(
    rcs: ArrayView2<f64>,
    temperatures: &[f64],
    range: &[f64],
    max_available_fit_range: f64,
    config: &Config,
    reference: &ReferenceCurve,
) -> Result<IntervalCandidates, OvError> {
    let bins = range.len();
    if rcs.nrows() != bins || reference.len() != bins {
        return Err(OvError::MalformedInput(format!(
            "signal has {} bins, range {}, reference {}",
            rcs.nrows(),
            bins,
            reference.len()
        )));
    }
    let mean_temperature = nan_mean(temperatures.iter().copied());
    let thresholds = GateThresholds::new(config, reference);

    let windows = candidate_grid(config, max_available_fit_range);
    if windows.is_empty() {
        return Ok(IntervalCandidates {
            rows: Vec::new(),
            thresholds,
            mean_temperature,
        });
    }
    let masks = WindowMasks::build(&windows, range);

    let mean_log: Vec<f64> = rcs
        .outer_iter()
        .map(|row| nan_mean(row.iter().map(|v| v.abs().log10())))
        .collect();

    let mut rows: Vec<CandidateRow> = windows
        .iter()
        .enumerate()
        .map(|(c, window)| {
            let fit = fit_window(c, window, &masks, &mean_log, range, config, &thresholds);
            CandidateRow {
                window: *window,
                last_window_bin: masks.last_inside(c),
                fit,
                overlap: Stage::Skipped,
                homogeneity: Stage::Skipped,
                monotonic: Stage::Skipped,
                internal_temperature: mean_temperature,
                curve: None,
            }
        })
        .collect();

    let fit_survivors = rows.iter().filter(|r| r.fit.passed()).count();
    debug!(candidates = rows.len(), fit_survivors, "fit gate done");
    if fit_survivors == 0 {
        return Ok(IntervalCandidates {
            rows,
            thresholds,
            mean_temperature,
        });
    }

    // Factors are only kept while the homogeneity gate needs them.
    let mut factors: Vec<Option<Vec<f64>>> = vec![None; rows.len()];
    for (c, row) in rows.iter_mut().enumerate() {
        let Stage::Passed(fit) = &row.fit else {
            continue;
        };
        let factor = correction_factor(&mean_log, range, fit, row.window.stop());
        let curve: Vec<f64> = reference
            .values()
            .iter()
            .zip(&factor)
            .map(|(r, f)| r * f)
            .collect();
        row.overlap = overlap_gate(&curve, reference, range, config, &thresholds);
        row.curve = Some(curve);
        factors[c] = Some(factor);
    }

    let overlap_survivors: Vec<usize> = (0..rows.len())
        .filter(|&c| rows[c].overlap.passed())
        .collect();
    debug!(overlap_survivors = overlap_survivors.len(), "overlap gate done");
    if !overlap_survivors.is_empty() {
        let outcomes = homogeneity_gate(
            rcs,
            range,
            max_available_fit_range,
            &overlap_survivors,
            &factors,
            &masks,
            config,
        );
        for (&c, stage) in overlap_survivors.iter().zip(outcomes) {
            rows[c].homogeneity = stage;
        }
    }
    drop(factors);

    let check_bins = config.thresholds.monotonic_check_bins.min(bins);
    let delta = if bins > 1 { range[1] - range[0] } else { 0.0 };
    for row in rows.iter_mut().filter(|r| r.homogeneity.passed()) {
        let Some(curve) = row.curve.as_ref() else {
            continue;
        };
        row.monotonic = monotonic_gate(
            &curve[..check_bins],
            delta,
            row.last_window_bin,
            config,
        )?;
    }

    debug!(
        passing = rows.iter().filter(|r| r.pass_all()).count(),
        "quality gates done"
    );
    Ok(IntervalCandidates {
        rows,
        thresholds,
        mean_temperature,
    })
}

/// Least-squares line of mean log-signal against range inside the window.
/// Non-finite bins do not take part.
fn fit_window(
    c: usize,
    window: &FittingWindow,
    masks: &WindowMasks,
    mean_log: &[f64],
    range: &[f64],
    config: &Config,
    thresholds: &GateThresholds,
) -> Stage<FitDiagnostics> {
    let mut inside = Vec::with_capacity(masks.counts[c]);
    inside.extend((0..range.len()).filter(|&i| !masks.excluded(i, c)));
    let finite: Vec<usize> = inside
        .iter()
        .copied()
        .filter(|&i| mean_log[i].is_finite())
        .collect();

    let (slope, intercept) = if finite.len() < 2 {
        (f64::NAN, f64::NAN)
    } else {
        let n = finite.len() as f64;
        let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
        for &i in &finite {
            let (x, y) = (range[i], mean_log[i]);
            sx += x;
            sy += y;
            sxx += x * x;
            sxy += x * y;
        }
        let beta = (n * sxy - sx * sy) / (n * sxx - sx * sx);
        let alpha = sy / n - beta * sx / n;
        (beta, alpha)
    };
    let line = |x: f64| intercept + slope * x;

    let residual = (finite
        .iter()
        .map(|&i| (mean_log[i] - line(range[i])).powi(2))
        .sum::<f64>()
        / finite.len() as f64)
        .sqrt();
    let residual_threshold = config.thresholds.thresh_resid_rel
        * nan_mean(inside.iter().map(|&i| line(range[i])));
    let whole_zone_residual = max_propagate(
        (0..range.len())
            .filter(|&i| range[i] >= config.min_fit_range && range[i] <= window.stop())
            .map(|i| {
                let l = line(range[i]);
                (mean_log[i] - l).abs() / l.abs()
            }),
    );

    let passed = slope >= thresholds.min_slope_fit
        && slope <= thresholds.max_slope_fit
        && intercept >= thresholds.min_intercept
        && intercept <= thresholds.max_intercept
        && residual < residual_threshold
        && whole_zone_residual < thresholds.whole_zone_residual;

    Stage::checked(
        passed,
        FitDiagnostics {
            included_bins: masks.counts[c],
            slope,
            intercept,
            residual,
            residual_threshold,
            whole_zone_residual,
        },
    )
}

/// `10^(signal - line)` per bin, exactly 1 above the window end.
pub(crate) fn correction_factor(
    mean_log: &[f64],
    range: &[f64],
    fit: &FitDiagnostics,
    stop: f64,
) -> Vec<f64> {
    mean_log
        .iter()
        .zip(range)
        .map(|(&y, &r)| {
            if r > stop {
                1.0
            } else {
                10f64.powf(y - (fit.intercept + fit.slope * r))
            }
        })
        .collect()
}

fn overlap_gate(
    curve: &[f64],
    reference: &ReferenceCurve,
    range: &[f64],
    config: &Config,
    thresholds: &GateThresholds,
) -> Stage<OverlapDiagnostics> {
    let max_overlap = nan_max(curve.iter().copied());
    let relative_error = nan_max(
        curve
            .iter()
            .zip(reference.values())
            .zip(range)
            .filter(|(_, &r)| r >= config.min_overlap_valid)
            .map(|((c, o), _)| (o - c).abs() / o.abs()),
    );
    let passed =
        max_overlap <= thresholds.max_overlap && relative_error < thresholds.relative_error;
    Stage::checked(
        passed,
        OverlapDiagnostics {
            max_overlap,
            relative_error,
        },
    )
}

/// Gradient magnitude of the corrected log-signal over the whole interval,
/// computed and reduced one candidate at a time.
fn homogeneity_gate(
    rcs: ArrayView2<f64>,
    range: &[f64],
    max_available_fit_range: f64,
    survivors: &[usize],
    factors: &[Option<Vec<f64>>],
    masks: &WindowMasks,
    config: &Config,
) -> Vec<Stage<HomogeneityDiagnostics>> {
    let t = &config.thresholds;
    let bins: Vec<usize> = (0..range.len())
        .filter(|&i| range[i] >= t.min_range_std_over_mean && range[i] < max_available_fit_range)
        .collect();
    let profiles = rcs.ncols();
    let rows = bins.len().saturating_sub(1);
    let cols = profiles.saturating_sub(1);

    survivors
        .iter()
        .map(|&c| {
            let Some(factor) = factors[c].as_ref() else {
                return Stage::Skipped;
            };
            let field = Array2::from_shape_fn((bins.len(), profiles), |(row, col)| {
                let bin = bins[row];
                (rcs[[bin, col]].abs() / factor[bin]).log10()
            });
            let magnitude = relative_gradient_magnitude(field.view());

            let last_inside = masks.last_inside(c);
            let mut row_means = Vec::new();
            let mut peak = f64::NAN;
            for row in 1..rows {
                let bin = bins[row];
                if masks.top[[bin, c]] || bin == last_inside {
                    continue;
                }
                let values: Vec<f64> = (1..cols)
                    .map(|col| magnitude[[row, col]])
                    .filter(|v| v.is_finite())
                    .collect();
                if values.is_empty() {
                    continue;
                }
                peak = nan_max(values.iter().copied().chain(std::iter::once(peak)));
                row_means.push(nan_mean(values.iter().copied()));
            }
            let gradient_mean = nan_mean(row_means.iter().copied());
            let passed = peak <= t.max_relgrad && gradient_mean <= t.max_relgrad_mean;
            Stage::checked(
                passed,
                HomogeneityDiagnostics {
                    gradient_max: peak,
                    gradient_mean,
                },
            )
        })
        .collect()
}

/// A dip in the smoothed derivative is tolerated only above the window end.
fn monotonic_gate(
    curve: &[f64],
    delta: f64,
    last_window_bin: usize,
    config: &Config,
) -> Result<Stage<MonotonicDiagnostics>, OvError> {
    let t = &config.thresholds;
    let slope = savgol_derivative(curve, t.sgolay_width, t.sgolay_ord, delta)?;
    let Some((index, min_derivative)) = nan_argmin(&slope) else {
        return Ok(Stage::Failed(MonotonicDiagnostics {
            min_derivative: f64::NAN,
            min_derivative_index: 0,
        }));
    };
    let passed = min_derivative >= config.min_slope || index > last_window_bin;
    Ok(Stage::checked(
        passed,
        MonotonicDiagnostics {
            min_derivative,
            min_derivative_index: index,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{clear_day, generous_config, reference_for};
    use ndarray::Array2;

    fn evaluate(rcs: &Array2<f64>, range: &[f64], max_range: f64, cfg: &Config) -> IntervalCandidates {
        let reference = reference_for(range);
        let temps = vec![20.0; rcs.ncols()];
        evaluate_candidates(rcs.view(), &temps, range, max_range, cfg, &reference).unwrap()
    }

    #[test]
    fn test_flat_signal_passes_every_gate() {
        let cfg = generous_config();
        let day = clear_day(48);
        let rcs = day.signal_block(0, 30);
        let out = evaluate(&rcs, day.range(), 660.0, &cfg);
        assert!(!out.rows.is_empty());
        assert!(out.rows.iter().all(|r| r.fit.passed()));
        assert!(out.rows.iter().all(|r| r.pass_all()));
        assert_eq!(out.mean_temperature, 20.0);
        // 270 m to 360 m inclusive
        assert_eq!(out.rows[0].window.start, 270.0);
        assert_eq!(out.rows[0].fit.value().unwrap().included_bins, 7);
        let reference = reference_for(day.range());
        for row in &out.rows {
            assert_eq!(row.curve.as_deref(), Some(reference.values()));
        }
    }

    #[test]
    fn test_factor_is_one_above_window_end() {
        let range: Vec<f64> = (1..=20).map(|i| 15.0 * i as f64).collect();
        let mean_log: Vec<f64> = range.iter().map(|r| 6.0 - 1e-3 * r + 0.01 * (r / 15.0).sin()).collect();
        let fit = FitDiagnostics {
            slope: -1e-3,
            intercept: 6.0,
            ..FitDiagnostics::default()
        };
        let stop = 150.0;
        let factor = correction_factor(&mean_log, &range, &fit, stop);
        for (f, r) in factor.iter().zip(&range) {
            if *r > stop {
                assert_eq!(*f, 1.0);
            } else {
                assert!((f - 10f64.powf(0.01 * (r / 15.0).sin())).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_decaying_signal_recovers_slope() {
        let cfg = generous_config();
        let day = clear_day(48);
        let range = day.range().to_vec();
        let rcs = Array2::from_shape_fn((range.len(), 30), |(i, _)| {
            10f64.powf(5.0 - 2e-6 * range[i])
        });
        let out = evaluate(&rcs, &range, 660.0, &cfg);
        let fit = out.rows[0].fit.value().unwrap();
        assert!((fit.slope + 2e-6).abs() < 1e-9);
        assert!((fit.intercept - 5.0).abs() < 1e-6);
        assert!(out.rows[0].fit.passed());
    }

    #[test]
    fn test_gate_short_circuit_zero_fills() {
        let cfg = generous_config();
        let day = clear_day(48);
        // steep decay outside the slope limits
        let range = day.range().to_vec();
        let rcs = Array2::from_shape_fn((range.len(), 30), |(i, _)| {
            10f64.powf(5.0 - 1e-2 * range[i])
        });
        let out = evaluate(&rcs, &range, 660.0, &cfg);
        assert!(!out.rows.is_empty());
        for row in &out.rows {
            assert!(matches!(row.fit, Stage::Failed(_)));
            assert_eq!(row.overlap, Stage::Skipped);
            assert_eq!(row.homogeneity, Stage::Skipped);
            assert_eq!(row.monotonic, Stage::Skipped);
            assert!(row.curve.is_none());
            assert!(row.curve_or_zeros(range.len()).iter().all(|&v| v == 0.0));
            assert!(!row.pass_all());
        }
    }

    #[test]
    fn test_overlap_gate_rejects_large_deviation() {
        let cfg = generous_config();
        let day = clear_day(48);
        let range = day.range().to_vec();
        // a strong bump just above full overlap, inside the windows
        let rcs = Array2::from_shape_fn((range.len(), 30), |(i, _)| {
            if (465.0..=480.0).contains(&range[i]) {
                1e5 * 3.0
            } else {
                1e5
            }
        });
        let mut cfg = cfg;
        cfg.thresholds.thresh_resid_rel = 1.0;
        cfg.thresholds.thresh_resid_whole_zone = 10.0;
        let out = evaluate(&rcs, &range, 660.0, &cfg);
        let covering: Vec<&CandidateRow> = out
            .rows
            .iter()
            .filter(|r| r.window.stop() >= 480.0 && r.fit.passed())
            .collect();
        assert!(!covering.is_empty());
        for row in covering {
            assert!(matches!(row.overlap, Stage::Failed(_)), "{:?}", row.window);
            assert_eq!(row.homogeneity, Stage::Skipped);
        }
    }

    #[test]
    fn test_homogeneity_gate_rejects_only_windows_over_time_step() {
        let mut cfg = generous_config();
        cfg.thresholds.thresh_resid_rel = 1.0;
        cfg.thresholds.thresh_resid_whole_zone = 10.0;
        cfg.thresholds.max_overlap_value = 10.0;
        cfg.thresholds.thresh_overlap_valid_rel_error = 10.0;
        let day = clear_day(48);
        let range = day.range().to_vec();
        // signal jumps tenfold halfway through the interval between 510 m and 540 m
        let rcs = Array2::from_shape_fn((range.len(), 30), |(i, k)| {
            if (510.0..=540.0).contains(&range[i]) && k >= 15 {
                1e6
            } else {
                1e5
            }
        });
        let out = evaluate(&rcs, &range, 660.0, &cfg);

        let below: Vec<&CandidateRow> = out.rows.iter().filter(|r| r.window.stop() <= 495.0).collect();
        assert!(!below.is_empty());
        assert!(below.iter().all(|r| r.pass_all()));

        let over: Vec<&CandidateRow> = out
            .rows
            .iter()
            .filter(|r| r.window.stop() >= 555.0 && r.homogeneity.value().is_some())
            .collect();
        assert!(!over.is_empty());
        for row in over {
            assert!(matches!(row.homogeneity, Stage::Failed(_)), "{:?}", row.window);
            assert!(row.homogeneity.value().unwrap().gradient_max > cfg.thresholds.max_relgrad);
            assert_eq!(row.monotonic, Stage::Skipped);
        }
    }

    #[test]
    fn test_monotonic_gate_tolerates_dip_above_window() {
        let cfg = generous_config();
        let delta = 15.0;
        let mut curve: Vec<f64> = (0..60).map(|i| (i as f64 / 30.0).min(1.0)).collect();
        for v in curve.iter_mut().skip(45) {
            *v = 0.5;
        }
        let dip_inside = monotonic_gate(&curve, delta, 50, &cfg).unwrap();
        assert!(matches!(dip_inside, Stage::Failed(_)));
        let dip_above = monotonic_gate(&curve, delta, 20, &cfg).unwrap();
        assert!(dip_above.passed());
        let d = dip_above.value().unwrap();
        assert!(d.min_derivative < cfg.min_slope);
        assert!(d.min_derivative_index > 20);
    }

    #[test]
    fn test_empty_grid_yields_no_rows() {
        let cfg = generous_config();
        let day = clear_day(48);
        let rcs = day.signal_block(0, 30);
        let out = evaluate(&rcs, day.range(), cfg.min_fit_range, &cfg);
        assert!(out.rows.is_empty());
        assert_eq!(out.passing().count(), 0);
    }
}
