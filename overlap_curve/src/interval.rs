//! Sliding time intervals over one day and their per-interval reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candidates::{evaluate_candidates, CandidateRow, IntervalCandidates};
use crate::config::Config;
use crate::precheck::{minutes, run_prechecks, PreCheckReport};
use crate::reference::ReferenceCurve;
use crate::stats::mode;
use crate::{DayProfiles, OvError};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IntervalReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Profiles `[start_index, end_index)` form the interval.
    pub start_index: usize,
    pub end_index: usize,
    pub prechecks: PreCheckReport,
    /// Present only when every pre-check passed.
    pub candidates: Option<IntervalCandidates>,
}

impl IntervalReport {
    /// Human-readable pre-check outcome.
    pub fn reason(&self) -> String {
        match &self.prechecks.failure {
            Some(failure) => failure.to_string(),
            None => format!(
                "passed pre-checks, max range {:.1} m",
                self.prechecks.max_available_fit_range
            ),
        }
    }

    pub fn passing_rows(&self) -> impl Iterator<Item = &CandidateRow> {
        self.candidates.iter().flat_map(|c| c.passing())
    }
}

/// `[start, end)` profile index pairs, one per interval start. Every interval
/// has the modal width so timestamp jitter does not change its size.
pub fn interval_bounds(times: &[DateTime<Utc>], config: &Config) -> Vec<(usize, usize)> {
    let (Some(&first), Some(&last)) = (times.first(), times.last()) else {
        return Vec::new();
    };
    let step = minutes(config.thresholds.d_fit_time);
    let length = minutes(config.thresholds.time_interval_length);
    if step <= chrono::Duration::zero() {
        return Vec::new();
    }

    let mut nominal = Vec::new();
    let mut start_time = first;
    while start_time <= last {
        let start = times.iter().position(|&t| t >= start_time);
        let end = times.iter().rposition(|&t| t <= start_time + length);
        if let (Some(start), Some(end)) = (start, end) {
            nominal.push((start, end));
        }
        start_time += step;
    }

    let widths: Vec<i64> = nominal.iter().map(|&(s, e)| e as i64 - s as i64).collect();
    let Some(width) = mode(&widths).filter(|&w| w > 0) else {
        return Vec::new();
    };
    nominal
        .into_iter()
        .map(|(s, _)| (s, s + width as usize))
        .filter(|&(s, e)| e < times.len() && times[s] <= last - length)
        .collect()
}

/// Runs the pre-checks and, where they pass, the quality gates for every
/// interval of the day.
pub fn run_intervals(
    day: &DayProfiles,
    reference: &ReferenceCurve,
    config: &Config,
) -> Result<Vec<IntervalReport>, OvError> {
    let times = day.times();
    let mut reports = Vec::new();
    for (start, end) in interval_bounds(&times, config) {
        let profiles = &day.profiles()[start..end];
        let rcs = day.signal_block(start, end);
        let prechecks = run_prechecks(profiles, rcs.view(), day.range(), config);

        let candidates = if prechecks.passed() {
            let temperatures: Vec<f64> =
                profiles.iter().map(|p| p.internal_temperature).collect();
            Some(evaluate_candidates(
                rcs.view(),
                &temperatures,
                day.range(),
                prechecks.max_available_fit_range,
                config,
                reference,
            )?)
        } else {
            None
        };

        let report = IntervalReport {
            start: times[start],
            end: times[end],
            start_index: start,
            end_index: end,
            prechecks,
            candidates,
        };
        debug!(
            start = %report.start,
            end = %report.end,
            passing = report.passing_rows().count(),
            reason = %report.reason(),
            "interval done"
        );
        reports.push(report);
    }
    Ok(reports)
}
