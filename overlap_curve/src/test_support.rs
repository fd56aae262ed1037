//! Synthetic days shared by the unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::config::{Config, Thresholds};
use crate::reference::ReferenceCurve;
use crate::{DayProfiles, Profile};

pub const BINS: usize = 250;
pub const RANGE_STEP: f64 = 15.0;

pub fn range_axis() -> Vec<f64> {
    (0..BINS).map(|i| RANGE_STEP * (i + 1) as f64).collect()
}

/// Smoothstep reaching full overlap at 450 m.
pub fn reference_for(range: &[f64]) -> ReferenceCurve {
    let values = range
        .iter()
        .map(|r| {
            let u = (r / 450.0).min(1.0);
            3.0 * u * u - 2.0 * u * u * u
        })
        .collect();
    ReferenceCurve::new(values).unwrap()
}

pub fn minute_times(n: usize) -> Vec<DateTime<Utc>> {
    let midnight = Utc.with_ymd_and_hms(2021, 6, 14, 0, 0, 0).unwrap();
    (0..n).map(|k| midnight + Duration::minutes(k as i64)).collect()
}

/// Wide limits: slope bounds around zero and a short maximum range.
pub fn generous_config() -> Config {
    let thresholds = Thresholds {
        max_fit_range: 700.0,
        min_fit_length: 90.0,
        max_std_over_mean: 0.05,
        max_overlap_value: 2.0,
        ..Thresholds::default()
    };
    let range = range_axis();
    let mut cfg = Config::derive(&thresholds, &reference_for(&range), &range, RANGE_STEP).unwrap();
    cfg.min_expected_slope = -1e-3;
    cfg.max_expected_slope = 1e-3;
    cfg
}

/// Clear sky, flat signal of 1e5 everywhere.
pub fn clear_day(n: usize) -> DayProfiles {
    let profiles = minute_times(n)
        .into_iter()
        .map(|time| Profile {
            time,
            rcs: vec![1e5; BINS],
            cloud_base: vec![-999.0; 3],
            sky_condition: 0,
            internal_temperature: 20.0,
            valid: true,
        })
        .collect();
    DayProfiles::new(range_axis(), profiles).unwrap()
}
