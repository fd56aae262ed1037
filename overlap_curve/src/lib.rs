//! Overlap-function candidate selection for ceilometer range-corrected
//! signal, one day at a time.

use chrono::{DateTime, Duration, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub mod aggregate;
pub mod candidates;
pub mod config;
pub mod gradient;
pub mod interval;
pub mod precheck;
pub mod reference;
pub mod savgol;
pub mod stats;
pub mod window;

#[cfg(test)]
mod test_support;

pub use aggregate::{DayResult, FinalOverlap};
pub use config::{Config, Thresholds};
pub use reference::ReferenceCurve;

#[derive(Error, Debug)]
pub enum OvError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("insufficient data for overlap computation")]
    InsufficientData,
}

/// One time sample of the instrument.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub time: DateTime<Utc>,
    /// Range-corrected signal, one value per range bin.
    pub rcs: Vec<f64>,
    /// Cloud-base heights in metres; negative or non-finite means none.
    pub cloud_base: Vec<f64>,
    /// 0 is clear sky.
    pub sky_condition: i32,
    pub internal_temperature: f64,
    /// False for profiles inserted to fill a time gap.
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl Profile {
    /// Placeholder for a missing sample.
    pub fn gap_filled(time: DateTime<Utc>, bins: usize) -> Self {
        Self {
            time,
            rcs: vec![f64::NAN; bins],
            cloud_base: vec![f64::NAN; 3],
            sky_condition: 0,
            internal_temperature: f64::NAN,
            valid: false,
        }
    }
}

/// A day of profiles on a shared range axis.
#[derive(Clone, Debug, PartialEq)]
pub struct DayProfiles {
    range: Vec<f64>,
    profiles: Vec<Profile>,
}

impl DayProfiles {
    pub fn new(range: Vec<f64>, profiles: Vec<Profile>) -> Result<Self, OvError> {
        if range.is_empty() {
            return Err(OvError::MalformedInput("empty range axis".into()));
        }
        if range.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(OvError::MalformedInput(
                "range axis is not strictly increasing".into(),
            ));
        }
        for (k, p) in profiles.iter().enumerate() {
            if p.rcs.len() != range.len() {
                return Err(OvError::MalformedInput(format!(
                    "profile {k} has {} bins, range axis {}",
                    p.rcs.len(),
                    range.len()
                )));
            }
            if p.cloud_base.is_empty() {
                return Err(OvError::MalformedInput(format!(
                    "profile {k} has no cloud-base entry"
                )));
            }
        }
        if profiles.windows(2).any(|w| w[1].time <= w[0].time) {
            return Err(OvError::MalformedInput(
                "profile times are not strictly increasing".into(),
            ));
        }
        if profiles.len() < 2 {
            return Err(OvError::InsufficientData);
        }
        Ok(Self { range, profiles })
    }

    pub fn range(&self) -> &[f64] {
        &self.range
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    #[cfg(test)]
    pub(crate) fn profiles_mut(&mut self) -> &mut [Profile] {
        &mut self.profiles
    }

    pub fn times(&self) -> Vec<DateTime<Utc>> {
        self.profiles.iter().map(|p| p.time).collect()
    }

    /// Signal of profiles `[start, end)` laid out (altitude × time).
    pub fn signal_block(&self, start: usize, end: usize) -> Array2<f64> {
        let block = &self.profiles[start..end];
        Array2::from_shape_fn((self.range.len(), block.len()), |(bin, k)| block[k].rcs[bin])
    }

    /// Median spacing between consecutive profiles.
    pub fn time_step(&self) -> Option<Duration> {
        let mut steps: Vec<i64> = self
            .profiles
            .windows(2)
            .map(|w| (w[1].time - w[0].time).num_milliseconds())
            .collect();
        if steps.is_empty() {
            return None;
        }
        steps.sort_unstable();
        Some(Duration::milliseconds(steps[steps.len() / 2]))
    }
}

/// Runs every interval of the day through the pre-checks and quality gates,
/// then pools, filters and averages the survivors.
pub fn process_day(
    day: &DayProfiles,
    reference: &ReferenceCurve,
    config: &Config,
) -> Result<DayResult, OvError> {
    if reference.len() != day.range().len() {
        return Err(OvError::MalformedInput(format!(
            "reference curve has {} bins, day has {}",
            reference.len(),
            day.range().len()
        )));
    }
    let intervals = interval::run_intervals(day, reference, config)?;
    let passed_prechecks = intervals.iter().filter(|r| r.prechecks.passed()).count();
    info!(
        profiles = day.profiles().len(),
        intervals = intervals.len(),
        passed_prechecks,
        "intervals evaluated"
    );
    Ok(aggregate::aggregate_day(day, reference, config, intervals))
}
