//! The externally supplied reference overlap curve.

use serde::{Deserialize, Serialize};

use crate::stats::interp;
use crate::OvError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReferenceCurve {
    values: Vec<f64>,
}

impl ReferenceCurve {
    pub fn new(values: Vec<f64>) -> Result<Self, OvError> {
        if values.is_empty() {
            return Err(OvError::MalformedInput("reference curve is empty".into()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(OvError::MalformedInput(format!(
                "reference curve bin {idx} is not finite"
            )));
        }
        Ok(Self { values })
    }

    /// Linear resampling from `from_range` onto `to_range`, holding the end
    /// values outside the source grid.
    pub fn resample(&self, from_range: &[f64], to_range: &[f64]) -> Result<Self, OvError> {
        if from_range.len() != self.values.len() {
            return Err(OvError::MalformedInput(format!(
                "reference curve has {} bins but its range axis {}",
                self.values.len(),
                from_range.len()
            )));
        }
        if from_range.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(OvError::MalformedInput(
                "reference range axis is not strictly increasing".into(),
            ));
        }
        let values = to_range
            .iter()
            .map(|&r| interp(r, from_range, &self.values))
            .collect();
        Self::new(values)
    }

    /// Range of the first bin whose value satisfies `predicate`.
    pub fn first_range_where<F>(&self, range: &[f64], predicate: F) -> Option<f64>
    where
        F: Fn(f64) -> bool,
    {
        self.values
            .iter()
            .zip(range)
            .find(|&(&v, _)| predicate(v))
            .map(|(_, &r)| r)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}
