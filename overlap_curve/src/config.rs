//! Static thresholds and the per-instrument configuration derived from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::reference::ReferenceCurve;
use crate::OvError;

/// Where the altitude-gradient limit of pre-check 5 lands relative to the
/// first exceeding bin.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "bins", rename_all = "snake_case")]
pub enum GradientOffset {
    /// Fixed bin offset into the full gradient range (historically 10).
    Fixed(usize),
    /// Index the eligible subset directly, no offset.
    SubsetAligned,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrecheckPolicy {
    pub altitude_gradient_offset: GradientOffset,
    /// Exceedances needed before a gradient limit applies (2 mirrors `> 1`).
    pub min_exceedances: usize,
}

impl Default for PrecheckPolicy {
    fn default() -> Self {
        Self {
            altitude_gradient_offset: GradientOffset::Fixed(10),
            min_exceedances: 2,
        }
    }
}

/// Thresholds as read from a configuration file. Times are minutes, ranges
/// metres.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub time_interval_length: f64,
    pub d_fit_time: f64,
    pub max_fit_range: f64,
    pub min_fit_length: f64,
    pub min_range_std_over_mean: f64,
    pub dt_sliding_variance: f64,
    pub max_std_over_mean: f64,
    pub max_relgrad: f64,
    pub max_relgrad_mean: f64,
    pub min_expected_zero_fit_value: f64,
    pub max_expected_zero_fit_value: f64,
    pub thresh_resid_rel: f64,
    pub thresh_resid_whole_zone: f64,
    pub max_overlap_value: f64,
    pub thresh_overlap_valid_rel_error: f64,
    pub sgolay_width: usize,
    pub sgolay_ord: usize,
    pub whiskers_length: f64,
    pub min_nb_samples_for_skipping_good_test: usize,
    pub good_samples_proportion: f64,
    pub min_nb_samples: usize,
    pub monotonic_check_bins: usize,
    pub precheck_policy: PrecheckPolicy,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            time_interval_length: 30.0,
            d_fit_time: 5.0,
            max_fit_range: 2000.0,
            min_fit_length: 300.0,
            min_range_std_over_mean: 100.0,
            dt_sliding_variance: 5.0,
            max_std_over_mean: 0.02,
            max_relgrad: 0.35,
            max_relgrad_mean: 0.05,
            min_expected_zero_fit_value: 3.0,
            max_expected_zero_fit_value: 9.0,
            thresh_resid_rel: 0.005,
            thresh_resid_whole_zone: 0.05,
            max_overlap_value: 1.2,
            thresh_overlap_valid_rel_error: 0.1,
            sgolay_width: 21,
            sgolay_ord: 2,
            whiskers_length: 1.5,
            min_nb_samples_for_skipping_good_test: 20,
            good_samples_proportion: 0.5,
            min_nb_samples: 10,
            monotonic_check_bins: 167,
            precheck_policy: PrecheckPolicy::default(),
        }
    }
}

impl Thresholds {
    /// Reads the two-column `name,value` table, skipping the header line.
    /// Names not known here are logged and ignored; missing names keep their
    /// defaults.
    pub fn from_table(text: &str) -> Result<Self, OvError> {
        let mut value = serde_json::to_value(Thresholds::default())
            .map_err(|e| OvError::InvalidConfig(e.to_string()))?;
        let fields = value
            .as_object_mut()
            .ok_or_else(|| OvError::InvalidConfig("thresholds are not a map".into()))?;

        for (lineno, line) in text.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, raw) = line.split_once(',').ok_or_else(|| {
                OvError::InvalidConfig(format!("line {}: expected `name,value`", lineno + 1))
            })?;
            let name = name.trim();
            let raw = raw.trim().trim_end_matches(',');
            let parsed: f64 = raw.parse().map_err(|_| {
                OvError::InvalidConfig(format!("line {}: `{raw}` is not a number", lineno + 1))
            })?;
            let Some(slot) = fields.get_mut(name) else {
                warn!(name, "ignoring unknown threshold");
                continue;
            };
            *slot = if slot.is_u64() {
                if parsed < 0.0 || parsed.fract() != 0.0 {
                    return Err(OvError::InvalidConfig(format!(
                        "{name} must be a non-negative integer, got {raw}"
                    )));
                }
                serde_json::Value::from(parsed as u64)
            } else if slot.is_number() {
                serde_json::Value::from(parsed)
            } else {
                warn!(name, "threshold cannot be set from a table");
                continue;
            };
        }
        serde_json::from_value(value).map_err(|e| OvError::InvalidConfig(e.to_string()))
    }

    /// SHA-256 of the canonical JSON encoding.
    pub fn fingerprint(&self) -> Result<String, OvError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| OvError::InvalidConfig(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }

    fn validate(&self) -> Result<(), OvError> {
        let positive = [
            ("time_interval_length", self.time_interval_length),
            ("d_fit_time", self.d_fit_time),
            ("dt_sliding_variance", self.dt_sliding_variance),
            ("min_fit_length", self.min_fit_length),
            ("max_fit_range", self.max_fit_range),
        ];
        for (name, v) in positive {
            if !(v.is_finite() && v > 0.0) {
                return Err(OvError::InvalidConfig(format!("{name} must be positive, got {v}")));
            }
        }
        if self.sgolay_width % 2 == 0 || self.sgolay_width < 3 {
            return Err(OvError::InvalidConfig(format!(
                "sgolay_width must be odd and at least 3, got {}",
                self.sgolay_width
            )));
        }
        if self.sgolay_ord >= self.sgolay_width {
            return Err(OvError::InvalidConfig(format!(
                "sgolay_ord {} must be below sgolay_width {}",
                self.sgolay_ord, self.sgolay_width
            )));
        }
        if self.monotonic_check_bins < self.sgolay_width {
            return Err(OvError::InvalidConfig(format!(
                "monotonic_check_bins {} is shorter than sgolay_width {}",
                self.monotonic_check_bins, self.sgolay_width
            )));
        }
        Ok(())
    }
}

/// Immutable per-file configuration: the static thresholds plus values
/// derived from the reference curve and the instrument range grid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub thresholds: Thresholds,
    pub d_fit_range: f64,
    pub d_fit_length: f64,
    /// First range where the reference curve exceeds 0.6.
    pub min_fit_range: f64,
    /// First range where the reference curve reaches 1.
    pub min_overlap_valid: f64,
    pub max_fit_length: f64,
    pub min_expected_slope: f64,
    pub max_expected_slope: f64,
    pub first_range_grad_altitude: f64,
    pub min_slope: f64,
    pub min_nb_good_samples: usize,
}

impl Config {
    pub fn derive(
        thresholds: &Thresholds,
        reference: &ReferenceCurve,
        range: &[f64],
        range_resolution: f64,
    ) -> Result<Self, OvError> {
        thresholds.validate()?;
        if reference.len() != range.len() {
            return Err(OvError::MalformedInput(format!(
                "reference curve has {} bins, range axis {}",
                reference.len(),
                range.len()
            )));
        }
        let d_fit_range = range_resolution.round_ties_even();
        if !(d_fit_range > 0.0) {
            return Err(OvError::InvalidConfig(format!(
                "range resolution {range_resolution} rounds to a non-positive step"
            )));
        }
        let min_fit_range = reference
            .first_range_where(range, |v| v > 0.6)
            .ok_or_else(|| OvError::InvalidConfig("reference curve never exceeds 0.6".into()))?;
        let min_overlap_valid = reference
            .first_range_where(range, |v| v >= 1.0)
            .ok_or_else(|| OvError::InvalidConfig("reference curve never reaches 1".into()))?;
        let slope_scale = -2.0 / std::f64::consts::LN_10;

        Ok(Self {
            thresholds: thresholds.clone(),
            d_fit_range,
            d_fit_length: d_fit_range,
            min_fit_range,
            min_overlap_valid,
            max_fit_length: thresholds.max_fit_range - min_fit_range,
            min_expected_slope: slope_scale * 10.0 * 1e-6,
            max_expected_slope: slope_scale * 0.1 * 1e-6,
            first_range_grad_altitude: min_fit_range,
            min_slope: -2.5e-4,
            min_nb_good_samples: (thresholds.good_samples_proportion
                * thresholds.min_nb_samples as f64)
                .floor()
                .max(0.0) as usize,
        })
    }

    /// Lowest range a fit window may end at for an interval to stay usable.
    pub fn min_required_range(&self) -> f64 {
        self.min_fit_range + self.thresholds.min_fit_length
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
