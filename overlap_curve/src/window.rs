//! Candidate fitting-window grid and its altitude masks.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::stats::arange;

/// One altitude window `[start, stop]` considered for a linear fit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct FittingWindow {
    pub start: f64,
    pub length: f64,
}

impl FittingWindow {
    pub fn stop(&self) -> f64 {
        self.start + self.length
    }
}

/// Start-major grid of windows for one interval. Starts step from
/// `min_fit_range` below `max_available_fit_range`; lengths step from
/// `min_fit_length` below `max_fit_length`. Windows ending past the last start
/// are dropped.
pub fn candidate_grid(config: &Config, max_available_fit_range: f64) -> Vec<FittingWindow> {
    let lengths = arange(
        config.thresholds.min_fit_length,
        config.max_fit_length,
        config.d_fit_length,
    );
    let starts = arange(config.min_fit_range, max_available_fit_range, config.d_fit_range);
    let Some(&last_start) = starts.last() else {
        return Vec::new();
    };
    starts
        .iter()
        .flat_map(|&start| lengths.iter().map(move |&length| FittingWindow { start, length }))
        .filter(|w| w.stop() <= last_start)
        .collect()
}

/// Per-candidate exclusion masks over the altitude axis, shaped
/// (bins × candidates).
#[derive(Clone, Debug)]
pub struct WindowMasks {
    pub bottom: Array2<bool>,
    pub top: Array2<bool>,
    /// Bins left for fitting per candidate.
    pub counts: Vec<usize>,
    first_above: Vec<usize>,
}

impl WindowMasks {
    pub fn build(windows: &[FittingWindow], range: &[f64]) -> Self {
        let shape = (range.len(), windows.len());
        let bottom = Array2::from_shape_fn(shape, |(i, c)| range[i] < windows[c].start);
        let top = Array2::from_shape_fn(shape, |(i, c)| range[i] > windows[c].stop());
        let counts = (0..windows.len())
            .map(|c| {
                (0..range.len())
                    .filter(|&i| !bottom[[i, c]] && !top[[i, c]])
                    .count()
            })
            .collect();
        let first_above = (0..windows.len())
            .map(|c| (0..range.len()).find(|&i| top[[i, c]]).unwrap_or(range.len()))
            .collect();
        Self {
            bottom,
            top,
            counts,
            first_above,
        }
    }

    pub fn excluded(&self, bin: usize, candidate: usize) -> bool {
        self.bottom[[bin, candidate]] || self.top[[bin, candidate]]
    }

    /// Index of the highest bin at or below the window end.
    pub fn last_inside(&self, candidate: usize) -> usize {
        self.first_above[candidate].saturating_sub(1)
    }
}
