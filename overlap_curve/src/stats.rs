//! NaN-aware reductions shared by the checks.
//!
//! Missing (gap-filled) profiles arrive as NaN, so most reductions skip NaN the
//! way the array-library `nan*` family does. The few places that must let NaN
//! through (running maxima) use [`max_propagate`].

use ordered_float::OrderedFloat;

/// Mean over finite-or-infinite, non-NaN values. NaN when nothing is left.
pub fn nan_mean<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Population standard deviation (ddof = 0) ignoring NaN.
pub fn nan_std(values: &[f64]) -> f64 {
    let mean = nan_mean(values.iter().copied());
    if mean.is_nan() {
        return f64::NAN;
    }
    if mean.is_infinite() {
        return f64::NAN;
    }
    let mut acc = 0.0;
    let mut count = 0usize;
    for &v in values {
        if !v.is_nan() {
            let d = v - mean;
            acc += d * d;
            count += 1;
        }
    }
    (acc / count as f64).sqrt()
}

/// Median ignoring NaN; mean of the two middle values for even counts.
pub fn nan_median(values: &[f64]) -> f64 {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if kept.is_empty() {
        return f64::NAN;
    }
    kept.sort_by_key(|v| OrderedFloat(*v));
    let mid = kept.len() / 2;
    if kept.len() % 2 == 0 {
        (kept[mid - 1] + kept[mid]) / 2.0
    } else {
        kept[mid]
    }
}

/// Maximum ignoring NaN. NaN when every value is NaN or the input is empty.
pub fn nan_max<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(f64::NAN, |acc, v| if acc.is_nan() || v > acc { v } else { acc })
}

/// Minimum ignoring NaN, with the index of its first occurrence.
pub fn nan_argmin(values: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v >= b => {}
            _ => best = Some((idx, v)),
        }
    }
    best
}

/// Maximum that lets NaN win, like an element-wise `maximum` reduction.
pub fn max_propagate<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let mut out = f64::NEG_INFINITY;
    let mut any = false;
    for v in values {
        any = true;
        if v.is_nan() {
            return f64::NAN;
        }
        if v > out {
            out = v;
        }
    }
    if any {
        out
    } else {
        f64::NAN
    }
}

/// Element-wise maximum of two values where NaN wins.
pub fn maximum(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

/// Matlab-compatible percentile: sorted samples sit at ranks `(2k-1)/(2n)`,
/// the requested quantile is linearly interpolated between them and clamped
/// to the extremes outside `[1/(2n), (2n-1)/(2n)]`.
pub fn prctile(values: &[f64], percent: f64) -> f64 {
    quantile(values, percent / 100.0)
}

pub fn quantile(values: &[f64], q: f64) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by_key(|v| OrderedFloat(*v));
    if n == 1 {
        return sorted[0];
    }
    let rank = |k: usize| (2 * k + 1) as f64 / (2 * n) as f64;
    if q <= rank(0) {
        return sorted[0];
    }
    if q >= rank(n - 1) {
        return sorted[n - 1];
    }
    let pos = q * n as f64 - 0.5;
    let lo = (pos.floor() as usize).min(n - 2);
    let frac = (q - rank(lo)) / (rank(lo + 1) - rank(lo));
    sorted[lo] + (sorted[lo + 1] - sorted[lo]) * frac
}

/// Most frequent value; the smallest one wins ties.
pub fn mode(values: &[i64]) -> Option<i64> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mut best: Option<(i64, usize)> = None;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        let count = j - i;
        match best {
            Some((_, c)) if c >= count => {}
            _ => best = Some((sorted[i], count)),
        }
        i = j;
    }
    best.map(|(v, _)| v)
}

/// Evenly stepped values from `start` (inclusive) to `stop` (exclusive).
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step <= 0.0 || !(stop > start) {
        return Vec::new();
    }
    let count = ((stop - start) / step).ceil() as usize;
    (0..count).map(|i| start + step * i as f64).collect()
}

/// Piecewise-linear interpolation clamped to the end values.
pub fn interp(target: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let len = xs.len().min(ys.len());
    if len == 0 {
        return f64::NAN;
    }
    if target <= xs[0] {
        return ys[0];
    }
    for i in 1..len {
        if target <= xs[i] {
            let (x0, x1) = (xs[i - 1], xs[i]);
            let (y0, y1) = (ys[i - 1], ys[i]);
            if (x1 - x0).abs() < f64::EPSILON {
                return y1;
            }
            let frac = ((target - x0) / (x1 - x0)).clamp(0.0, 1.0);
            return y0 + (y1 - y0) * frac;
        }
    }
    ys[len - 1]
}
