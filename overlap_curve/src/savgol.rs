//! Savitzky–Golay first derivative with polynomial fitting at the edges.
//!
//! Interior samples use the centred least-squares weights. The first and last
//! `window / 2` samples are taken from one polynomial fitted to the first (or
//! last) full window and differentiated at the sample's own position.

use crate::OvError;

/// Least-squares weights that map a window of `window` samples at
/// `x = idx - window / 2` to the first derivative of the fitted polynomial of
/// degree `order`, evaluated at `at`.
fn derivative_weights(window: usize, order: usize, at: f64) -> Result<Vec<f64>, OvError> {
    let half = (window / 2) as f64;
    let p = order + 1;

    let vander: Vec<Vec<f64>> = (0..window)
        .map(|idx| {
            let x = idx as f64 - half;
            let mut xk = 1.0;
            (0..p)
                .map(|_| {
                    let v = xk;
                    xk *= x;
                    v
                })
                .collect()
        })
        .collect();

    let mut aug = vec![vec![0.0; 2 * p]; p];
    for row in 0..p {
        for col in 0..p {
            aug[row][col] = vander.iter().map(|r| r[row] * r[col]).sum();
        }
        aug[row][p + row] = 1.0;
    }

    // Gauss-Jordan with partial pivoting.
    for col in 0..p {
        let pivot_row = (col..p)
            .max_by(|&a, &b| aug[a][col].abs().total_cmp(&aug[b][col].abs()))
            .unwrap_or(col);
        aug.swap(col, pivot_row);
        let pivot = aug[col][col];
        if pivot.abs() < 1e-12 {
            return Err(OvError::InvalidConfig(format!(
                "Savitzky-Golay normal matrix is singular (window {window}, order {order})"
            )));
        }
        for v in aug[col].iter_mut() {
            *v /= pivot;
        }
        for row in 0..p {
            if row != col {
                let factor = aug[row][col];
                if factor != 0.0 {
                    for k in 0..2 * p {
                        aug[row][k] -= factor * aug[col][k];
                    }
                }
            }
        }
    }

    // d/dx of x^k at `at`
    let dpoly: Vec<f64> = (0..p)
        .map(|k| if k == 0 { 0.0 } else { k as f64 * at.powi(k as i32 - 1) })
        .collect();

    let weights = vander
        .iter()
        .map(|vrow| {
            (0..p)
                .map(|k| {
                    let pinv_k: f64 = (0..p).map(|j| aug[k][p + j] * vrow[j]).sum();
                    dpoly[k] * pinv_k
                })
                .sum()
        })
        .collect();
    Ok(weights)
}

/// First derivative of `data` sampled every `delta` along the axis.
pub fn savgol_derivative(
    data: &[f64],
    window: usize,
    order: usize,
    delta: f64,
) -> Result<Vec<f64>, OvError> {
    if window % 2 == 0 || window < 3 {
        return Err(OvError::InvalidConfig(format!(
            "Savitzky-Golay window must be odd and at least 3, got {window}"
        )));
    }
    if order >= window {
        return Err(OvError::InvalidConfig(format!(
            "Savitzky-Golay order {order} must be below the window {window}"
        )));
    }
    if !(delta.is_finite() && delta != 0.0) {
        return Err(OvError::MalformedInput(format!("sample spacing {delta} is not usable")));
    }
    let n = data.len();
    if n < window {
        return Err(OvError::MalformedInput(format!(
            "{n} samples are fewer than the Savitzky-Golay window {window}"
        )));
    }

    let half = window / 2;
    let centre = derivative_weights(window, order, 0.0)?;
    let apply = |weights: &[f64], first: usize| -> f64 {
        weights
            .iter()
            .zip(&data[first..first + window])
            .map(|(w, v)| w * v)
            .sum::<f64>()
            / delta
    };

    let mut out = vec![0.0; n];
    for i in half..n - half {
        out[i] = apply(&centre, i - half);
    }
    for i in 0..half {
        let w = derivative_weights(window, order, i as f64 - half as f64)?;
        out[i] = apply(&w, 0);
    }
    let tail = n - window;
    for i in n - half..n {
        let w = derivative_weights(window, order, (i - tail) as f64 - half as f64)?;
        out[i] = apply(&w, tail);
    }
    Ok(out)
}
