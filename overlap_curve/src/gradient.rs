//! Sobel-type finite differences on log-signal fields laid out as
//! (altitude × time).
//!
//! The convolution is the centred "same size" form with zero padding. Every
//! kernel tap is multiplied in, including the zero taps, so a NaN anywhere in
//! the 3×3 neighbourhood poisons the output bin. Border rows and columns are
//! not meaningful; callers drop them.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradientAxis {
    Altitude,
    Time,
}

/// Rows index altitude, columns index time.
const ALTITUDE_KERNEL: [[f64; 3]; 3] = [[1.0, 2.0, 1.0], [0.0, 0.0, 0.0], [-1.0, -2.0, -1.0]];
const TIME_KERNEL: [[f64; 3]; 3] = [[1.0, 0.0, -1.0], [2.0, 0.0, -2.0], [1.0, 0.0, -1.0]];

impl GradientAxis {
    fn kernel(self) -> &'static [[f64; 3]; 3] {
        match self {
            GradientAxis::Altitude => &ALTITUDE_KERNEL,
            GradientAxis::Time => &TIME_KERNEL,
        }
    }
}

/// Gradient of `field` along `axis`; output has the input's shape.
pub fn sobel(field: ArrayView2<f64>, axis: GradientAxis) -> Array2<f64> {
    let (rows, cols) = field.dim();
    let kernel = axis.kernel();
    let mut out = Array2::<f64>::zeros((rows, cols));
    for p in 0..rows {
        for q in 0..cols {
            let mut acc = 0.0;
            for (a, krow) in kernel.iter().enumerate() {
                let r = p as isize + 1 - a as isize;
                if r < 0 || r >= rows as isize {
                    continue;
                }
                for (b, &k) in krow.iter().enumerate() {
                    let c = q as isize + 1 - b as isize;
                    if c < 0 || c >= cols as isize {
                        continue;
                    }
                    acc += field[[r as usize, c as usize]] * k;
                }
            }
            out[[p, q]] = acc;
        }
    }
    out
}

/// `sqrt(gx² + gy²) / |field|` per bin.
pub fn relative_gradient_magnitude(field: ArrayView2<f64>) -> Array2<f64> {
    let ga = sobel(field, GradientAxis::Altitude);
    let gt = sobel(field, GradientAxis::Time);
    let mut out = Array2::<f64>::zeros(field.dim());
    ndarray::Zip::from(&mut out)
        .and(&ga)
        .and(&gt)
        .and(&field)
        .for_each(|o, &a, &t, &f| {
            *o = (a * a + t * t).sqrt() / f.abs();
        });
    out
}
