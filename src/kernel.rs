//! Host ground-cost kernel.
//!
//! Ground cost is `c(x, y) = |x − y|^p / p`, so that `∇ₓc(x, y) = |x − y|^{p−2} (x − y)`
//! (for `p = 2`: `x − y`). Distances come from `wass::euclidean_cost_matrix`, which keeps the
//! host path on the same Euclidean convention as the solver crate.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

#[inline]
pub fn ground_cost(dist: f32, p: f32) -> f32 {
    if p == 2.0 {
        0.5 * dist * dist
    } else {
        dist.powf(p) / p
    }
}

fn check_shapes(x: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Result<()> {
    if x.ncols() != y.ncols() {
        return Err(Error::InvalidInput(format!(
            "dimension mismatch: source d={} vs target d={}",
            x.ncols(),
            y.ncols()
        )));
    }
    Ok(())
}

/// `n×m` matrix of `c(x_i, y_j)`.
pub fn cost_matrix(x: &ArrayView2<f32>, y: &ArrayView2<f32>, p: f32) -> Result<Array2<f32>> {
    check_shapes(x, y)?;
    let dist = wass::euclidean_cost_matrix(&x.to_owned(), &y.to_owned());
    Ok(dist.mapv(|d| ground_cost(d, p)))
}

/// `Σ_j plan[i,j] ∇ₓc(x_i, y_j)` with `y` held fixed (envelope gradient of `⟨C(x), P⟩`).
pub fn transport_gradient(
    x: &ArrayView2<f32>,
    y: &ArrayView2<f32>,
    plan: &ArrayView2<f32>,
    p: f32,
) -> Result<Array2<f32>> {
    check_shapes(x, y)?;
    let (n, d) = x.dim();
    let m = y.nrows();
    if plan.dim() != (n, m) {
        return Err(Error::InvalidInput(format!(
            "plan shape {:?} does not match ({n}, {m})",
            plan.dim()
        )));
    }
    let mut grad = Array2::<f32>::zeros((n, d));
    let mut diff = vec![0.0f32; d];
    for i in 0..n {
        for j in 0..m {
            let pij = plan[[i, j]];
            if pij == 0.0 {
                continue;
            }
            let mut r2 = 0.0f32;
            for k in 0..d {
                diff[k] = x[[i, k]] - y[[j, k]];
                r2 += diff[k] * diff[k];
            }
            let w = if p == 2.0 {
                pij
            } else if r2 == 0.0 {
                // Subgradient 0 at coincident points (p < 2 is singular there).
                0.0
            } else {
                pij * r2.sqrt().powf(p - 2.0)
            };
            for k in 0..d {
                grad[[i, k]] += w * diff[k];
            }
        }
    }
    Ok(grad)
}
