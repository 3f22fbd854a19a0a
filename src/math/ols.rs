//! Least squares solves.
//!
//! The engine repeatedly solves small linear least-squares problems:
//!
//! ```text
//! minimize ‖A x − b‖²                      (tail regression, Gauss–Newton steps)
//! minimize ‖J δ + r‖² + λ Σ d_k δ_k²       (damped Levenberg–Marquardt steps)
//! ```
//!
//! Implementation choices:
//! - SVD everywhere, so tall and rank-deficient systems are handled without
//!   forming normal equations.
//! - The damped problem is solved as an augmented system `[J; √(λD)] δ = [−r; 0]`.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Progressively looser singular-value cutoffs.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Levenberg–Marquardt step: minimize `‖J δ + r‖² + λ Σ d_k δ_k²`.
///
/// `scale` holds the per-column damping weights `d_k` (typically `diag(JᵀJ)`).
pub fn solve_damped(
    jac: &DMatrix<f64>,
    residuals: &DVector<f64>,
    lambda: f64,
    scale: &[f64],
) -> Option<DVector<f64>> {
    let (m, n) = jac.shape();
    if scale.len() != n || residuals.len() != m {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(m + n, n);
    a.view_mut((0, 0), (m, n)).copy_from(jac);
    for (k, d) in scale.iter().enumerate() {
        a[(m + k, k)] = (lambda * d.max(1e-12)).sqrt();
    }
    let mut b = DVector::<f64>::zeros(m + n);
    for i in 0..m {
        b[i] = -residuals[i];
    }
    solve_least_squares(&a, &b)
}

/// Ordinary straight-line fit `y ≈ a + b x`, returning `(a, b)`.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let design = DMatrix::from_fn(x.len(), 2, |i, j| if j == 0 { 1.0 } else { x[i] });
    let rhs = DVector::from_column_slice(y);
    let beta = solve_least_squares(&design, &rhs)?;
    Some((beta[0], beta[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn damping_shrinks_the_step() {
        let j = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let r = DVector::from_row_slice(&[-1.0, -2.0, -3.0]);
        let undamped = solve_damped(&j, &r, 0.0, &[1.0, 1.0]).unwrap();
        let damped = solve_damped(&j, &r, 10.0, &[1.0, 1.0]).unwrap();
        assert!((undamped[0] - 1.0).abs() < 1e-10);
        assert!((undamped[1] - 2.0).abs() < 1e-10);
        assert!(damped.norm() < undamped.norm());
    }

    #[test]
    fn line_fit_recovers_intercept() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y: Vec<f64> = x.iter().map(|v| 4.0 - 0.5 * v).collect();
        let (a, b) = linear_fit(&x, &y).unwrap();
        assert!((a - 4.0).abs() < 1e-10);
        assert!((b + 0.5).abs() < 1e-10);
    }
}
