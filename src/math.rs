//! Dense linear algebra on matrices that are reversible with respect to a
//! known stationary distribution.
//!
//! A matrix `A` with `π[i] A[i][j] = π[j] A[j][i]` is similar to the symmetric
//! matrix `S = Π^{1/2} A Π^{-1/2}`, so functions of `A` can be computed from
//! the real eigendecomposition of `S`:
//!
//! `f(A) = Π^{-1/2} U f(Λ) Uᵀ Π^{1/2}`

use faer::{Mat, Side};
use itertools::Itertools;

use crate::error::{RateMatrixError, Result};

/// Eigenvalues of a transition matrix below this have no usable logarithm.
const MIN_LOG_EIGENVALUE: f64 = 1e-12;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, |acc, val| {
            if acc == f64::NEG_INFINITY {
                val
            } else {
                logaddexp(acc, val)
            }
        })
}

/// Eigendecomposition of the symmetrized form of a reversible matrix.
struct ReversibleEigen {
    values: Vec<f64>,
    vectors: Mat<f64>,
    sqrt_pi: Vec<f64>,
}

impl ReversibleEigen {
    fn new(matrix: &Mat<f64>, stationary: &[f64]) -> Option<Self> {
        let n = matrix.nrows();
        let sqrt_pi = stationary.iter().map(|p| p.sqrt()).collect_vec();

        // Rounding leaves the similarity transform slightly asymmetric.
        let sym = Mat::from_fn(n, n, |i, j| {
            let upper = sqrt_pi[i] * matrix[(i, j)] / sqrt_pi[j];
            let lower = sqrt_pi[j] * matrix[(j, i)] / sqrt_pi[i];
            0.5 * (upper + lower)
        });
        if !sym_all_finite(&sym) {
            return None;
        }

        let eig = sym.self_adjoint_eigen(Side::Lower).ok()?;
        let diag = eig.S().column_vector();
        let values = (0..n).map(|k| diag[k]).collect_vec();
        let vectors = eig.U().to_owned();

        Some(Self {
            values,
            vectors,
            sqrt_pi,
        })
    }

    /// `Π^{-1/2} U diag(f(λ)) Uᵀ Π^{1/2}`
    fn apply(&self, func: impl Fn(f64) -> f64) -> Mat<f64> {
        let n = self.sqrt_pi.len();
        let transformed = self.values.iter().map(|&val| func(val)).collect_vec();
        let scaled = Mat::from_fn(n, n, |i, k| self.vectors[(i, k)] * transformed[k]);
        let inner = scaled.as_ref() * self.vectors.as_ref().transpose();
        Mat::from_fn(n, n, |i, j| inner[(i, j)] * self.sqrt_pi[j] / self.sqrt_pi[i])
    }
}

fn check_shape(matrix: &Mat<f64>, stationary: &[f64]) -> Result<()> {
    let n = stationary.len();
    if matrix.nrows() != n || matrix.ncols() != n {
        return Err(RateMatrixError::Dimension(format!(
            "expected a {n}x{n} matrix, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    Ok(())
}

fn sym_all_finite(mat: &Mat<f64>) -> bool {
    (0..mat.nrows()).all(|i| (0..mat.ncols()).all(|j| mat[(i, j)].is_finite()))
}

/// Compute `expm(rates * lag_time)` for a generator that satisfies detailed
/// balance with respect to `stationary`.
pub fn expm_reversible(rates: &Mat<f64>, stationary: &[f64], lag_time: f64) -> Result<Mat<f64>> {
    check_shape(rates, stationary)?;
    let eig = ReversibleEigen::new(rates, stationary).ok_or_else(|| {
        RateMatrixError::NumericalInstability("eigendecomposition did not converge".into())
    })?;
    let transition = eig.apply(|val| (val * lag_time).exp());
    if !sym_all_finite(&transition) {
        return Err(RateMatrixError::NumericalInstability(
            "matrix exponential is not finite".into(),
        ));
    }
    Ok(transition)
}

/// Compute the real matrix logarithm of a transition matrix that satisfies
/// detailed balance with respect to `stationary`.
///
/// Fails if the spectrum contains eigenvalues that are not strictly positive,
/// in which case the matrix cannot be the exponential of a real generator.
pub fn logm_reversible(transition: &Mat<f64>, stationary: &[f64]) -> Result<Mat<f64>> {
    check_shape(transition, stationary)?;
    let eig = ReversibleEigen::new(transition, stationary).ok_or_else(|| {
        RateMatrixError::SingularGuess {
            reason: "eigendecomposition of the transition matrix did not converge".into(),
        }
    })?;
    if let Some(&bad) = eig.values.iter().find(|&&val| val < MIN_LOG_EIGENVALUE) {
        return Err(RateMatrixError::SingularGuess {
            reason: format!(
                "transition matrix has eigenvalue {bad:e}, its logarithm is not a real generator"
            ),
        });
    }
    Ok(eig.apply(f64::ln))
}

/// Eigenvalues of a reversible matrix, sorted in descending order.
pub fn reversible_eigenvalues(matrix: &Mat<f64>, stationary: &[f64]) -> Result<Vec<f64>> {
    check_shape(matrix, stationary)?;
    let eig = ReversibleEigen::new(matrix, stationary).ok_or_else(|| {
        RateMatrixError::NumericalInstability("eigendecomposition did not converge".into())
    })?;
    let mut values = eig.values;
    values.sort_by(|a, b| b.total_cmp(a));
    Ok(values)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use faer::Mat;

    use super::{expm_reversible, logaddexp, logm_reversible, logsumexp, reversible_eigenvalues};
    use crate::error::RateMatrixError;

    fn two_state(a: f64, b: f64) -> (Mat<f64>, Vec<f64>) {
        let rates = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => -a,
            (0, 1) => a,
            (1, 0) => b,
            _ => -b,
        });
        (rates, vec![b / (a + b), a / (a + b)])
    }

    #[test]
    fn check_logaddexp() {
        let x = 1.;
        let y = 2.;
        let out = logaddexp(x, y);
        assert_abs_diff_eq!(out, (x.exp() + y.exp()).ln(), epsilon = 1e-12);
        let out = logaddexp(y, x);
        assert_abs_diff_eq!(out, (x.exp() + y.exp()).ln(), epsilon = 1e-12);

        let out = logaddexp(f64::NEG_INFINITY, 3.);
        assert_eq!(out, 3.);
        assert!(logaddexp(f64::NAN, 1.).is_nan());
    }

    #[test]
    fn check_logsumexp() {
        let vals = [0.1, -2., 3.5, 700.];
        let out = logsumexp(&vals);
        assert_abs_diff_eq!(out, 700., epsilon = 1e-10);

        let vals = [0.1f64, -2., 3.5];
        let expected = vals.iter().map(|v| v.exp()).sum::<f64>().ln();
        assert_abs_diff_eq!(logsumexp(&vals), expected, epsilon = 1e-12);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn expm_two_state_closed_form() {
        let (a, b, t) = (0.3, 0.7, 1.5);
        let (rates, pi) = two_state(a, b);
        let trans = expm_reversible(&rates, &pi, t).unwrap();

        let decay = (-(a + b) * t).exp();
        let expected_01 = a / (a + b) * (1. - decay);
        let expected_10 = b / (a + b) * (1. - decay);
        assert_abs_diff_eq!(trans[(0, 1)], expected_01, epsilon = 1e-12);
        assert_abs_diff_eq!(trans[(1, 0)], expected_10, epsilon = 1e-12);
        assert_abs_diff_eq!(trans[(0, 0)], 1. - expected_01, epsilon = 1e-12);
        assert_abs_diff_eq!(trans[(1, 1)], 1. - expected_10, epsilon = 1e-12);
    }

    #[test]
    fn expm_zero_time_is_identity() {
        let (rates, pi) = two_state(2., 5.);
        let trans = expm_reversible(&rates, &pi, 0.).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1. } else { 0. };
                assert_abs_diff_eq!(trans[(i, j)], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn logm_inverts_expm() {
        let pi = [0.2, 0.5, 0.3];
        let q = [[0., 0.05, 0.01], [0.05, 0., 0.08], [0.01, 0.08, 0.]];
        let mut rates = Mat::from_fn(3, 3, |i, j| if i == j { 0. } else { q[i][j] / pi[i] });
        for i in 0..3 {
            let sum: f64 = (0..3).filter(|&j| j != i).map(|j| rates[(i, j)]).sum();
            rates[(i, i)] = -sum;
        }

        let trans = expm_reversible(&rates, &pi, 2.).unwrap();
        let log = logm_reversible(&trans, &pi).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(log[(i, j)] / 2., rates[(i, j)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn logm_rejects_negative_spectrum() {
        // Periodic chain, eigenvalues 1 and -1
        let trans = Mat::from_fn(2, 2, |i, j| if i == j { 0. } else { 1. });
        let err = logm_reversible(&trans, &[0.5, 0.5]).unwrap_err();
        assert!(matches!(err, RateMatrixError::SingularGuess { .. }));
    }

    #[test]
    fn eigenvalues_of_generator() {
        let (rates, pi) = two_state(0.3, 0.7);
        let vals = reversible_eigenvalues(&rates, &pi).unwrap();
        assert_eq!(vals.len(), 2);
        assert_abs_diff_eq!(vals[0], 0., epsilon = 1e-12);
        assert_abs_diff_eq!(vals[1], -1., epsilon = 1e-12);
    }

    #[test]
    fn expm_non_finite_input() {
        let (mut rates, pi) = two_state(0.3, 0.7);
        rates[(0, 1)] = f64::NAN;
        let err = expm_reversible(&rates, &pi, 1.).unwrap_err();
        assert!(err.is_recoverable());
    }
}
