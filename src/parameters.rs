//! Unconstrained parameterization of reversible rate matrices.
//!
//! A reversible generator on `n` states has `n - 1` free stationary
//! probabilities and `n (n - 1) / 2` symmetric exchange rates
//! `q[i][j] = π[i] K[i][j]`. The parameter vector stores
//!
//! - `ln(π[i] / π[n - 1])` for `i < n - 1`, followed by
//! - `ln q[i][j]` for `i < j`, upper triangle in row-major order.
//!
//! Every finite parameter vector decodes to a generator with positive
//! off-diagonal rates, zero row sums and exact detailed balance.

use faer::Mat;
use itertools::Itertools;

use crate::{
    error::{RateMatrixError, Result},
    math::logsumexp,
    rate_matrix::{rates_from_exchange, validate, RateMatrix},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterClass {
    /// Log ratio of a stationary probability to the last one
    Stationary,
    /// Log of an exchange rate
    Exchange,
}

/// Positions of the degrees of freedom of an `n` state generator in the
/// parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    n_states: usize,
}

impl ParameterLayout {
    pub fn new(n_states: usize) -> Self {
        Self { n_states }
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_stationary(&self) -> usize {
        self.n_states.saturating_sub(1)
    }

    pub fn n_exchange(&self) -> usize {
        self.n_states * self.n_states.saturating_sub(1) / 2
    }

    pub fn dim(&self) -> usize {
        self.n_stationary() + self.n_exchange()
    }

    pub fn class(&self, index: usize) -> ParameterClass {
        assert!(index < self.dim());
        if index < self.n_stationary() {
            ParameterClass::Stationary
        } else {
            ParameterClass::Exchange
        }
    }

    /// Index of the exchange rate between states `i` and `j`.
    pub fn exchange_index(&self, i: usize, j: usize) -> usize {
        assert!(i != j);
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        assert!(j < self.n_states);
        // Rows above i contribute (n - 1) + (n - 2) + ... + (n - i) entries
        let before = i * self.n_states - i * (i + 1) / 2;
        self.n_stationary() + before + (j - i - 1)
    }

    /// State pairs `(i, j)` with `i < j`, in parameter order.
    pub fn exchange_pairs(&self) -> impl Iterator<Item = (usize, usize)> {
        (0..self.n_states).tuple_combinations()
    }
}

/// Encode a rate matrix and its stationary distribution as a parameter vector.
///
/// All off-diagonal rates must be strictly positive, since the exchange rates
/// are stored as logarithms. A generator with a zero rate between two states
/// is a valid [`RateMatrix`] but fails here with
/// [`RateMatrixError::InvalidGenerator`], so `unpack(pack(K, π)) == (K, π)`
/// only holds for strictly positive rates.
///
/// π must sum to one within `1e-10`.
pub fn pack(rates: &Mat<f64>, stationary: &[f64]) -> Result<Box<[f64]>> {
    validate(rates, stationary, true)?;
    let layout = ParameterLayout::new(stationary.len());

    let log_last = stationary[layout.n_states() - 1].ln();
    let mut theta = Vec::with_capacity(layout.dim());
    theta.extend(
        stationary[..layout.n_stationary()]
            .iter()
            .map(|p| p.ln() - log_last),
    );
    theta.extend(layout.exchange_pairs().map(|(i, j)| {
        let forward = stationary[i] * rates[(i, j)];
        let backward = stationary[j] * rates[(j, i)];
        (0.5 * (forward + backward)).ln()
    }));
    debug_assert!(theta.len() == layout.dim());
    Ok(theta.into())
}

/// Decode a parameter vector into a rate matrix on `n_states` states.
pub fn unpack(theta: &[f64], n_states: usize) -> Result<RateMatrix> {
    let layout = ParameterLayout::new(n_states);
    if n_states == 0 {
        return Err(RateMatrixError::Reconstruction(
            "rate matrix needs at least one state".into(),
        ));
    }
    if theta.len() != layout.dim() {
        return Err(RateMatrixError::Reconstruction(format!(
            "expected {} parameters for {} states, got {}",
            layout.dim(),
            n_states,
            theta.len()
        )));
    }
    if let Some(idx) = theta.iter().position(|val| !val.is_finite()) {
        return Err(RateMatrixError::Reconstruction(format!(
            "parameter {idx} is {}",
            theta[idx]
        )));
    }

    let (log_ratios, log_exchange) = theta.split_at(layout.n_stationary());

    let mut logits = log_ratios.to_vec();
    logits.push(0.);
    let norm = logsumexp(&logits);
    let mut stationary = logits.iter().map(|val| (val - norm).exp()).collect_vec();
    let total: f64 = stationary.iter().sum();
    stationary.iter_mut().for_each(|p| *p /= total);
    if let Some(idx) = stationary.iter().position(|&p| !(p.is_finite() && p > 0.)) {
        return Err(RateMatrixError::Reconstruction(format!(
            "stationary probability of state {idx} underflows"
        )));
    }

    let exchange = log_exchange.iter().map(|val| val.exp()).collect_vec();
    if let Some(idx) = exchange.iter().position(|&q| !(q.is_finite() && q > 0.)) {
        return Err(RateMatrixError::Reconstruction(format!(
            "exchange rate {idx} is {}",
            exchange[idx]
        )));
    }

    let rates = rates_from_exchange(n_states, &stationary, |i, j| {
        exchange[layout.exchange_index(i, j) - layout.n_stationary()]
    });
    let all_finite = (0..n_states).all(|i| (0..n_states).all(|j| rates[(i, j)].is_finite()));
    if !all_finite {
        return Err(RateMatrixError::Reconstruction(
            "rate matrix overflows".into(),
        ));
    }

    Ok(RateMatrix::new_unchecked(rates, stationary.into()))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use faer::Mat;

    use super::{pack, unpack, ParameterClass, ParameterLayout};
    use crate::{
        error::RateMatrixError,
        rate_matrix::{test_matrices::three_state, RateMatrix},
    };

    #[test]
    fn layout_sizes() {
        let layout = ParameterLayout::new(4);
        assert_eq!(layout.n_stationary(), 3);
        assert_eq!(layout.n_exchange(), 6);
        assert_eq!(layout.dim(), 9);
        assert_eq!(layout.class(2), ParameterClass::Stationary);
        assert_eq!(layout.class(3), ParameterClass::Exchange);

        let indices = layout
            .exchange_pairs()
            .map(|(i, j)| layout.exchange_index(i, j))
            .collect_vec();
        assert_eq!(indices, (3..9).collect_vec());
        assert_eq!(layout.exchange_index(2, 1), layout.exchange_index(1, 2));

        let single = ParameterLayout::new(1);
        assert_eq!(single.dim(), 0);
    }

    #[test]
    fn round_trip() {
        let matrix = three_state();
        let theta = matrix.to_parameters().unwrap();
        assert_eq!(theta.len(), 5);
        let decoded = unpack(&theta, 3).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(
                decoded.stationary()[i],
                matrix.stationary()[i],
                epsilon = 1e-12
            );
            for j in 0..3 {
                assert_abs_diff_eq!(decoded.rate(i, j), matrix.rate(i, j), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn pack_rejects_bad_inputs() {
        let matrix = three_state();
        let err = pack(matrix.rates(), &[0.5, 0.5]).unwrap_err();
        assert!(matches!(err, RateMatrixError::Dimension(_)));

        let err = pack(matrix.rates(), &[0.3, 0.3, 0.3]).unwrap_err();
        assert!(matches!(err, RateMatrixError::Dimension(_)));

        let err = pack(matrix.rates(), &[0.0, 0.5, 0.5]).unwrap_err();
        assert!(matches!(err, RateMatrixError::Dimension(_)));

        let mut rates = matrix.rates().clone();
        rates[(0, 0)] += rates[(0, 2)];
        rates[(2, 2)] += rates[(2, 0)];
        rates[(0, 2)] = 0.;
        rates[(2, 0)] = 0.;
        let err = pack(&rates, matrix.stationary()).unwrap_err();
        assert!(matches!(err, RateMatrixError::InvalidGenerator(_)));
    }

    #[test]
    fn zero_rate_generator_can_not_be_packed() {
        let matrix = three_state();
        let mut exchange = Mat::from_fn(3, 3, |i, j| matrix.exchange_rate(i, j));
        exchange[(0, 2)] = 0.;
        let sparse = RateMatrix::from_exchange_rates(&exchange, matrix.stationary().into()).unwrap();
        assert_eq!(sparse.rate(0, 2), 0.);
        let err = sparse.to_parameters().unwrap_err();
        match err {
            RateMatrixError::InvalidGenerator(msg) => assert!(msg.contains("K[0][2]")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn round_trip_of_nearly_normalized_distribution() {
        let matrix = three_state();
        let exchange = Mat::from_fn(3, 3, |i, j| matrix.exchange_rate(i, j));

        let pi: Box<[f64]> = vec![0.2, 0.5, 0.3 + 5e-9].into();
        let err = RateMatrix::from_exchange_rates(&exchange, pi.clone()).unwrap_err();
        assert!(matches!(err, RateMatrixError::Dimension(_)));
        let rates = Mat::from_fn(3, 3, |i, j| matrix.rate(i, j));
        let err = pack(&rates, &pi).unwrap_err();
        assert!(matches!(err, RateMatrixError::Dimension(_)));

        let pi: Box<[f64]> = vec![0.2, 0.5, 0.3 + 5e-11].into();
        let close = RateMatrix::from_exchange_rates(&exchange, pi).unwrap();
        let decoded = unpack(&close.to_parameters().unwrap(), 3).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(decoded.stationary()[i], close.stationary()[i], epsilon = 1e-9);
            for j in 0..3 {
                assert_abs_diff_eq!(decoded.rate(i, j), close.rate(i, j), epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn unpack_rejects_malformed_parameters() {
        let err = unpack(&[0.; 4], 3).unwrap_err();
        assert!(matches!(err, RateMatrixError::Reconstruction(_)));

        let err = unpack(&[0., f64::NAN, 0., 0., 0.], 3).unwrap_err();
        assert!(matches!(err, RateMatrixError::Reconstruction(_)));

        // exp(800) overflows
        let err = unpack(&[0., 0., 800., 0., 0.], 3).unwrap_err();
        assert!(err.is_recoverable());

        // π[0] underflows
        let err = unpack(&[-800., 0., 0., 0., 0.], 3).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn single_state() {
        let matrix = unpack(&[], 1).unwrap();
        assert_eq!(matrix.stationary(), &[1.]);
        assert_eq!(matrix.rate(0, 0), 0.);
    }

    fn assert_generator(theta: &[f64], n: usize) {
        let matrix = unpack(theta, n).unwrap();
        let pi = matrix.stationary();
        assert_abs_diff_eq!(pi.iter().sum::<f64>(), 1., epsilon = 1e-12);
        assert!(pi.iter().all(|&p| p > 0.));
        for i in 0..n {
            let scale = matrix.rate(i, i).abs().max(1.);
            let total: f64 = (0..n).map(|j| matrix.rate(i, j)).sum();
            assert!(total.abs() <= 1e-12 * scale);
            for j in 0..n {
                if i != j {
                    assert!(matrix.rate(i, j) >= 0.);
                    let lhs = pi[i] * matrix.rate(i, j);
                    let rhs = pi[j] * matrix.rate(j, i);
                    assert!((lhs - rhs).abs() <= 1e-12 * lhs.max(rhs));
                }
            }
        }
    }

    proptest! {
        #[test]
        fn any_parameters_decode_to_generator(
            n in 2usize..6,
            raw in prop::collection::vec(-8f64..8f64, 15),
        ) {
            let dim = ParameterLayout::new(n).dim();
            assert_generator(&raw[..dim], n);
        }

        #[test]
        fn pack_inverts_unpack(
            n in 2usize..6,
            raw in prop::collection::vec(-5f64..5f64, 15),
        ) {
            let dim = ParameterLayout::new(n).dim();
            let theta = &raw[..dim];
            let matrix = unpack(theta, n).unwrap();
            let packed = matrix.to_parameters().unwrap();
            prop_assert_eq!(packed.len(), dim);
            for (a, b) in packed.iter().zip(theta) {
                prop_assert!((a - b).abs() < 1e-9);
            }
            let again = unpack(&packed, n).unwrap();
            for i in 0..n {
                prop_assert!((again.stationary()[i] - matrix.stationary()[i]).abs() < 1e-9);
                for j in 0..n {
                    let scale = matrix.rate(i, j).abs().max(1.);
                    prop_assert!((again.rate(i, j) - matrix.rate(i, j)).abs() < 1e-9 * scale);
                }
            }
        }
    }
}
