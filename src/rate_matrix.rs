use faer::Mat;
use itertools::Itertools;
use rand::{
    distr::{weighted::WeightedIndex, Distribution},
    Rng,
};

use crate::{
    error::{RateMatrixError, Result},
    math::{expm_reversible, reversible_eigenvalues},
    parameters::{pack, unpack},
};

/// Maximum deviation of `sum(π)` from one.
///
/// Decoding renormalizes π, so this bounds the error of an encode/decode
/// round trip.
pub(crate) const DISTRIBUTION_TOLERANCE: f64 = 1e-10;
/// Relative tolerance for zero row sums and detailed balance.
pub(crate) const GENERATOR_TOLERANCE: f64 = 1e-8;

/// A generator of a reversible continuous time Markov chain together with its
/// stationary distribution.
///
/// Off-diagonal rates are non-negative, rows sum to zero and
/// `π[i] K[i][j] = π[j] K[j][i]` holds for all pairs of states.
#[derive(Debug, Clone)]
pub struct RateMatrix {
    rates: Mat<f64>,
    stationary: Box<[f64]>,
}

impl RateMatrix {
    /// Validate and wrap a rate matrix and its stationary distribution.
    pub fn new(rates: Mat<f64>, stationary: Box<[f64]>) -> Result<Self> {
        validate(&rates, &stationary, false)?;
        Ok(Self { rates, stationary })
    }

    /// Build a rate matrix from symmetric exchange rates `q[i][j] = π[i] K[i][j]`.
    ///
    /// Only the strict upper triangle of `exchange` is read.
    pub fn from_exchange_rates(exchange: &Mat<f64>, stationary: Box<[f64]>) -> Result<Self> {
        let n = stationary.len();
        if exchange.nrows() != n || exchange.ncols() != n {
            return Err(RateMatrixError::Dimension(format!(
                "exchange matrix is {}x{}, stationary distribution has {} states",
                exchange.nrows(),
                exchange.ncols(),
                n
            )));
        }
        check_distribution(&stationary)?;
        let rates = rates_from_exchange(n, &stationary, |i, j| exchange[(i, j)]);
        Self::new(rates, stationary)
    }

    /// Wrap matrices that are valid by construction.
    pub(crate) fn new_unchecked(rates: Mat<f64>, stationary: Box<[f64]>) -> Self {
        debug_assert!(rates.nrows() == stationary.len());
        Self { rates, stationary }
    }

    pub fn n_states(&self) -> usize {
        self.stationary.len()
    }

    pub fn rates(&self) -> &Mat<f64> {
        &self.rates
    }

    pub fn stationary(&self) -> &[f64] {
        &self.stationary
    }

    pub fn rate(&self, from: usize, to: usize) -> f64 {
        self.rates[(from, to)]
    }

    /// The symmetric exchange rate `π[i] K[i][j]` between two states.
    pub fn exchange_rate(&self, i: usize, j: usize) -> f64 {
        self.stationary[i] * self.rates[(i, j)]
    }

    pub fn row_sums(&self) -> Vec<f64> {
        let n = self.n_states();
        (0..n)
            .map(|i| (0..n).map(|j| self.rates[(i, j)]).sum())
            .collect()
    }

    /// Largest violation of detailed balance, `max |π[i] K[i][j] - π[j] K[j][i]|`.
    pub fn detailed_balance_error(&self) -> f64 {
        (0..self.n_states())
            .tuple_combinations()
            .map(|(i, j)| (self.exchange_rate(i, j) - self.exchange_rate(j, i)).abs())
            .fold(0f64, f64::max)
    }

    /// The transition matrix `expm(K τ)` at lag time `τ`.
    pub fn transition_matrix(&self, lag_time: f64) -> Result<Mat<f64>> {
        expm_reversible(&self.rates, &self.stationary, lag_time)
    }

    /// Eigenvalues of the generator in descending order. The first one is zero.
    pub fn eigenvalues(&self) -> Result<Vec<f64>> {
        reversible_eigenvalues(&self.rates, &self.stationary)
    }

    /// Relaxation timescales `-1/λ_k` of all non-stationary eigenvalues,
    /// slowest first.
    pub fn timescales(&self) -> Result<Vec<f64>> {
        Ok(self
            .eigenvalues()?
            .into_iter()
            .skip(1)
            .map(|val| -val.recip())
            .collect())
    }

    /// Encode as an unconstrained parameter vector.
    pub fn to_parameters(&self) -> Result<Box<[f64]>> {
        pack(&self.rates, &self.stationary)
    }

    /// Decode an unconstrained parameter vector.
    pub fn from_parameters(theta: &[f64], n_states: usize) -> Result<Self> {
        unpack(theta, n_states)
    }

    /// Draw a discrete state trajectory observed every `lag_time`, starting
    /// from the stationary distribution.
    pub fn simulate_trajectory<R: Rng + ?Sized>(
        &self,
        lag_time: f64,
        length: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let n = self.n_states();
        let transition = self.transition_matrix(lag_time)?;
        let initial = row_distribution(self.stationary.iter().copied())?;
        let rows: Vec<_> = (0..n)
            .map(|i| row_distribution((0..n).map(|j| transition[(i, j)])))
            .try_collect()?;

        let mut states = Vec::with_capacity(length);
        if length == 0 {
            return Ok(states);
        }
        let mut state = initial.sample(rng);
        states.push(state);
        for _ in 1..length {
            state = rows[state].sample(rng);
            states.push(state);
        }
        Ok(states)
    }
}

fn row_distribution(row: impl Iterator<Item = f64>) -> Result<WeightedIndex<f64>> {
    // Round-off can leave tiny negative transition probabilities
    WeightedIndex::new(row.map(|p| p.max(0.)).collect_vec()).map_err(|err| {
        RateMatrixError::NumericalInstability(format!("invalid transition row: {err}"))
    })
}

pub(crate) fn rates_from_exchange(
    n: usize,
    stationary: &[f64],
    mut exchange: impl FnMut(usize, usize) -> f64,
) -> Mat<f64> {
    let mut rates = Mat::zeros(n, n);
    for (i, j) in (0..n).tuple_combinations() {
        let q = exchange(i, j);
        rates[(i, j)] = q / stationary[i];
        rates[(j, i)] = q / stationary[j];
    }
    for i in 0..n {
        let total: f64 = (0..n).filter(|&j| j != i).map(|j| rates[(i, j)]).sum();
        rates[(i, i)] = -total;
    }
    rates
}

pub(crate) fn check_distribution(stationary: &[f64]) -> Result<()> {
    if stationary.is_empty() {
        return Err(RateMatrixError::Dimension(
            "stationary distribution is empty".into(),
        ));
    }
    if let Some((idx, val)) = stationary
        .iter()
        .enumerate()
        .find(|&(_, &p)| !(p.is_finite() && p > 0.))
    {
        return Err(RateMatrixError::Dimension(format!(
            "stationary probability of state {idx} is {val}, must be positive"
        )));
    }
    let total: f64 = stationary.iter().sum();
    if (total - 1.).abs() > DISTRIBUTION_TOLERANCE {
        return Err(RateMatrixError::Dimension(format!(
            "stationary distribution sums to {total}"
        )));
    }
    Ok(())
}

/// Check shapes, the stationary distribution and the generator constraints.
///
/// With `strictly_positive` all off-diagonal rates must be larger than zero,
/// which is needed to take their logarithm.
pub(crate) fn validate(rates: &Mat<f64>, stationary: &[f64], strictly_positive: bool) -> Result<()> {
    let n = stationary.len();
    if rates.nrows() != n || rates.ncols() != n {
        return Err(RateMatrixError::Dimension(format!(
            "rate matrix is {}x{}, stationary distribution has {} states",
            rates.nrows(),
            rates.ncols(),
            n
        )));
    }
    check_distribution(stationary)?;

    let scale = (0..n)
        .map(|i| rates[(i, i)].abs())
        .fold(1f64, f64::max);

    for i in 0..n {
        let mut total = 0f64;
        for j in 0..n {
            let val = rates[(i, j)];
            if !val.is_finite() {
                return Err(RateMatrixError::InvalidGenerator(format!(
                    "rate K[{i}][{j}] is {val}"
                )));
            }
            total += val;
            if i == j {
                continue;
            }
            if val < 0. || (strictly_positive && val == 0.) {
                return Err(RateMatrixError::InvalidGenerator(format!(
                    "off-diagonal rate K[{i}][{j}] is {val}"
                )));
            }
        }
        if total.abs() > GENERATOR_TOLERANCE * scale {
            return Err(RateMatrixError::InvalidGenerator(format!(
                "row {i} sums to {total}"
            )));
        }
    }

    for (i, j) in (0..n).tuple_combinations() {
        let forward = stationary[i] * rates[(i, j)];
        let backward = stationary[j] * rates[(j, i)];
        if (forward - backward).abs() > GENERATOR_TOLERANCE * forward.max(backward).max(1e-300) {
            return Err(RateMatrixError::InvalidGenerator(format!(
                "detailed balance violated between states {i} and {j}: {forward} != {backward}"
            )));
        }
    }
    Ok(())
}
