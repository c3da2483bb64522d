use faer::Mat;
use itertools::Itertools;
use tracing::debug;

use crate::{
    counts::CountMatrix,
    error::{RateMatrixError, Result},
    math::logm_reversible,
    rate_matrix::{rates_from_exchange, RateMatrix},
};

/// Settings for the construction of the initial rate matrix.
#[derive(Debug, Clone, Copy)]
pub struct GuessSettings {
    /// Pseudocount added to every entry of a row without observed
    /// transitions. If this is `None`, such rows are an error.
    ///
    /// The smoothed row is uniform, and symmetrization pairs it with the
    /// observed counts into that state. If those counts are large compared
    /// to the pseudocount, the estimated transition matrix can still have a
    /// negative eigenvalue and the guess fails as singular.
    pub empty_row_pseudocount: Option<f64>,
    /// Lower bound for the exchange rates of the guess. Transitions that
    /// were never observed would otherwise get a zero or negative rate,
    /// which can not be represented in the unconstrained parameterization.
    pub min_exchange_rate: f64,
}

impl Default for GuessSettings {
    fn default() -> Self {
        Self {
            empty_row_pseudocount: None,
            min_exchange_rate: 1e-8,
        }
    }
}

/// Estimate a reversible rate matrix from transition counts at lag time `lag_time`.
///
/// The stationary distribution is the normalized marginal of the symmetrized
/// counts `(C + Cᵀ) / 2`, the transition matrix is the row-normalized
/// symmetrized count matrix. Its matrix logarithm, divided by the lag time,
/// is projected onto detailed balance by averaging the exchange rates
/// `π[i] K[i][j]` and `π[j] K[j][i]`, clamping them from below.
///
/// The projection is not a maximum likelihood estimate, it only supplies a
/// valid starting point for the sampler.
pub fn initial_guess(
    counts: &CountMatrix,
    lag_time: f64,
    settings: &GuessSettings,
) -> Result<RateMatrix> {
    let n = counts.n_states();
    if n < 2 {
        return Err(RateMatrixError::Dimension(format!(
            "need at least two states for a rate matrix, got {n}"
        )));
    }
    if !(lag_time.is_finite() && lag_time > 0.) {
        return Err(RateMatrixError::Dimension(format!(
            "lag time must be positive, got {lag_time}"
        )));
    }
    if !(settings.min_exchange_rate.is_finite() && settings.min_exchange_rate > 0.) {
        return Err(RateMatrixError::InvalidSettings(format!(
            "minimum exchange rate must be positive, got {}",
            settings.min_exchange_rate
        )));
    }

    let mut raw = counts.to_mat();
    for i in 0..n {
        if counts.row_total(i) > 0 {
            continue;
        }
        match settings.empty_row_pseudocount {
            Some(pseudo) if pseudo.is_finite() && pseudo > 0. => {
                debug!(state = i, pseudo, "Smoothing row without observed transitions");
                (0..n).for_each(|j| raw[(i, j)] += pseudo);
            }
            Some(pseudo) => {
                return Err(RateMatrixError::InvalidSettings(format!(
                    "pseudocount must be positive, got {pseudo}"
                )));
            }
            None => {
                return Err(RateMatrixError::SingularGuess {
                    reason: format!("state {i} has no observed outgoing transitions"),
                });
            }
        }
    }

    let sym = Mat::from_fn(n, n, |i, j| 0.5 * (raw[(i, j)] + raw[(j, i)]));
    let marginals = (0..n)
        .map(|i| (0..n).map(|j| sym[(i, j)]).sum::<f64>())
        .collect_vec();
    let total: f64 = marginals.iter().sum();
    let stationary = marginals.iter().map(|m| m / total).collect_vec();

    let transition = Mat::from_fn(n, n, |i, j| sym[(i, j)] / marginals[i]);
    let log_transition = logm_reversible(&transition, &stationary)?;

    let mut clamped = 0usize;
    let rates = rates_from_exchange(n, &stationary, |i, j| {
        let forward = stationary[i] * log_transition[(i, j)];
        let backward = stationary[j] * log_transition[(j, i)];
        let exchange = 0.5 * (forward + backward) / lag_time;
        if exchange < settings.min_exchange_rate {
            clamped += 1;
            settings.min_exchange_rate
        } else {
            exchange
        }
    });
    debug!(
        n_states = n,
        clamped_exchange_rates = clamped,
        "Constructed initial rate matrix"
    );

    RateMatrix::new(rates, stationary.into()).map_err(|err| RateMatrixError::SingularGuess {
        reason: format!("projected guess is not a valid generator: {err}"),
    })
}
