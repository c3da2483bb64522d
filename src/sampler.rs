use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::{
    chain::{ChainSummary, RateMatrixChain},
    collector::Collector,
    counts::CountMatrix,
    error::RateMatrixError,
    guess::{initial_guess, GuessSettings},
    trace::RateMatrixTrace,
};

/// Settings for the rate matrix sampler
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    /// The number of Metropolis iterations.
    pub num_iterations: u64,
    /// Standard deviation of the Gaussian proposal for the log ratios of
    /// the stationary probabilities.
    pub stationary_step_size: f64,
    /// Standard deviation of the Gaussian proposal for the log exchange rates.
    pub rate_step_size: f64,
    pub seed: u64,
    /// Only every `thin`-th iteration is recorded.
    pub thin: u64,
    /// Settings for the initial guess.
    pub guess: GuessSettings,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_iterations: 1000,
            stationary_step_size: 0.05,
            rate_step_size: 0.1,
            seed: 0,
            thin: 1,
            guess: GuessSettings::default(),
        }
    }
}

impl SamplerSettings {
    pub fn validate(&self) -> Result<(), RateMatrixError> {
        if self.num_iterations == 0 {
            return Err(RateMatrixError::InvalidSettings(
                "number of iterations must be positive".into(),
            ));
        }
        if self.thin == 0 {
            return Err(RateMatrixError::InvalidSettings(
                "thinning interval must be positive".into(),
            ));
        }
        for (name, val) in [
            ("stationary step size", self.stationary_step_size),
            ("rate step size", self.rate_step_size),
        ] {
            if !(val.is_finite() && val > 0.) {
                return Err(RateMatrixError::InvalidSettings(format!(
                    "{name} must be positive, got {val}"
                )));
            }
        }
        Ok(())
    }
}

/// Construct the initial guess for `counts` and start a chain from it.
///
/// The returned chain lazily yields the recorded draws. Running it again
/// requires a new chain, using the same seed reproduces the draws.
pub fn sample_sequentially(
    counts: CountMatrix,
    lag_time: f64,
    settings: SamplerSettings,
) -> Result<RateMatrixChain<ChaCha8Rng>> {
    sample_sequentially_with(counts, lag_time, settings, ())
}

/// Like [`sample_sequentially`], with a collector that observes every iteration.
pub fn sample_sequentially_with<C: Collector>(
    counts: CountMatrix,
    lag_time: f64,
    settings: SamplerSettings,
    collector: C,
) -> Result<RateMatrixChain<ChaCha8Rng, C>> {
    settings.validate().context("Invalid sampler settings")?;
    let guess = initial_guess(&counts, lag_time, &settings.guess).with_context(|| {
        format!(
            "Could not construct initial guess from {} states with {} counts at lag time {lag_time}",
            counts.n_states(),
            counts.total()
        )
    })?;
    let rng = ChaCha8Rng::seed_from_u64(settings.seed);
    let chain = RateMatrixChain::new(counts, lag_time, &guess, settings, rng, collector)
        .context("Could not initialize chain at the initial guess")?;
    Ok(chain)
}

/// Run a complete chain and collect its draws.
pub fn sample_trace(
    counts: CountMatrix,
    lag_time: f64,
    settings: SamplerSettings,
) -> Result<(RateMatrixTrace, ChainSummary)> {
    let n_states = counts.n_states();
    let mut chain = sample_sequentially(counts, lag_time, settings)?;
    let mut trace = RateMatrixTrace::new(n_states, lag_time);
    chain.by_ref().try_for_each(|draw| trace.push(draw))?;
    let summary = chain.summary();
    info!(
        iterations = summary.iterations,
        recorded = trace.len(),
        acceptance_rate = summary.acceptance_rate,
        "Sampling finished"
    );
    Ok((trace, summary))
}
