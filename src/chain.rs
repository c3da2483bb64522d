use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use faer::Mat;
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::{debug, info, trace};

use crate::{
    collector::Collector,
    counts::CountMatrix,
    error::{RateMatrixError, Result},
    parameters::{unpack, ParameterClass, ParameterLayout},
    rate_matrix::RateMatrix,
    sampler::SamplerSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    /// The initial state is set, no proposal has been made yet.
    Initialized,
    Iterating,
    /// All requested iterations were performed.
    Completed,
    /// Sampling was cancelled before all iterations were performed.
    Terminated,
}

/// Shared flag to stop a chain at the start of its next iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Information about a single Metropolis step.
#[derive(Debug, Clone)]
pub struct SampleInfo {
    pub iteration: u64,
    pub accepted: bool,
    /// Log-likelihood of the proposed rate matrix, `-inf` if the proposal
    /// could not be evaluated.
    pub candidate_log_likelihood: f64,
    /// `min(1, exp(logL' - logL))`
    pub acceptance_probability: f64,
    /// The reason why the proposal could not be evaluated.
    pub failure: Option<RateMatrixError>,
}

/// The state of the chain after an iteration.
#[derive(Debug, Clone)]
pub struct ChainDraw {
    pub iteration: u64,
    pub rates: Mat<f64>,
    pub stationary: Box<[f64]>,
    pub log_likelihood: f64,
    /// Whether the proposal of this iteration was accepted.
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct ChainSummary {
    pub iterations: u64,
    pub accepted: u64,
    pub acceptance_rate: f64,
    pub phase: ChainPhase,
    pub log_likelihood: f64,
    pub final_state: RateMatrix,
}

/// A single Metropolis chain over the unconstrained parameters of a
/// reversible rate matrix.
///
/// The chain is an iterator over the recorded draws. Each call to `next`
/// performs iterations until one is retained by the thinning interval, and
/// returns `None` once all iterations are done or the chain was cancelled.
pub struct RateMatrixChain<R: Rng, C: Collector = ()> {
    counts: CountMatrix,
    lag_time: f64,
    settings: SamplerSettings,
    step_sizes: Box<[f64]>,
    rng: R,
    position: Box<[f64]>,
    current: RateMatrix,
    log_likelihood: f64,
    iteration: u64,
    num_accepted: u64,
    phase: ChainPhase,
    cancel: CancelToken,
    collector: C,
}

impl<R: Rng, C: Collector> RateMatrixChain<R, C> {
    /// Initialize a chain at `initial`.
    ///
    /// This fails if the initial rate matrix can not be encoded, decoded or
    /// evaluated, or if its size does not match the count matrix.
    pub fn new(
        counts: CountMatrix,
        lag_time: f64,
        initial: &RateMatrix,
        settings: SamplerSettings,
        rng: R,
        collector: C,
    ) -> Result<Self> {
        settings.validate()?;
        let n = counts.n_states();
        if initial.n_states() != n {
            return Err(RateMatrixError::Dimension(format!(
                "initial rate matrix has {} states, count matrix has {n}",
                initial.n_states()
            )));
        }
        if !(lag_time.is_finite() && lag_time > 0.) {
            return Err(RateMatrixError::Dimension(format!(
                "lag time must be positive, got {lag_time}"
            )));
        }

        let position = initial.to_parameters()?;
        let current = unpack(&position, n)?;
        let transition = current.transition_matrix(lag_time)?;
        let log_likelihood = counts.log_likelihood(&transition)?;

        let layout = ParameterLayout::new(n);
        let step_sizes = (0..layout.dim())
            .map(|idx| match layout.class(idx) {
                ParameterClass::Stationary => settings.stationary_step_size,
                ParameterClass::Exchange => settings.rate_step_size,
            })
            .collect();

        info!(
            n_states = n,
            dim = layout.dim(),
            num_iterations = settings.num_iterations,
            log_likelihood,
            "Initialized rate matrix chain"
        );

        Ok(Self {
            counts,
            lag_time,
            settings,
            step_sizes,
            rng,
            position,
            current,
            log_likelihood,
            iteration: 0,
            num_accepted: 0,
            phase: ChainPhase::Initialized,
            cancel: CancelToken::new(),
            collector,
        })
    }

    /// Use an externally created cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Perform one iteration.
    ///
    /// Returns `None` without changing the state if all iterations are done
    /// or the chain was cancelled.
    pub fn draw(&mut self) -> Option<SampleInfo> {
        if !self.advance_phase() {
            return None;
        }
        let proposal = self.propose();
        Some(self.step(&proposal))
    }

    /// Perform one iteration with a given proposal instead of a random one.
    ///
    /// The proposal is accepted or rejected with the Metropolis criterion.
    /// Proposals that can not be decoded or whose transition matrix can not
    /// be computed are rejected. Like [`draw`](Self::draw) this returns
    /// `None` and leaves the state alone once the chain is finished.
    pub fn step_to(&mut self, proposal: &[f64]) -> Option<SampleInfo> {
        if !self.advance_phase() {
            return None;
        }
        Some(self.step(proposal))
    }

    /// Move to a final phase if the chain is cancelled or out of
    /// iterations. Returns whether another iteration may run.
    fn advance_phase(&mut self) -> bool {
        match self.phase {
            ChainPhase::Completed | ChainPhase::Terminated => return false,
            ChainPhase::Initialized | ChainPhase::Iterating => {}
        }
        if self.cancel.is_cancelled() {
            self.finish(ChainPhase::Terminated);
            return false;
        }
        if self.iteration >= self.settings.num_iterations {
            self.finish(ChainPhase::Completed);
            return false;
        }
        true
    }

    fn step(&mut self, proposal: &[f64]) -> SampleInfo {
        let iteration = self.iteration;
        self.iteration += 1;
        if self.phase == ChainPhase::Initialized {
            self.phase = ChainPhase::Iterating;
        }

        let info = match self.evaluate(proposal) {
            Ok((candidate, log_likelihood)) => {
                let log_ratio = log_likelihood - self.log_likelihood;
                // Ties accept
                let accepted =
                    log_ratio >= 0. || self.rng.random::<f64>().ln() <= log_ratio;
                if accepted {
                    self.position = proposal.into();
                    self.current = candidate;
                    self.log_likelihood = log_likelihood;
                    self.num_accepted += 1;
                }
                SampleInfo {
                    iteration,
                    accepted,
                    candidate_log_likelihood: log_likelihood,
                    acceptance_probability: if log_ratio.is_nan() {
                        0.
                    } else {
                        log_ratio.min(0.).exp()
                    },
                    failure: None,
                }
            }
            Err(err) => {
                debug_assert!(err.is_recoverable());
                debug!(iteration, error = %err, "Rejected proposal");
                SampleInfo {
                    iteration,
                    accepted: false,
                    candidate_log_likelihood: f64::NEG_INFINITY,
                    acceptance_probability: 0.,
                    failure: Some(err),
                }
            }
        };

        trace!(
            iteration,
            accepted = info.accepted,
            log_likelihood = self.log_likelihood,
            "Finished iteration"
        );
        self.collector.register_draw(&info);
        info
    }

    fn propose(&mut self) -> Box<[f64]> {
        let rng = &mut self.rng;
        izip!(self.position.iter(), self.step_sizes.iter())
            .map(|(&val, &scale)| {
                let noise: f64 = rng.sample(StandardNormal);
                val + scale * noise
            })
            .collect()
    }

    fn evaluate(&mut self, theta: &[f64]) -> Result<(RateMatrix, f64)> {
        let candidate = unpack(theta, self.counts.n_states())?;
        self.collector.register_candidate(&candidate);
        let transition = candidate.transition_matrix(self.lag_time)?;
        let log_likelihood = self.counts.log_likelihood(&transition)?;
        Ok((candidate, log_likelihood))
    }

    fn finish(&mut self, phase: ChainPhase) {
        self.phase = phase;
        info!(
            iterations = self.iteration,
            acceptance_rate = self.acceptance_rate(),
            log_likelihood = self.log_likelihood,
            phase = ?phase,
            "Finished rate matrix chain"
        );
    }

    /// The state of the chain, labelled as the result of the most recent iteration.
    fn record(&self, iteration: u64, accepted: bool) -> ChainDraw {
        ChainDraw {
            iteration,
            rates: self.current.rates().clone(),
            stationary: self.current.stationary().into(),
            log_likelihood: self.log_likelihood,
            accepted,
        }
    }

    pub fn current(&self) -> &RateMatrix {
        &self.current
    }

    /// The unconstrained parameters of the current state.
    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Number of iterations performed so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn num_accepted(&self) -> u64 {
        self.num_accepted
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.iteration == 0 {
            return 0.;
        }
        self.num_accepted as f64 / self.iteration as f64
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    pub fn into_collector(self) -> C {
        self.collector
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            iterations: self.iteration,
            accepted: self.num_accepted,
            acceptance_rate: self.acceptance_rate(),
            phase: self.phase,
            log_likelihood: self.log_likelihood,
            final_state: self.current.clone(),
        }
    }
}

impl<R: Rng, C: Collector> Iterator for RateMatrixChain<R, C> {
    type Item = ChainDraw;

    fn next(&mut self) -> Option<ChainDraw> {
        loop {
            let info = self.draw()?;
            if info.iteration % self.settings.thin == 0 {
                return Some(self.record(info.iteration, info.accepted));
            }
        }
    }
}
