use crate::{chain::SampleInfo, rate_matrix::RateMatrix};

/// Callbacks for events during a Metropolis step.
///
/// Collectors can compute statistics like the mean acceptance rate or check
/// properties of the proposed rate matrices.
pub trait Collector {
    /// Called for every proposal that decodes to a rate matrix, before its
    /// likelihood is evaluated.
    fn register_candidate(&mut self, _candidate: &RateMatrix) {}

    /// Called once per iteration after the proposal was accepted or rejected.
    fn register_draw(&mut self, _info: &SampleInfo) {}
}

impl Collector for () {}

impl<A: Collector, B: Collector> Collector for (A, B) {
    fn register_candidate(&mut self, candidate: &RateMatrix) {
        self.0.register_candidate(candidate);
        self.1.register_candidate(candidate);
    }

    fn register_draw(&mut self, info: &SampleInfo) {
        self.0.register_draw(info);
        self.1.register_draw(info);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub(crate) fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// `None` until the first value was added.
    pub(crate) fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability `min(1, L'/L)` and the number of
/// proposals that failed to decode or evaluate.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceRateCollector {
    acceptance: RunningMean,
    failed: u64,
}

impl AcceptanceRateCollector {
    pub fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector::default()
    }

    /// Mean acceptance probability over all iterations so far.
    pub fn mean_acceptance_probability(&self) -> Option<f64> {
        self.acceptance.mean()
    }

    /// Number of iterations observed.
    pub fn iterations(&self) -> u64 {
        self.acceptance.count()
    }

    /// Number of proposals that were rejected because they could not be
    /// decoded or evaluated.
    pub fn failed(&self) -> u64 {
        self.failed
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_draw(&mut self, info: &SampleInfo) {
        if info.failure.is_some() {
            self.failed += 1;
        }
        self.acceptance.add(info.acceptance_probability);
    }
}
