//! Recorded draws of a chain and summaries of the rate matrix ensemble.

use arrow::{
    array::{ArrayBuilder, BooleanBuilder, FixedSizeListBuilder, PrimitiveBuilder, StructArray},
    datatypes::{Field, Float64Type, UInt64Type},
};
use faer::Mat;
use itertools::Itertools;

use crate::{
    chain::ChainDraw,
    error::{RateMatrixError, Result},
    rate_matrix::RateMatrix,
};

/// The draws recorded from one chain.
#[derive(Debug, Clone)]
pub struct RateMatrixTrace {
    n_states: usize,
    lag_time: f64,
    draws: Vec<ChainDraw>,
}

impl RateMatrixTrace {
    pub fn new(n_states: usize, lag_time: f64) -> Self {
        Self {
            n_states,
            lag_time,
            draws: Vec::new(),
        }
    }

    /// Append a draw. Fails if the draw has a different number of states.
    pub fn push(&mut self, draw: ChainDraw) -> Result<()> {
        check_draw(&draw, self.n_states)?;
        self.draws.push(draw);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn lag_time(&self) -> f64 {
        self.lag_time
    }

    pub fn draws(&self) -> &[ChainDraw] {
        &self.draws
    }

    /// Drop the first `count` draws.
    pub fn discard_warmup(&mut self, count: usize) {
        let count = count.min(self.draws.len());
        self.draws.drain(..count);
    }

    /// Fraction of recorded iterations whose proposal was accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.draws.is_empty() {
            return 0.;
        }
        self.draws.iter().filter(|d| d.accepted).count() as f64 / self.draws.len() as f64
    }

    pub fn mean_rates(&self) -> Option<Mat<f64>> {
        if self.draws.is_empty() {
            return None;
        }
        let n = self.n_states;
        let count = self.draws.len() as f64;
        Some(Mat::from_fn(n, n, |i, j| {
            self.draws.iter().map(|d| d.rates[(i, j)]).sum::<f64>() / count
        }))
    }

    pub fn mean_stationary(&self) -> Option<Vec<f64>> {
        if self.draws.is_empty() {
            return None;
        }
        let count = self.draws.len() as f64;
        Some(
            (0..self.n_states)
                .map(|i| self.draws.iter().map(|d| d.stationary[i]).sum::<f64>() / count)
                .collect(),
        )
    }

    /// Symmetric empirical interval of the rate `K[from][to]`.
    pub fn rate_interval(&self, from: usize, to: usize, interval: f64) -> Option<(f64, f64)> {
        let samples = self.draws.iter().map(|d| d.rates[(from, to)]).collect_vec();
        empirical_interval(&samples, interval)
    }

    /// Symmetric empirical interval of the stationary probability of `state`.
    pub fn stationary_interval(&self, state: usize, interval: f64) -> Option<(f64, f64)> {
        let samples = self.draws.iter().map(|d| d.stationary[state]).collect_vec();
        empirical_interval(&samples, interval)
    }

    /// Relaxation timescales of every recorded rate matrix.
    pub fn timescales(&self) -> Result<Vec<Vec<f64>>> {
        self.draws
            .iter()
            .map(|d| {
                RateMatrix::new_unchecked(d.rates.clone(), d.stationary.clone()).timescales()
            })
            .collect()
    }

    /// Convert the draws to an arrow struct array with one row per draw.
    pub fn to_arrow(&self) -> StructArray {
        let mut builder = TraceBuilder::new(self.n_states);
        for draw in self.draws.iter() {
            builder.push_unchecked(draw);
        }
        builder.finalize()
    }
}

fn check_draw(draw: &ChainDraw, n_states: usize) -> Result<()> {
    let rates = &draw.rates;
    if draw.stationary.len() != n_states || rates.nrows() != n_states || rates.ncols() != n_states {
        return Err(RateMatrixError::Dimension(format!(
            "draw {} has {} states and a {}x{} rate matrix, expected {n_states} states",
            draw.iteration,
            draw.stationary.len(),
            rates.nrows(),
            rates.ncols()
        )));
    }
    Ok(())
}

/// Sorted-sample interval containing the central `interval` fraction of `samples`.
pub fn empirical_interval(samples: &[f64], interval: f64) -> Option<(f64, f64)> {
    if samples.is_empty() || !(0. ..=1.).contains(&interval) {
        return None;
    }
    let sorted = samples.iter().copied().sorted_by(f64::total_cmp).collect_vec();
    let last = (sorted.len() - 1) as f64;
    let low = (last * (0.5 - interval / 2.)).round() as usize;
    let high = (last * (0.5 + interval / 2.)).round() as usize;
    Some((sorted[low], sorted[high.min(sorted.len() - 1)]))
}

/// Columnar builder for chain draws.
pub struct TraceBuilder {
    n_states: usize,
    iteration: PrimitiveBuilder<UInt64Type>,
    log_likelihood: PrimitiveBuilder<Float64Type>,
    accepted: BooleanBuilder,
    stationary: FixedSizeListBuilder<PrimitiveBuilder<Float64Type>>,
    rates: FixedSizeListBuilder<PrimitiveBuilder<Float64Type>>,
}

impl TraceBuilder {
    pub fn new(n_states: usize) -> Self {
        Self {
            n_states,
            iteration: PrimitiveBuilder::new(),
            log_likelihood: PrimitiveBuilder::new(),
            accepted: BooleanBuilder::new(),
            stationary: FixedSizeListBuilder::new(PrimitiveBuilder::new(), n_states as i32),
            rates: FixedSizeListBuilder::new(
                PrimitiveBuilder::new(),
                (n_states * n_states) as i32,
            ),
        }
    }

    pub fn append_value(&mut self, draw: &ChainDraw) -> Result<()> {
        check_draw(draw, self.n_states)?;
        self.push_unchecked(draw);
        Ok(())
    }

    fn push_unchecked(&mut self, draw: &ChainDraw) {
        let n = self.n_states;
        self.iteration.append_value(draw.iteration);
        self.log_likelihood.append_value(draw.log_likelihood);
        self.accepted.append_value(draw.accepted);
        self.stationary.values().append_slice(&draw.stationary);
        self.stationary.append(true);
        for i in 0..n {
            for j in 0..n {
                self.rates.values().append_value(draw.rates[(i, j)]);
            }
        }
        self.rates.append(true);
    }

    pub fn finalize(self) -> StructArray {
        let Self {
            mut iteration,
            mut log_likelihood,
            mut accepted,
            mut stationary,
            mut rates,
            ..
        } = self;

        let arrays = vec![
            ArrayBuilder::finish(&mut iteration),
            ArrayBuilder::finish(&mut log_likelihood),
            ArrayBuilder::finish(&mut accepted),
            ArrayBuilder::finish(&mut stationary),
            ArrayBuilder::finish(&mut rates),
        ];
        Self::struct_array(arrays)
    }

    pub fn inspect(&self) -> StructArray {
        let arrays = vec![
            ArrayBuilder::finish_cloned(&self.iteration),
            ArrayBuilder::finish_cloned(&self.log_likelihood),
            ArrayBuilder::finish_cloned(&self.accepted),
            ArrayBuilder::finish_cloned(&self.stationary),
            ArrayBuilder::finish_cloned(&self.rates),
        ];
        Self::struct_array(arrays)
    }

    fn struct_array(arrays: Vec<arrow::array::ArrayRef>) -> StructArray {
        let names = ["iteration", "log_likelihood", "accepted", "stationary", "rates"];
        let fields = names
            .iter()
            .zip(arrays.iter())
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), false))
            .collect_vec();
        StructArray::new(fields.into(), arrays, None)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use arrow::{array::Array, datatypes::DataType};
    use faer::Mat;
    use pretty_assertions::assert_eq;

    use super::{empirical_interval, RateMatrixTrace, TraceBuilder};
    use crate::{
        chain::ChainDraw, error::RateMatrixError, rate_matrix::test_matrices::three_state,
    };

    fn trace(len: usize) -> RateMatrixTrace {
        let matrix = three_state();
        let mut trace = RateMatrixTrace::new(3, 1.);
        for iteration in 0..len {
            let scale = 1. + iteration as f64;
            trace.push(ChainDraw {
                iteration: iteration as u64,
                rates: Mat::from_fn(3, 3, |i, j| matrix.rate(i, j) * scale),
                stationary: matrix.stationary().into(),
                log_likelihood: -(iteration as f64),
                accepted: iteration % 2 == 0,
            })
            .unwrap();
        }
        trace
    }

    #[test]
    fn interval_of_sorted_sample() {
        let samples = (0..101).rev().map(|x| x as f64).collect::<Vec<_>>();
        let (low, high) = empirical_interval(&samples, 0.9).unwrap();
        assert_eq!(low, 5.);
        assert_eq!(high, 95.);
        assert_eq!(empirical_interval(&[2.], 0.95), Some((2., 2.)));
        assert_eq!(empirical_interval(&[], 0.95), None);
        assert_eq!(empirical_interval(&[1., 2.], 1.5), None);
    }

    #[test]
    fn ensemble_means() {
        let trace = trace(4);
        let matrix = three_state();
        let mean = trace.mean_rates().unwrap();
        assert_abs_diff_eq!(mean[(0, 1)], matrix.rate(0, 1) * 2.5, epsilon = 1e-14);
        let pi = trace.mean_stationary().unwrap();
        assert_abs_diff_eq!(pi[1], 0.5, epsilon = 1e-14);
        assert_abs_diff_eq!(trace.acceptance_rate(), 0.5);

        let (low, high) = trace.rate_interval(0, 1, 1.).unwrap();
        assert_abs_diff_eq!(low, matrix.rate(0, 1), epsilon = 1e-14);
        assert_abs_diff_eq!(high, matrix.rate(0, 1) * 4., epsilon = 1e-14);
        let (low, high) = trace.stationary_interval(2, 0.5).unwrap();
        assert_eq!(low, high);

        let timescales = trace.timescales().unwrap();
        assert_eq!(timescales.len(), 4);
        assert_abs_diff_eq!(timescales[0][0], 2. * timescales[1][0], epsilon = 1e-9);

        assert!(RateMatrixTrace::new(3, 1.).mean_rates().is_none());
    }

    #[test]
    fn warmup() {
        let mut trace = trace(5);
        trace.discard_warmup(2);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.draws()[0].iteration, 2);
        trace.discard_warmup(10);
        assert!(trace.is_empty());
    }

    #[test]
    fn arrow_columns() {
        let trace = trace(6);
        let array = trace.to_arrow();
        assert_eq!(array.len(), 6);
        assert_eq!(array.num_columns(), 5);
        let rates = array.column_by_name("rates").unwrap();
        assert!(matches!(rates.data_type(), DataType::FixedSizeList(_, 9)));
        let stationary = array.column_by_name("stationary").unwrap();
        assert!(matches!(stationary.data_type(), DataType::FixedSizeList(_, 3)));
        assert_eq!(array.column_by_name("iteration").unwrap().data_type(), &DataType::UInt64);

        let mut builder = TraceBuilder::new(3);
        builder.append_value(&trace.draws()[0]).unwrap();
        assert_eq!(builder.inspect().len(), 1);
        builder.append_value(&trace.draws()[1]).unwrap();
        assert_eq!(builder.finalize().len(), 2);
    }

    #[test]
    fn draws_of_other_size_are_rejected() {
        let mut trace = trace(2);
        let draw = ChainDraw {
            iteration: 2,
            rates: Mat::zeros(2, 2),
            stationary: vec![0.5, 0.5].into(),
            log_likelihood: 0.,
            accepted: true,
        };
        let err = trace.push(draw.clone()).unwrap_err();
        assert!(matches!(err, RateMatrixError::Dimension(_)));
        assert_eq!(trace.len(), 2);

        let err = TraceBuilder::new(3).append_value(&draw).unwrap_err();
        assert!(matches!(err, RateMatrixError::Dimension(_)));
    }
}
