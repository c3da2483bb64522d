use faer::Mat;

use crate::error::{RateMatrixError, Result};

/// Transition probabilities are clamped to this value before taking the
/// logarithm, so that observed transitions that a candidate forbids give a
/// large but finite penalty.
pub const MIN_TRANSITION_PROBABILITY: f64 = f64::MIN_POSITIVE;

/// Observed transition counts `C[i][j]` between states at a fixed lag time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMatrix {
    n_states: usize,
    counts: Box<[u64]>,
}

impl CountMatrix {
    /// Create a count matrix from row-major counts.
    pub fn new(n_states: usize, counts: Vec<u64>) -> Result<Self> {
        if n_states == 0 {
            return Err(RateMatrixError::Dimension(
                "count matrix needs at least one state".into(),
            ));
        }
        if counts.len() != n_states * n_states {
            return Err(RateMatrixError::Dimension(format!(
                "expected {} counts for {} states, got {}",
                n_states * n_states,
                n_states,
                counts.len()
            )));
        }
        Ok(Self {
            n_states,
            counts: counts.into(),
        })
    }

    pub fn from_rows<T: AsRef<[u64]>>(rows: &[T]) -> Result<Self> {
        let n_states = rows.len();
        let mut counts = Vec::with_capacity(n_states * n_states);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != n_states {
                return Err(RateMatrixError::Dimension(format!(
                    "row {i} of the count matrix has {} entries, expected {n_states}",
                    row.len()
                )));
            }
            counts.extend_from_slice(row);
        }
        Self::new(n_states, counts)
    }

    /// Count transitions `s[t] -> s[t + lag]` in discrete state trajectories.
    pub fn from_trajectories<'a>(
        trajectories: impl IntoIterator<Item = &'a [usize]>,
        n_states: usize,
        lag: usize,
    ) -> Result<Self> {
        if lag == 0 {
            return Err(RateMatrixError::Dimension("lag must be at least one step".into()));
        }
        let mut counts = vec![0u64; n_states * n_states];
        for traj in trajectories {
            if let Some(&bad) = traj.iter().find(|&&s| s >= n_states) {
                return Err(RateMatrixError::Dimension(format!(
                    "trajectory visits state {bad}, but there are only {n_states} states"
                )));
            }
            for (&from, &to) in traj.iter().zip(traj.iter().skip(lag)) {
                counts[from * n_states + to] += 1;
            }
        }
        Self::new(n_states, counts)
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn get(&self, from: usize, to: usize) -> u64 {
        self.counts[from * self.n_states + to]
    }

    pub fn row(&self, from: usize) -> &[u64] {
        &self.counts[from * self.n_states..(from + 1) * self.n_states]
    }

    pub fn row_total(&self, from: usize) -> u64 {
        self.row(from).iter().sum()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn to_mat(&self) -> Mat<f64> {
        Mat::from_fn(self.n_states, self.n_states, |i, j| self.get(i, j) as f64)
    }

    /// The count log-likelihood `Σ C[i][j] ln T[i][j]` of a transition matrix.
    ///
    /// Fails with a dimension error if `transition` does not match the number
    /// of states.
    pub fn log_likelihood(&self, transition: &Mat<f64>) -> Result<f64> {
        let n = self.n_states;
        if transition.nrows() != n || transition.ncols() != n {
            return Err(RateMatrixError::Dimension(format!(
                "transition matrix is {}x{}, count matrix has {n} states",
                transition.nrows(),
                transition.ncols()
            )));
        }
        let mut logp = 0f64;
        for i in 0..n {
            for (j, &count) in self.row(i).iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let prob = transition[(i, j)].max(MIN_TRANSITION_PROBABILITY);
                logp += count as f64 * prob.ln();
            }
        }
        Ok(logp)
    }
}
