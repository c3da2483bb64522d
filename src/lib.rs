//! Sample reversible continuous time Markov rate matrices that are consistent
//! with transition counts observed at a fixed lag time.
//!
//! A rate matrix and its stationary distribution are encoded as an
//! unconstrained parameter vector, so that every proposal of a Gaussian random
//! walk decodes to a valid generator that satisfies detailed balance. The
//! likelihood of the observed counts is evaluated through the matrix
//! exponential of the candidate generator.
//!
//! Exchange rates are stored as logarithms, so only generators whose
//! off-diagonal rates are all strictly positive can be encoded. A zero rate
//! is a valid [`RateMatrix`], but [`pack`] rejects it.
//!
//! ```no_run
//! use rate_mcmc::{sample_sequentially, CountMatrix, SamplerSettings};
//!
//! let counts = CountMatrix::from_rows(&[[950u64, 30, 20], [25, 900, 75], [15, 60, 925]])?;
//! let settings = SamplerSettings {
//!     num_iterations: 5000,
//!     seed: 42,
//!     ..Default::default()
//! };
//! let mut chain = sample_sequentially(counts, 1.0, settings)?;
//! for draw in chain.by_ref() {
//!     println!("{} {:?}", draw.log_likelihood, draw.stationary);
//! }
//! println!("acceptance rate {}", chain.acceptance_rate());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub(crate) mod chain;
pub(crate) mod collector;
pub(crate) mod counts;
pub(crate) mod error;
pub(crate) mod guess;
pub(crate) mod math;
pub(crate) mod parameters;
pub(crate) mod rate_matrix;
pub(crate) mod sampler;
pub(crate) mod trace;

pub use chain::{CancelToken, ChainDraw, ChainPhase, ChainSummary, RateMatrixChain, SampleInfo};
pub use collector::{AcceptanceRateCollector, Collector};
pub use counts::{CountMatrix, MIN_TRANSITION_PROBABILITY};
pub use error::RateMatrixError;
pub use guess::{initial_guess, GuessSettings};
pub use math::{expm_reversible, logm_reversible, reversible_eigenvalues};
pub use parameters::{pack, unpack, ParameterClass, ParameterLayout};
pub use rate_matrix::RateMatrix;
pub use sampler::{sample_sequentially, sample_sequentially_with, sample_trace, SamplerSettings};
pub use trace::{empirical_interval, RateMatrixTrace, TraceBuilder};
