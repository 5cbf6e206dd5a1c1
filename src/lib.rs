//! Likelihood-free Bayesian inference with Population Monte Carlo ABC.
//!
//! A model only has to simulate data for a parameter vector and report the
//! distance of the simulation to the observed data, see [`AbcModel`].
//! [`pmc_abc`] runs a sequence of rejection rounds with a shrinking tolerance.
//! Every round after the first proposes candidates by resampling the weighted
//! population of the previous round and perturbing them with a gaussian kernel.
//!
//! ```no_run
//! use abc_pmc::{pmc_abc, test_models::LinearGaussian, PmcSettings};
//!
//! # fn main() -> anyhow::Result<()> {
//! let model = LinearGaussian::new(20., 1., 1., 100.)?;
//! let settings = PmcSettings {
//!     epsilon_0: 50.,
//!     steps: 10,
//!     max_iter: 2000,
//!     ..Default::default()
//! };
//! let trace = pmc_abc(&model, &settings, None)?;
//! let posterior = trace.last().expect("at least one round").accepted();
//! println!("{:?}", posterior.posterior_mean());
//! # Ok(())
//! # }
//! ```

pub(crate) mod abc;
pub(crate) mod epsilon;
pub(crate) mod executor;
pub(crate) mod kernel;
pub(crate) mod model;
pub(crate) mod pmc;
pub(crate) mod prior;
pub(crate) mod stats;
pub(crate) mod trace;
pub(crate) mod weights;

pub use abc::{
    basic_abc, AbcError, AcceptedSet, Population, Progress, ProgressCallback, Proposal,
    RejectionOptions, RejectionSampler, RejectionSummary, Result, FAILURE_DISTANCE,
};
pub use epsilon::{
    compute_adaptive_alpha, select_epsilon, DistanceQuartiles, EpsilonController,
    EpsilonSettings, EpsilonUpdate,
};
pub use executor::Executor;
pub use kernel::{KernelSettings, PerturbationKernel};
pub use model::{test_models, AbcModel};
pub use pmc::{pmc_abc, run_pmc_abc, PmcSettings, PmcTrace, StepRecord, Termination};
pub use prior::{
    ExponentialPrior, IndependentPrior, LogNormalPrior, MarginalPrior, NormalPrior, UniformPrior,
};
pub use stats::{effective_sample_size, percentile, weighted_covar, weighted_mean, weighted_variance};
pub use trace::StepTraceBuilder;
pub use weights::calc_weights;
