//! Core abstractions for ABC models.
//!
//! The `AbcModel` trait is the only way the sampler talks to a forward model.
//! Besides the prior it needs a combined simulate-and-compare step that
//! returns the distance between simulated and observed summary statistics.

use anyhow::Result;
use rand::Rng;

use crate::prior::IndependentPrior;

/// A stochastic forward model with an independent prior and a fixed observation.
///
/// The sampler never inspects simulations. It only needs a distance between
/// the summary statistics of a simulation at `theta` and those of the
/// observed data.
///
/// The trait is thread-safe so that the candidates of one round can be
/// evaluated in parallel.
pub trait AbcModel: Send + Sync {
    /// The prior over the model parameters.
    fn prior(&self) -> &IndependentPrior;

    /// Simulate data at `theta`, reduce it to summary statistics and return
    /// their distance to the observed summary statistics.
    ///
    /// A simulation that fails, or returns a NaN distance, does not abort
    /// sampling. The candidate is rejected instead. Implementations are
    /// responsible for bounding their own run time and should return an error
    /// rather than block.
    fn simulate_and_reduce<R: Rng + ?Sized>(&self, theta: &[f64], rng: &mut R) -> Result<f64>;

    /// The number of free parameters.
    fn dim(&self) -> usize {
        self.prior().dim()
    }

    fn draw_from_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> Box<[f64]> {
        self.prior().sample(rng)
    }

    /// Joint prior density, the product of the marginal densities.
    fn prior_density(&self, theta: &[f64]) -> f64 {
        self.prior().density(theta)
    }
}

/// Small models with a known answer, used in tests, benchmarks and demos.
pub mod test_models {
    use anyhow::{bail, Result};
    use rand::Rng;
    use rand_distr::StandardNormal;

    use super::AbcModel;
    use crate::prior::{IndependentPrior, UniformPrior};

    /// One parameter `tau` with a `Uniform(low, high)` prior. The distance of
    /// a simulation is `|tau - true_tau| + noise * |z|` with standard normal `z`.
    #[derive(Debug)]
    pub struct LinearGaussian {
        prior: IndependentPrior,
        true_tau: f64,
        noise: f64,
    }

    impl LinearGaussian {
        pub fn new(true_tau: f64, noise: f64, low: f64, high: f64) -> crate::Result<Self> {
            let prior = IndependentPrior::new(vec![Box::new(UniformPrior::new(low, high)?)])?;
            Ok(Self {
                prior,
                true_tau,
                noise,
            })
        }
    }

    impl AbcModel for LinearGaussian {
        fn prior(&self) -> &IndependentPrior {
            &self.prior
        }

        fn simulate_and_reduce<R: Rng + ?Sized>(&self, theta: &[f64], rng: &mut R) -> Result<f64> {
            let z: f64 = rng.sample(StandardNormal);
            Ok((theta[0] - self.true_tau).abs() + self.noise * z.abs())
        }
    }

    /// Normal observations with unknown location per dimension. Each
    /// simulation draws `num_obs` points per dimension and reports the
    /// euclidean distance between simulated and observed means.
    #[derive(Debug)]
    pub struct NormalMeans {
        prior: IndependentPrior,
        observed_means: Box<[f64]>,
        num_obs: usize,
    }

    impl NormalMeans {
        pub fn new(observed_means: &[f64], num_obs: usize, low: f64, high: f64) -> crate::Result<Self> {
            let marginals = observed_means
                .iter()
                .map(|_| -> crate::Result<Box<dyn crate::prior::MarginalPrior>> {
                    Ok(Box::new(UniformPrior::new(low, high)?))
                })
                .collect::<crate::Result<Vec<_>>>()?;
            Ok(Self {
                prior: IndependentPrior::new(marginals)?,
                observed_means: observed_means.into(),
                num_obs,
            })
        }
    }

    impl AbcModel for NormalMeans {
        fn prior(&self) -> &IndependentPrior {
            &self.prior
        }

        fn simulate_and_reduce<R: Rng + ?Sized>(&self, theta: &[f64], rng: &mut R) -> Result<f64> {
            let mut dist = 0f64;
            for (&mu, &observed) in theta.iter().zip(self.observed_means.iter()) {
                let sum: f64 = (0..self.num_obs)
                    .map(|_| mu + rng.sample::<f64, _>(StandardNormal))
                    .sum();
                let diff = sum / (self.num_obs as f64) - observed;
                dist += diff * diff;
            }
            Ok(dist.sqrt())
        }
    }

    /// Wraps a model and fails every simulation whose first parameter lies
    /// above `threshold`, alternating between errors and NaN distances.
    #[derive(Debug)]
    pub struct Flaky<M> {
        pub inner: M,
        pub threshold: f64,
    }

    impl<M: AbcModel> AbcModel for Flaky<M> {
        fn prior(&self) -> &IndependentPrior {
            self.inner.prior()
        }

        fn simulate_and_reduce<R: Rng + ?Sized>(&self, theta: &[f64], rng: &mut R) -> Result<f64> {
            if theta[0] > self.threshold {
                if rng.random::<bool>() {
                    bail!("solver did not converge at {:?}", theta);
                }
                return Ok(f64::NAN);
            }
            self.inner.simulate_and_reduce(theta, rng)
        }
    }
}
