use std::time::{Duration, Instant};

use faer::Mat;
use rand::{
    distr::{weighted::WeightedIndex, Distribution},
    Rng, SeedableRng,
};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::debug;

use crate::{
    executor::Executor,
    kernel::PerturbationKernel,
    model::AbcModel,
    stats::{weighted_covar, weighted_mean},
};

/// Distance assigned to candidates whose simulation failed.
pub const FAILURE_DISTANCE: f64 = 1e5;

#[derive(Error, Debug)]
pub enum AbcError {
    #[error("all {accepted} importance weights are zero or not finite, the perturbation kernel has no support overlap with the prior")]
    DegenerateWeights { accepted: usize },
    #[error("kernel covariance has non-finite entries: {covariance:?}")]
    NonFiniteCovariance { covariance: Box<[f64]> },
    #[error("kernel covariance is not positive definite: {covariance:?}")]
    NotPositiveDefinite { covariance: Box<[f64]> },
    #[error("no non-negative perturbation of {center:?} found in {tries} tries")]
    PerturbationExhausted { tries: usize, center: Box<[f64]> },
    #[error("weights must sum to one, got {sum}")]
    WeightsNotNormalized { sum: f64 },
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("population is empty")]
    EmptyPopulation,
    #[error("previous population has no importance weights")]
    MissingWeights,
    #[error("invalid prior: {0}")]
    InvalidPrior(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("could not start thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("round {round} failed at epsilon {epsilon}")]
    Round {
        round: usize,
        epsilon: f64,
        /// Accepted members of the round, `None` if sampling itself failed.
        accepted: Option<usize>,
        #[source]
        source: Box<AbcError>,
    },
}

pub type Result<T> = std::result::Result<T, AbcError>;

/// The members of a population whose distance is within tolerance.
#[derive(Debug, Clone)]
pub struct AcceptedSet {
    dim: usize,
    thetas: Vec<Box<[f64]>>,
    distances: Box<[f64]>,
    weights: Option<Box<[f64]>>,
}

impl AcceptedSet {
    pub(crate) fn new(
        dim: usize,
        thetas: Vec<Box<[f64]>>,
        distances: Box<[f64]>,
        weights: Option<Box<[f64]>>,
    ) -> Self {
        assert!(thetas.len() == distances.len());
        if let Some(weights) = weights.as_ref() {
            assert!(weights.len() == thetas.len());
        }
        Self {
            dim,
            thetas,
            distances,
            weights,
        }
    }

    pub fn len(&self) -> usize {
        self.thetas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thetas.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn thetas(&self) -> &[Box<[f64]>] {
        &self.thetas
    }

    pub fn distances(&self) -> &[f64] {
        &self.distances
    }

    /// Normalized importance weights. Not available for sample-only rounds.
    pub fn weights(&self) -> Option<&[f64]> {
        self.weights.as_deref()
    }

    /// The accepted parameters as a `dim × len` matrix, one column per member.
    pub fn to_matrix(&self) -> Mat<f64> {
        Mat::from_fn(self.dim, self.len(), |i, j| self.thetas[j][i])
    }

    fn weights_or_uniform(&self) -> Box<[f64]> {
        match self.weights.as_ref() {
            Some(weights) => weights.clone(),
            None => vec![1. / self.len() as f64; self.len()].into(),
        }
    }

    /// Weighted posterior mean. Members count equally if there are no weights.
    pub fn posterior_mean(&self) -> Box<[f64]> {
        if self.is_empty() {
            return vec![f64::NAN; self.dim].into();
        }
        weighted_mean(&self.thetas, &self.weights_or_uniform())
    }

    /// Weighted posterior covariance with reliability-weights correction.
    pub fn posterior_covariance(&self) -> Result<Mat<f64>> {
        if self.is_empty() {
            return Err(AbcError::EmptyPopulation);
        }
        weighted_covar(&self.thetas, &self.weights_or_uniform())
    }
}

/// All candidates of one rejection round.
#[derive(Debug, Clone)]
pub struct Population {
    dim: usize,
    epsilon: f64,
    thetas: Vec<Box<[f64]>>,
    distances: Box<[f64]>,
    accepted: Box<[bool]>,
    failures: usize,
}

impl Population {
    pub fn len(&self) -> usize {
        self.thetas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thetas.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The tolerance the candidates were accepted against.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn thetas(&self) -> &[Box<[f64]>] {
        &self.thetas
    }

    pub fn distances(&self) -> &[f64] {
        &self.distances
    }

    pub fn accepted_flags(&self) -> &[bool] {
        &self.accepted
    }

    /// Number of candidates whose simulation failed.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn n_accepted(&self) -> usize {
        self.accepted.iter().filter(|&&acc| acc).count()
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.is_empty() {
            return 0.;
        }
        self.n_accepted() as f64 / self.len() as f64
    }

    pub fn accepted_thetas(&self) -> Vec<Box<[f64]>> {
        self.thetas
            .iter()
            .zip(self.accepted.iter())
            .filter(|(_, &acc)| acc)
            .map(|(theta, _)| theta.clone())
            .collect()
    }

    pub fn accepted_distances(&self) -> Box<[f64]> {
        self.distances
            .iter()
            .zip(self.accepted.iter())
            .filter(|(_, &acc)| acc)
            .map(|(&dist, _)| dist)
            .collect()
    }

    pub(crate) fn accepted_set(&self, weights: Option<Box<[f64]>>) -> AcceptedSet {
        AcceptedSet::new(
            self.dim,
            self.accepted_thetas(),
            self.accepted_distances(),
            weights,
        )
    }

    /// The accepted members with placeholder importance structure: uniform
    /// weights, a zero covariance and an effective sample size equal to the
    /// number of accepted members.
    pub fn summary(&self) -> RejectionSummary {
        let n = self.n_accepted();
        let weights = if n == 0 {
            None
        } else {
            Some(vec![1. / n as f64; n].into())
        };
        RejectionSummary {
            accepted: self.accepted_set(weights),
            covariance: Mat::zeros(self.dim, self.dim),
            ess: n as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RejectionSummary {
    pub accepted: AcceptedSet,
    pub covariance: Mat<f64>,
    pub ess: f64,
}

/// Where the candidates of a round come from.
#[derive(Debug, Clone, Copy)]
pub enum Proposal<'a> {
    /// Independent draws from the prior.
    Prior,
    /// Resample a member of the previous population by weight and perturb it
    /// with the kernel.
    Pmc {
        previous: &'a AcceptedSet,
        kernel: &'a PerturbationKernel,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RejectionOptions {
    /// Distance recorded for candidates whose simulation failed.
    pub failure_distance: f64,
    /// Maximum number of perturbations of one resampled member before the
    /// round is aborted.
    pub max_perturbation_tries: usize,
}

impl Default for RejectionOptions {
    fn default() -> Self {
        Self {
            failure_distance: FAILURE_DISTANCE,
            max_perturbation_tries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub round: usize,
    pub evaluated: usize,
    pub total: usize,
    pub accepted: usize,
    pub epsilon: f64,
    pub elapsed: Duration,
}

/// Called while a round is sampled, every `rate` candidates.
pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(&Progress) + Send>,
    pub rate: usize,
}

struct Candidate {
    theta: Box<[f64]>,
    distance: f64,
    failed: bool,
}

impl Candidate {
    /// Failed simulations are rejected at any tolerance.
    fn is_accepted(&self, epsilon: f64) -> bool {
        !self.failed && (self.distance <= epsilon)
    }
}

enum Source<'a> {
    Prior,
    Pmc {
        previous: &'a AcceptedSet,
        kernel: &'a PerturbationKernel,
        index: WeightedIndex<f64>,
    },
}

/// Draws and evaluates the candidates of one round.
pub struct RejectionSampler<'a, M: AbcModel> {
    model: &'a M,
    options: RejectionOptions,
    executor: &'a Executor,
}

impl<'a, M: AbcModel> RejectionSampler<'a, M> {
    pub fn new(model: &'a M, options: RejectionOptions, executor: &'a Executor) -> Self {
        Self {
            model,
            options,
            executor,
        }
    }

    /// Produce a population of exactly `max_iter` candidates.
    ///
    /// Candidate `i` uses its own random stream derived from `seed`, so the
    /// population is the same for every executor.
    pub fn sample_round(
        &self,
        round: usize,
        seed: u64,
        epsilon: f64,
        max_iter: usize,
        proposal: Proposal<'_>,
        mut progress: Option<&mut ProgressCallback>,
    ) -> Result<Population> {
        let dim = self.model.dim();
        let source = match proposal {
            Proposal::Prior => Source::Prior,
            Proposal::Pmc { previous, kernel } => {
                if let Some(found) = [previous.dim(), kernel.dim()]
                    .into_iter()
                    .find(|&found| found != dim)
                {
                    return Err(AbcError::DimensionMismatch {
                        expected: dim,
                        found,
                    });
                }
                let weights = previous.weights().ok_or(AbcError::MissingWeights)?;
                if weights.is_empty() {
                    return Err(AbcError::EmptyPopulation);
                }
                let index = WeightedIndex::new(weights)
                    .map_err(|_| AbcError::DegenerateWeights { accepted: weights.len() })?;
                Source::Pmc {
                    previous,
                    kernel,
                    index,
                }
            }
        };

        let chunk_size = match progress.as_ref() {
            Some(callback) if callback.rate > 0 => callback.rate,
            _ => max_iter.max(1),
        };

        let start = Instant::now();
        let mut candidates: Vec<Candidate> = Vec::with_capacity(max_iter);
        let mut accepted = 0;
        let mut begin = 0;
        while begin < max_iter {
            let end = (begin + chunk_size).min(max_iter);
            let chunk = self.executor.map(begin..end, |i| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(i as u64);
                self.evaluate(&source, &mut rng)
            });
            for candidate in chunk {
                let candidate = candidate?;
                if candidate.is_accepted(epsilon) {
                    accepted += 1;
                }
                candidates.push(candidate);
            }
            begin = end;

            if let Some(ProgressCallback { callback, .. }) = progress.as_mut() {
                callback(&Progress {
                    round,
                    evaluated: end,
                    total: max_iter,
                    accepted,
                    epsilon,
                    elapsed: start.elapsed(),
                });
            }
        }

        let failures = candidates.iter().filter(|cand| cand.failed).count();
        if failures > 0 {
            debug!(round, failures, "Simulations failed, candidates rejected");
        }

        let mut thetas = Vec::with_capacity(max_iter);
        let mut distances = Vec::with_capacity(max_iter);
        let mut flags = Vec::with_capacity(max_iter);
        for candidate in candidates {
            flags.push(candidate.is_accepted(epsilon));
            distances.push(candidate.distance);
            thetas.push(candidate.theta);
        }

        Ok(Population {
            dim,
            epsilon,
            thetas,
            distances: distances.into(),
            accepted: flags.into(),
            failures,
        })
    }

    fn evaluate<R: Rng + ?Sized>(&self, source: &Source<'_>, rng: &mut R) -> Result<Candidate> {
        let theta = match source {
            Source::Prior => self.model.draw_from_prior(rng),
            Source::Pmc {
                previous,
                kernel,
                index,
            } => {
                let center = &previous.thetas()[index.sample(rng)];
                self.perturb(kernel, center, rng)?
            }
        };

        let (distance, failed) = match self.model.simulate_and_reduce(&theta, rng) {
            Ok(dist) if dist.is_finite() => (dist, false),
            Ok(_) | Err(_) => (self.options.failure_distance, true),
        };
        Ok(Candidate {
            theta,
            distance,
            failed,
        })
    }

    fn perturb<R: Rng + ?Sized>(
        &self,
        kernel: &PerturbationKernel,
        center: &[f64],
        rng: &mut R,
    ) -> Result<Box<[f64]>> {
        let mut theta = vec![0f64; center.len()];
        for _ in 0..self.options.max_perturbation_tries {
            kernel.perturb(rng, center, &mut theta);
            if theta.iter().all(|&val| val >= 0.) {
                return Ok(theta.into());
            }
        }
        Err(AbcError::PerturbationExhausted {
            tries: self.options.max_perturbation_tries,
            center: center.into(),
        })
    }
}

/// One sequential rejection round with default options and no progress
/// reporting.
pub fn basic_abc<M: AbcModel>(
    model: &M,
    epsilon: f64,
    max_iter: usize,
    proposal: Proposal<'_>,
    seed: u64,
) -> Result<Population> {
    let executor = Executor::Sequential;
    RejectionSampler::new(model, RejectionOptions::default(), &executor)
        .sample_round(0, seed, epsilon, max_iter, proposal, None)
}
