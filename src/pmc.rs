use faer::Mat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::{
    abc::{
        AbcError, AcceptedSet, Population, ProgressCallback, Proposal, RejectionOptions,
        RejectionSampler, Result,
    },
    epsilon::{EpsilonController, EpsilonSettings},
    executor::Executor,
    kernel::{KernelSettings, PerturbationKernel},
    model::AbcModel,
    stats::effective_sample_size,
    weights::calc_weights_on,
};

/// Settings for a PMC-ABC run.
#[derive(Debug, Clone, Copy)]
pub struct PmcSettings {
    /// Tolerance of the first round.
    pub epsilon_0: f64,
    /// A round needs at least this many accepted members to build the
    /// next perturbation kernel. At least two.
    pub min_samples: usize,
    /// Scheduled number of rounds.
    pub steps: usize,
    /// Only resample: after the first round, keep its weights and kernel
    /// instead of recomputing them.
    pub sample_only: bool,
    /// Candidates per round.
    pub max_iter: usize,
    /// Stop after a round whose acceptance rate is below this value.
    pub min_acc_rate: f64,
    /// Acceptance rate the tolerance schedule aims for.
    pub target_acc_rate: f64,
    /// Stop once the next tolerance falls below this value.
    pub epsilon_floor: f64,
    pub seed: u64,
    /// Evaluate the candidates of a round on this many threads.
    pub num_threads: usize,
    pub kernel: KernelSettings,
    pub epsilon: EpsilonSettings,
    pub rejection: RejectionOptions,
}

impl Default for PmcSettings {
    fn default() -> Self {
        Self {
            epsilon_0: 1.,
            min_samples: 10,
            steps: 10,
            sample_only: false,
            max_iter: 1000,
            min_acc_rate: 1e-3,
            target_acc_rate: 0.05,
            epsilon_floor: 5e-3,
            seed: 0,
            num_threads: 1,
            kernel: KernelSettings::default(),
            epsilon: EpsilonSettings::default(),
            rejection: RejectionOptions::default(),
        }
    }
}

impl PmcSettings {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(AbcError::InvalidSettings(msg));
        if !(self.epsilon_0.is_finite() & (self.epsilon_0 >= 0.)) {
            return fail(format!("epsilon_0 must be finite and non-negative, got {}", self.epsilon_0));
        }
        if self.steps == 0 {
            return fail("steps must be positive".to_string());
        }
        if self.max_iter == 0 {
            return fail("max_iter must be positive".to_string());
        }
        if self.min_samples < 2 {
            return fail(format!("min_samples must be at least 2, got {}", self.min_samples));
        }
        if !((0. ..=1.).contains(&self.min_acc_rate)) {
            return fail(format!("min_acc_rate must be in [0, 1], got {}", self.min_acc_rate));
        }
        if !((self.target_acc_rate > 0.) & (self.target_acc_rate <= 1.)) {
            return fail(format!(
                "target_acc_rate must be in (0, 1], got {}",
                self.target_acc_rate
            ));
        }
        if !(self.epsilon_floor >= 0.) {
            return fail(format!("epsilon_floor must be non-negative, got {}", self.epsilon_floor));
        }
        let EpsilonSettings {
            alpha_min,
            alpha_max,
            ..
        } = self.epsilon;
        if !((0. < alpha_min) & (alpha_min <= alpha_max) & (alpha_max < 1.)) {
            return fail(format!(
                "adaptation rates must satisfy 0 < alpha_min <= alpha_max < 1, got {} and {}",
                alpha_min, alpha_max
            ));
        }
        if !((self.kernel.bandwidth_scale > 0.) & (self.kernel.jitter >= 0.)) {
            return fail(format!(
                "kernel bandwidth must be positive and jitter non-negative, got {} and {}",
                self.kernel.bandwidth_scale, self.kernel.jitter
            ));
        }
        let failure_distance = self.rejection.failure_distance;
        if !(failure_distance > 0.) {
            return fail(format!("failure_distance must be positive, got {}", failure_distance));
        }
        // failed simulations must not enter the tolerance quartiles
        if !(self.epsilon.max_valid_distance <= failure_distance) {
            return fail(format!(
                "max_valid_distance {} exceeds failure_distance {}",
                self.epsilon.max_valid_distance, failure_distance
            ));
        }
        if self.rejection.max_perturbation_tries == 0 {
            return fail("max_perturbation_tries must be positive".to_string());
        }
        Ok(())
    }
}

/// Snapshot of one finished round.
#[derive(Debug, Clone)]
pub struct StepRecord {
    round: usize,
    accepted: AcceptedSet,
    distances: Box<[f64]>,
    n_total: usize,
    failures: usize,
    epsilon: f64,
    next_epsilon: f64,
    alpha: f64,
    ess: f64,
    kernel_covariance: Option<Mat<f64>>,
}

impl StepRecord {
    /// Index of the round, starting at zero.
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn accepted(&self) -> &AcceptedSet {
        &self.accepted
    }

    /// Distances of all candidates of the round, failed simulations included.
    pub fn distances(&self) -> &[f64] {
        &self.distances
    }

    pub fn n_accepted(&self) -> usize {
        self.accepted.len()
    }

    pub fn n_total(&self) -> usize {
        self.n_total
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.n_accepted() as f64 / self.n_total as f64
    }

    /// The tolerance this round was sampled with.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// The tolerance proposed for the following round.
    pub fn next_epsilon(&self) -> f64 {
        self.next_epsilon
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn ess(&self) -> f64 {
        self.ess
    }

    /// Covariance of the kernel built from this round. `None` if the round
    /// did not refresh the kernel.
    pub fn kernel_covariance(&self) -> Option<&Mat<f64>> {
        self.kernel_covariance.as_ref()
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Termination {
    /// All scheduled rounds ran.
    Completed,
    LowAcceptance { acceptance_rate: f64 },
    EpsilonFloor { epsilon: f64 },
    TooFewAccepted { accepted: usize },
}

#[derive(Debug, Clone)]
pub struct PmcTrace {
    pub steps: Vec<StepRecord>,
    pub termination: Termination,
}

impl PmcTrace {
    pub fn last(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Tolerance of every round, in order.
    pub fn epsilons(&self) -> Vec<f64> {
        self.steps.iter().map(|step| step.epsilon()).collect()
    }
}

/// The weighted population and kernel the next round proposes from.
struct Importance {
    previous: AcceptedSet,
    kernel: PerturbationKernel,
}

fn reweight<M: AbcModel>(
    executor: &Executor,
    model: &M,
    population: &Population,
    current: Option<&Importance>,
    settings: &KernelSettings,
) -> Result<Importance> {
    let thetas = population.accepted_thetas();
    let weights = match current {
        None => {
            let n = thetas.len();
            vec![1. / n as f64; n].into()
        }
        Some(Importance { previous, kernel }) => {
            calc_weights_on(executor, previous, &thetas, kernel, model.prior())?
        }
    };
    let kernel = PerturbationKernel::from_population(&thetas, &weights, settings)?;
    let previous = AcceptedSet::new(
        population.dim(),
        thetas,
        population.accepted_distances(),
        Some(weights),
    );
    Ok(Importance { previous, kernel })
}

/// Run PMC-ABC.
///
/// The first round samples the prior, later rounds resample and perturb the
/// weighted population of the last round that refreshed the kernel. Returns
/// the records of all rounds that ran. A run that stops early, because the
/// acceptance rate or the tolerance dropped too far, returns the records up to
/// and including the round that triggered the stop.
pub fn pmc_abc<M: AbcModel>(
    model: &M,
    settings: &PmcSettings,
    mut progress: Option<ProgressCallback>,
) -> Result<PmcTrace> {
    settings.validate()?;
    if model.dim() == 0 {
        return Err(AbcError::InvalidSettings(
            "model has no parameters".to_string(),
        ));
    }

    let executor = Executor::new(settings.num_threads)?;
    let sampler = RejectionSampler::new(model, settings.rejection, &executor);
    let controller =
        EpsilonController::new(settings.epsilon, settings.steps, settings.target_acc_rate);
    let mut seeds = ChaCha8Rng::seed_from_u64(settings.seed);

    let mut epsilon = settings.epsilon_0;
    let mut importance: Option<Importance> = None;
    let mut steps = Vec::with_capacity(settings.steps);
    let mut termination = Termination::Completed;

    for round in 0..settings.steps {
        let round_seed: u64 = seeds.random();
        let proposal = match importance.as_ref() {
            Some(Importance { previous, kernel }) => Proposal::Pmc { previous, kernel },
            None => Proposal::Prior,
        };

        let population = sampler
            .sample_round(
                round,
                round_seed,
                epsilon,
                settings.max_iter,
                proposal,
                progress.as_mut(),
            )
            .map_err(|source| AbcError::Round {
                round,
                epsilon,
                accepted: None,
                source: Box::new(source),
            })?;
        let n_accepted = population.n_accepted();
        let acceptance_rate = population.acceptance_rate();

        let update = controller.advance(round, population.distances(), epsilon, acceptance_rate);

        // the first kernel is always built, sample-only runs keep it afterwards
        let needs_kernel = importance.is_none() || !settings.sample_only;
        let refreshed = if needs_kernel && (n_accepted >= settings.min_samples) {
            let refreshed = reweight(
                &executor,
                model,
                &population,
                importance.as_ref(),
                &settings.kernel,
            )
            .map_err(|source| AbcError::Round {
                round,
                epsilon,
                accepted: Some(n_accepted),
                source: Box::new(source),
            })?;
            Some(refreshed)
        } else {
            None
        };

        let record = match refreshed.as_ref() {
            Some(Importance { previous, kernel }) => StepRecord {
                round,
                accepted: previous.clone(),
                distances: population.distances().into(),
                n_total: population.len(),
                failures: population.failures(),
                epsilon,
                next_epsilon: update.epsilon,
                alpha: update.alpha,
                ess: previous.weights().map_or(0., effective_sample_size),
                kernel_covariance: Some(kernel.covariance().clone()),
            },
            None => StepRecord {
                round,
                accepted: population.accepted_set(None),
                distances: population.distances().into(),
                n_total: population.len(),
                failures: population.failures(),
                epsilon,
                next_epsilon: update.epsilon,
                alpha: update.alpha,
                ess: n_accepted as f64,
                kernel_covariance: None,
            },
        };
        info!(
            round,
            epsilon,
            next_epsilon = update.epsilon,
            accepted = n_accepted,
            acceptance_rate,
            ess = record.ess,
            "Finished round"
        );
        steps.push(record);

        if acceptance_rate < settings.min_acc_rate {
            warn!(
                round,
                acceptance_rate,
                min_acc_rate = settings.min_acc_rate,
                "Acceptance rate too low, stopping"
            );
            termination = Termination::LowAcceptance { acceptance_rate };
            break;
        }
        if needs_kernel && (n_accepted < settings.min_samples) {
            warn!(
                round,
                accepted = n_accepted,
                min_samples = settings.min_samples,
                "Too few accepted samples to build a kernel, stopping"
            );
            termination = Termination::TooFewAccepted {
                accepted: n_accepted,
            };
            break;
        }

        if let Some(refreshed) = refreshed {
            importance = Some(refreshed);
        }
        epsilon = update.epsilon;
        if epsilon < settings.epsilon_floor {
            warn!(round, epsilon, floor = settings.epsilon_floor, "Epsilon below floor, stopping");
            termination = Termination::EpsilonFloor { epsilon };
            break;
        }
    }

    Ok(PmcTrace { steps, termination })
}

/// [`pmc_abc`] with default settings apart from the given schedule.
#[allow(clippy::too_many_arguments)]
pub fn run_pmc_abc<M: AbcModel>(
    model: &M,
    epsilon_0: f64,
    min_samples: usize,
    steps: usize,
    sample_only: bool,
    max_iter: usize,
    min_acc_rate: f64,
    target_acc_rate: f64,
) -> Result<PmcTrace> {
    let settings = PmcSettings {
        epsilon_0,
        min_samples,
        steps,
        sample_only,
        max_iter,
        min_acc_rate,
        target_acc_rate,
        ..Default::default()
    };
    pmc_abc(model, &settings, None)
}
