use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use abc_pmc::{
    pmc_abc, run_pmc_abc, test_models::LinearGaussian, AbcModel, IndependentPrior, NormalPrior,
    PmcSettings, Progress, ProgressCallback, Termination,
};
use anyhow::{bail, Result};
use rand::Rng;
use rand_distr::StandardNormal;

/// Mean of `num_obs` unit normal observations per coordinate, compared by
/// euclidean distance to a fixed observed mean.
struct NormalMean {
    prior: IndependentPrior,
    observed: Vec<f64>,
    num_obs: usize,
    fail_above: f64,
}

impl NormalMean {
    fn new(observed: &[f64], num_obs: usize) -> Self {
        let prior = IndependentPrior::new(
            observed
                .iter()
                .map(|_| -> Box<dyn abc_pmc::MarginalPrior> {
                    Box::new(NormalPrior::new(3., 1.5).unwrap())
                })
                .collect(),
        )
        .unwrap();
        Self {
            prior,
            observed: observed.to_vec(),
            num_obs,
            fail_above: f64::INFINITY,
        }
    }
}

impl AbcModel for NormalMean {
    fn prior(&self) -> &IndependentPrior {
        &self.prior
    }

    fn simulate_and_reduce<R: Rng + ?Sized>(&self, theta: &[f64], rng: &mut R) -> Result<f64> {
        if theta.iter().any(|&val| val > self.fail_above) {
            bail!("parameter out of range: {:?}", theta);
        }
        let dist: f64 = theta
            .iter()
            .zip(self.observed.iter())
            .map(|(&mu, &obs)| {
                let mean = (0..self.num_obs)
                    .map(|_| mu + rng.sample::<f64, _>(StandardNormal))
                    .sum::<f64>()
                    / self.num_obs as f64;
                (mean - obs) * (mean - obs)
            })
            .sum();
        Ok(dist.sqrt())
    }
}

#[test]
fn toy_gaussian_recovers_location() {
    let model = LinearGaussian::new(20., 1., 1., 100.).unwrap();
    let settings = PmcSettings {
        epsilon_0: 50.,
        steps: 10,
        max_iter: 2000,
        target_acc_rate: 0.05,
        seed: 42,
        ..Default::default()
    };
    let trace = pmc_abc(&model, &settings, None).unwrap();
    let last = trace.last().unwrap();
    let mean = last.accepted().posterior_mean();
    assert!((mean[0] - 20.).abs() < 5., "posterior mean {}", mean[0]);
    assert!(last.epsilon() < settings.epsilon_0);
}

#[test]
fn unreachable_acceptance_stops_early() {
    let model = LinearGaussian::new(20., 1., 1., 100.).unwrap();
    let trace = run_pmc_abc(&model, 100., 10, 10, false, 500, 0.9, 0.05).unwrap();
    assert!(trace.len() < 10);
    let last = trace.last().unwrap();
    assert!(last.acceptance_rate() < 0.9);
    assert!(matches!(
        trace.termination,
        Termination::LowAcceptance { .. }
    ));
}

#[test]
fn multivariate_in_parallel() {
    let model = NormalMean::new(&[2., 4.], 20);
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_inner = calls.clone();
    let progress = ProgressCallback {
        callback: Box::new(move |_: &Progress| {
            calls_inner.fetch_add(1, Ordering::Relaxed);
        }),
        rate: 250,
    };
    let settings = PmcSettings {
        epsilon_0: 3.,
        steps: 6,
        max_iter: 1000,
        target_acc_rate: 0.1,
        num_threads: 4,
        seed: 3,
        ..Default::default()
    };
    let trace = pmc_abc(&model, &settings, Some(progress)).unwrap();
    assert!(trace.len() >= 2);
    assert_eq!(calls.load(Ordering::Relaxed), 4 * trace.len());

    let last = trace.last().unwrap();
    let mean = last.accepted().posterior_mean();
    assert!((mean[0] - 2.).abs() < 1., "posterior mean {:?}", mean);
    assert!((mean[1] - 4.).abs() < 1., "posterior mean {:?}", mean);
    let cov = last.accepted().posterior_covariance().unwrap();
    assert_eq!((cov.nrows(), cov.ncols()), (2, 2));
    assert!(cov[(0, 0)] > 0. && cov[(1, 1)] > 0.);
    // only perturbed candidates are constrained to be non-negative
    for step in trace.steps.iter().skip(1) {
        for theta in step.accepted().thetas() {
            assert!(theta.iter().all(|&val| val >= 0.));
        }
    }
}

#[test]
fn failed_simulations_do_not_abort() {
    let mut model = NormalMean::new(&[2., 4.], 10);
    model.fail_above = 5.;
    let settings = PmcSettings {
        epsilon_0: 3.,
        steps: 4,
        max_iter: 800,
        min_acc_rate: 0.,
        seed: 9,
        ..Default::default()
    };
    let trace = pmc_abc(&model, &settings, None).unwrap();
    assert!(trace.steps[0].failures() > 0);
    for step in trace.steps.iter() {
        assert!(step
            .accepted()
            .thetas()
            .iter()
            .all(|theta| theta.iter().all(|&val| val <= 5.)));
    }
}
