use itertools::izip;
use multiversion::multiversion;

use crate::{
    abc::{AbcError, AcceptedSet, Result},
    executor::Executor,
    kernel::PerturbationKernel,
    prior::IndependentPrior,
    stats::log_sum_exp,
};

/// Normalized importance weights of the accepted members of the current round.
///
/// The weight of `theta_i` is `prior(theta_i) / Σ_j w_j N(theta_i; theta_j, Σ)`,
/// where `theta_j`, `w_j` are the previous population and its weights and `Σ`
/// is the covariance of the kernel that produced the current round. The prior
/// density is the product of independent marginals.
///
/// Fails with [`AbcError::DegenerateWeights`] if no weight is positive and finite.
pub fn calc_weights(
    previous: &AcceptedSet,
    current: &[Box<[f64]>],
    kernel: &PerturbationKernel,
    prior: &IndependentPrior,
) -> Result<Box<[f64]>> {
    calc_weights_on(&Executor::Sequential, previous, current, kernel, prior)
}

pub(crate) fn calc_weights_on(
    executor: &Executor,
    previous: &AcceptedSet,
    current: &[Box<[f64]>],
    kernel: &PerturbationKernel,
    prior: &IndependentPrior,
) -> Result<Box<[f64]>> {
    let dim = kernel.dim();
    if (previous.dim() != dim) | (prior.dim() != dim) {
        return Err(AbcError::DimensionMismatch {
            expected: dim,
            found: previous.dim(),
        });
    }
    if let Some(bad) = current.iter().find(|theta| theta.len() != dim) {
        return Err(AbcError::DimensionMismatch {
            expected: dim,
            found: bad.len(),
        });
    }
    if current.is_empty() || previous.is_empty() {
        return Err(AbcError::EmptyPopulation);
    }

    let prev_weights = previous.weights().ok_or(AbcError::MissingWeights)?;
    let log_prev_weights: Box<[f64]> = prev_weights.iter().map(|w| w.ln()).collect();

    let log_weights = if dim == 1 {
        let centers: Box<[f64]> = previous.thetas().iter().map(|theta| theta[0]).collect();
        let inv_var = kernel.inv_variance_1d();
        let log_norm = kernel.log_norm();
        executor.map(0..current.len(), |i| {
            let x = current[i][0];
            let mut terms = vec![0f64; centers.len()];
            log_mixture_terms_1d(x, &centers, &log_prev_weights, inv_var, &mut terms);
            prior.log_density(&current[i]) - (log_norm + log_sum_exp(&terms))
        })
    } else {
        executor.map(0..current.len(), |i| {
            let theta = &current[i];
            let terms: Vec<f64> = izip!(previous.thetas(), log_prev_weights.iter())
                .map(|(center, &log_w)| log_w + kernel.log_density(theta, center))
                .collect();
            prior.log_density(theta) - log_sum_exp(&terms)
        })
    };

    normalize_log_weights(&log_weights)
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn log_mixture_terms_1d(x: f64, centers: &[f64], log_weights: &[f64], inv_var: f64, out: &mut [f64]) {
    izip!(out.iter_mut(), centers, log_weights).for_each(|(out, &center, &log_w)| {
        let diff = x - center;
        *out = log_w - 0.5 * diff * diff * inv_var;
    });
}

/// Exponentiate and normalize log weights so that they sum to one.
fn normalize_log_weights(log_weights: &[f64]) -> Result<Box<[f64]>> {
    let accepted = log_weights.len();
    if log_weights
        .iter()
        .any(|&val| val.is_nan() | (val == f64::INFINITY))
    {
        return Err(AbcError::DegenerateWeights { accepted });
    }
    let max = log_weights
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return Err(AbcError::DegenerateWeights { accepted });
    }

    let mut weights: Vec<f64> = log_weights.iter().map(|&val| (val - max).exp()).collect();
    let total: f64 = weights.iter().sum();
    if !(total.is_finite() & (total > 0.)) {
        return Err(AbcError::DegenerateWeights { accepted });
    }
    weights.iter_mut().for_each(|w| *w /= total);
    Ok(weights.into())
}
