//! Prior distributions over the model parameters.
//!
//! The importance weights of the sampler need the joint prior density of a
//! parameter vector. This crate only supports priors that factor into
//! independent one-dimensional marginals, so the joint density is the product
//! of the marginal densities. Priors with a dependency structure between
//! parameters can not be expressed with [`IndependentPrior`] and are not
//! supported by the importance reweighting.

use std::fmt::Debug;

use rand::{Rng, RngCore};
use rand_distr::{Distribution, Exp, LogNormal, Normal};

use crate::abc::{AbcError, Result};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// A one-dimensional prior distribution.
pub trait MarginalPrior: Debug + Send + Sync {
    /// Log of the (normalized) density at `x`. Returns `-inf` outside the support.
    fn log_density(&self, x: f64) -> f64;

    /// Draw one value from the distribution.
    fn sample(&self, rng: &mut dyn RngCore) -> f64;

    fn density(&self, x: f64) -> f64 {
        self.log_density(x).exp()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UniformPrior {
    low: f64,
    high: f64,
}

impl UniformPrior {
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !(low.is_finite() & high.is_finite()) | (low >= high) {
            return Err(AbcError::InvalidPrior(format!(
                "uniform prior needs finite bounds with low < high, got [{}, {}]",
                low, high
            )));
        }
        Ok(Self { low, high })
    }
}

impl MarginalPrior for UniformPrior {
    fn log_density(&self, x: f64) -> f64 {
        if (self.low <= x) & (x <= self.high) {
            -(self.high - self.low).ln()
        } else {
            f64::NEG_INFINITY
        }
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        rng.random_range(self.low..self.high)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NormalPrior {
    mean: f64,
    std: f64,
    dist: Normal<f64>,
}

impl NormalPrior {
    pub fn new(mean: f64, std: f64) -> Result<Self> {
        let dist = Normal::new(mean, std).map_err(|err| {
            AbcError::InvalidPrior(format!("normal prior ({}, {}): {}", mean, std, err))
        })?;
        if std <= 0. {
            return Err(AbcError::InvalidPrior(format!(
                "normal prior needs a positive standard deviation, got {}",
                std
            )));
        }
        Ok(Self { mean, std, dist })
    }
}

impl MarginalPrior for NormalPrior {
    fn log_density(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.std;
        -0.5 * z * z - self.std.ln() - LN_SQRT_2PI
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        self.dist.sample(rng)
    }
}

/// Log-normal prior, parametrized by the mean and standard deviation of `ln(x)`.
#[derive(Debug, Clone, Copy)]
pub struct LogNormalPrior {
    mu: f64,
    sigma: f64,
    dist: LogNormal<f64>,
}

impl LogNormalPrior {
    pub fn new(mu: f64, sigma: f64) -> Result<Self> {
        let dist = LogNormal::new(mu, sigma).map_err(|err| {
            AbcError::InvalidPrior(format!("log-normal prior ({}, {}): {}", mu, sigma, err))
        })?;
        if sigma <= 0. {
            return Err(AbcError::InvalidPrior(format!(
                "log-normal prior needs a positive sigma, got {}",
                sigma
            )));
        }
        Ok(Self { mu, sigma, dist })
    }
}

impl MarginalPrior for LogNormalPrior {
    fn log_density(&self, x: f64) -> f64 {
        if x <= 0. {
            return f64::NEG_INFINITY;
        }
        let ln_x = x.ln();
        let z = (ln_x - self.mu) / self.sigma;
        -0.5 * z * z - self.sigma.ln() - ln_x - LN_SQRT_2PI
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        self.dist.sample(rng)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExponentialPrior {
    rate: f64,
    dist: Exp<f64>,
}

impl ExponentialPrior {
    pub fn new(rate: f64) -> Result<Self> {
        if !(rate.is_finite() & (rate > 0.)) {
            return Err(AbcError::InvalidPrior(format!(
                "exponential prior needs a positive rate, got {}",
                rate
            )));
        }
        let dist = Exp::new(rate).map_err(|err| {
            AbcError::InvalidPrior(format!("exponential prior ({}): {}", rate, err))
        })?;
        Ok(Self { rate, dist })
    }
}

impl MarginalPrior for ExponentialPrior {
    fn log_density(&self, x: f64) -> f64 {
        if x < 0. {
            f64::NEG_INFINITY
        } else {
            self.rate.ln() - self.rate * x
        }
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        self.dist.sample(rng)
    }
}

/// A prior over a parameter vector made of independent marginals, one per
/// dimension.
///
/// The joint density is the product of the marginal densities. Parameters
/// that are correlated a priori can not be represented.
#[derive(Debug)]
pub struct IndependentPrior {
    marginals: Vec<Box<dyn MarginalPrior>>,
}

impl IndependentPrior {
    pub fn new(marginals: Vec<Box<dyn MarginalPrior>>) -> Result<Self> {
        if marginals.is_empty() {
            return Err(AbcError::InvalidPrior(
                "a prior needs at least one marginal".to_string(),
            ));
        }
        Ok(Self { marginals })
    }

    pub fn dim(&self) -> usize {
        self.marginals.len()
    }

    pub fn marginals(&self) -> &[Box<dyn MarginalPrior>] {
        &self.marginals
    }

    /// Sum of the marginal log densities.
    pub fn log_density(&self, theta: &[f64]) -> f64 {
        assert!(theta.len() == self.dim());
        self.marginals
            .iter()
            .zip(theta)
            .map(|(marginal, &x)| marginal.log_density(x))
            .sum()
    }

    pub fn density(&self, theta: &[f64]) -> f64 {
        self.log_density(theta).exp()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Box<[f64]> {
        let mut rng = rng;
        self.marginals
            .iter()
            .map(|marginal| marginal.sample(&mut rng))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn uniform_density() {
        let prior = UniformPrior::new(1., 101.).unwrap();
        assert_abs_diff_eq!(prior.density(50.), 0.01, epsilon = 1e-12);
        assert_eq!(prior.density(0.5), 0.);
        assert_eq!(prior.density(101.5), 0.);
    }

    #[test]
    fn invalid_bounds() {
        assert!(UniformPrior::new(2., 1.).is_err());
        assert!(UniformPrior::new(0., f64::INFINITY).is_err());
        assert!(NormalPrior::new(0., -1.).is_err());
        assert!(ExponentialPrior::new(0.).is_err());
        assert!(IndependentPrior::new(vec![]).is_err());
    }

    #[test]
    fn normal_density_peak() {
        let prior = NormalPrior::new(3., 2.).unwrap();
        let expected = 1. / (2. * (2. * std::f64::consts::PI).sqrt());
        assert_abs_diff_eq!(prior.density(3.), expected, epsilon = 1e-12);
    }

    #[test]
    fn log_normal_support() {
        let prior = LogNormalPrior::new(0., 1.).unwrap();
        assert_eq!(prior.density(-1.), 0.);
        let expected = 1. / (2. * std::f64::consts::PI).sqrt();
        assert_abs_diff_eq!(prior.density(1.), expected, epsilon = 1e-12);
    }

    #[test]
    fn joint_density_is_product() {
        let prior = IndependentPrior::new(vec![
            Box::new(UniformPrior::new(0., 4.).unwrap()),
            Box::new(ExponentialPrior::new(2.).unwrap()),
        ])
        .unwrap();
        let theta = [1., 0.5];
        let expected = 0.25 * 2. * (-1f64).exp();
        assert_abs_diff_eq!(prior.density(&theta), expected, epsilon = 1e-12);
        assert_eq!(prior.density(&[5., 0.5]), 0.);
    }

    #[test]
    fn samples_stay_in_support() {
        let prior = IndependentPrior::new(vec![
            Box::new(UniformPrior::new(1., 100.).unwrap()),
            Box::new(LogNormalPrior::new(0., 0.5).unwrap()),
        ])
        .unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..1000 {
            let theta = prior.sample(&mut rng);
            assert_eq!(theta.len(), 2);
            assert!(prior.log_density(&theta).is_finite());
        }
    }
}
