use faer::{Mat, Side};
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    abc::{AbcError, Result},
    stats::weighted_covar,
};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Settings for the gaussian perturbation kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelSettings {
    /// The kernel covariance is this multiple of the weighted population covariance.
    pub bandwidth_scale: f64,
    /// Added to the diagonal of the covariance before it is factorized.
    pub jitter: f64,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            bandwidth_scale: 2.,
            jitter: 1e-5,
        }
    }
}

/// A multivariate normal perturbation kernel with fixed covariance.
///
/// The covariance is stabilized with a diagonal jitter and decomposed as
/// `U diag(s) Uᵗ` once, so that draws and densities only need matrix vector
/// products.
#[derive(Debug, Clone)]
pub struct PerturbationKernel {
    covariance: Mat<f64>,
    vecs: Mat<f64>,
    vals_sqrt: Box<[f64]>,
    vals_sqrt_inv: Box<[f64]>,
    log_norm: f64,
}

impl PerturbationKernel {
    /// Build a kernel from a covariance matrix, adding `jitter` to its diagonal.
    pub fn new(covariance: Mat<f64>, jitter: f64) -> Result<Self> {
        let dim = covariance.nrows();
        if (dim == 0) | (covariance.ncols() != dim) {
            return Err(AbcError::DimensionMismatch {
                expected: dim,
                found: covariance.ncols(),
            });
        }

        let mut stabilized = covariance;
        for i in 0..dim {
            stabilized[(i, i)] += jitter;
        }

        let mut finite = true;
        for j in 0..dim {
            for i in 0..dim {
                finite &= stabilized[(i, j)].is_finite();
            }
        }
        if !finite {
            return Err(AbcError::NonFiniteCovariance {
                covariance: flatten(&stabilized),
            });
        }

        let (vals, vecs) = if dim == 1 {
            (vec![stabilized[(0, 0)]], Mat::from_fn(1, 1, |_, _| 1f64))
        } else {
            let eig = stabilized
                .self_adjoint_eigen(Side::Lower)
                .map_err(|_| AbcError::NotPositiveDefinite {
                    covariance: flatten(&stabilized),
                })?;
            let vals = eig.S().column_vector().to_owned();
            (vals.iter().copied().collect(), eig.U().to_owned())
        };

        if vals.iter().any(|&val| !(val > 0.) | !val.is_finite()) {
            return Err(AbcError::NotPositiveDefinite {
                covariance: flatten(&stabilized),
            });
        }

        let log_det: f64 = vals.iter().map(|val| val.ln()).sum();
        let log_norm = -0.5 * (log_det + (dim as f64) * LN_2PI);

        Ok(Self {
            covariance: stabilized,
            vals_sqrt: vals.iter().map(|val| val.sqrt()).collect(),
            vals_sqrt_inv: vals.iter().map(|val| val.sqrt().recip()).collect(),
            vecs,
            log_norm,
        })
    }

    /// Kernel for the next round: `bandwidth_scale` times the weighted
    /// covariance of the accepted population, plus jitter.
    pub fn from_population(
        samples: &[Box<[f64]>],
        weights: &[f64],
        settings: &KernelSettings,
    ) -> Result<Self> {
        let mut covariance = weighted_covar(samples, weights)?;
        let dim = covariance.nrows();
        for j in 0..dim {
            for i in 0..dim {
                covariance[(i, j)] *= settings.bandwidth_scale;
            }
        }
        Self::new(covariance, settings.jitter)
    }

    pub fn dim(&self) -> usize {
        self.vals_sqrt.len()
    }

    /// The stabilized covariance, jitter included.
    pub fn covariance(&self) -> &Mat<f64> {
        &self.covariance
    }

    /// Write `center + L z` into `out`, with `z` standard normal and `L Lᵗ` the covariance.
    pub fn perturb<R: Rng + ?Sized>(&self, rng: &mut R, center: &[f64], out: &mut [f64]) {
        let dim = self.dim();
        assert!(center.len() == dim);
        assert!(out.len() == dim);

        out.copy_from_slice(center);
        for (k, &scale) in self.vals_sqrt.iter().enumerate() {
            let z: f64 = rng.sample(StandardNormal);
            let step = scale * z;
            for (i, val) in out.iter_mut().enumerate() {
                *val += self.vecs[(i, k)] * step;
            }
        }
    }

    /// Log density at `x` of the normal distribution centered at `center`.
    pub fn log_density(&self, x: &[f64], center: &[f64]) -> f64 {
        let dim = self.dim();
        assert!(x.len() == dim);
        assert!(center.len() == dim);

        if dim == 1 {
            let z = (x[0] - center[0]) * self.vals_sqrt_inv[0];
            return self.log_norm - 0.5 * z * z;
        }

        let mut mahalanobis = 0f64;
        for (k, &inv_scale) in self.vals_sqrt_inv.iter().enumerate() {
            let mut proj = 0f64;
            for (i, (&xi, &ci)) in izip!(x, center).enumerate() {
                proj += self.vecs[(i, k)] * (xi - ci);
            }
            let z = proj * inv_scale;
            mahalanobis += z * z;
        }
        self.log_norm - 0.5 * mahalanobis
    }

    pub(crate) fn log_norm(&self) -> f64 {
        self.log_norm
    }

    /// `1 / variance` of a one-dimensional kernel.
    pub(crate) fn inv_variance_1d(&self) -> f64 {
        debug_assert!(self.dim() == 1);
        self.vals_sqrt_inv[0] * self.vals_sqrt_inv[0]
    }
}

fn flatten(mat: &Mat<f64>) -> Box<[f64]> {
    let mut out = Vec::with_capacity(mat.nrows() * mat.ncols());
    for i in 0..mat.nrows() {
        for j in 0..mat.ncols() {
            out.push(mat[(i, j)]);
        }
    }
    out.into()
}
