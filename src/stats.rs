use faer::Mat;
use itertools::izip;
use multiversion::multiversion;

use crate::abc::{AbcError, Result};

/// Weights have to sum to one up to this tolerance.
pub(crate) const WEIGHT_SUM_TOLERANCE: f64 = 1e-8;

fn check_weights(n: usize, weights: &[f64]) -> Result<()> {
    if weights.len() != n {
        return Err(AbcError::DimensionMismatch {
            expected: n,
            found: weights.len(),
        });
    }
    let sum: f64 = weights.iter().sum();
    if !((sum - 1.).abs() <= WEIGHT_SUM_TOLERANCE) {
        return Err(AbcError::WeightsNotNormalized { sum });
    }
    Ok(())
}

/// Weighted covariance of a population with reliability-weights correction.
///
/// `samples` holds one parameter vector per member and `weights` must sum to one.
/// The result is `Σ w_i (x_i - x̄)(x_i - x̄)ᵗ / (1 - Σ w_i²)`. If all the weight
/// sits on a single member the correction factor is infinite and so is the result.
pub fn weighted_covar(samples: &[Box<[f64]>], weights: &[f64]) -> Result<Mat<f64>> {
    check_weights(samples.len(), weights)?;
    let Some(first) = samples.first() else {
        return Err(AbcError::EmptyPopulation);
    };
    let dim = first.len();
    if let Some(bad) = samples.iter().find(|sample| sample.len() != dim) {
        return Err(AbcError::DimensionMismatch {
            expected: dim,
            found: bad.len(),
        });
    }

    let mut mean = vec![0f64; dim];
    for (sample, &w) in samples.iter().zip(weights) {
        izip!(mean.iter_mut(), sample.iter()).for_each(|(m, &x)| *m = w.mul_add(x, *m));
    }

    let mut covar = Mat::<f64>::zeros(dim, dim);
    let mut diff = vec![0f64; dim];
    for (sample, &w) in samples.iter().zip(weights) {
        izip!(diff.iter_mut(), sample.iter(), mean.iter()).for_each(|(d, &x, &m)| *d = x - m);
        for i in 0..dim {
            for j in 0..=i {
                covar[(i, j)] += w * diff[i] * diff[j];
            }
        }
    }

    let scale = (1. - sum_of_squares(weights)).recip();
    for i in 0..dim {
        for j in 0..=i {
            let val = covar[(i, j)] * scale;
            covar[(i, j)] = val;
            covar[(j, i)] = val;
        }
    }
    Ok(covar)
}

/// One-dimensional version of [`weighted_covar`].
pub fn weighted_variance(values: &[f64], weights: &[f64]) -> Result<f64> {
    check_weights(values.len(), weights)?;
    if values.is_empty() {
        return Err(AbcError::EmptyPopulation);
    }
    let mean: f64 = izip!(values, weights).map(|(&x, &w)| w * x).sum();
    let var: f64 = izip!(values, weights)
        .map(|(&x, &w)| w * (x - mean) * (x - mean))
        .sum();
    Ok(var / (1. - sum_of_squares(weights)))
}

/// `(Σw)² / Σw²`, the number of independent draws a weighted population is worth.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum: f64 = weights.iter().sum();
    sum * sum / sum_of_squares(weights)
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn sum_of_squares(values: &[f64]) -> f64 {
    values.iter().map(|x| x * x).sum()
}

/// `ln Σ exp(values)` without overflow.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    if max == f64::INFINITY {
        return max;
    }
    let sum: f64 = values.iter().map(|&val| (val - max).exp()).sum();
    max + sum.ln()
}

/// Percentile `q` in `[0, 100]` of already sorted values, linear interpolation
/// between the closest ranks.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (q / 100.).clamp(0., 1.) * ((n - 1) as f64);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Weighted mean of a population, one value per dimension.
pub fn weighted_mean(samples: &[Box<[f64]>], weights: &[f64]) -> Box<[f64]> {
    let dim = samples.first().map(|sample| sample.len()).unwrap_or(0);
    let mut mean = vec![0f64; dim];
    for (sample, &w) in samples.iter().zip(weights) {
        izip!(mean.iter_mut(), sample.iter()).for_each(|(m, &x)| *m += w * x);
    }
    mean.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn to_samples(rows: &[Vec<f64>]) -> Vec<Box<[f64]>> {
        rows.iter().map(|row| row.clone().into()).collect()
    }

    #[test]
    fn uniform_weights_match_sample_covariance() {
        let samples = to_samples(&[
            vec![1., 2.],
            vec![2., 1.],
            vec![4., 5.],
            vec![3., 7.],
            vec![0., 1.],
        ]);
        let n = samples.len();
        let weights = vec![1. / n as f64; n];
        let covar = weighted_covar(&samples, &weights).unwrap();

        let mean_x = 10. / 5.;
        let mean_y = 16. / 5.;
        let mut sxx = 0.;
        let mut syy = 0.;
        let mut sxy = 0.;
        for s in samples.iter() {
            sxx += (s[0] - mean_x) * (s[0] - mean_x);
            syy += (s[1] - mean_y) * (s[1] - mean_y);
            sxy += (s[0] - mean_x) * (s[1] - mean_y);
        }
        let denom = (n - 1) as f64;
        assert_abs_diff_eq!(covar[(0, 0)], sxx / denom, epsilon = 1e-12);
        assert_abs_diff_eq!(covar[(1, 1)], syy / denom, epsilon = 1e-12);
        assert_abs_diff_eq!(covar[(0, 1)], sxy / denom, epsilon = 1e-12);
        assert_abs_diff_eq!(covar[(1, 0)], sxy / denom, epsilon = 1e-12);
    }

    #[test]
    fn variance_agrees_with_covar() {
        let values = [0.5, 1.5, 3., 7.];
        let weights = [0.1, 0.2, 0.3, 0.4];
        let samples: Vec<Box<[f64]>> = values.iter().map(|&v| vec![v].into()).collect();
        let var = weighted_variance(&values, &weights).unwrap();
        let covar = weighted_covar(&samples, &weights).unwrap();
        assert_abs_diff_eq!(var, covar[(0, 0)], epsilon = 1e-12);
    }

    #[test]
    fn unnormalized_weights_are_rejected() {
        let samples = to_samples(&[vec![1.], vec![2.]]);
        let err = weighted_covar(&samples, &[1., 1.]).unwrap_err();
        assert!(matches!(err, AbcError::WeightsNotNormalized { .. }));
        let err = weighted_variance(&[1., 2.], &[1.]).unwrap_err();
        assert!(matches!(err, AbcError::DimensionMismatch { .. }));
    }

    #[test]
    fn single_member_is_not_finite() {
        let samples = to_samples(&[vec![1., 2.]]);
        let covar = weighted_covar(&samples, &[1.]).unwrap();
        assert!(!covar[(0, 0)].is_finite());
    }

    #[test]
    fn percentiles() {
        let sorted = [1., 2., 3., 4., 5.];
        assert_eq!(percentile(&sorted, 50.), Some(3.));
        assert_eq!(percentile(&sorted, 25.), Some(2.));
        assert_eq!(percentile(&sorted, 0.), Some(1.));
        assert_eq!(percentile(&sorted, 100.), Some(5.));
        assert_eq!(percentile(&[1., 2.], 50.), Some(1.5));
        assert_eq!(percentile(&[], 50.), None);
    }

    #[test]
    fn check_log_sum_exp() {
        let values = [0.1f64, -2., 3.];
        let expected = values.iter().map(|x| x.exp()).sum::<f64>().ln();
        assert_abs_diff_eq!(log_sum_exp(&values), expected, epsilon = 1e-12);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY; 3]), f64::NEG_INFINITY);
        assert_abs_diff_eq!(log_sum_exp(&[-1000., -1000.]), -1000. + 2f64.ln(), epsilon = 1e-9);
    }

    proptest! {
        #[test]
        fn ess_bounded_by_length(raw in prop::collection::vec(1e-6f64..1., 1..200)) {
            let total: f64 = raw.iter().sum();
            let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
            let ess = effective_sample_size(&weights);
            prop_assert!(ess <= weights.len() as f64 + 1e-9);
            prop_assert!(ess >= 1. - 1e-9);
        }

        #[test]
        fn ess_of_uniform_weights(n in 1usize..500) {
            let weights = vec![1. / n as f64; n];
            let ess = effective_sample_size(&weights);
            prop_assert!((ess - n as f64).abs() < 1e-8 * n as f64);
        }

        #[test]
        fn weighted_covar_is_idempotent(
            rows in prop::collection::vec(prop::collection::vec(-10f64..10., 3), 2..50),
            raw in prop::collection::vec(1e-3f64..1., 50),
        ) {
            let samples = to_samples(&rows);
            let raw = &raw[..samples.len()];
            let total: f64 = raw.iter().sum();
            let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
            let first = weighted_covar(&samples, &weights).unwrap();
            let second = weighted_covar(&samples, &weights).unwrap();
            for i in 0..3 {
                for j in 0..3 {
                    prop_assert_eq!(first[(i, j)].to_bits(), second[(i, j)].to_bits());
                }
            }
        }
    }
}
