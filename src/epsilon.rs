use tracing::warn;

use crate::{abc::FAILURE_DISTANCE, stats::percentile};

/// Settings for the adaptive tolerance schedule.
#[derive(Debug, Clone, Copy)]
pub struct EpsilonSettings {
    /// Smallest adaptation rate.
    pub alpha_min: f64,
    /// Largest adaptation rate, used in the first round.
    pub alpha_max: f64,
    /// Distances at or above this value are failed simulations and are ignored.
    pub max_valid_distance: f64,
    /// Epsilon is held while the acceptance rate is within this relative
    /// band around the target.
    pub hold_band: f64,
    /// Increase alpha if the acceptance rate is off the target by more than this factor.
    pub boost_ratio: f64,
    pub boost: f64,
    /// Decrease alpha if the acceptance rate is within this relative band of the target.
    pub calm_band: f64,
    pub calm: f64,
}

impl Default for EpsilonSettings {
    fn default() -> Self {
        Self {
            alpha_min: 0.1,
            alpha_max: 0.9,
            max_valid_distance: FAILURE_DISTANCE,
            hold_band: 0.1,
            boost_ratio: 2.,
            boost: 1.5,
            calm_band: 0.2,
            calm: 0.5,
        }
    }
}

/// Quartiles of the valid distances of a round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceQuartiles {
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
}

impl DistanceQuartiles {
    /// Quartiles of the finite distances below `max_valid`, or `None` if there are none.
    pub fn new(distances: &[f64], max_valid: f64) -> Option<Self> {
        let mut valid: Vec<f64> = distances
            .iter()
            .copied()
            .filter(|dist| dist.is_finite() & (*dist < max_valid))
            .collect();
        if valid.is_empty() {
            return None;
        }
        valid.sort_unstable_by(f64::total_cmp);
        Some(Self {
            q25: percentile(&valid, 25.)?,
            q50: percentile(&valid, 50.)?,
            q75: percentile(&valid, 75.)?,
        })
    }
}

/// The adaptation rate for `round` (counted from zero) of `total_rounds`.
///
/// Decays linearly from `alpha_max` to `alpha_min` over the schedule and is
/// scaled up if the acceptance rate is far off the target, or down if it is
/// close to it.
pub fn compute_adaptive_alpha(
    round: usize,
    total_rounds: usize,
    acceptance_rate: f64,
    target_acc_rate: f64,
    settings: &EpsilonSettings,
) -> f64 {
    let EpsilonSettings {
        alpha_min,
        alpha_max,
        ..
    } = *settings;
    let progress = if total_rounds > 1 {
        (round as f64 / (total_rounds - 1) as f64).min(1.)
    } else {
        1.
    };
    let base = alpha_max - (alpha_max - alpha_min) * progress;

    let ratio = acceptance_rate / target_acc_rate;
    let alpha = if (ratio > settings.boost_ratio) | (ratio < settings.boost_ratio.recip()) {
        base * settings.boost
    } else if (ratio - 1.).abs() < settings.calm_band {
        base * settings.calm
    } else {
        base
    };
    alpha.clamp(alpha_min, alpha_max)
}

/// Result of one tolerance update.
#[derive(Debug, Clone, Copy)]
pub struct EpsilonUpdate {
    pub epsilon: f64,
    pub alpha: f64,
    pub quartiles: Option<DistanceQuartiles>,
}

/// Propose the tolerance of the next round.
///
/// `acceptance_rate` is `None` in the first round, where the median of the
/// valid distances is used. Afterwards epsilon shrinks by `1 - alpha` if the
/// acceptance rate is above the target band, never below the first quartile,
/// grows by `1 + alpha` if it is below the band, never above the third
/// quartile, and is held otherwise.
pub fn select_epsilon(
    distances: &[f64],
    epsilon: f64,
    acceptance_rate: Option<f64>,
    target_acc_rate: f64,
    alpha: f64,
    settings: &EpsilonSettings,
) -> EpsilonUpdate {
    let Some(quartiles) = DistanceQuartiles::new(distances, settings.max_valid_distance) else {
        warn!(
            epsilon,
            num_distances = distances.len(),
            "No valid distances in round, keeping epsilon"
        );
        return EpsilonUpdate {
            epsilon,
            alpha,
            quartiles: None,
        };
    };

    let next = match acceptance_rate {
        None => quartiles.q50,
        Some(rate) if rate > target_acc_rate * (1. + settings.hold_band) => {
            quartiles.q25.max(epsilon * (1. - alpha))
        }
        Some(rate) if rate < target_acc_rate * (1. - settings.hold_band) => {
            quartiles.q75.min(epsilon * (1. + alpha))
        }
        Some(_) => epsilon,
    };

    EpsilonUpdate {
        epsilon: next.max(0.),
        alpha,
        quartiles: Some(quartiles),
    }
}

/// Tolerance schedule of a PMC run.
#[derive(Debug, Clone, Copy)]
pub struct EpsilonController {
    settings: EpsilonSettings,
    total_rounds: usize,
    target_acc_rate: f64,
}

impl EpsilonController {
    pub fn new(settings: EpsilonSettings, total_rounds: usize, target_acc_rate: f64) -> Self {
        Self {
            settings,
            total_rounds,
            target_acc_rate,
        }
    }

    /// Next tolerance after `round` (counted from zero) with the given distances
    /// and acceptance rate.
    pub fn advance(
        &self,
        round: usize,
        distances: &[f64],
        epsilon: f64,
        acceptance_rate: f64,
    ) -> EpsilonUpdate {
        let alpha = compute_adaptive_alpha(
            round,
            self.total_rounds,
            acceptance_rate,
            self.target_acc_rate,
            &self.settings,
        );
        let history = if round == 0 {
            None
        } else {
            Some(acceptance_rate)
        };
        select_epsilon(
            distances,
            epsilon,
            history,
            self.target_acc_rate,
            alpha,
            &self.settings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn settings() -> EpsilonSettings {
        EpsilonSettings::default()
    }

    #[test]
    fn alpha_decays_linearly() {
        let s = settings();
        let target = 0.1;
        // 1.5 times the target is neither close nor far
        let first = compute_adaptive_alpha(0, 11, 0.15, target, &s);
        let middle = compute_adaptive_alpha(5, 11, 0.15, target, &s);
        let last = compute_adaptive_alpha(10, 11, 0.15, target, &s);
        assert_abs_diff_eq!(first, 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(middle, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(last, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn alpha_is_scaled() {
        let s = settings();
        assert_abs_diff_eq!(compute_adaptive_alpha(5, 11, 0.5, 0.1, &s), 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(compute_adaptive_alpha(5, 11, 0.01, 0.1, &s), 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(compute_adaptive_alpha(5, 11, 0.105, 0.1, &s), 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(compute_adaptive_alpha(0, 11, 0.5, 0.1, &s), 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(compute_adaptive_alpha(10, 11, 0.1, 0.1, &s), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn first_round_takes_median() {
        let distances = [5., 1., 3., 2., 4., f64::NAN, 1e5];
        let update = select_epsilon(&distances, 10., None, 0.1, 0.5, &settings());
        assert_eq!(update.epsilon, 3.);
        assert_eq!(
            update.quartiles,
            Some(DistanceQuartiles {
                q25: 2.,
                q50: 3.,
                q75: 4.
            })
        );
    }

    #[test]
    fn tighten_and_relax() {
        let distances: Vec<f64> = (1..=9).map(|i| i as f64).collect();
        // quartiles are 3, 5, 7
        let s = settings();
        let tight = select_epsilon(&distances, 6., Some(0.5), 0.1, 0.5, &s);
        assert_eq!(tight.epsilon, 3.);
        let tight = select_epsilon(&distances, 6., Some(0.5), 0.1, 0.1, &s);
        assert_abs_diff_eq!(tight.epsilon, 5.4, epsilon = 1e-12);
        let relaxed = select_epsilon(&distances, 6., Some(0.01), 0.1, 0.5, &s);
        assert_eq!(relaxed.epsilon, 7.);
        let relaxed = select_epsilon(&distances, 4., Some(0.01), 0.1, 0.25, &s);
        assert_abs_diff_eq!(relaxed.epsilon, 5., epsilon = 1e-12);
        let held = select_epsilon(&distances, 6., Some(0.105), 0.1, 0.5, &s);
        assert_eq!(held.epsilon, 6.);
    }

    #[test]
    fn no_valid_distance_keeps_epsilon() {
        let distances = [f64::NAN, f64::INFINITY, 1e5, 2e5];
        let update = select_epsilon(&distances, 0.7, Some(0.5), 0.1, 0.5, &settings());
        assert_eq!(update.epsilon, 0.7);
        assert!(update.quartiles.is_none());
        let update = select_epsilon(&[], 0.7, None, 0.1, 0.5, &settings());
        assert_eq!(update.epsilon, 0.7);
    }

    #[test]
    fn controller_uses_median_first() {
        let controller = EpsilonController::new(settings(), 10, 0.05);
        let distances = [1., 2., 3.];
        assert_eq!(controller.advance(0, &distances, 100., 1.).epsilon, 2.);
        assert_eq!(controller.advance(1, &distances, 2., 1.).epsilon, 1.5);
    }

    proptest! {
        #[test]
        fn clamped_by_quartiles(
            distances in prop::collection::vec(0f64..100., 1..200),
            epsilon in 0f64..200.,
            rate in 0f64..1.,
            target in 0.01f64..0.5,
            round in 0usize..20,
        ) {
            let s = settings();
            let alpha = compute_adaptive_alpha(round, 20, rate, target, &s);
            prop_assert!((s.alpha_min..=s.alpha_max).contains(&alpha));
            let update = select_epsilon(&distances, epsilon, Some(rate), target, alpha, &s);
            let q = update.quartiles.unwrap();
            if rate > target * 1.1 {
                prop_assert!(update.epsilon >= q.q25);
            } else if rate < target * 0.9 {
                prop_assert!(update.epsilon <= q.q75);
            } else {
                prop_assert_eq!(update.epsilon, epsilon);
            }
        }
    }
}
