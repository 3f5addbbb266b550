use serde::Serialize;

use crate::core::feedback::FeedbackSignals;

/// Weights and shaping constants for the reward function.
#[derive(Debug, Clone)]
pub struct RewardConfig {
    pub resolution_weight: f64,
    pub rating_weight: f64,
    pub barge_in_weight: f64,
    pub repeats_weight: f64,
    pub handover_weight: f64,
    /// Call duration at which the duration term peaks, in seconds.
    pub optimal_duration_sec: f64,
    /// Magnitude cap of the duration term.
    pub duration_bonus_max: f64,
    pub min_reward: f64,
    pub max_reward: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            resolution_weight: 0.6,
            rating_weight: 0.2,
            barge_in_weight: -0.1,
            repeats_weight: -0.1,
            handover_weight: -0.1,
            optimal_duration_sec: 180.0,
            duration_bonus_max: 0.2,
            min_reward: -1.0,
            max_reward: 1.0,
        }
    }
}

/// Per-term reward breakdown for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RewardBreakdown {
    pub resolution: f64,
    pub rating: f64,
    pub barge_in: f64,
    pub repeats: f64,
    pub handover: f64,
    pub duration: f64,
    /// Sum of all terms, clipped to the configured range.
    pub total: f64,
}

/// Maps end-of-call signals to a scalar reward in [-1, +1].
///
/// The function is referentially transparent: equal signal vectors always
/// produce equal rewards. Missing signals default to neutral values.
#[derive(Debug, Clone, Default)]
pub struct RewardCalculator {
    config: RewardConfig,
}

impl RewardCalculator {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    /// Compute the reward for a signal vector.
    pub fn reward(&self, signals: &FeedbackSignals) -> f64 {
        self.breakdown(signals).total
    }

    /// Compute the reward with a per-term breakdown.
    pub fn breakdown(&self, signals: &FeedbackSignals) -> RewardBreakdown {
        let c = &self.config;

        let resolution = if signals.resolution {
            c.resolution_weight
        } else {
            0.0
        };

        // 1 -> -1, 3 -> 0, 5 -> +1; absent rating is neutral
        let rating = signals
            .user_rating
            .map(|r| c.rating_weight * ((r as f64 - 3.0) / 2.0))
            .unwrap_or(0.0);

        let barge_in = c.barge_in_weight * (signals.barge_in_count.min(3) as f64 / 3.0);
        let repeats = c.repeats_weight * (signals.repeats.min(3) as f64 / 3.0);
        let handover = if signals.handover {
            c.handover_weight
        } else {
            0.0
        };

        let duration = self.duration_bonus(signals.duration_sec);

        let raw = resolution + rating + barge_in + repeats + handover + duration;
        let total = raw.clamp(c.min_reward, c.max_reward);

        RewardBreakdown {
            resolution,
            rating,
            barge_in,
            repeats,
            handover,
            duration,
            total,
        }
    }

    /// Duration term: `clip((optimal - duration) / optimal, ±max)`.
    ///
    /// Linear around the optimal duration; shorter calls earn up to the cap,
    /// overlong calls are penalized down to its negative. A missing duration
    /// defaults to the optimum and lands exactly at zero.
    fn duration_bonus(&self, duration_sec: f64) -> f64 {
        let c = &self.config;
        let raw = (c.optimal_duration_sec - duration_sec) / c.optimal_duration_sec;
        raw.clamp(-c.duration_bonus_max, c.duration_bonus_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> FeedbackSignals {
        FeedbackSignals::default()
    }

    #[test]
    fn test_reward_scenario_s1() {
        let calc = RewardCalculator::default();
        let s = FeedbackSignals {
            resolution: true,
            user_rating: Some(4),
            barge_in_count: 1,
            repeats: 0,
            handover: false,
            duration_sec: 120.0,
        };
        // 0.6 + 0.2*0.5 - 0.1*(1/3) + clip((180-120)/180, ±0.2)
        let breakdown = calc.breakdown(&s);
        assert!((breakdown.resolution - 0.6).abs() < 1e-9);
        assert!((breakdown.rating - 0.1).abs() < 1e-9);
        assert!((breakdown.barge_in + 0.0333).abs() < 1e-3);
        assert_eq!(breakdown.repeats, 0.0);
        assert_eq!(breakdown.handover, 0.0);
        // (180-120)/180 = 0.333, clipped to 0.2
        assert!((breakdown.duration - 0.2).abs() < 1e-9);
        assert!((breakdown.total - 0.867).abs() < 1e-3);
    }

    #[test]
    fn test_reward_is_referentially_transparent() {
        let calc = RewardCalculator::default();
        let s = FeedbackSignals {
            resolution: true,
            user_rating: Some(2),
            barge_in_count: 2,
            repeats: 1,
            handover: true,
            duration_sec: 400.0,
        };
        let first = calc.reward(&s);
        for _ in 0..10 {
            assert_eq!(calc.reward(&s), first);
        }
    }

    #[test]
    fn test_neutral_defaults_yield_zero_reward() {
        let calc = RewardCalculator::default();
        let breakdown = calc.breakdown(&signals());
        assert_eq!(breakdown.resolution, 0.0);
        assert_eq!(breakdown.rating, 0.0);
        assert_eq!(breakdown.barge_in, 0.0);
        assert_eq!(breakdown.repeats, 0.0);
        assert_eq!(breakdown.handover, 0.0);
        // Neutral duration defaults to the optimum: zero term
        assert!(breakdown.duration.abs() < 1e-9);
        assert!(breakdown.total.abs() < 1e-9);
    }

    #[test]
    fn test_rating_maps_linearly() {
        let calc = RewardCalculator::default();
        let mut s = signals();
        s.user_rating = Some(1);
        assert!((calc.breakdown(&s).rating + 0.2).abs() < 1e-9);
        s.user_rating = Some(3);
        assert_eq!(calc.breakdown(&s).rating, 0.0);
        s.user_rating = Some(5);
        assert!((calc.breakdown(&s).rating - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_barge_in_penalty_caps_at_three() {
        let calc = RewardCalculator::default();
        let mut s = signals();
        s.barge_in_count = 3;
        let at_cap = calc.breakdown(&s).barge_in;
        s.barge_in_count = 30;
        assert_eq!(calc.breakdown(&s).barge_in, at_cap);
        assert!((at_cap + 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_duration_bonus_shape() {
        let calc = RewardCalculator::default();
        let mut s = signals();

        // At the optimum: zero term
        s.duration_sec = 180.0;
        assert!(calc.breakdown(&s).duration.abs() < 1e-9);

        // Slightly long: small penalty, (180-198)/180 = -0.1
        s.duration_sec = 198.0;
        assert!((calc.breakdown(&s).duration + 0.1).abs() < 1e-9);

        // Far beyond: clipped to -0.2
        s.duration_sec = 900.0;
        assert!((calc.breakdown(&s).duration + 0.2).abs() < 1e-9);

        // Very short calls clip at the positive cap
        s.duration_sec = 30.0;
        assert!((calc.breakdown(&s).duration - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_total_is_clipped() {
        let config = RewardConfig {
            resolution_weight: 5.0,
            ..Default::default()
        };
        let calc = RewardCalculator::new(config);
        let mut s = signals();
        s.resolution = true;
        assert_eq!(calc.reward(&s), 1.0);

        let config = RewardConfig {
            handover_weight: -5.0,
            ..Default::default()
        };
        let calc = RewardCalculator::new(config);
        let mut s = signals();
        s.handover = true;
        s.duration_sec = 900.0;
        assert_eq!(calc.reward(&s), -1.0);
    }

    #[test]
    fn test_breakdown_total_matches_reward() {
        let calc = RewardCalculator::default();
        let s = FeedbackSignals {
            resolution: true,
            user_rating: Some(5),
            barge_in_count: 1,
            repeats: 2,
            handover: false,
            duration_sec: 200.0,
        };
        assert_eq!(calc.breakdown(&s).total, calc.reward(&s));
    }
}
