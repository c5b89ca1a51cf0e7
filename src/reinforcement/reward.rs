// src/reinforcement/reward.rs
use serde::{Deserialize, Serialize};

use super::state_encoder::SCORE_FALLBACK_BIN;
use super::types::LearningState;
use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryTier {
    Weak,
    Developing,
    Proficient,
    Mastered,
}

impl MasteryTier {
    /// Tier of a state's score bin; ungraded (fallback) counts as weak.
    pub fn of(state: &LearningState) -> Self {
        match state.score_bin {
            1 => MasteryTier::Developing,
            2 => MasteryTier::Proficient,
            3 => MasteryTier::Mastered,
            _ => MasteryTier::Weak,
        }
    }
}

/// Q-update step size per mastery tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRates {
    pub weak: f64,
    pub developing: f64,
    pub proficient: f64,
    pub mastered: f64,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            weak: config::LEARNING_RATE_WEAK,
            developing: config::LEARNING_RATE_DEVELOPING,
            proficient: config::LEARNING_RATE_PROFICIENT,
            mastered: config::LEARNING_RATE_MASTERED,
        }
    }
}

impl LearningRates {
    pub fn for_tier(&self, tier: MasteryTier) -> f64 {
        match tier {
            MasteryTier::Weak => self.weak,
            MasteryTier::Developing => self.developing,
            MasteryTier::Proficient => self.proficient,
            MasteryTier::Mastered => self.mastered,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    /// Flat cost of taking any action
    pub step_cost: f64,
    pub time_cost_per_minute: f64,
    /// Per progress bin gained (or module advanced)
    pub progress_gain: f64,
    /// Per graded score bin gained; losses are charged the same way
    pub score_gain: f64,
    /// Paid when the mastery tier improves
    pub mastery_bonus: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            step_cost: config::REWARD_STEP_COST,
            time_cost_per_minute: config::REWARD_TIME_COST_PER_MINUTE,
            progress_gain: config::REWARD_PROGRESS_GAIN,
            score_gain: config::REWARD_SCORE_GAIN,
            mastery_bonus: config::REWARD_MASTERY_BONUS,
        }
    }
}

impl RewardWeights {
    /// reward = -(step cost + time cost)
    ///          + progress_gain * progress improvement
    ///          + score_gain * graded score-bin change
    ///          + mastery_bonus if the mastery tier went up
    pub fn reward(&self, state: &LearningState, next: &LearningState, duration_secs: f64) -> f64 {
        let minutes = duration_secs.max(0.0) / 60.0;
        let cost = self.step_cost + self.time_cost_per_minute * minutes;

        let progress = if next.module_index > state.module_index {
            1.0
        } else if next.module_index == state.module_index {
            (next.progress_bin as f64 - state.progress_bin as f64).max(0.0)
        } else {
            0.0
        };

        let graded = |s: &LearningState| s.score_bin != SCORE_FALLBACK_BIN;
        let score = if graded(state) && graded(next) {
            next.score_bin as f64 - state.score_bin as f64
        } else {
            0.0
        };

        let bonus = if MasteryTier::of(next) > MasteryTier::of(state) {
            self.mastery_bonus
        } else {
            0.0
        };

        -cost + self.progress_gain * progress + self.score_gain * score + bonus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(progress_bin: u8, score_bin: u8) -> LearningState {
        LearningState {
            cluster_id: 0,
            module_index: 1,
            progress_bin,
            score_bin,
            learning_phase: 0,
            engagement_level: 1,
        }
    }

    #[test]
    fn idle_step_only_costs() {
        let w = RewardWeights::default();
        let r = w.reward(&state(1, 1), &state(1, 1), 120.0);
        assert!((r - (-0.1 - 0.02)).abs() < 1e-12);
    }

    #[test]
    fn mastery_gain_dominates_step_cost() {
        let w = RewardWeights::default();
        let r = w.reward(&state(1, 1), &state(1, 2), 60.0);
        // -0.1 - 0.01 + 0.75 + 1.0
        assert!((r - 1.64).abs() < 1e-12);
        assert!(w.mastery_bonus / w.step_cost >= config::MASTERY_BONUS_MIN_RATIO);
    }

    #[test]
    fn first_grade_is_not_a_score_jump() {
        let w = RewardWeights::default();
        let r = w.reward(&state(0, SCORE_FALLBACK_BIN), &state(0, 3), 0.0);
        // Weak -> Mastered earns the bonus but no score-bin delta
        assert!((r - (-0.1 + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn tiers_order_and_rates() {
        assert_eq!(MasteryTier::of(&state(0, SCORE_FALLBACK_BIN)), MasteryTier::Weak);
        assert_eq!(MasteryTier::of(&state(0, 3)), MasteryTier::Mastered);
        let rates = LearningRates::default();
        assert!(rates.for_tier(MasteryTier::Weak) > rates.for_tier(MasteryTier::Mastered));
    }
}
