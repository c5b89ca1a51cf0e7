// src/reinforcement/q_learning.rs
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::action_catalog::ActionCatalog;
use super::q_table::QTable;
use super::reward::{LearningRates, MasteryTier, RewardWeights};
use super::transition_model::TransitionModel;
use super::types::{LearningState, StateDims, Transition};
use crate::config;
use crate::errors::AnalyticsError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub discount: f64,
    pub epsilon_start: f64,
    pub epsilon_min: f64,
    /// Multiplicative decay applied after every episode
    pub epsilon_decay: f64,
    pub episode_length: usize,
    pub max_episodes: usize,
    /// Episodes always run before convergence is checked
    pub min_episodes: usize,
    pub tolerance: f64,
    pub convergence_window: usize,
    pub observed_replay_passes: usize,
    pub divergence_bound: f64,
    pub learning_rates: LearningRates,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            discount: config::DISCOUNT_FACTOR,
            epsilon_start: config::EPSILON_START,
            epsilon_min: config::EPSILON_MIN,
            epsilon_decay: config::EPSILON_DECAY,
            episode_length: config::EPISODE_LENGTH,
            max_episodes: config::MAX_EPISODES,
            min_episodes: config::MIN_EPISODES,
            tolerance: config::CONVERGENCE_TOLERANCE,
            convergence_window: config::CONVERGENCE_WINDOW,
            observed_replay_passes: config::OBSERVED_REPLAY_PASSES,
            divergence_bound: config::Q_DIVERGENCE_BOUND,
            learning_rates: LearningRates::default(),
        }
    }
}

/// Exploration schedule carried explicitly through training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExplorationState {
    pub epsilon: f64,
    pub episode: usize,
}

impl ExplorationState {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon, episode: 0 }
    }

    pub fn finish_episode(&mut self, decay: f64, floor: f64) {
        self.epsilon = (self.epsilon * decay).max(floor);
        self.episode += 1;
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub table: QTable,
    pub episodes: usize,
    pub converged: bool,
    /// Total reward of every simulated episode
    pub reward_trace: Vec<f64>,
    /// Mean |ΔQ| of every simulated episode
    pub delta_trace: Vec<f64>,
    pub exploration: ExplorationState,
    pub replayed_updates: usize,
}

/// Single-writer tabular Q-learning over observed and simulated experience.
///
/// Observed transitions are replayed first so every visited (state, action)
/// pair starts from real data; simulated ε-greedy episodes drawn from the
/// transition model follow until the mean |ΔQ| over the last window drops
/// below the tolerance or the episode cap is hit.
pub struct QLearningTrainer<'a> {
    config: TrainerConfig,
    catalog: &'a ActionCatalog,
    rewards: RewardWeights,
}

impl<'a> QLearningTrainer<'a> {
    pub fn new(config: TrainerConfig, catalog: &'a ActionCatalog, rewards: RewardWeights) -> Self {
        Self {
            config,
            catalog,
            rewards,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn train(
        &self,
        model: &TransitionModel,
        observed: &[Transition],
        seed: u64,
    ) -> Result<TrainingOutcome, AnalyticsError> {
        let dims = model.dims();
        let mut table = QTable::new(self.catalog.len());
        for state in model.visited_states() {
            table.touch(state);
        }
        if table.n_states() == 0 {
            return Err(AnalyticsError::InsufficientData {
                stage: "q_learning",
                found: 0,
                required: 1,
            });
        }

        let mut replayed_updates = 0;
        for _ in 0..self.config.observed_replay_passes {
            for t in observed {
                let Some(a) = self.catalog.index_of(&t.action) else {
                    continue;
                };
                self.step(&mut table, &dims, &t.state, a, &t.next_state, t.reward, 0)?;
                replayed_updates += 1;
            }
        }
        debug!(
            "Replayed {} observed updates over {} passes",
            replayed_updates, self.config.observed_replay_passes
        );

        let mut rng = ChaCha8Rng::seed_from_u64(
            seed.wrapping_mul(config::SEED_STREAM_MULTIPLIER)
                .wrapping_add(config::TRAINER_SEED_STREAM),
        );
        let mut exploration = ExplorationState::new(self.config.epsilon_start);
        let mut reward_trace = Vec::with_capacity(self.config.max_episodes);
        let mut delta_trace = Vec::with_capacity(self.config.max_episodes);
        let mut converged = false;

        while exploration.episode < self.config.max_episodes {
            let Some(mut state) = model.sample_start(&mut rng) else {
                break;
            };
            let mut total_reward = 0.0;
            let mut total_delta = 0.0;
            let mut steps = 0usize;

            for _ in 0..self.config.episode_length {
                let valid = self.catalog.valid_in_state(&state, &dims);
                if valid.is_empty() {
                    break;
                }
                let action = if rng.r#gen::<f64>() < exploration.epsilon {
                    valid[rng.gen_range(0..valid.len())]
                } else {
                    table.best_action(&state, &valid).unwrap_or(valid[0])
                };
                let sim = model.simulate(&state, action, self.catalog, &mut rng);
                let reward = self.rewards.reward(&state, &sim.next_state, sim.duration_secs);
                total_delta += self.step(
                    &mut table,
                    &dims,
                    &state,
                    action,
                    &sim.next_state,
                    reward,
                    exploration.episode,
                )?;
                total_reward += reward;
                steps += 1;
                state = sim.next_state;
            }

            reward_trace.push(total_reward);
            delta_trace.push(if steps > 0 {
                total_delta / steps as f64
            } else {
                0.0
            });
            exploration.finish_episode(self.config.epsilon_decay, self.config.epsilon_min);

            if exploration.episode >= self.config.min_episodes
                && delta_trace.len() >= self.config.convergence_window
                && self.config.convergence_window > 0
            {
                let window = &delta_trace[delta_trace.len() - self.config.convergence_window..];
                let mean = window.iter().sum::<f64>() / window.len() as f64;
                if mean < self.config.tolerance {
                    converged = true;
                    break;
                }
            }
            if exploration.episode % 500 == 0 {
                debug!(
                    "Episode {}: epsilon {:.3}, mean |dQ| {:.5}, reward {:.3}",
                    exploration.episode,
                    exploration.epsilon,
                    delta_trace.last().copied().unwrap_or(0.0),
                    total_reward
                );
            }
        }

        if !converged {
            warn!(
                "Q-learning stopped at the episode cap ({}) without reaching tolerance {}",
                exploration.episode, self.config.tolerance
            );
        }
        info!(
            "Q-learning finished: {} episodes, {} states, converged={}, final epsilon {:.3}, max |Q| {:.3}",
            exploration.episode,
            table.n_states(),
            converged,
            exploration.epsilon,
            table.max_abs()
        );

        Ok(TrainingOutcome {
            episodes: exploration.episode,
            table,
            converged,
            reward_trace,
            delta_trace,
            exploration,
            replayed_updates,
        })
    }

    /// One Bellman update with the mastery-tier learning rate. Returns |ΔQ|.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        table: &mut QTable,
        dims: &StateDims,
        state: &LearningState,
        action: usize,
        next: &LearningState,
        reward: f64,
        episode: usize,
    ) -> Result<f64, AnalyticsError> {
        let next_valid = self.catalog.valid_in_state(next, dims);
        let target = reward + self.config.discount * table.max_over(next, &next_valid);
        let rate = self.config.learning_rates.for_tier(MasteryTier::of(state));
        let delta = table.update(state, action, target, rate);
        let q = table.get(state, action);
        if !q.is_finite() || q.abs() > self.config.divergence_bound {
            return Err(AnalyticsError::TrainingDivergence {
                max_abs_q: q.abs(),
                bound: self.config.divergence_bound,
                episode,
            });
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reinforcement::types::{Action, ActionType, TemporalContext};

    fn dims() -> StateDims {
        StateDims {
            clusters: 1,
            modules: 2,
            progress_bins: 4,
            score_bins: 5,
            phases: 3,
            engagement_levels: 3,
        }
    }

    fn state(module_index: u8, progress_bin: u8, score_bin: u8) -> LearningState {
        LearningState {
            cluster_id: 0,
            module_index,
            progress_bin,
            score_bin,
            learning_phase: 0,
            engagement_level: 1,
        }
    }

    fn observed(rewards: &RewardWeights) -> Vec<Transition> {
        let mut out = Vec::new();
        let mut push = |s: LearningState, a: Action, n: LearningState, d: f64| {
            out.push(Transition {
                state: s,
                action: a,
                next_state: n,
                duration_secs: d,
                reward: rewards.reward(&s, &n, d),
            });
        };
        let view = Action::new(ActionType::ViewContent, TemporalContext::Current);
        let quiz = Action::new(ActionType::SubmitQuiz, TemporalContext::Current);
        let ahead = Action::new(ActionType::ViewContent, TemporalContext::Future);
        for _ in 0..5 {
            push(state(0, 0, 1), view, state(0, 1, 1), 300.0);
            push(state(0, 1, 1), quiz, state(0, 1, 3), 900.0);
            push(state(0, 1, 3), ahead, state(1, 0, 3), 120.0);
            push(state(1, 0, 3), view, state(1, 1, 3), 300.0);
        }
        out
    }

    fn setup() -> (ActionCatalog, RewardWeights, Vec<Transition>, TransitionModel) {
        let catalog = ActionCatalog::standard();
        let rewards = RewardWeights::default();
        let transitions = observed(&rewards);
        let model = TransitionModel::fit(&transitions, &catalog, dims(), 1.0);
        (catalog, rewards, transitions, model)
    }

    fn short_config() -> TrainerConfig {
        TrainerConfig {
            max_episodes: 600,
            min_episodes: 600,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn values_stay_finite_and_updates_shrink() {
        let (catalog, rewards, transitions, model) = setup();
        let trainer = QLearningTrainer::new(short_config(), &catalog, rewards);
        let outcome = trainer.train(&model, &transitions, 42).unwrap();

        assert!(outcome.table.is_finite());
        assert_eq!(outcome.episodes, 600);
        assert_eq!(outcome.reward_trace.len(), outcome.delta_trace.len());
        assert_eq!(outcome.replayed_updates, transitions.len() * 3);

        let head: f64 = outcome.delta_trace[..100].iter().sum::<f64>() / 100.0;
        let tail: f64 = outcome.delta_trace[500..].iter().sum::<f64>() / 100.0;
        assert!(tail < head, "mean |dQ| did not shrink: {} -> {}", head, tail);
        assert!(outcome.exploration.epsilon < 0.1);
    }

    #[test]
    fn same_seed_same_table() {
        let (catalog, rewards, transitions, model) = setup();
        let trainer = QLearningTrainer::new(short_config(), &catalog, rewards);
        let a = trainer.train(&model, &transitions, 9).unwrap();
        let b = trainer.train(&model, &transitions, 9).unwrap();
        assert_eq!(a.table, b.table);
        assert_eq!(a.reward_trace, b.reward_trace);
    }

    #[test]
    fn exceeding_the_bound_aborts() {
        let (catalog, rewards, transitions, model) = setup();
        let config = TrainerConfig {
            divergence_bound: 0.5,
            ..short_config()
        };
        let trainer = QLearningTrainer::new(config, &catalog, rewards);
        let err = trainer.train(&model, &transitions, 1).unwrap_err();
        assert!(matches!(err, AnalyticsError::TrainingDivergence { .. }));
    }

    #[test]
    fn empty_model_is_insufficient() {
        let catalog = ActionCatalog::standard();
        let model = TransitionModel::fit(&[], &catalog, dims(), 1.0);
        let trainer = QLearningTrainer::new(short_config(), &catalog, RewardWeights::default());
        let err = trainer.train(&model, &[], 1).unwrap_err();
        assert!(err.is_insufficient_data());
    }
}
