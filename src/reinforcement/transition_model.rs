// src/reinforcement/transition_model.rs
use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::action_catalog::ActionCatalog;
use super::state_encoder::{ENGAGEMENT_LEVELS, SCORE_FALLBACK_BIN};
use super::types::{ActionType, LearningState, StateDims, TemporalContext, Transition};
use crate::analytics::stats;
use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Bin change statistics of one action type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    /// Share of observations where the bin went up
    pub p_improvement: f64,
}

impl DeltaStats {
    fn from_deltas(deltas: &[f64]) -> Self {
        let improved = deltas.iter().filter(|d| **d > 0.0).count();
        Self {
            count: deltas.len(),
            mean: stats::mean(deltas),
            std: stats::std_dev(deltas),
            p_improvement: if deltas.is_empty() {
                0.0
            } else {
                improved as f64 / deltas.len() as f64
            },
        }
    }
}

/// Serializable digest of a fitted model, carried in run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionModelSummary {
    pub observed_transitions: usize,
    pub visited_states: usize,
    pub observed_pairs: usize,
    pub time_patterns: BTreeMap<ActionType, DurationStats>,
    pub progress_patterns: BTreeMap<ActionType, DeltaStats>,
    pub score_patterns: BTreeMap<ActionType, DeltaStats>,
}

/// Outcome of one simulated step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedStep {
    pub next_state: LearningState,
    pub duration_secs: f64,
    /// True when the next state came from observed (state, action) counts
    pub observed: bool,
}

/// Empirical statistics of observed trajectories, also usable as a
/// stochastic simulator for generating extra training episodes.
#[derive(Debug, Clone)]
pub struct TransitionModel {
    dims: StateDims,
    /// Laplace-smoothed P(action | state) over the catalog; invalid actions get 0
    action_matrix: BTreeMap<LearningState, Vec<f64>>,
    time_patterns: BTreeMap<ActionType, DurationStats>,
    progress_patterns: BTreeMap<ActionType, DeltaStats>,
    score_patterns: BTreeMap<ActionType, DeltaStats>,
    /// P(engagement level | phase, progress bin), smoothed
    engagement_patterns: HashMap<(u8, u8), Vec<f64>>,
    next_state_counts: HashMap<(LearningState, usize), BTreeMap<LearningState, usize>>,
    state_counts: BTreeMap<LearningState, usize>,
    duration_samples: HashMap<ActionType, Vec<f64>>,
    observed: usize,
}

impl TransitionModel {
    pub fn fit(
        transitions: &[Transition],
        catalog: &ActionCatalog,
        dims: StateDims,
        laplace_alpha: f64,
    ) -> Self {
        let mut action_counts: BTreeMap<LearningState, Vec<f64>> = BTreeMap::new();
        let mut durations: HashMap<ActionType, Vec<f64>> = HashMap::new();
        let mut progress: HashMap<ActionType, Vec<f64>> = HashMap::new();
        let mut score: HashMap<ActionType, Vec<f64>> = HashMap::new();
        let mut engagement: HashMap<(u8, u8), Vec<f64>> = HashMap::new();
        let mut next_state_counts: HashMap<(LearningState, usize), BTreeMap<LearningState, usize>> =
            HashMap::new();
        let mut state_counts: BTreeMap<LearningState, usize> = BTreeMap::new();
        let mut duration_samples: HashMap<ActionType, Vec<f64>> = HashMap::new();

        for t in transitions {
            let Some(a) = catalog.index_of(&t.action) else {
                debug!("Skipping transition with action {} outside the catalog", t.action);
                continue;
            };
            let kind = t.action.action_type;
            action_counts
                .entry(t.state)
                .or_insert_with(|| vec![0.0; catalog.len()])[a] += 1.0;
            *state_counts.entry(t.state).or_default() += 1;
            *next_state_counts
                .entry((t.state, a))
                .or_default()
                .entry(t.next_state)
                .or_default() += 1;

            durations.entry(kind).or_default().push(t.duration_secs);
            let samples = duration_samples.entry(kind).or_default();
            if samples.len() < config::DURATION_SAMPLES_PER_ACTION {
                samples.push(t.duration_secs);
            }

            let progress_delta = if t.next_state.module_index > t.state.module_index {
                1.0
            } else {
                t.next_state.progress_bin as f64 - t.state.progress_bin as f64
            };
            progress.entry(kind).or_default().push(progress_delta);
            if t.state.score_bin != SCORE_FALLBACK_BIN && t.next_state.score_bin != SCORE_FALLBACK_BIN
            {
                score
                    .entry(kind)
                    .or_default()
                    .push(t.next_state.score_bin as f64 - t.state.score_bin as f64);
            }

            let row = engagement
                .entry((t.next_state.learning_phase, t.next_state.progress_bin))
                .or_insert_with(|| vec![0.0; ENGAGEMENT_LEVELS as usize]);
            if let Some(slot) = row.get_mut(t.next_state.engagement_level as usize) {
                *slot += 1.0;
            }
        }

        // Laplace smoothing over the actions valid in each state
        let alpha = laplace_alpha.max(0.0);
        let action_matrix = action_counts
            .into_iter()
            .map(|(state, counts)| {
                let valid = catalog.valid_in_state(&state, &dims);
                let mut row = vec![0.0; catalog.len()];
                let total: f64 = valid.iter().map(|&i| counts[i] + alpha).sum();
                for &i in &valid {
                    row[i] = if total > 0.0 {
                        (counts[i] + alpha) / total
                    } else {
                        1.0 / valid.len() as f64
                    };
                }
                (state, row)
            })
            .collect();

        let engagement_patterns = engagement
            .into_iter()
            .map(|(key, counts)| {
                let total: f64 = counts.iter().map(|c| c + 1.0).sum();
                (key, counts.iter().map(|c| (c + 1.0) / total).collect())
            })
            .collect();

        let time_patterns = durations
            .into_iter()
            .map(|(kind, d)| {
                let stats = DurationStats {
                    count: d.len(),
                    mean: stats::mean(&d),
                    std: stats::std_dev(&d),
                    min: d.iter().copied().fold(f64::INFINITY, f64::min),
                    max: d.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                (kind, stats)
            })
            .collect();
        let to_delta_stats = |m: HashMap<ActionType, Vec<f64>>| -> BTreeMap<ActionType, DeltaStats> {
            m.into_iter()
                .map(|(k, d)| (k, DeltaStats::from_deltas(&d)))
                .collect()
        };

        let model = Self {
            dims,
            action_matrix,
            time_patterns,
            progress_patterns: to_delta_stats(progress),
            score_patterns: to_delta_stats(score),
            engagement_patterns,
            next_state_counts,
            state_counts,
            duration_samples,
            observed: transitions.len(),
        };
        info!(
            "Transition model fitted: {} transitions, {} visited states, {} (state, action) pairs",
            model.observed,
            model.state_counts.len(),
            model.next_state_counts.len()
        );
        model
    }

    pub fn dims(&self) -> StateDims {
        self.dims
    }

    pub fn observed_transitions(&self) -> usize {
        self.observed
    }

    /// Smoothed P(action | state); `None` for states never observed.
    pub fn action_distribution(&self, state: &LearningState) -> Option<&[f64]> {
        self.action_matrix.get(state).map(Vec::as_slice)
    }

    pub fn action_matrix(&self) -> &BTreeMap<LearningState, Vec<f64>> {
        &self.action_matrix
    }

    pub fn time_pattern(&self, action_type: ActionType) -> Option<&DurationStats> {
        self.time_patterns.get(&action_type)
    }

    pub fn progress_pattern(&self, action_type: ActionType) -> Option<&DeltaStats> {
        self.progress_patterns.get(&action_type)
    }

    pub fn score_pattern(&self, action_type: ActionType) -> Option<&DeltaStats> {
        self.score_patterns.get(&action_type)
    }

    /// P(engagement | phase, progress bin); uniform when never observed.
    pub fn engagement_distribution(&self, phase: u8, progress_bin: u8) -> Vec<f64> {
        self.engagement_patterns
            .get(&(phase, progress_bin))
            .cloned()
            .unwrap_or_else(|| vec![1.0 / ENGAGEMENT_LEVELS as f64; ENGAGEMENT_LEVELS as usize])
    }

    pub fn visited_states(&self) -> impl Iterator<Item = &LearningState> {
        self.state_counts.keys()
    }

    pub fn summary(&self) -> TransitionModelSummary {
        TransitionModelSummary {
            observed_transitions: self.observed,
            visited_states: self.state_counts.len(),
            observed_pairs: self.next_state_counts.len(),
            time_patterns: self.time_patterns.clone(),
            progress_patterns: self.progress_patterns.clone(),
            score_patterns: self.score_patterns.clone(),
        }
    }

    /// Draws a start state proportional to how often each state was observed.
    pub fn sample_start(&self, rng: &mut ChaCha8Rng) -> Option<LearningState> {
        sample_weighted(
            self.state_counts.iter().map(|(s, n)| (*s, *n as f64)),
            rng,
        )
    }

    /// Samples the outcome of taking catalog action `action_idx` in `state`.
    ///
    /// Observed (state, action) pairs replay their empirical next-state
    /// distribution. Unobserved pairs are synthesized from the per-action
    /// progress, score and engagement patterns.
    pub fn simulate(
        &self,
        state: &LearningState,
        action_idx: usize,
        catalog: &ActionCatalog,
        rng: &mut ChaCha8Rng,
    ) -> SimulatedStep {
        let Some(action) = catalog.action(action_idx).copied() else {
            return SimulatedStep {
                next_state: *state,
                duration_secs: 0.0,
                observed: false,
            };
        };
        let duration_secs = self.sample_duration(action.action_type, rng);

        if let Some(next) = self
            .next_state_counts
            .get(&(*state, action_idx))
            .and_then(|counts| sample_weighted(counts.iter().map(|(s, n)| (*s, *n as f64)), rng))
        {
            return SimulatedStep {
                next_state: next,
                duration_secs,
                observed: true,
            };
        }

        let mut next = *state;
        next.learning_phase = action.action_type.phase().code();
        match action.context {
            TemporalContext::Future if next.module_index < self.dims.last_module() => {
                next.module_index += 1;
                next.progress_bin = 0;
            }
            TemporalContext::Current => {
                let p = self
                    .progress_patterns
                    .get(&action.action_type)
                    .map(|d| d.p_improvement)
                    .unwrap_or(0.0);
                if rng.r#gen::<f64>() < p {
                    next.progress_bin = (next.progress_bin + 1).min(self.dims.progress_bins - 1);
                }
            }
            _ => {}
        }
        if next.score_bin != SCORE_FALLBACK_BIN && action.action_type.is_graded() {
            if let Some(d) = self.score_patterns.get(&action.action_type) {
                let roll = rng.r#gen::<f64>();
                if roll < d.p_improvement {
                    next.score_bin = (next.score_bin + 1).min(SCORE_FALLBACK_BIN - 1);
                } else if d.mean < 0.0 && roll < d.p_improvement + (-d.mean).min(1.0) {
                    next.score_bin = next.score_bin.saturating_sub(1);
                }
            }
        }
        let engagement = self.engagement_distribution(next.learning_phase, next.progress_bin);
        if let Some(level) = sample_weighted(
            engagement.iter().enumerate().map(|(i, p)| (i as u8, *p)),
            rng,
        ) {
            next.engagement_level = level;
        }

        SimulatedStep {
            next_state: next,
            duration_secs,
            observed: false,
        }
    }

    fn sample_duration(&self, action_type: ActionType, rng: &mut ChaCha8Rng) -> f64 {
        let secs = match self.duration_samples.get(&action_type) {
            Some(samples) if !samples.is_empty() => samples[rng.gen_range(0..samples.len())],
            _ => self
                .time_patterns
                .get(&action_type)
                .map(|t| t.mean)
                .unwrap_or(config::DEFAULT_ACTION_DURATION_SECS),
        };
        secs.max(0.0)
    }
}

/// Draws one item with probability proportional to its weight.
fn sample_weighted<T: Copy>(
    items: impl Iterator<Item = (T, f64)>,
    rng: &mut ChaCha8Rng,
) -> Option<T> {
    let items: Vec<(T, f64)> = items.filter(|(_, w)| *w > 0.0 && w.is_finite()).collect();
    let total: f64 = items.iter().map(|(_, w)| w).sum();
    if items.is_empty() || total <= 0.0 {
        return None;
    }
    let mut target = rng.r#gen::<f64>() * total;
    for (item, w) in &items {
        if target < *w {
            return Some(*item);
        }
        target -= w;
    }
    items.last().map(|(item, _)| *item)
}
