// src/reinforcement/q_table.rs
use std::collections::BTreeMap;

use super::types::LearningState;

/// Mutable (state, action) value table owned by a single trainer.
///
/// Rows are created lazily at zero the first time a state is touched, so
/// the table only holds reachable states.
#[derive(Debug, Clone, PartialEq)]
pub struct QTable {
    n_actions: usize,
    values: BTreeMap<LearningState, Vec<f64>>,
    visits: BTreeMap<LearningState, u64>,
}

impl QTable {
    pub fn new(n_actions: usize) -> Self {
        Self {
            n_actions,
            values: BTreeMap::new(),
            visits: BTreeMap::new(),
        }
    }

    pub fn n_actions(&self) -> usize {
        self.n_actions
    }

    pub fn n_states(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, state: &LearningState, action: usize) -> f64 {
        self.values
            .get(state)
            .and_then(|row| row.get(action))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn row(&self, state: &LearningState) -> Option<&[f64]> {
        self.values.get(state).map(Vec::as_slice)
    }

    pub fn visits(&self, state: &LearningState) -> u64 {
        self.visits.get(state).copied().unwrap_or(0)
    }

    /// Ensures a zero row exists for `state`.
    pub fn touch(&mut self, state: &LearningState) {
        let n = self.n_actions;
        self.values.entry(*state).or_insert_with(|| vec![0.0; n]);
    }

    /// Moves Q(state, action) toward `target` by `rate`. Returns |ΔQ|.
    pub fn update(&mut self, state: &LearningState, action: usize, target: f64, rate: f64) -> f64 {
        let n = self.n_actions;
        let row = self.values.entry(*state).or_insert_with(|| vec![0.0; n]);
        let Some(q) = row.get_mut(action) else {
            return 0.0;
        };
        let delta = rate * (target - *q);
        *q += delta;
        *self.visits.entry(*state).or_default() += 1;
        delta.abs()
    }

    /// max over `valid` of Q(state, ·); zero for an empty set.
    pub fn max_over(&self, state: &LearningState, valid: &[usize]) -> f64 {
        valid
            .iter()
            .map(|&a| self.get(state, a))
            .fold(None, |best: Option<f64>, q| Some(best.map_or(q, |b| b.max(q))))
            .unwrap_or(0.0)
    }

    /// Greedy action among `valid`; ties go to the earliest entry.
    pub fn best_action(&self, state: &LearningState, valid: &[usize]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for &a in valid {
            let q = self.get(state, a);
            if best.is_none_or(|(_, b)| q > b) {
                best = Some((a, q));
            }
        }
        best.map(|(a, _)| a)
    }

    pub fn max_abs(&self) -> f64 {
        self.values
            .values()
            .flatten()
            .fold(0.0_f64, |m, q| m.max(q.abs()))
    }

    pub fn is_finite(&self) -> bool {
        self.values.values().flatten().all(|q| q.is_finite())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LearningState, &Vec<f64>)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(cluster_id: u8) -> LearningState {
        LearningState {
            cluster_id,
            module_index: 0,
            progress_bin: 0,
            score_bin: 0,
            learning_phase: 0,
            engagement_level: 0,
        }
    }

    #[test]
    fn update_moves_toward_target() {
        let mut q = QTable::new(3);
        let delta = q.update(&s(0), 1, 10.0, 0.5);
        assert_eq!(delta, 5.0);
        assert_eq!(q.get(&s(0), 1), 5.0);
        assert_eq!(q.visits(&s(0)), 1);
        assert_eq!(q.get(&s(1), 1), 0.0);
        assert_eq!(q.update(&s(0), 7, 1.0, 0.5), 0.0);
    }

    #[test]
    fn greedy_choice_respects_the_valid_set() {
        let mut q = QTable::new(3);
        q.update(&s(0), 0, 4.0, 1.0);
        q.update(&s(0), 2, 2.0, 1.0);
        assert_eq!(q.best_action(&s(0), &[0, 1, 2]), Some(0));
        assert_eq!(q.best_action(&s(0), &[1, 2]), Some(2));
        assert_eq!(q.max_over(&s(0), &[1, 2]), 2.0);
        assert_eq!(q.best_action(&s(0), &[]), None);
        // Untouched rows tie at zero
        assert_eq!(q.best_action(&s(3), &[2, 1]), Some(2));
        assert_eq!(q.max_abs(), 4.0);
        assert!(q.is_finite());
    }
}
