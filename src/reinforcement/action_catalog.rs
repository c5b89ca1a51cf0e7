// src/reinforcement/action_catalog.rs
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::{Action, ActionType, LearningState, StateDims, TemporalContext};
use crate::errors::AnalyticsError;
use crate::utils;

/// Version tag of the built-in validity table. Bump whenever the table changes;
/// tables trained against another version are rejected.
pub const CATALOG_VERSION: &str = "2024.2";

/// Which temporal contexts an action type may be recommended in.
fn valid_contexts(action_type: ActionType) -> &'static [TemporalContext] {
    use TemporalContext::*;
    match action_type {
        ActionType::ViewContent | ActionType::ViewAssignment | ActionType::PostForum => {
            &[Past, Current, Future]
        }
        ActionType::AttemptQuiz | ActionType::ReviewQuiz => &[Past, Current],
        ActionType::SubmitQuiz | ActionType::SubmitAssignment => &[Current],
    }
}

/// Closed, ordered set of recommendable actions.
///
/// Action indices are positions in `actions` and index every Q-table row,
/// so the catalog must be identical between training and serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCatalog {
    version: String,
    actions: Vec<Action>,
    #[serde(skip)]
    index: HashMap<Action, usize>,
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl ActionCatalog {
    pub fn standard() -> Self {
        let actions = ActionType::ALL
            .into_iter()
            .flat_map(|t| valid_contexts(t).iter().map(move |c| Action::new(t, *c)))
            .collect();
        Self::from_actions(CATALOG_VERSION, actions)
    }

    fn from_actions(version: &str, actions: Vec<Action>) -> Self {
        let index = actions.iter().enumerate().map(|(i, a)| (*a, i)).collect();
        Self {
            version: version.to_string(),
            actions,
            index,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn action(&self, idx: usize) -> Option<&Action> {
        self.actions.get(idx)
    }

    pub fn index_of(&self, action: &Action) -> Option<usize> {
        self.index.get(action).copied()
    }

    pub fn is_valid(action: &Action) -> bool {
        valid_contexts(action.action_type).contains(&action.context)
    }

    /// FNV-1a over the ordered action keys. Two catalogs with the same
    /// fingerprint index Q-table rows identically.
    pub fn fingerprint(&self) -> String {
        let keys: String = self.actions.iter().map(|a| a.key() + ";").collect();
        format!("{:016x}", utils::fnv1a(keys.into_bytes()))
    }

    /// Indices of actions that make sense in `state`: no earlier module
    /// before the first one, no next module after the last one.
    pub fn valid_in_state(&self, state: &LearningState, dims: &StateDims) -> Vec<usize> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| match a.context {
                TemporalContext::Past => state.module_index > 0,
                TemporalContext::Current => true,
                TemporalContext::Future => state.module_index < dims.last_module(),
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Fails unless a table built for (`version`, `fingerprint`) can be used
    /// with this catalog.
    pub fn verify(&self, version: &str, fingerprint: &str) -> Result<(), AnalyticsError> {
        let ours = self.fingerprint();
        if self.version != version || ours != fingerprint {
            return Err(AnalyticsError::CatalogMismatch {
                expected: format!("{} ({})", self.version, ours),
                found: format!("{} ({})", version, fingerprint),
            });
        }
        Ok(())
    }

    /// Rebuilds the lookup index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (*a, i))
            .collect();
    }
}
