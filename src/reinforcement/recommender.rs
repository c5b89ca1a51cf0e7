// src/reinforcement/recommender.rs
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::action_catalog::ActionCatalog;
use super::policy::{PolicyRegistry, QTableSnapshot};
use super::types::{Action, LearningState};
use crate::config;
use crate::models::{CourseId, StudentId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub default_top_k: usize,
    /// Temperature of the softmax turning Q-values into confidences
    pub softmax_temperature: f64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            default_top_k: config::DEFAULT_TOP_K,
            softmax_temperature: config::SOFTMAX_TEMPERATURE,
        }
    }
}

/// How the state used for ranking was found.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Exact,
    NearestState { distance: f64 },
    /// No usable policy; actions come in catalog order with neutral values
    DefaultPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub rank: usize,
    pub action: Action,
    pub label: String,
    pub description: String,
    pub q_value: f64,
    /// Softmax probability among the actions valid in the state
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub course_id: CourseId,
    pub student_id: Option<StudentId>,
    pub state: Option<LearningState>,
    pub resolution: Resolution,
    pub policy_version: Option<u64>,
    pub items: Vec<Recommendation>,
}

/// Read-only ranking of catalog actions against published policies.
///
/// Every call loads one snapshot and answers from it alone; nothing here
/// mutates a policy, and no input makes a call fail.
pub struct RecommendationServer {
    registry: Arc<PolicyRegistry>,
    catalog: ActionCatalog,
    config: ServingConfig,
}

impl RecommendationServer {
    pub fn new(registry: Arc<PolicyRegistry>, catalog: ActionCatalog, config: ServingConfig) -> Self {
        Self {
            registry,
            catalog,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Top `top_k` actions for a student; `0` means the configured default.
    pub fn recommend(
        &self,
        student_id: &StudentId,
        course_id: &CourseId,
        top_k: usize,
    ) -> RecommendationResponse {
        let Some(snapshot) = self.usable_snapshot(course_id) else {
            return self.default_policy(course_id, Some(student_id.clone()), None, top_k);
        };
        let state = snapshot.state_of(student_id).unwrap_or_else(|| {
            debug!(
                "Student {} unknown to policy v{} of course {}, using the default state",
                student_id, snapshot.version, course_id
            );
            snapshot.default_state
        });
        let mut response = self.rank(&snapshot, state, top_k);
        response.student_id = Some(student_id.clone());
        response
    }

    /// Top `top_k` actions for an explicit state.
    pub fn recommend_for_state(
        &self,
        course_id: &CourseId,
        state: LearningState,
        top_k: usize,
    ) -> RecommendationResponse {
        match self.usable_snapshot(course_id) {
            Some(snapshot) => self.rank(&snapshot, state, top_k),
            None => self.default_policy(course_id, None, Some(state), top_k),
        }
    }

    fn usable_snapshot(&self, course_id: &CourseId) -> Option<Arc<QTableSnapshot>> {
        let snapshot = self.registry.get(course_id)?;
        match snapshot.check_catalog(&self.catalog) {
            Ok(()) => Some(snapshot),
            Err(e) => {
                warn!("Ignoring policy v{} of course {}: {}", snapshot.version, course_id, e);
                None
            }
        }
    }

    fn top_k(&self, top_k: usize) -> usize {
        if top_k == 0 {
            self.config.default_top_k
        } else {
            top_k
        }
    }

    fn rank(
        &self,
        snapshot: &QTableSnapshot,
        state: LearningState,
        top_k: usize,
    ) -> RecommendationResponse {
        let (values, resolution) = match snapshot.values_for(&state) {
            Some(values) => (Some(values), Resolution::Exact),
            None => match snapshot.nearest_visited(&state) {
                Some((nearest, distance)) => {
                    debug!(
                        "State {} unseen in course {}, answering from {} (distance {})",
                        state, snapshot.course_id, nearest, distance
                    );
                    (
                        snapshot.values_for(&nearest),
                        Resolution::NearestState { distance },
                    )
                }
                None => (None, Resolution::DefaultPolicy),
            },
        };

        let valid = self.catalog.valid_in_state(&state, &snapshot.dims);
        let mut scored: Vec<(usize, f64)> = valid
            .iter()
            .map(|&i| {
                let q = values.and_then(|v| v.get(i)).copied().unwrap_or(0.0);
                (i, if q.is_finite() { q } else { 0.0 })
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        RecommendationResponse {
            course_id: snapshot.course_id.clone(),
            student_id: None,
            state: Some(state),
            resolution,
            policy_version: Some(snapshot.version),
            items: self.items(&scored, top_k),
        }
    }

    fn default_policy(
        &self,
        course_id: &CourseId,
        student_id: Option<StudentId>,
        state: Option<LearningState>,
        top_k: usize,
    ) -> RecommendationResponse {
        let scored: Vec<(usize, f64)> = (0..self.catalog.len()).map(|i| (i, 0.0)).collect();
        RecommendationResponse {
            course_id: course_id.clone(),
            student_id,
            state,
            resolution: Resolution::DefaultPolicy,
            policy_version: None,
            items: self.items(&scored, top_k),
        }
    }

    fn items(&self, scored: &[(usize, f64)], top_k: usize) -> Vec<Recommendation> {
        let confidences = softmax(
            &scored.iter().map(|(_, q)| *q).collect::<Vec<_>>(),
            self.config.softmax_temperature,
        );
        scored
            .iter()
            .zip(confidences)
            .take(self.top_k(top_k))
            .enumerate()
            .filter_map(|(rank, ((idx, q), confidence))| {
                let action = *self.catalog.action(*idx)?;
                Some(Recommendation {
                    rank: rank + 1,
                    action,
                    label: action.label(),
                    description: action.description(),
                    q_value: *q,
                    confidence,
                })
            })
            .collect()
    }
}

fn softmax(values: &[f64], temperature: f64) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| ((v - max) / t).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}
