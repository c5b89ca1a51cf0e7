// src/analytics/clustering/reconcile.rs
//
// Cluster indices are only meaningful inside one run. Successive runs are
// linked by matching each cluster profile to the nearest profile of the
// previous run, and student histories are classified against that matching.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::selector::{ClusterAssignment, ClusterProfile};
use crate::analytics::stats;
use crate::models::{CourseId, StudentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileDistance {
    #[default]
    Euclidean,
    Cosine,
}

impl ProfileDistance {
    pub fn between(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            ProfileDistance::Euclidean => stats::euclidean(a, b),
            ProfileDistance::Cosine => stats::cosine_distance(a, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    Initial,
    Moved,
    Stable,
}

/// One run's entry in a student's cluster history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTransition {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub cluster_id: usize,
    pub transition_type: TransitionType,
    /// Raw index in the previous run; `None` only for `Initial`
    pub previous_cluster_id: Option<usize>,
    /// Previous-run cluster whose profile is nearest to `cluster_id`'s
    pub matched_previous_cluster: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTransitionRecord {
    pub course_id: CourseId,
    pub student_id: StudentId,
    pub history: Vec<ClusterTransition>,
}

impl ClusterTransitionRecord {
    pub fn latest(&self) -> Option<&ClusterTransition> {
        self.history.last()
    }
}

/// Pairing of this run's clusters with the previous run's, plus distances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMatching {
    pub matches: BTreeMap<usize, usize>,
    pub distances: BTreeMap<usize, f64>,
}

/// Raw feature means of a profile laid out over `names`; absent features count as 0.
fn profile_vector(profile: &ClusterProfile, names: &[String]) -> Vec<f64> {
    names
        .iter()
        .map(|n| profile.feature_means.get(n).copied().unwrap_or(0.0))
        .collect()
}

/// Matches every current cluster to its nearest previous cluster.
///
/// Several current clusters may map to the same previous one (a split); ties
/// go to the lower previous index.
pub fn match_profiles(
    previous: &ClusterAssignment,
    current: &ClusterAssignment,
    metric: ProfileDistance,
) -> ProfileMatching {
    let names: Vec<String> = previous
        .feature_names
        .iter()
        .chain(&current.feature_names)
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let prior: Vec<(usize, Vec<f64>)> = previous
        .profiles
        .iter()
        .map(|p| (p.cluster_id, profile_vector(p, &names)))
        .collect();

    let mut matching = ProfileMatching::default();
    for profile in &current.profiles {
        let v = profile_vector(profile, &names);
        let mut best: Option<(usize, f64)> = None;
        for (id, pv) in &prior {
            let d = metric.between(&v, pv);
            match best {
                Some((_, bd)) if d >= bd => {}
                _ => best = Some((*id, d)),
            }
        }
        if let Some((id, d)) = best {
            debug!(
                "Cluster {} of run {} matches previous cluster {} (distance {:.4})",
                profile.cluster_id, current.run_id, id, d
            );
            matching.matches.insert(profile.cluster_id, id);
            matching.distances.insert(profile.cluster_id, d);
        }
    }
    matching
}

/// Per-course ledger of student cluster histories, one entry appended per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLedger {
    pub course_id: CourseId,
    pub records: BTreeMap<StudentId, ClusterTransitionRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionCounts {
    pub initial: usize,
    pub moved: usize,
    pub stable: usize,
}

impl TransitionLedger {
    pub fn new(course_id: CourseId) -> Self {
        Self {
            course_id,
            records: BTreeMap::new(),
        }
    }

    pub fn from_records(course_id: CourseId, records: Vec<ClusterTransitionRecord>) -> Self {
        let records = records
            .into_iter()
            .filter(|r| r.course_id == course_id)
            .map(|r| (r.student_id.clone(), r))
            .collect();
        Self { course_id, records }
    }

    pub fn record(&self, student: &StudentId) -> Option<&ClusterTransitionRecord> {
        self.records.get(student)
    }

    /// Appends `current` to every member's history. `previous` is the
    /// assignment the histories were last reconciled against; a student whose
    /// last entry belongs to another run is classified `Moved`.
    ///
    /// Re-applying a run already in a history leaves that history unchanged.
    pub fn apply(
        &mut self,
        previous: Option<&ClusterAssignment>,
        current: &ClusterAssignment,
        metric: ProfileDistance,
    ) -> TransitionCounts {
        let matching = previous
            .map(|p| match_profiles(p, current, metric))
            .unwrap_or_default();
        let mut counts = TransitionCounts::default();

        for (student, &cluster_id) in &current.memberships {
            let record = self
                .records
                .entry(student.clone())
                .or_insert_with(|| ClusterTransitionRecord {
                    course_id: self.course_id.clone(),
                    student_id: student.clone(),
                    history: Vec::new(),
                });
            if record.history.iter().any(|t| t.run_id == current.run_id) {
                continue;
            }

            let matched = matching.matches.get(&cluster_id).copied();
            let entry = match record.history.last() {
                None => {
                    counts.initial += 1;
                    ClusterTransition {
                        run_id: current.run_id,
                        timestamp: current.run_timestamp,
                        cluster_id,
                        transition_type: TransitionType::Initial,
                        previous_cluster_id: None,
                        matched_previous_cluster: matched,
                    }
                }
                Some(last) => {
                    let same_lineage = previous.is_some_and(|p| p.run_id == last.run_id);
                    let stable = same_lineage && matched == Some(last.cluster_id);
                    let transition_type = if stable {
                        counts.stable += 1;
                        TransitionType::Stable
                    } else {
                        counts.moved += 1;
                        TransitionType::Moved
                    };
                    ClusterTransition {
                        run_id: current.run_id,
                        timestamp: current.run_timestamp,
                        cluster_id,
                        transition_type,
                        previous_cluster_id: Some(last.cluster_id),
                        matched_previous_cluster: matched,
                    }
                }
            };
            record.history.push(entry);
        }

        info!(
            "Course {}: reconciled run {} ({} initial, {} stable, {} moved)",
            self.course_id, current.run_id, counts.initial, counts.stable, counts.moved
        );
        counts
    }

    pub fn into_records(self) -> Vec<ClusterTransitionRecord> {
        self.records.into_values().collect()
    }
}
