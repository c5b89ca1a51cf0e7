// src/reinforcement/policy.rs
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action_catalog::ActionCatalog;
use super::q_table::QTable;
use super::state_encoder::SCORE_FALLBACK_BIN;
use super::types::{LearningState, StateDims};
use crate::analytics::stats;
use crate::errors::AnalyticsError;
use crate::models::{CourseId, StudentId};

/// Snapshot format version written into every serialized table.
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QRow {
    pub state: LearningState,
    /// One value per catalog action, in catalog order
    pub values: Vec<f64>,
    pub visits: u64,
}

/// Immutable, versioned Q-table published for serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QTableSnapshot {
    pub format: u32,
    /// Monotonic per course; newer runs carry larger versions
    pub version: u64,
    pub course_id: CourseId,
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub catalog_version: String,
    pub catalog_fingerprint: String,
    pub dims: StateDims,
    /// Sorted by state
    pub rows: Vec<QRow>,
    pub student_states: BTreeMap<StudentId, LearningState>,
    /// Standardized cluster centroids of the run, indexed by cluster id
    pub cluster_centroids: Vec<Vec<f64>>,
    /// Used for students the run has never seen
    pub default_state: LearningState,
    pub episodes: usize,
    pub converged: bool,
    #[serde(skip)]
    index: HashMap<LearningState, usize>,
}

impl PartialEq for QTableSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format
            && self.version == other.version
            && self.course_id == other.course_id
            && self.run_id == other.run_id
            && self.run_timestamp == other.run_timestamp
            && self.catalog_version == other.catalog_version
            && self.catalog_fingerprint == other.catalog_fingerprint
            && self.dims == other.dims
            && self.rows == other.rows
            && self.student_states == other.student_states
            && self.cluster_centroids == other.cluster_centroids
            && self.default_state == other.default_state
            && self.episodes == other.episodes
            && self.converged == other.converged
    }
}

/// Inputs of a snapshot that do not come from the Q-table itself.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub course_id: CourseId,
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub dims: StateDims,
    pub student_states: BTreeMap<StudentId, LearningState>,
    pub cluster_centroids: Vec<Vec<f64>>,
    pub default_state: LearningState,
    pub episodes: usize,
    pub converged: bool,
}

impl QTableSnapshot {
    pub fn build(meta: SnapshotMeta, table: &QTable, catalog: &ActionCatalog) -> Self {
        let rows = table
            .iter()
            .map(|(state, values)| QRow {
                state: *state,
                values: values.clone(),
                visits: table.visits(state),
            })
            .collect();
        let mut snapshot = Self {
            format: SNAPSHOT_FORMAT,
            version: meta.run_timestamp.timestamp_millis().max(0) as u64,
            course_id: meta.course_id,
            run_id: meta.run_id,
            run_timestamp: meta.run_timestamp,
            catalog_version: catalog.version().to_string(),
            catalog_fingerprint: catalog.fingerprint(),
            dims: meta.dims,
            rows,
            student_states: meta.student_states,
            cluster_centroids: meta.cluster_centroids,
            default_state: meta.default_state,
            episodes: meta.episodes,
            converged: meta.converged,
            index: HashMap::new(),
        };
        snapshot.rebuild_index();
        snapshot
    }

    pub fn rebuild_index(&mut self) {
        self.rows.sort_by(|a, b| a.state.cmp(&b.state));
        self.index = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.state, i))
            .collect();
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize Q-table snapshot")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut snapshot: QTableSnapshot =
            serde_json::from_str(raw).context("Failed to parse Q-table snapshot")?;
        snapshot.rebuild_index();
        Ok(snapshot)
    }

    /// Fails when the snapshot was trained against another action catalog.
    pub fn check_catalog(&self, catalog: &ActionCatalog) -> Result<(), AnalyticsError> {
        catalog.verify(&self.catalog_version, &self.catalog_fingerprint)
    }

    pub fn n_states(&self) -> usize {
        self.rows.len()
    }

    pub fn state_of(&self, student: &StudentId) -> Option<LearningState> {
        self.student_states.get(student).copied()
    }

    pub fn values_for(&self, state: &LearningState) -> Option<&[f64]> {
        self.index
            .get(state)
            .and_then(|&i| self.rows.get(i))
            .map(|r| r.values.as_slice())
    }

    /// Nearest state present in the table, with its distance.
    ///
    /// Cluster and learning phase are categorical and count 0 or 1; so does
    /// the score bin when either side is the ungraded fallback. The other
    /// dimensions count their absolute bin difference. Ties go to the state
    /// whose cluster centroid is closest, then to the smaller state.
    pub fn nearest_visited(&self, state: &LearningState) -> Option<(LearningState, f64)> {
        let mut best: Option<(LearningState, f64, f64)> = None;
        for row in &self.rows {
            let d = state_distance(state, &row.state);
            let c = self.centroid_distance(state.cluster_id, row.state.cluster_id);
            let better = match best {
                None => true,
                Some((_, bd, bc)) => d < bd || (d == bd && c < bc),
            };
            if better {
                best = Some((row.state, d, c));
            }
        }
        best.map(|(s, d, _)| (s, d))
    }

    fn centroid_distance(&self, a: u8, b: u8) -> f64 {
        if a == b {
            return 0.0;
        }
        match (
            self.cluster_centroids.get(a as usize),
            self.cluster_centroids.get(b as usize),
        ) {
            (Some(x), Some(y)) if x.len() == y.len() => stats::euclidean(x, y),
            _ => f64::INFINITY,
        }
    }
}

pub fn state_distance(a: &LearningState, b: &LearningState) -> f64 {
    let categorical = |x: u8, y: u8| if x == y { 0.0 } else { 1.0 };
    let ordinal = |x: u8, y: u8| (x as f64 - y as f64).abs();
    let score = if a.score_bin == SCORE_FALLBACK_BIN || b.score_bin == SCORE_FALLBACK_BIN {
        categorical(a.score_bin, b.score_bin)
    } else {
        ordinal(a.score_bin, b.score_bin)
    };
    categorical(a.cluster_id, b.cluster_id)
        + ordinal(a.module_index, b.module_index)
        + ordinal(a.progress_bin, b.progress_bin)
        + score
        + categorical(a.learning_phase, b.learning_phase)
        + ordinal(a.engagement_level, b.engagement_level)
}

/// Live policies by course. Readers get an `Arc` to one fixed snapshot;
/// publishing swaps the whole map atomically.
pub struct PolicyRegistry {
    policies: ArcSwap<HashMap<CourseId, Arc<QTableSnapshot>>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            policies: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Makes `snapshot` the live policy of its course. A snapshot whose
    /// version is not newer than the live one is rejected.
    pub fn publish(&self, snapshot: QTableSnapshot) -> Result<(), AnalyticsError> {
        let snapshot = Arc::new(snapshot);
        let mut rejected: Option<u64> = None;
        self.policies.rcu(|current| {
            match current.get(&snapshot.course_id) {
                Some(live) if live.version >= snapshot.version => {
                    rejected = Some(live.version);
                    Arc::clone(current)
                }
                _ => {
                    rejected = None;
                    let mut next = HashMap::clone(current);
                    next.insert(snapshot.course_id.clone(), Arc::clone(&snapshot));
                    Arc::new(next)
                }
            }
        });
        if let Some(current) = rejected {
            return Err(AnalyticsError::StaleSnapshot {
                course_id: snapshot.course_id.to_string(),
                version: snapshot.version,
                current,
            });
        }
        info!(
            "Published policy v{} for course {} ({} states)",
            snapshot.version,
            snapshot.course_id,
            snapshot.n_states()
        );
        Ok(())
    }

    pub fn get(&self, course_id: &CourseId) -> Option<Arc<QTableSnapshot>> {
        self.policies.load().get(course_id).cloned()
    }

    pub fn version_of(&self, course_id: &CourseId) -> Option<u64> {
        self.policies.load().get(course_id).map(|s| s.version)
    }

    pub fn courses(&self) -> Vec<CourseId> {
        let mut courses: Vec<CourseId> = self.policies.load().keys().cloned().collect();
        courses.sort();
        courses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state(cluster_id: u8, module_index: u8, score_bin: u8) -> LearningState {
        LearningState {
            cluster_id,
            module_index,
            progress_bin: 1,
            score_bin,
            learning_phase: 0,
            engagement_level: 1,
        }
    }

    fn snapshot(minute: u32) -> QTableSnapshot {
        let catalog = ActionCatalog::standard();
        let mut table = QTable::new(catalog.len());
        table.update(&state(0, 1, 2), 0, 1.0, 1.0);
        table.update(&state(1, 1, 2), 1, 1.0, 1.0);
        table.update(&state(2, 1, 2), 2, 1.0, 1.0);
        let meta = SnapshotMeta {
            course_id: CourseId("c1".into()),
            run_id: Uuid::new_v4(),
            run_timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap(),
            dims: StateDims {
                clusters: 3,
                modules: 3,
                progress_bins: 4,
                score_bins: 5,
                phases: 3,
                engagement_levels: 3,
            },
            student_states: BTreeMap::new(),
            cluster_centroids: vec![vec![0.0, 0.0], vec![5.0, 0.0], vec![1.0, 0.0]],
            default_state: state(0, 1, 2),
            episodes: 10,
            converged: true,
        };
        QTableSnapshot::build(meta, &table, &catalog)
    }

    #[test]
    fn nearest_prefers_close_clusters_on_ties() {
        let snap = snapshot(0);
        // Cluster 3 is unknown, every row is at distance 1 from it
        let (s, d) = snap.nearest_visited(&state(3, 1, 2)).unwrap();
        assert_eq!(d, 1.0);
        assert_eq!(s, state(0, 1, 2));

        // Without cluster 0 rows, cluster 2 sits closer than cluster 1
        let mut snap = snap;
        snap.rows.retain(|r| r.state.cluster_id != 0);
        snap.rebuild_index();
        let (s, _) = snap.nearest_visited(&state(0, 1, 2)).unwrap();
        assert_eq!(s.cluster_id, 2);
    }

    #[test]
    fn fallback_score_bin_is_categorical() {
        let graded = state(0, 0, 0);
        let far = state(0, 0, 3);
        let ungraded = state(0, 0, SCORE_FALLBACK_BIN);
        assert_eq!(state_distance(&graded, &far), 3.0);
        assert_eq!(state_distance(&far, &ungraded), 1.0);
    }

    #[test]
    fn json_reload_restores_the_index() {
        let snap = snapshot(0);
        let back = QTableSnapshot::from_json(&snap.to_json().unwrap()).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.values_for(&state(1, 1, 2)), snap.values_for(&state(1, 1, 2)));
        assert!(back.values_for(&state(1, 1, 2)).is_some());
        assert!(back.check_catalog(&ActionCatalog::standard()).is_ok());
    }

    #[test]
    fn registry_rejects_stale_versions() {
        let registry = PolicyRegistry::new();
        let course = CourseId("c1".into());
        assert!(registry.get(&course).is_none());

        registry.publish(snapshot(5)).unwrap();
        let held = registry.get(&course).unwrap();
        let v5 = registry.version_of(&course).unwrap();

        let err = registry.publish(snapshot(5)).unwrap_err();
        assert!(matches!(err, AnalyticsError::StaleSnapshot { .. }));
        assert!(registry.publish(snapshot(1)).is_err());

        registry.publish(snapshot(9)).unwrap();
        assert!(registry.version_of(&course).unwrap() > v5);
        // Readers keep the snapshot they loaded
        assert_eq!(held.version, v5);
        assert_eq!(registry.courses(), vec![course]);
    }
}
