// src/pipeline.rs

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::analytics::clustering::{
    ClusterAssignment, ClusterSelector, ClusterTransitionRecord, TransitionLedger,
};
use crate::analytics::features::{FeatureExtractor, FeatureSelector, FeatureVector};
use crate::analytics::ingest;
use crate::config::{self, EngineConfig};
use crate::errors::{AnalyticsError, FetchError};
use crate::models::{CourseDataset, CourseId, RunWindow, StudentActivity, StudentId};
use crate::reinforcement::{
    ActionCatalog, PolicyRegistry, QLearningTrainer, QTableSnapshot, SnapshotMeta,
    TransitionModel, build_trajectories,
};
use crate::results::{ClusterStats, PhaseTimer, RunReport, TrainingStats};
use crate::storage::{RunArtifacts, SnapshotStore};
use crate::utils::{RetryConfig, with_retry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of the sliding log window, days
    pub window_days: i64,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_days: config::DEFAULT_WINDOW_DAYS,
            retry: RetryConfig::default(),
        }
    }
}

//------------------------------------------------------------------------------
// LOG SOURCE
//------------------------------------------------------------------------------

/// Supplier of normalized course activity.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self, course_id: &CourseId, window: &RunWindow)
    -> Result<CourseDataset, FetchError>;
}

/// Reads `<dir>/<course_id>.json` files holding a serialized `CourseDataset`.
pub struct JsonLogSource {
    dir: PathBuf,
}

impl JsonLogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Course ids of every `*.json` file in the directory, sorted.
    pub async fn list_courses(&self) -> Result<Vec<CourseId>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list data directory {}", self.dir.display()))?;
        let mut courses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                courses.push(CourseId(stem.to_string()));
            }
        }
        courses.sort();
        Ok(courses)
    }
}

/// Course file as written on disk. Events and grades stay untyped until
/// [`decode_course`] converts them one by one.
#[derive(Deserialize)]
struct CourseFile {
    course_id: CourseId,
    #[serde(default)]
    module_count: Option<u8>,
    #[serde(default)]
    students: Vec<StudentFile>,
}

#[derive(Deserialize)]
struct StudentFile {
    student_id: StudentId,
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    grades: Vec<Value>,
}

/// Parses a course file. Only a broken course envelope is an error; an event
/// or grade that does not decode is dropped and counted in
/// `malformed_records`.
fn decode_course(raw: &str, window: RunWindow) -> serde_json::Result<CourseDataset> {
    let file: CourseFile = serde_json::from_str(raw)?;
    let mut malformed = 0;
    let students = file
        .students
        .into_iter()
        .map(|s| StudentActivity {
            events: decode_records(s.events, &s.student_id, &mut malformed),
            grades: decode_records(s.grades, &s.student_id, &mut malformed),
            student_id: s.student_id,
        })
        .collect();
    Ok(CourseDataset {
        course_id: file.course_id,
        window,
        module_count: file.module_count,
        students,
        malformed_records: malformed,
    })
}

fn decode_records<T: DeserializeOwned>(
    values: Vec<Value>,
    student_id: &StudentId,
    malformed: &mut usize,
) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping malformed record of {}: {}", student_id, e);
                *malformed += 1;
                None
            }
        })
        .collect()
}

#[async_trait]
impl LogSource for JsonLogSource {
    async fn fetch(
        &self,
        course_id: &CourseId,
        window: &RunWindow,
    ) -> Result<CourseDataset, FetchError> {
        let path = self.dir.join(format!("{}.json", course_id));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::Permanent(format!("{} not found", path.display())));
            }
            Err(e) => {
                return Err(FetchError::Transient(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let mut dataset = decode_course(&raw, *window)
            .map_err(|e| FetchError::Permanent(format!("parsing {}: {}", path.display(), e)))?;
        if dataset.malformed_records > 0 {
            warn!(
                "{}: dropped {} undecodable records",
                path.display(),
                dataset.malformed_records
            );
        }
        if dataset.course_id != *course_id {
            warn!(
                "{} declares course {}, using {}",
                path.display(),
                dataset.course_id,
                course_id
            );
            dataset.course_id = course_id.clone();
        }
        Ok(dataset)
    }
}

//------------------------------------------------------------------------------
// PIPELINE
//------------------------------------------------------------------------------

/// In-memory result of one course run, persisted only as a whole.
#[derive(Debug, Clone)]
pub struct CourseRunOutput {
    pub artifacts: RunArtifacts,
    /// Raw, scaled and selected features of every student
    pub features: Vec<FeatureVector>,
    pub reward_trace: Vec<f64>,
    pub delta_trace: Vec<f64>,
}

/// Runs every analytics stage of one course, start to finish, in memory.
pub struct AnalyticsPipeline {
    config: EngineConfig,
    catalog: ActionCatalog,
}

impl AnalyticsPipeline {
    pub fn new(config: EngineConfig, catalog: ActionCatalog) -> Self {
        Self { config, catalog }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    /// extraction -> selection -> clustering -> reconciliation ->
    /// trajectories -> transition model -> training.
    ///
    /// Fails with `AnalyticsError::InsufficientData` (as the root cause) when
    /// the course cannot be clustered, and with `TrainingDivergence` when
    /// training blows up. Too little trajectory data only skips training.
    pub async fn run_course(
        &self,
        dataset: CourseDataset,
        previous: Option<&ClusterAssignment>,
        history: Vec<ClusterTransitionRecord>,
        run_timestamp: DateTime<Utc>,
    ) -> Result<CourseRunOutput> {
        let mut timer = PhaseTimer::start();
        let course_id = dataset.course_id.clone();
        let window = dataset.window;

        // Phase 1: ingestion
        let (dataset, ingest_report) = ingest::sanitize(dataset);
        let mut report = RunReport::new(
            Uuid::nil(),
            course_id.clone(),
            run_timestamp,
            window,
            self.config.seed,
        );
        report.ingest = ingest_report;
        timer.lap(&mut report, "ingestion");

        // Phase 2: features
        let mut extraction =
            FeatureExtractor::new(self.config.features.clone()).extract(&dataset, run_timestamp);
        let selection = FeatureSelector::new(self.config.selection.clone())
            .select(&extraction.matrix, Some(&extraction.label_proxy));
        extraction.apply_selection(&selection);
        let selected = extraction.matrix.select_named(&selection.retained);
        report.features_extracted = extraction.matrix.n_cols();
        report.features_retained = selected.n_cols();
        report.selection_fallback_used = selection.fallback_used;
        timer.lap(&mut report, "feature_extraction");

        // Phase 3: clustering
        let mut clustering = self.config.clustering.clone();
        clustering.seed = self.config.seed;
        let assignment = ClusterSelector::new(clustering)
            .select_parallel(&course_id, run_timestamp, Arc::new(selected))
            .await?;
        report.run_id = assignment.run_id;
        timer.lap(&mut report, "clustering");

        // Phase 4: reconciliation
        let mut ledger = TransitionLedger::from_records(course_id.clone(), history);
        let counts = ledger.apply(
            previous,
            &assignment,
            self.config.clustering.profile_distance,
        );
        report.cluster_stats = Some(ClusterStats {
            optimal_k: assignment.optimal_k,
            candidates_evaluated: assignment.candidates.len(),
            silhouette: assignment.quality.silhouette,
            composite: assignment.quality.composite,
            cluster_sizes: assignment.profiles.iter().map(|p| p.size).collect(),
            transitions: counts,
        });
        timer.lap(&mut report, "reconciliation");

        // Phase 5: trajectories
        let trajectories = build_trajectories(
            &dataset,
            &assignment.memberships,
            assignment.optimal_k,
            &self.config.encoder,
            &self.config.rewards,
        );
        timer.lap(&mut report, "trajectories");

        // Phase 6-7: transition model and training
        let observed = trajectories.transitions.len();
        let trained = if observed < config::MIN_TRANSITIONS_FOR_TRAINING {
            warn!(
                "Course {} run {}: {} transitions (need {}), training skipped",
                course_id,
                assignment.run_id,
                observed,
                config::MIN_TRANSITIONS_FOR_TRAINING
            );
            None
        } else {
            let model = TransitionModel::fit(
                &trajectories.transitions,
                &self.catalog,
                trajectories.dims(),
                config::LAPLACE_ALPHA,
            );
            timer.lap(&mut report, "transition_model");

            let trainer = QLearningTrainer::new(
                self.config.trainer.clone(),
                &self.catalog,
                self.config.rewards,
            );
            match trainer.train(&model, &trajectories.transitions, self.config.seed) {
                Ok(outcome) => {
                    timer.lap(&mut report, "training");
                    Some((model, outcome))
                }
                Err(e) if e.is_insufficient_data() => {
                    warn!(
                        "Course {} run {}: {}, training skipped",
                        course_id, assignment.run_id, e
                    );
                    None
                }
                Err(e @ AnalyticsError::TrainingDivergence { .. }) => {
                    error!(
                        "Course {} run {} at {}: {}. Previous policy stays live.",
                        course_id, assignment.run_id, run_timestamp, e
                    );
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut reward_trace = Vec::new();
        let mut delta_trace = Vec::new();
        let mut policy = None;
        if let Some((model, outcome)) = trained {
            let dims = model.dims();
            let tail = outcome.reward_trace.len().min(config::CONVERGENCE_WINDOW);
            let recent_mean_reward = if tail == 0 {
                0.0
            } else {
                outcome.reward_trace[outcome.reward_trace.len() - tail..]
                    .iter()
                    .sum::<f64>()
                    / tail as f64
            };
            report.training_stats = Some(TrainingStats {
                observed_transitions: observed,
                unmapped_events: trajectories.unmapped_events,
                visited_states: outcome.table.n_states(),
                state_space_size: dims.size(),
                episodes: outcome.episodes,
                converged: outcome.converged,
                final_epsilon: outcome.exploration.epsilon,
                max_abs_q: outcome.table.max_abs(),
                recent_mean_reward,
                model: model.summary(),
            });

            let mut profiles: Vec<_> = assignment.profiles.iter().collect();
            profiles.sort_by_key(|p| p.cluster_id);
            let default_state = trajectories
                .modal_start_state()
                .or_else(|| model.visited_states().next().copied())
                .unwrap_or_default();
            let meta = SnapshotMeta {
                course_id: course_id.clone(),
                run_id: assignment.run_id,
                run_timestamp,
                dims,
                student_states: trajectories.student_states.clone(),
                cluster_centroids: profiles.iter().map(|p| p.centroid.clone()).collect(),
                default_state,
                episodes: outcome.episodes,
                converged: outcome.converged,
            };
            policy = Some(QTableSnapshot::build(meta, &outcome.table, &self.catalog));
            reward_trace = outcome.reward_trace;
            delta_trace = outcome.delta_trace;
        }

        timer.finish(&mut report);
        report.log_summary();

        Ok(CourseRunOutput {
            artifacts: RunArtifacts {
                assignment,
                transitions: ledger.into_records(),
                policy,
                report,
            },
            features: extraction.vectors,
            reward_trace,
            delta_trace,
        })
    }
}

//------------------------------------------------------------------------------
// SCHEDULER
//------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        run_id: Uuid,
        optimal_k: usize,
        policy_version: Option<u64>,
    },
    /// The (course, window) pair already ran
    Skipped { window_key: String },
    InsufficientData { reason: String },
    Failed { error: String },
}

/// Scheduled, idempotent, single-flighted course runs.
pub struct RunScheduler {
    pipeline: Arc<AnalyticsPipeline>,
    source: Arc<dyn LogSource>,
    store: Arc<dyn SnapshotStore>,
    registry: Arc<PolicyRegistry>,
    retry: RetryConfig,
    course_locks: Mutex<HashMap<CourseId, Arc<Mutex<()>>>>,
    completed: Mutex<HashSet<(CourseId, String)>>,
}

impl RunScheduler {
    pub fn new(
        pipeline: Arc<AnalyticsPipeline>,
        source: Arc<dyn LogSource>,
        store: Arc<dyn SnapshotStore>,
        registry: Arc<PolicyRegistry>,
    ) -> Self {
        let retry = pipeline.config().scheduler.retry.clone();
        Self {
            pipeline,
            source,
            store,
            registry,
            retry,
            course_locks: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Runs every course over `window` concurrently.
    pub async fn run_batch(
        &self,
        course_ids: &[CourseId],
        window: RunWindow,
    ) -> Vec<(CourseId, RunOutcome)> {
        info!(
            "Starting batch of {} courses over window {}",
            course_ids.len(),
            window.key()
        );
        let runs = course_ids.iter().map(|course_id| async move {
            let outcome = self.run_course(course_id, window).await;
            (course_id.clone(), outcome)
        });
        let outcomes = join_all(runs).await;

        let completed = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RunOutcome::Completed { .. }))
            .count();
        info!(
            "Batch finished: {}/{} courses completed",
            completed,
            outcomes.len()
        );
        outcomes
    }

    async fn course_lock(&self, course_id: &CourseId) -> Arc<Mutex<()>> {
        let mut locks = self.course_locks.lock().await;
        Arc::clone(
            locks
                .entry(course_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// One course run. Never panics and never returns an error: every
    /// failure becomes a `RunOutcome`.
    pub async fn run_course(&self, course_id: &CourseId, window: RunWindow) -> RunOutcome {
        let lock = self.course_lock(course_id).await;
        let _guard = lock.lock().await;

        let key = (course_id.clone(), window.key());
        if self.completed.lock().await.contains(&key) {
            info!("Course {} window {} already ran, skipping", course_id, key.1);
            return RunOutcome::Skipped { window_key: key.1 };
        }
        match self.store.has_completed(course_id, &window).await {
            Ok(true) => {
                info!("Course {} window {} found in store, skipping", course_id, key.1);
                self.completed.lock().await.insert(key.clone());
                return RunOutcome::Skipped { window_key: key.1 };
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Course {}: idempotency check failed: {:#}", course_id, e);
            }
        }

        match self.execute(course_id, window).await {
            Ok(outcome) => {
                if matches!(outcome, RunOutcome::Completed { .. }) {
                    self.completed.lock().await.insert(key);
                }
                outcome
            }
            Err(e) => {
                if let Some(AnalyticsError::InsufficientData {
                    stage,
                    found,
                    required,
                }) = e.downcast_ref::<AnalyticsError>()
                {
                    warn!(
                        "Course {} window {}: insufficient data for {} ({} < {})",
                        course_id, key.1, stage, found, required
                    );
                    return RunOutcome::InsufficientData {
                        reason: e.to_string(),
                    };
                }
                error!("Course {} window {} failed: {:#}", course_id, key.1, e);
                RunOutcome::Failed {
                    error: format!("{:#}", e),
                }
            }
        }
    }

    async fn execute(&self, course_id: &CourseId, window: RunWindow) -> Result<RunOutcome> {
        let source = Arc::clone(&self.source);
        let dataset = with_retry(&self.retry, FetchError::is_transient, || {
            let source = Arc::clone(&source);
            let course_id = course_id.clone();
            async move { source.fetch(&course_id, &window).await }
        })
        .await
        .with_context(|| format!("Failed to fetch activity of course {}", course_id))?;

        let previous = self
            .store
            .load_latest_assignment(course_id)
            .await
            .context("Failed to load previous cluster assignment")?;
        let history = self
            .store
            .load_transition_records(course_id)
            .await
            .context("Failed to load cluster transition records")?;

        let output = self
            .pipeline
            .run_course(dataset, previous.as_ref(), history, Utc::now())
            .await?;
        let artifacts = output.artifacts;

        self.store
            .save_run(&artifacts)
            .await
            .with_context(|| format!("Failed to persist run {}", artifacts.report.run_id))?;

        let mut policy_version = None;
        if let Some(policy) = artifacts.policy.clone() {
            let version = policy.version;
            match self.registry.publish(policy) {
                Ok(()) => policy_version = Some(version),
                Err(e) => warn!("Course {}: {}", course_id, e),
            }
        }

        Ok(RunOutcome::Completed {
            run_id: artifacts.report.run_id,
            optimal_k: artifacts.assignment.optimal_k,
            policy_version,
        })
    }
}

/// Publishes the latest persisted policy of every course into `registry`.
/// Returns how many courses got a policy.
pub async fn restore_policies(
    store: &dyn SnapshotStore,
    registry: &PolicyRegistry,
    course_ids: &[CourseId],
) -> Result<usize> {
    let mut restored = 0;
    for course_id in course_ids {
        if let Some(snapshot) = store.load_latest_policy(course_id).await? {
            match registry.publish(snapshot) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Course {}: {}", course_id, e),
            }
        }
    }
    info!("Restored {} of {} course policies", restored, course_ids.len());
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> RunWindow {
        RunWindow::trailing(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(), 28)
    }

    #[tokio::test]
    async fn missing_course_file_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let source = JsonLogSource::new(tmp.path());
        let err = source
            .fetch(&CourseId("ghost".into()), &window())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn lists_json_files_as_courses() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = CourseDataset {
            course_id: CourseId("bio".into()),
            window: window(),
            module_count: None,
            students: Vec::new(),
            malformed_records: 0,
        };
        std::fs::write(
            tmp.path().join("bio.json"),
            serde_json::to_string(&dataset).unwrap(),
        )
        .unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let source = JsonLogSource::new(tmp.path());
        assert_eq!(source.list_courses().await.unwrap(), vec![CourseId("bio".into())]);
        let fetched = source.fetch(&CourseId("bio".into()), &window()).await.unwrap();
        assert_eq!(fetched.window, window());
    }
}
