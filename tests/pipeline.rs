// tests/pipeline.rs
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use pathwise_lib::errors::{AnalyticsError, FetchError};
use pathwise_lib::models::{CourseDataset, CourseId, RunWindow, StudentId};
use pathwise_lib::pipeline::{
    AnalyticsPipeline, JsonLogSource, LogSource, RunOutcome, RunScheduler,
};
use pathwise_lib::reinforcement::{
    ActionCatalog, PolicyRegistry, RecommendationServer, Resolution, ServingConfig,
};
use pathwise_lib::storage::{FileSnapshotStore, SnapshotStore};

/// Serves synthetic courses; the first `flaky` fetches fail transiently.
struct SyntheticSource {
    students: usize,
    flaky: usize,
    calls: AtomicUsize,
}

impl SyntheticSource {
    fn new(students: usize) -> Self {
        Self {
            students,
            flaky: 0,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LogSource for SyntheticSource {
    async fn fetch(
        &self,
        course_id: &CourseId,
        window: &RunWindow,
    ) -> Result<CourseDataset, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.flaky {
            return Err(FetchError::Transient("connection reset".into()));
        }
        if course_id.0 == "missing" {
            return Err(FetchError::Permanent("no such course".into()));
        }
        let mut dataset = common::synthetic_course(&course_id.0, self.students);
        dataset.window = *window;
        Ok(dataset)
    }
}

fn scheduler(
    source: Arc<dyn LogSource>,
    store: Arc<dyn SnapshotStore>,
) -> RunScheduler {
    let pipeline = Arc::new(AnalyticsPipeline::new(
        common::test_config(),
        ActionCatalog::standard(),
    ));
    RunScheduler::new(pipeline, source, store, Arc::new(PolicyRegistry::new()))
}

#[tokio::test]
async fn small_course_is_reported_as_insufficient_data() {
    let pipeline = AnalyticsPipeline::new(common::test_config(), ActionCatalog::standard());
    let err = pipeline
        .run_course(common::synthetic_course("tiny", 8), None, Vec::new(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AnalyticsError>(),
        Some(AnalyticsError::InsufficientData { found: 8, .. })
    ));

    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(tmp.path()));
    let s = scheduler(Arc::new(SyntheticSource::new(8)), Arc::clone(&store));
    let course = CourseId("tiny".into());
    let outcome = s.run_course(&course, common::window()).await;
    assert!(matches!(outcome, RunOutcome::InsufficientData { .. }));
    assert!(store.load_latest_assignment(&course).await.unwrap().is_none());
    assert!(s.registry().get(&course).is_none());
}

#[tokio::test]
async fn full_run_segments_trains_and_persists() {
    let pipeline = AnalyticsPipeline::new(common::test_config(), ActionCatalog::standard());
    let output = pipeline
        .run_course(common::synthetic_course("bio", 30), None, Vec::new(), Utc::now())
        .await
        .unwrap();
    let artifacts = output.artifacts;

    assert!(artifacts.assignment.optimal_k >= 2);
    assert_eq!(artifacts.assignment.memberships.len(), 30);
    // First run: every student starts a ledger record
    assert_eq!(artifacts.transitions.len(), 30);
    let stats = artifacts.report.cluster_stats.as_ref().unwrap();
    assert_eq!(stats.transitions.initial, 30);

    let policy = artifacts.policy.as_ref().unwrap();
    assert_eq!(policy.student_states.len(), 30);
    assert!(policy.n_states() > 0);
    assert!(artifacts.report.training_stats.as_ref().unwrap().max_abs_q.is_finite());
    assert!(output.delta_trace.iter().all(|d| d.is_finite()));

    assert_eq!(output.features.len(), 30);
    let retained = artifacts.report.features_retained;
    assert!(output.features.iter().all(|f| f.selected.len() == retained));
}

#[tokio::test]
async fn persisted_policy_serves_identical_recommendations() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(tmp.path()));
    let s = scheduler(Arc::new(SyntheticSource::new(30)), Arc::clone(&store));
    let course = CourseId("bio".into());

    let outcome = s.run_course(&course, common::window()).await;
    let RunOutcome::Completed { policy_version: Some(version), .. } = outcome.clone() else {
        panic!("expected a trained run, got {:?}", outcome);
    };
    assert_eq!(s.registry().version_of(&course), Some(version));

    let live = RecommendationServer::new(
        Arc::clone(s.registry()),
        ActionCatalog::standard(),
        ServingConfig::default(),
    );

    let reloaded = Arc::new(PolicyRegistry::new());
    reloaded
        .publish(store.load_latest_policy(&course).await.unwrap().unwrap())
        .unwrap();
    let restarted = RecommendationServer::new(reloaded, ActionCatalog::standard(), ServingConfig::default());

    for i in [0, 1, 2, 17] {
        let student = StudentId(format!("s{:03}", i));
        let before = live.recommend(&student, &course, 3);
        let after = restarted.recommend(&student, &course, 3);
        assert_eq!(before, after);
        assert_ne!(before.resolution, Resolution::DefaultPolicy);
        assert!(!before.items.is_empty());
    }
}

#[tokio::test]
async fn undecodable_records_are_skipped_and_the_run_completes() {
    let logs = tempfile::tempdir().unwrap();
    let mut file = serde_json::to_value(common::synthetic_course("chem", 30)).unwrap();
    file["students"][0]["events"][0]["module_index"] = serde_json::json!(300);
    file["students"][0]["grades"][0]["score"] = serde_json::json!("n/a");
    std::fs::write(logs.path().join("chem.json"), file.to_string()).unwrap();

    let source = JsonLogSource::new(logs.path());
    let course = CourseId("chem".into());
    let dataset = source.fetch(&course, &common::window()).await.unwrap();
    let intact = common::student(0);
    assert_eq!(dataset.malformed_records, 2);
    assert_eq!(dataset.students.len(), 30);
    assert_eq!(dataset.students[0].events.len(), intact.events.len() - 1);
    assert_eq!(dataset.students[0].grades.len(), intact.grades.len() - 1);

    let pipeline = AnalyticsPipeline::new(common::test_config(), ActionCatalog::standard());
    let output = pipeline
        .run_course(dataset, None, Vec::new(), Utc::now())
        .await
        .unwrap();
    let ingest = &output.artifacts.report.ingest;
    assert_eq!(ingest.malformed_records, 2);
    assert_eq!(ingest.skipped_records(), 2);
    assert_eq!(output.artifacts.assignment.memberships.len(), 30);

    let snapshots = tempfile::tempdir().unwrap();
    let s = scheduler(
        Arc::new(source),
        Arc::new(FileSnapshotStore::new(snapshots.path())),
    );
    assert!(matches!(
        s.run_course(&course, common::window()).await,
        RunOutcome::Completed { .. }
    ));
}

#[tokio::test]
async fn save_into_an_unusable_root_fails_without_touching_it() {
    let pipeline = AnalyticsPipeline::new(common::test_config(), ActionCatalog::standard());
    let output = pipeline
        .run_course(common::synthetic_course("bio", 30), None, Vec::new(), Utc::now())
        .await
        .unwrap();

    // Staging and its cleanup both fail under a root that is a plain file
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("snapshots");
    std::fs::write(&blocker, "occupied").unwrap();
    let store = FileSnapshotStore::new(blocker.clone());
    assert!(store.save_run(&output.artifacts).await.is_err());
    assert_eq!(std::fs::read_to_string(&blocker).unwrap(), "occupied");
}

#[tokio::test]
async fn rerunning_a_window_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(tmp.path()));
    let source = Arc::new(SyntheticSource::new(30));
    let s = scheduler(source.clone(), Arc::clone(&store));
    let course = CourseId("bio".into());

    assert!(matches!(
        s.run_course(&course, common::window()).await,
        RunOutcome::Completed { .. }
    ));
    assert!(matches!(
        s.run_course(&course, common::window()).await,
        RunOutcome::Skipped { .. }
    ));

    // A restarted scheduler learns about the run from the store
    let restarted = scheduler(source.clone(), Arc::clone(&store));
    assert!(matches!(
        restarted.run_course(&course, common::window()).await,
        RunOutcome::Skipped { .. }
    ));
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_runs_of_one_course_are_single_flighted() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(tmp.path()));
    let s = scheduler(Arc::new(SyntheticSource::new(30)), store);
    let course = CourseId("bio".into());

    let (a, b) = tokio::join!(
        s.run_course(&course, common::window()),
        s.run_course(&course, common::window())
    );
    let completed = [&a, &b]
        .iter()
        .filter(|o| matches!(o, RunOutcome::Completed { .. }))
        .count();
    let skipped = [&a, &b]
        .iter()
        .filter(|o| matches!(o, RunOutcome::Skipped { .. }))
        .count();
    assert_eq!((completed, skipped), (1, 1));
}

#[tokio::test]
async fn batch_isolates_failing_courses() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(tmp.path()));
    let source = Arc::new(SyntheticSource {
        students: 30,
        flaky: 2,
        calls: AtomicUsize::new(0),
    });
    let s = scheduler(source, store);

    let courses = [CourseId("bio".into()), CourseId("missing".into())];
    let outcomes = s.run_batch(&courses, common::window()).await;
    assert_eq!(outcomes.len(), 2);
    for (course, outcome) in outcomes {
        match course.0.as_str() {
            "bio" => assert!(matches!(outcome, RunOutcome::Completed { .. }), "{:?}", outcome),
            _ => assert!(matches!(outcome, RunOutcome::Failed { .. }), "{:?}", outcome),
        }
    }
}

#[tokio::test]
async fn second_window_reconciles_against_the_first() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(tmp.path()));
    let s = scheduler(Arc::new(SyntheticSource::new(30)), Arc::clone(&store));
    let course = CourseId("bio".into());

    let first = common::window();
    assert!(matches!(s.run_course(&course, first).await, RunOutcome::Completed { .. }));
    let next = RunWindow::new(first.start + chrono::Duration::days(1), first.end + chrono::Duration::days(1));
    assert!(matches!(s.run_course(&course, next).await, RunOutcome::Completed { .. }));

    let records = store.load_transition_records(&course).await.unwrap();
    assert_eq!(records.len(), 30);
    assert!(records.iter().all(|r| r.history.len() == 2));
}
