// tests/reinforcement.rs
mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use pathwise_lib::analytics::ingest;
use pathwise_lib::config;
use pathwise_lib::errors::AnalyticsError;
use pathwise_lib::models::{CourseId, StudentId};
use pathwise_lib::pipeline::AnalyticsPipeline;
use pathwise_lib::reinforcement::{
    ActionCatalog, EncoderConfig, LearningState, PolicyRegistry, QLearningTrainer, QTableSnapshot,
    RecommendationServer, Resolution, RewardWeights, ServingConfig, StateDims, TrainerConfig,
    TrajectorySet, TransitionModel, build_trajectories,
};

/// Trajectories of a synthetic course with one cluster per behavior group.
fn trajectories(n_students: usize) -> TrajectorySet {
    let (dataset, _) = ingest::sanitize(common::synthetic_course("rl", n_students));
    let memberships: BTreeMap<StudentId, usize> = (0..n_students)
        .map(|i| (StudentId(format!("s{:03}", i)), i % 3))
        .collect();
    build_trajectories(
        &dataset,
        &memberships,
        3,
        &EncoderConfig::default(),
        &RewardWeights::default(),
    )
}

fn all_states(dims: StateDims) -> Vec<LearningState> {
    let mut states = Vec::with_capacity(dims.size());
    for cluster_id in 0..dims.clusters {
        for module_index in 0..dims.modules {
            for progress_bin in 0..dims.progress_bins {
                for score_bin in 0..dims.score_bins {
                    for learning_phase in 0..dims.phases {
                        for engagement_level in 0..dims.engagement_levels {
                            states.push(LearningState {
                                cluster_id,
                                module_index,
                                progress_bin,
                                score_bin,
                                learning_phase,
                                engagement_level,
                            });
                        }
                    }
                }
            }
        }
    }
    states
}

async fn trained_snapshot() -> QTableSnapshot {
    let pipeline = AnalyticsPipeline::new(common::test_config(), ActionCatalog::standard());
    pipeline
        .run_course(common::synthetic_course("rl", 30), None, Vec::new(), Utc::now())
        .await
        .unwrap()
        .artifacts
        .policy
        .unwrap()
}

fn server(snapshot: QTableSnapshot) -> RecommendationServer {
    let registry = Arc::new(PolicyRegistry::new());
    registry.publish(snapshot).unwrap();
    RecommendationServer::new(registry, ActionCatalog::standard(), ServingConfig::default())
}

#[test]
fn action_matrix_rows_are_distributions() {
    let set = trajectories(30);
    let catalog = ActionCatalog::standard();
    let model = TransitionModel::fit(&set.transitions, &catalog, set.dims(), config::LAPLACE_ALPHA);

    assert!(!model.action_matrix().is_empty());
    for (state, row) in model.action_matrix() {
        assert_eq!(row.len(), catalog.len());
        assert!(row.iter().all(|p| *p >= 0.0), "negative probability in {}", state);
        let total: f64 = row.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "row of {} sums to {}", state, total);
        // Smoothing never puts mass on actions invalid in the state
        let valid = catalog.valid_in_state(state, &set.dims());
        for (a, p) in row.iter().enumerate() {
            if !valid.contains(&a) {
                assert_eq!(*p, 0.0);
            }
        }
    }
}

#[test]
fn training_stays_finite_and_settles() {
    let set = trajectories(30);
    let catalog = ActionCatalog::standard();
    let model = TransitionModel::fit(&set.transitions, &catalog, set.dims(), config::LAPLACE_ALPHA);
    let trainer_config = TrainerConfig {
        max_episodes: 600,
        min_episodes: 600,
        ..TrainerConfig::default()
    };
    let outcome = QLearningTrainer::new(trainer_config, &catalog, RewardWeights::default())
        .train(&model, &set.transitions, 7)
        .unwrap();

    assert!(outcome.table.is_finite());
    assert_eq!(outcome.episodes, 600);
    let early: f64 = outcome.delta_trace[..100].iter().sum::<f64>() / 100.0;
    let late: f64 = outcome.delta_trace[500..].iter().sum::<f64>() / 100.0;
    assert!(late < early, "mean |dQ| went from {} to {}", early, late);
}

#[test]
fn divergence_bound_aborts_training() {
    let set = trajectories(30);
    let catalog = ActionCatalog::standard();
    let model = TransitionModel::fit(&set.transitions, &catalog, set.dims(), config::LAPLACE_ALPHA);
    let trainer_config = TrainerConfig {
        divergence_bound: 1e-3,
        ..TrainerConfig::default()
    };
    let err = QLearningTrainer::new(trainer_config, &catalog, RewardWeights::default())
        .train(&model, &set.transitions, 7)
        .unwrap_err();
    assert!(matches!(err, AnalyticsError::TrainingDivergence { .. }));
}

#[tokio::test]
async fn unseen_state_is_answered_from_the_nearest_visited_state() {
    let snapshot = trained_snapshot().await;
    let dims = snapshot.dims;
    let unseen = all_states(dims)
        .into_iter()
        .find(|s| snapshot.values_for(s).is_none())
        .unwrap();

    let course = snapshot.course_id.clone();
    let server = server(snapshot);
    let response = server.recommend_for_state(&course, unseen, 3);
    match response.resolution {
        Resolution::NearestState { distance } => assert!(distance > 0.0),
        other => panic!("expected a nearest-state answer, got {:?}", other),
    }
    assert_eq!(response.state, Some(unseen));
    assert!(!response.items.is_empty() && response.items.len() <= 3);
    for pair in response.items.windows(2) {
        assert!(pair[0].q_value >= pair[1].q_value);
        assert!(pair[0].rank < pair[1].rank);
    }
}

#[tokio::test]
async fn unknown_students_and_courses_still_get_answers() {
    let snapshot = trained_snapshot().await;
    let course = snapshot.course_id.clone();
    let default_state = snapshot.default_state;
    let server = server(snapshot);

    let newcomer = server.recommend(&StudentId("newcomer".into()), &course, 0);
    assert_eq!(newcomer.state, Some(default_state));
    assert_eq!(newcomer.items.len(), config::DEFAULT_TOP_K);

    let elsewhere = server.recommend(&StudentId("s000".into()), &CourseId("unknown".into()), 2);
    assert_eq!(elsewhere.resolution, Resolution::DefaultPolicy);
    assert_eq!(elsewhere.policy_version, None);
    assert_eq!(elsewhere.items.len(), 2);
    let confidence: f64 = elsewhere.items.iter().map(|r| r.confidence).sum();
    assert!(confidence > 0.0 && confidence <= 1.0 + 1e-9);
}

#[tokio::test]
async fn registry_rejects_stale_policies() {
    let snapshot = trained_snapshot().await;
    let registry = PolicyRegistry::new();
    registry.publish(snapshot.clone()).unwrap();
    let err = registry.publish(snapshot.clone()).unwrap_err();
    assert!(matches!(err, AnalyticsError::StaleSnapshot { .. }));
    assert_eq!(registry.version_of(&snapshot.course_id), Some(snapshot.version));
}
