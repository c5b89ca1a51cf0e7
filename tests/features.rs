// tests/features.rs
mod common;

use chrono::Utc;

use pathwise_lib::analytics::clustering::{ClusterSelector, ClusteringConfig};
use pathwise_lib::analytics::features::{FeatureConfig, FeatureExtractor, FeatureSelector, SelectionConfig};
use pathwise_lib::analytics::ingest;
use pathwise_lib::errors::AnalyticsError;
use pathwise_lib::models::{CourseId, StudentActivity, StudentId};

#[test]
fn inactive_student_gets_an_all_zero_vector() {
    let mut dataset = common::synthetic_course("c", 2);
    dataset.students.push(StudentActivity::new("idle"));
    let (dataset, report) = ingest::sanitize(dataset);
    assert_eq!(report.students, 3);
    assert_eq!(report.inactive_students, 1);

    let out = FeatureExtractor::new(FeatureConfig::default()).extract(&dataset, Utc::now());
    assert_eq!(out.matrix.n_rows(), 3);
    assert!(out.matrix.n_cols() > 0);
    let idle = out
        .vectors
        .iter()
        .find(|v| v.student_id == StudentId("idle".into()))
        .unwrap();
    assert!(idle.is_all_zero());
    assert_eq!(idle.values.len(), out.matrix.n_cols());
    assert!(out.vectors.iter().filter(|v| v.is_all_zero()).count() == 1);
}

#[test]
fn three_students_cannot_be_clustered() {
    let dataset = common::synthetic_course("c", 3);
    let out = FeatureExtractor::new(FeatureConfig::default()).extract(&dataset, Utc::now());
    let err = ClusterSelector::new(ClusteringConfig::default())
        .select(&CourseId("c".into()), Utc::now(), &out.matrix)
        .unwrap_err();
    assert!(matches!(err, AnalyticsError::InsufficientData { found: 3, .. }));
}

#[test]
fn selection_keeps_a_usable_subset() {
    let dataset = common::synthetic_course("c", 24);
    let out = FeatureExtractor::new(FeatureConfig::default()).extract(&dataset, Utc::now());
    let report = FeatureSelector::new(SelectionConfig::default())
        .select(&out.matrix, Some(&out.label_proxy));
    assert!(!report.retained.is_empty());
    assert!(report.retained.len() <= SelectionConfig::default().max_features);
    for name in &report.retained {
        assert!(out.matrix.column_index(name).is_some());
    }
}

#[test]
fn clustering_separates_behavior_groups_deterministically() {
    let dataset = common::synthetic_course("c", 30);
    let now = Utc::now();
    let out = FeatureExtractor::new(FeatureConfig::default()).extract(&dataset, now);
    let report = FeatureSelector::new(SelectionConfig::default())
        .select(&out.matrix, Some(&out.label_proxy));
    let matrix = out.matrix.select_named(&report.retained);

    let selector = ClusterSelector::new(ClusteringConfig::default());
    let first = selector.select(&CourseId("c".into()), now, &matrix).unwrap();
    let second = selector.select(&CourseId("c".into()), now, &matrix).unwrap();

    assert!(first.optimal_k >= 2);
    assert_eq!(first.memberships, second.memberships);
    assert_eq!(first.optimal_k, second.optimal_k);
    let sizes: usize = first.profiles.iter().map(|p| p.size).sum();
    assert_eq!(sizes, 30);
    // The quiz-driven and view-only groups never share a cluster
    let quiz = first.cluster_of(&StudentId("s000".into())).unwrap();
    let view = first.cluster_of(&StudentId("s002".into())).unwrap();
    assert_ne!(quiz, view);
}

#[test]
fn vectors_carry_the_scaled_and_selected_view_used_for_clustering() {
    let dataset = common::synthetic_course("c", 30);
    let now = Utc::now();
    let mut out = FeatureExtractor::new(FeatureConfig::default()).extract(&dataset, now);
    let report = FeatureSelector::new(SelectionConfig::default())
        .select(&out.matrix, Some(&out.label_proxy));
    out.apply_selection(&report);
    let matrix = out.matrix.select_named(&report.retained);
    let assignment = ClusterSelector::new(ClusteringConfig::default())
        .select(&CourseId("c".into()), now, &matrix)
        .unwrap();

    assert_eq!(out.vectors.len(), matrix.n_rows());
    for (i, vector) in out.vectors.iter().enumerate() {
        assert_eq!(vector.student_id, matrix.student_ids[i]);
        assert_eq!(vector.selected, report.retained);
        assert_eq!(vector.scaled.len(), vector.values.len());
        let expected = assignment.scaler.transform_row(&matrix.rows[i]);
        let actual = vector.selected_scaled();
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-9, "{} vs {}", a, e);
        }
    }
}
